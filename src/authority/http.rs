use std::sync::atomic::{AtomicUsize, Ordering};

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use url::Url;

use super::{Authority, AuthorityConfig, NewSession, SessionGrant, VerifyRequest};
use crate::error::Error;
use crate::handshake::{HandshakeDocument, HandshakeInfo, SigningConfig, SigningKeyDocument};
use crate::types::{Session, SessionHandle, Token, UserId};

/// Session authority reached over HTTP(S).
///
/// Requests go to the configured hosts in turn, starting from a rotating
/// cursor. A host that cannot be connected to (or times out) is skipped; the
/// call fails only when every host did.
pub struct HttpAuthority {
    config: AuthorityConfig,
    http: reqwest::Client,
    cursor: AtomicUsize,
}

// ── Wire types ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionBody<'a> {
    user_id: &'a UserId,
    user_data: &'a JsonValue,
    session_data: &'a JsonValue,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyBody<'a> {
    access_token: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    anti_csrf_token: Option<&'a str>,
    enforce_anti_csrf: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshBody<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum RemoveBody<'a> {
    SessionHandles(&'a [SessionHandle]),
    UserId(&'a UserId),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionDataBody<'a> {
    session_handle: &'a SessionHandle,
    session_data: &'a JsonValue,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionIdentity {
    handle: SessionHandle,
    user_id: UserId,
    #[serde(default)]
    user_data: JsonValue,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionBody {
    session: SessionIdentity,
    #[serde(default)]
    access_token: Option<Token>,
    #[serde(default)]
    refresh_token: Option<Token>,
    #[serde(default)]
    id_refresh_token: Option<Token>,
    #[serde(default)]
    anti_csrf_token: Option<String>,
    #[serde(default)]
    signing_key: Option<SigningKeyDocument>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TheftBody {
    session: TheftIdentity,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TheftIdentity {
    handle: SessionHandle,
    user_id: UserId,
}

/// Protocol outcome carried in the `status` field of session responses.
#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
enum SessionReply {
    Ok(SessionBody),
    Unauthorised {
        #[serde(default)]
        message: String,
    },
    TryRefreshToken {
        #[serde(default)]
        message: String,
    },
    TokenTheftDetected(TheftBody),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevokedReply {
    session_handles_revoked: Vec<SessionHandle>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HandlesReply {
    session_handles: Vec<SessionHandle>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
enum SessionDataReply {
    Ok {
        #[serde(rename = "sessionData", default)]
        session_data: JsonValue,
    },
    Unauthorised {
        #[serde(default)]
        message: String,
    },
}

impl SessionReply {
    fn into_grant(self) -> Result<SessionGrant, Error> {
        match self {
            Self::Ok(body) => {
                let signing: Option<SigningConfig> =
                    body.signing_key.map(TryInto::try_into).transpose()?;
                let session = Session {
                    access_token: body.access_token,
                    refresh_token: body.refresh_token,
                    id_refresh_token: body.id_refresh_token,
                    anti_csrf_token: body.anti_csrf_token,
                    ..Session::bare(
                        body.session.handle,
                        body.session.user_id,
                        body.session.user_data,
                    )
                };
                Ok(SessionGrant { session, signing })
            }
            Self::Unauthorised { message } => Err(Error::Unauthorized(message)),
            Self::TryRefreshToken { message } => Err(Error::TryRefreshToken(message)),
            Self::TokenTheftDetected(body) => Err(Error::TokenTheftDetected {
                handle: body.session.handle,
                user_id: body.session.user_id,
            }),
        }
    }
}

impl HttpAuthority {
    /// Create a new authority client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] if the HTTP client cannot be built.
    pub fn new(config: AuthorityConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            config,
            http,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    ///
    /// The client's own timeout applies instead of the configured one.
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    #[must_use]
    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }

    /// Joins host, base path and `path` (which may carry an already encoded query).
    fn endpoint(&self, host: &Url, path: &str) -> Url {
        let (path, query) = match path.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (path, None),
        };
        let mut url = host.clone();
        url.set_path(&format!("{}{path}", self.config.base_path));
        url.set_query(query);
        url
    }

    /// Sends a request, failing over across hosts on connection errors and timeouts.
    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        operation: &'static str,
    ) -> Result<reqwest::Response, Error> {
        let hosts = &self.config.hosts;
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        let mut last_error = None;

        for offset in 0..hosts.len() {
            let host = &hosts[(start + offset) % hosts.len()];
            let mut request = self.http.request(method.clone(), self.endpoint(host, path));
            if let Some(api_key) = &self.config.api_key {
                request = request.header("api-key", api_key);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => return Self::ensure_success(response, operation).await,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    tracing::warn!(host = %host, error = %e, operation, "Authority host unreachable");
                    last_error = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(last_error.map_or_else(
            || Error::General("no authority hosts configured".into()),
            Error::from,
        ))
    }

    async fn call<B, R>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        operation: &'static str,
    ) -> Result<R, Error>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self.send(method, path, body, operation).await?;
        response.json::<R>().await.map_err(Into::into)
    }

    /// Checks HTTP response status; returns the response on success or an error with details.
    async fn ensure_success(
        response: reqwest::Response,
        operation: &'static str,
    ) -> Result<reqwest::Response, Error> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_else(|e| e.to_string());
        Err(Error::Authority {
            operation,
            status: Some(status),
            detail: body,
        })
    }
}

impl Authority for HttpAuthority {
    async fn fetch_handshake(&self) -> Result<HandshakeInfo, Error> {
        let doc: HandshakeDocument = self
            .call::<(), _>(Method::GET, "/handshake", None, "handshake")
            .await?;
        doc.try_into()
    }

    async fn create_session(&self, session: NewSession) -> Result<SessionGrant, Error> {
        let body = CreateSessionBody {
            user_id: &session.user_id,
            user_data: &session.user_data,
            session_data: &session.session_data,
        };
        let reply: SessionReply = self
            .call(Method::POST, "/session", Some(&body), "create session")
            .await?;
        reply.into_grant()
    }

    async fn verify_session(&self, request: VerifyRequest<'_>) -> Result<SessionGrant, Error> {
        let body = VerifyBody {
            access_token: request.access_token,
            anti_csrf_token: request.anti_csrf_token,
            enforce_anti_csrf: request.enforce_anti_csrf,
        };
        let reply: SessionReply = self
            .call(Method::POST, "/session/verify", Some(&body), "verify session")
            .await?;
        reply.into_grant()
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<SessionGrant, Error> {
        let body = RefreshBody { refresh_token };
        let reply: SessionReply = self
            .call(Method::POST, "/session/refresh", Some(&body), "refresh session")
            .await?;
        reply.into_grant()
    }

    async fn revoke_sessions(&self, handles: &[SessionHandle]) -> Result<Vec<SessionHandle>, Error> {
        let body = RemoveBody::SessionHandles(handles);
        let reply: RevokedReply = self
            .call(Method::POST, "/session/remove", Some(&body), "revoke sessions")
            .await?;
        Ok(reply.session_handles_revoked)
    }

    async fn revoke_all_sessions_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<SessionHandle>, Error> {
        let body = RemoveBody::UserId(user_id);
        let reply: RevokedReply = self
            .call(Method::POST, "/session/remove", Some(&body), "revoke user sessions")
            .await?;
        Ok(reply.session_handles_revoked)
    }

    async fn list_session_handles(&self, user_id: &UserId) -> Result<Vec<SessionHandle>, Error> {
        let path = format!("/session/user?userId={}", urlencoding::encode(user_id.as_str()));
        let reply: HandlesReply = self
            .call::<(), _>(Method::GET, &path, None, "list sessions")
            .await?;
        Ok(reply.session_handles)
    }

    async fn get_session_data(&self, handle: &SessionHandle) -> Result<JsonValue, Error> {
        let path = format!(
            "/session/data?sessionHandle={}",
            urlencoding::encode(handle.as_str())
        );
        let reply: SessionDataReply = self
            .call::<(), _>(Method::GET, &path, None, "get session data")
            .await?;
        match reply {
            SessionDataReply::Ok { session_data } => Ok(session_data),
            SessionDataReply::Unauthorised { message } => Err(Error::Unauthorized(message)),
        }
    }

    async fn update_session_data(&self, handle: &SessionHandle, data: JsonValue) -> Result<(), Error> {
        let body = SessionDataBody {
            session_handle: handle,
            session_data: &data,
        };
        let reply: SessionDataReply = self
            .call(Method::PUT, "/session/data", Some(&body), "update session data")
            .await?;
        match reply {
            SessionDataReply::Ok { .. } => Ok(()),
            SessionDataReply::Unauthorised { message } => Err(Error::Unauthorized(message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use mockito::{Matcher, Server};
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const KEY_HEX: &str = "1111111111111111111111111111111111111111111111111111111111111111";

    fn authority_for(url: &str) -> HttpAuthority {
        HttpAuthority::new(AuthorityConfig::new(url.parse().unwrap())).unwrap()
    }

    fn session_json() -> serde_json::Value {
        json!({
            "status": "OK",
            "session": { "handle": "h-1", "userId": "u-1", "userData": { "a": 1 } },
            "accessToken": { "token": "access", "expiry": "2030-01-01T00:00:00Z" },
            "refreshToken": { "token": "refresh", "expiry": "2030-01-01T00:00:00Z" },
            "idRefreshToken": { "token": "id", "expiry": "2030-01-01T00:00:00Z" },
            "antiCsrfToken": "csrf",
            "signingKey": { "kid": "k2", "publicKeyHex": KEY_HEX }
        })
    }

    #[tokio::test]
    async fn fetches_handshake() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/handshake")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "refreshTokenPath": "/auth/refresh",
                    "enableAntiCsrf": false,
                    "signingKey": { "kid": "k1", "publicKeyHex": KEY_HEX },
                    "sessionExpiredStatusCode": 440
                })
                .to_string(),
            )
            .create_async()
            .await;

        let info = authority_for(&server.url()).fetch_handshake().await.unwrap();
        mock.assert_async().await;
        assert_eq!(info.refresh_token_path, "/auth/refresh");
        assert!(!info.anti_csrf_enabled);
        assert_eq!(info.session_expired_status_code, 440);
    }

    #[tokio::test]
    async fn create_session_parses_tokens_and_signing_key() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/session")
            .match_body(Matcher::PartialJson(json!({ "userId": "u-1" })))
            .with_status(200)
            .with_body(session_json().to_string())
            .create_async()
            .await;

        let grant = authority_for(&server.url())
            .create_session(NewSession {
                user_id: UserId("u-1".into()),
                user_data: json!({}),
                session_data: json!({}),
            })
            .await
            .unwrap();
        mock.assert_async().await;

        assert_eq!(grant.session.handle.as_str(), "h-1");
        assert_eq!(grant.session.refresh_token.unwrap().value, "refresh");
        assert_eq!(grant.session.anti_csrf_token.as_deref(), Some("csrf"));
        assert_eq!(grant.signing.unwrap().key_id.0, "k2");
    }

    #[tokio::test]
    async fn verify_maps_try_refresh_status() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/session/verify")
            .match_body(Matcher::PartialJson(json!({ "enforceAntiCsrf": true })))
            .with_status(200)
            .with_body(json!({ "status": "TRY_REFRESH_TOKEN", "message": "expired" }).to_string())
            .create_async()
            .await;

        let err = authority_for(&server.url())
            .verify_session(VerifyRequest {
                access_token: "t",
                anti_csrf_token: None,
                enforce_anti_csrf: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TryRefreshToken(ref m) if m == "expired"));
    }

    #[tokio::test]
    async fn refresh_maps_theft_status() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/session/refresh")
            .with_status(200)
            .with_body(
                json!({
                    "status": "TOKEN_THEFT_DETECTED",
                    "session": { "handle": "h-9", "userId": "u-9" }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let err = authority_for(&server.url())
            .refresh_session("old")
            .await
            .unwrap_err();
        match err {
            Error::TokenTheftDetected { handle, user_id } => {
                assert_eq!(handle.as_str(), "h-9");
                assert_eq!(user_id.as_str(), "u-9");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn revoke_sends_handles() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/session/remove")
            .match_body(Matcher::Json(json!({ "sessionHandles": ["h-1"] })))
            .with_status(200)
            .with_body(json!({ "status": "OK", "sessionHandlesRevoked": ["h-1"] }).to_string())
            .create_async()
            .await;

        let revoked = authority_for(&server.url())
            .revoke_sessions(&[SessionHandle("h-1".into())])
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(revoked, vec![SessionHandle("h-1".into())]);
    }

    #[tokio::test]
    async fn list_encodes_user_id() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/session/user")
            .match_query(Matcher::UrlEncoded("userId".into(), "a b".into()))
            .with_status(200)
            .with_body(json!({ "status": "OK", "sessionHandles": [] }).to_string())
            .create_async()
            .await;

        let handles = authority_for(&server.url())
            .list_session_handles(&UserId("a b".into()))
            .await
            .unwrap();
        mock.assert_async().await;
        assert!(handles.is_empty());
    }

    #[tokio::test]
    async fn non_success_status_is_authority_error() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/handshake")
            .with_status(503)
            .with_body("maintenance")
            .create_async()
            .await;

        let err = authority_for(&server.url()).fetch_handshake().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Authority { operation: "handshake", status: Some(503), ref detail } if detail == "maintenance"
        ));
    }

    #[tokio::test]
    async fn fails_over_to_next_host() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/session/remove")
            .with_status(200)
            .with_body(json!({ "status": "OK", "sessionHandlesRevoked": [] }).to_string())
            .create_async()
            .await;

        // Port 9 (discard) on localhost refuses connections.
        let config = AuthorityConfig::new("http://127.0.0.1:9".parse().unwrap())
            .with_additional_host(server.url().parse().unwrap());
        let authority = HttpAuthority::new(config).unwrap();

        let revoked = authority
            .revoke_all_sessions_for_user(&UserId("u".into()))
            .await
            .unwrap();
        assert!(revoked.is_empty());
        mock.assert_async().await;
    }

    /// A host that accepts connections and never answers.
    async fn silent_host() -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        format!("http://{addr}").parse().unwrap()
    }

    fn verify_request() -> VerifyRequest<'static> {
        VerifyRequest {
            access_token: "t",
            anti_csrf_token: None,
            enforce_anti_csrf: false,
        }
    }

    #[tokio::test]
    async fn timed_out_host_is_authority_error() {
        let config =
            AuthorityConfig::new(silent_host().await).with_timeout(Duration::from_millis(100));
        let authority = HttpAuthority::new(config).unwrap();

        let verify = authority.verify_session(verify_request());
        let err = tokio::time::timeout(Duration::from_secs(5), verify)
            .await
            .expect("request should give up after its own timeout")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authority);
        assert!(matches!(err, Error::Http(ref e) if e.is_timeout()), "got {err:?}");
    }

    #[tokio::test]
    async fn fails_over_from_timed_out_host() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/session/verify")
            .with_status(200)
            .with_body(session_json().to_string())
            .create_async()
            .await;

        let config = AuthorityConfig::new(silent_host().await)
            .with_additional_host(server.url().parse().unwrap())
            .with_timeout(Duration::from_millis(100));
        let authority = HttpAuthority::new(config).unwrap();

        let verify = authority.verify_session(verify_request());
        let grant = tokio::time::timeout(Duration::from_secs(5), verify)
            .await
            .expect("failover should finish")
            .unwrap();
        assert_eq!(grant.session.handle.as_str(), "h-1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unreadable_error_body_keeps_the_read_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            // Promises more body than it sends, then hangs up.
            let reply = b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 100\r\n\r\nshort";
            let _ = socket.write_all(reply).await;
        });

        let err = authority_for(&format!("http://{addr}"))
            .fetch_handshake()
            .await
            .unwrap_err();
        match err {
            Error::Authority { status: Some(503), ref detail, .. } => assert!(!detail.is_empty()),
            other => panic!("expected authority error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn api_key_and_base_path_are_applied() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/auth/session/data")
            .match_header("api-key", "secret")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(json!({ "status": "OK", "sessionData": { "k": "v" } }).to_string())
            .create_async()
            .await;

        let config = AuthorityConfig::new(server.url().parse().unwrap())
            .with_base_path("/auth")
            .with_api_key("secret");
        let data = HttpAuthority::new(config)
            .unwrap()
            .get_session_data(&SessionHandle("h".into()))
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(data["k"], "v");
    }
}
