use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::authority::{Authority, NewSession, SessionGrant, VerifyRequest};
use crate::context::SessionContext;
use crate::error::Error;
use crate::events::EventName;
use crate::secret;
use crate::token::{self, TokenError};
use crate::types::{Session, SessionHandle, UserId};

/// Session lifecycle operations: create, verify, refresh, revoke.
///
/// Verification is local whenever the cached signing key is enough; the
/// authority is only called when the token cannot be judged locally. No lock
/// is held across an authority call.
pub struct SessionProtocol<A> {
    authority: Arc<A>,
    context: Arc<SessionContext>,
}

// Manual Clone: avoid derive adding an `A: Clone` bound.
impl<A> Clone for SessionProtocol<A> {
    fn clone(&self) -> Self {
        Self {
            authority: self.authority.clone(),
            context: self.context.clone(),
        }
    }
}

impl<A: Authority> SessionProtocol<A> {
    /// Create a protocol with its own fresh [`SessionContext`].
    #[must_use]
    pub fn new(authority: A) -> Self {
        Self::with_context(Arc::new(authority), Arc::new(SessionContext::new()))
    }

    #[must_use]
    pub fn with_context(authority: Arc<A>, context: Arc<SessionContext>) -> Self {
        Self { authority, context }
    }

    #[must_use]
    pub fn authority(&self) -> &A {
        &self.authority
    }

    #[must_use]
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Creates a session for `user_id`.
    ///
    /// `user_data` is embedded in the access token; `session_data` is kept by
    /// the authority. Both must be JSON objects (or `null`, read as `{}`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPayload`] for non-object payloads, and an
    /// authority error if the authority cannot be reached.
    pub async fn create_session(
        &self,
        user_id: UserId,
        user_data: JsonValue,
        session_data: JsonValue,
    ) -> Result<Session, Error> {
        let user_data = object_or_empty(user_data, "user data")?;
        let session_data = object_or_empty(session_data, "session data")?;

        let grant = self
            .authority
            .create_session(NewSession {
                user_id,
                user_data,
                session_data,
            })
            .await?;
        let session = self.absorb(grant).await;
        tracing::debug!(handle = %session.handle, user_id = %session.user_id, "Session created");
        Ok(session)
    }

    /// Verifies an access token, locally when possible.
    ///
    /// Handles revoked through this process are rejected without an authority
    /// call; revocations made elsewhere surface once the authority is consulted
    /// or the access token expires.
    ///
    /// The anti-CSRF token is checked only when the authority enables the
    /// feature *and* `enforce_anti_csrf` is set.
    ///
    /// # Errors
    ///
    /// - [`Error::TryRefreshToken`]: expired access token or failed anti-CSRF check.
    /// - [`Error::Unauthorized`]: malformed token or revoked session.
    /// - [`Error::HandshakeUnavailable`] / authority errors on network failure.
    pub async fn verify_session(
        &self,
        access_token: &str,
        anti_csrf_token: Option<&str>,
        enforce_anti_csrf: bool,
    ) -> Result<Session, Error> {
        let handshake = self.context.handshake(self.authority.as_ref()).await?;
        let enforce_anti_csrf = enforce_anti_csrf && handshake.anti_csrf_enabled;

        let claims = match token::verify_access_token(
            &handshake.signing.key_id,
            &handshake.signing.public_key,
            access_token,
        ) {
            Ok(claims) => Some(claims),
            Err(TokenError::KeyMismatch { token, cached }) => {
                tracing::debug!(token = %token, cached = %cached, "Access token signed with unknown key");
                self.context.events().record(EventName::SigningKeyStale);
                self.context.handshake_cache().mark_stale();
                None
            }
            Err(TokenError::Expired) => {
                return Err(Error::TryRefreshToken("access token expired".into()));
            }
            Err(e @ TokenError::Invalid(_)) => return Err(Error::Unauthorized(e.to_string())),
        };

        if let Some(claims) = claims {
            if self.context.is_revoked(&claims.session_handle) {
                return Err(Error::Unauthorized("session revoked".into()));
            }
            let needs_commit = claims.parent_refresh_token_hash.is_some();
            let anti_csrf_supplied = anti_csrf_token.is_some();

            if enforce_anti_csrf && anti_csrf_supplied {
                let matches = match (anti_csrf_token, claims.anti_csrf_token.as_deref()) {
                    (Some(given), Some(expected)) => secret::constant_time_eq(given, expected),
                    _ => false,
                };
                if !matches {
                    return Err(Error::TryRefreshToken("anti-csrf token mismatch".into()));
                }
            }

            if !needs_commit && (!enforce_anti_csrf || anti_csrf_supplied) {
                return Ok(Session::bare(
                    claims.session_handle,
                    claims.user_id,
                    claims.user_data,
                ));
            }
        }

        self.context.events().record(EventName::CallingServiceInVerify);
        let grant = self
            .authority
            .verify_session(VerifyRequest {
                access_token,
                anti_csrf_token,
                enforce_anti_csrf,
            })
            .await
            .inspect_err(|e| self.note_failure(e))?;
        Ok(self.absorb(grant).await.into_verified())
    }

    /// Exchanges a refresh token for a rotated set of tokens.
    ///
    /// # Errors
    ///
    /// - [`Error::TokenTheftDetected`]: the token was already exchanged; the
    ///   session is revoked by the authority.
    /// - [`Error::Unauthorized`]: unknown, expired or revoked.
    pub async fn refresh_session(&self, refresh_token: &str) -> Result<Session, Error> {
        let grant = self
            .authority
            .refresh_session(refresh_token)
            .await
            .inspect_err(|e| self.note_failure(e))?;
        let session = self.absorb(grant).await;
        tracing::debug!(handle = %session.handle, "Session refreshed");
        Ok(session)
    }

    /// Revokes one session. Unknown or empty handles yield `Ok(false)`.
    ///
    /// # Errors
    ///
    /// Returns an authority error if the authority cannot be reached.
    pub async fn revoke_session(&self, handle: &SessionHandle) -> Result<bool, Error> {
        if handle.as_str().is_empty() {
            return Ok(false);
        }
        let revoked = self
            .authority
            .revoke_sessions(std::slice::from_ref(handle))
            .await?;
        let was_active = revoked.contains(handle);
        self.context.mark_revoked(revoked);
        Ok(was_active)
    }

    /// Revokes several sessions, returning those that were active.
    ///
    /// # Errors
    ///
    /// Returns an authority error if the authority cannot be reached.
    pub async fn revoke_multiple_sessions(
        &self,
        handles: &[SessionHandle],
    ) -> Result<Vec<SessionHandle>, Error> {
        let handles: Vec<SessionHandle> = handles
            .iter()
            .filter(|h| !h.as_str().is_empty())
            .cloned()
            .collect();
        if handles.is_empty() {
            return Ok(Vec::new());
        }
        let revoked = self.authority.revoke_sessions(&handles).await?;
        self.context.mark_revoked(revoked.iter().cloned());
        Ok(revoked)
    }

    /// Revokes every session of `user_id`, returning exactly the handles revoked.
    ///
    /// # Errors
    ///
    /// Returns an authority error if the authority cannot be reached.
    pub async fn revoke_all_sessions_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<SessionHandle>, Error> {
        let revoked = self.authority.revoke_all_sessions_for_user(user_id).await?;
        self.context.mark_revoked(revoked.iter().cloned());
        tracing::info!(user_id = %user_id, count = revoked.len(), "Revoked all user sessions");
        Ok(revoked)
    }

    /// Lists active session handles of `user_id`.
    ///
    /// # Errors
    ///
    /// Returns an authority error if the authority cannot be reached.
    pub async fn get_all_session_handles_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<SessionHandle>, Error> {
        self.authority.list_session_handles(user_id).await
    }

    /// Reads the authority-side data of a session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthorized`] if the session does not exist.
    pub async fn get_session_data(&self, handle: &SessionHandle) -> Result<JsonValue, Error> {
        self.authority.get_session_data(handle).await
    }

    /// Replaces the authority-side data of a session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPayload`] for non-object data and
    /// [`Error::Unauthorized`] if the session does not exist.
    pub async fn update_session_data(
        &self,
        handle: &SessionHandle,
        data: JsonValue,
    ) -> Result<(), Error> {
        let data = object_or_empty(data, "session data")?;
        self.authority.update_session_data(handle, data).await
    }

    /// Checks any signing key the authority reported against the cache and
    /// returns the session.
    async fn absorb(&self, grant: SessionGrant) -> Session {
        if let Some(signing) = grant.signing {
            self.context.handshake_cache().observe_signing(&signing).await;
        }
        grant.session
    }

    fn note_failure(&self, error: &Error) {
        match error {
            Error::TokenTheftDetected { handle, user_id } => {
                self.context.events().record(EventName::TokenTheftDetected);
                self.context.mark_revoked([handle.clone()]);
                tracing::warn!(handle = %handle, user_id = %user_id, "Refresh token theft detected");
            }
            Error::Unauthorized(reason) => {
                tracing::debug!(reason = %reason, "Session rejected by authority");
            }
            _ => {}
        }
    }
}

fn object_or_empty(value: JsonValue, what: &str) -> Result<JsonValue, Error> {
    match value {
        JsonValue::Null => Ok(JsonValue::Object(serde_json::Map::new())),
        JsonValue::Object(_) => Ok(value),
        other => Err(Error::InvalidPayload(format!(
            "{what} must be a JSON object, got {other}"
        ))),
    }
}
