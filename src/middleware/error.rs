use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use super::cookies;
use crate::error::{Error, ErrorKind};
use crate::handshake::HandshakeInfo;
use crate::types::{SessionHandle, UserId};

/// Handles an unauthorized, try-refresh or general failure.
pub type FailureHandler = Arc<dyn Fn(&Error) -> Response + Send + Sync>;

/// Handles a detected refresh-token theft.
pub type TheftHandler = Arc<dyn Fn(&SessionHandle, &UserId) -> Response + Send + Sync>;

/// Per-kind failure handlers.
///
/// Unset slots fall through to the next layer: instance handlers, then
/// process-wide handlers, then the built-in defaults. Exactly one handler
/// runs per failure.
#[derive(Clone, Default)]
pub struct ErrorHandlers {
    on_unauthorized: Option<FailureHandler>,
    on_try_refresh_token: Option<FailureHandler>,
    on_token_theft_detected: Option<TheftHandler>,
    on_general_error: Option<FailureHandler>,
}

impl ErrorHandlers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_on_unauthorized<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Error) -> Response + Send + Sync + 'static,
    {
        self.on_unauthorized = Some(Arc::new(handler));
        self
    }

    #[must_use]
    pub fn with_on_try_refresh_token<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Error) -> Response + Send + Sync + 'static,
    {
        self.on_try_refresh_token = Some(Arc::new(handler));
        self
    }

    #[must_use]
    pub fn with_on_token_theft_detected<F>(mut self, handler: F) -> Self
    where
        F: Fn(&SessionHandle, &UserId) -> Response + Send + Sync + 'static,
    {
        self.on_token_theft_detected = Some(Arc::new(handler));
        self
    }

    #[must_use]
    pub fn with_on_general_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Error) -> Response + Send + Sync + 'static,
    {
        self.on_general_error = Some(Arc::new(handler));
        self
    }

    /// Slot-wise merge: `self` wins where set, `fallback` fills the rest.
    #[must_use]
    pub fn or(&self, fallback: &ErrorHandlers) -> ErrorHandlers {
        ErrorHandlers {
            on_unauthorized: self
                .on_unauthorized
                .clone()
                .or_else(|| fallback.on_unauthorized.clone()),
            on_try_refresh_token: self
                .on_try_refresh_token
                .clone()
                .or_else(|| fallback.on_try_refresh_token.clone()),
            on_token_theft_detected: self
                .on_token_theft_detected
                .clone()
                .or_else(|| fallback.on_token_theft_detected.clone()),
            on_general_error: self
                .on_general_error
                .clone()
                .or_else(|| fallback.on_general_error.clone()),
        }
    }

    /// Turn `error` into a response using the first handler set for its kind.
    ///
    /// `handshake` drives the defaults (status code, cookie attributes); when
    /// it is unavailable, defaults answer 401 without touching cookies.
    pub(super) fn respond(&self, error: &Error, handshake: Option<&HandshakeInfo>) -> Response {
        match error.kind() {
            ErrorKind::Unauthorized => match &self.on_unauthorized {
                Some(handler) => handler(error),
                None => session_ended(error, handshake),
            },
            ErrorKind::TryRefreshToken => match &self.on_try_refresh_token {
                Some(handler) => handler(error),
                None => expired_status(handshake, error.to_string()),
            },
            ErrorKind::TokenTheftDetected => {
                let Error::TokenTheftDetected { handle, user_id } = error else {
                    return self.general(error);
                };
                match &self.on_token_theft_detected {
                    Some(handler) => handler(handle, user_id),
                    None => session_ended(error, handshake),
                }
            }
            ErrorKind::Authority | ErrorKind::General => self.general(error),
        }
    }

    fn general(&self, error: &Error) -> Response {
        match &self.on_general_error {
            Some(handler) => handler(error),
            None => {
                tracing::error!(error = %error, "Session middleware internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
            }
        }
    }
}

impl std::fmt::Debug for ErrorHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorHandlers")
            .field("on_unauthorized", &self.on_unauthorized.is_some())
            .field("on_try_refresh_token", &self.on_try_refresh_token.is_some())
            .field("on_token_theft_detected", &self.on_token_theft_detected.is_some())
            .field("on_general_error", &self.on_general_error.is_some())
            .finish()
    }
}

fn expired_status(handshake: Option<&HandshakeInfo>, body: String) -> Response {
    let status = handshake
        .and_then(|h| StatusCode::from_u16(h.session_expired_status_code).ok())
        .unwrap_or(StatusCode::UNAUTHORIZED);
    (status, body).into_response()
}

/// Default for unauthorized and theft: the session is over, drop its cookies.
fn session_ended(error: &Error, handshake: Option<&HandshakeInfo>) -> Response {
    let mut response = expired_status(handshake, error.to_string());
    if let Some(info) = handshake {
        cookies::clear_session(&mut response, info);
    }
    response
}

/// Rejection of [`VerifiedSession`](super::VerifiedSession) when the route is
/// not behind the session middleware, or the request passed through unverified.
#[derive(Debug, thiserror::Error)]
#[error("No verified session")]
pub struct MissingSession;

impl IntoResponse for MissingSession {
    fn into_response(self) -> Response {
        (StatusCode::UNAUTHORIZED, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::SET_COOKIE;

    fn theft() -> Error {
        Error::TokenTheftDetected {
            handle: SessionHandle("h".into()),
            user_id: UserId("u".into()),
        }
    }

    #[test]
    fn defaults_without_handshake() {
        let handlers = ErrorHandlers::new();
        let response = handlers.respond(&Error::Unauthorized("x".into()), None);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().get(SET_COOKIE).is_none());

        let response = handlers.respond(&Error::General("boom".into()), None);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = handlers.respond(&Error::HandshakeUnavailable("down".into()), None);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn theft_handler_receives_handle_and_user() {
        let handlers = ErrorHandlers::new().with_on_token_theft_detected(|handle, user| {
            (StatusCode::FORBIDDEN, format!("{handle}/{user}")).into_response()
        });
        let response = handlers.respond(&theft(), None);
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn only_matching_slot_fires() {
        let handlers = ErrorHandlers::new()
            .with_on_unauthorized(|_| StatusCode::IM_A_TEAPOT.into_response());

        let response = handlers.respond(&Error::TryRefreshToken("x".into()), None);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let response = handlers.respond(&Error::Unauthorized("x".into()), None);
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    }

    #[test]
    fn merge_prefers_self() {
        let instance =
            ErrorHandlers::new().with_on_general_error(|_| StatusCode::BAD_GATEWAY.into_response());
        let process = ErrorHandlers::new()
            .with_on_general_error(|_| StatusCode::SERVICE_UNAVAILABLE.into_response())
            .with_on_unauthorized(|_| StatusCode::FORBIDDEN.into_response());

        let merged = instance.or(&process);
        let general = merged.respond(&Error::General("x".into()), None);
        assert_eq!(general.status(), StatusCode::BAD_GATEWAY);
        let unauthorized = merged.respond(&Error::Unauthorized("x".into()), None);
        assert_eq!(unauthorized.status(), StatusCode::FORBIDDEN);
    }
}
