use crate::types::{SessionHandle, UserId};

/// Errors returned by session operations.
///
/// Every variant maps to exactly one [`ErrorKind`] through [`Error::kind`];
/// request handling dispatches on that tag, never on message text.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The session is invalid or revoked. The caller must re-authenticate.
    #[error("Unauthorised: {0}")]
    Unauthorized(String),

    /// The access token is stale but the session may be salvaged by refreshing.
    #[error("Try refresh token: {0}")]
    TryRefreshToken(String),

    /// A consumed refresh token was presented again. The authority has revoked
    /// the whole session.
    #[error("Token theft detected for session {handle} (user {user_id})")]
    TokenTheftDetected { handle: SessionHandle, user_id: UserId },

    /// Handshake info could not be fetched; no session can be verified.
    #[error("Handshake unavailable: {0}")]
    HandshakeUnavailable(String),

    /// The authority answered with an unexpected status or body.
    #[error("Authority error during {operation}: {detail}")]
    Authority {
        operation: &'static str,
        status: Option<u16>,
        detail: String,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Session payload or session data was not a JSON object.
    #[error("Invalid session payload: {0}")]
    InvalidPayload(String),

    #[error("{0}")]
    General(String),
}

/// Closed set of error kinds used to pick an error handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Unauthorized,
    TryRefreshToken,
    TokenTheftDetected,
    /// Network or availability failure. Retryable, not a security decision.
    Authority,
    General,
}

impl Error {
    /// Classifies this error into its [`ErrorKind`].
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::TryRefreshToken(_) => ErrorKind::TryRefreshToken,
            Self::TokenTheftDetected { .. } => ErrorKind::TokenTheftDetected,
            Self::HandshakeUnavailable(_) | Self::Authority { .. } | Self::Http(_) => {
                ErrorKind::Authority
            }
            Self::InvalidPayload(_) | Self::General(_) => ErrorKind::General,
        }
    }

    /// Returns `true` if the error is a security decision rather than a failure.
    #[must_use]
    pub const fn is_session_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Unauthorized | ErrorKind::TryRefreshToken | ErrorKind::TokenTheftDetected
        )
    }
}
