use std::convert::Infallible;

use axum::extract::{FromRequestParts, OptionalFromRequestParts};
use axum::http::request::Parts;

use super::error::MissingSession;
use crate::types::Session;

/// Session verified by [`session_middleware`](super::session_middleware).
///
/// Returns `401 Unauthorized` if the route is not behind the middleware.
///
/// # Example
///
/// ```rust,ignore
/// async fn me(VerifiedSession(session): VerifiedSession) -> impl IntoResponse {
///     format!("Hello, {}", session.user_id)
/// }
///
/// // Optional: also reachable without a session
/// async fn home(session: Option<VerifiedSession>) -> impl IntoResponse {
///     match session {
///         Some(VerifiedSession(s)) => format!("Hello, {}", s.user_id),
///         None => "Hello, guest".to_string(),
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct VerifiedSession(pub Session);

impl<S: Send + Sync> FromRequestParts<S> for VerifiedSession {
    type Rejection = MissingSession;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Session>()
            .cloned()
            .map(Self)
            .ok_or(MissingSession)
    }
}

impl<S: Send + Sync> OptionalFromRequestParts<S> for VerifiedSession {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Option<Self>, Self::Rejection> {
        Ok(parts.extensions.get::<Session>().cloned().map(Self))
    }
}
