use axum::extract::{Request, State};
use axum::http::Method;
use axum::middleware::Next;
use axum::response::Response;

use super::cookies::{self, RequestTokens};
use super::state::SessionGuard;
use crate::authority::Authority;
use crate::error::Error;
use crate::types::Session;

/// What the middleware does with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Forward untouched; no session is attached.
    PassThrough,
    /// Exchange the refresh token for rotated tokens.
    Refresh,
    /// Verify the access token.
    Verify { enforce_anti_csrf: bool },
}

/// `OPTIONS` and `TRACE` never carry session semantics.
#[must_use]
pub fn bypasses(method: &Method) -> bool {
    method == Method::OPTIONS || method == Method::TRACE
}

/// Matches `path` against the refresh path, tolerating one trailing slash on
/// either side.
#[must_use]
pub fn is_refresh_path(path: &str, refresh_path: &str) -> bool {
    path == refresh_path
        || path.strip_suffix('/') == Some(refresh_path)
        || refresh_path.strip_suffix('/') == Some(path)
}

/// Classify a request.
///
/// Anti-CSRF enforcement defaults to "every method except GET" unless
/// `enforce_override` is set.
#[must_use]
pub fn classify(
    method: &Method,
    path: &str,
    refresh_path: &str,
    enforce_override: Option<bool>,
) -> Dispatch {
    if bypasses(method) {
        return Dispatch::PassThrough;
    }
    if method == Method::POST && is_refresh_path(path, refresh_path) {
        return Dispatch::Refresh;
    }
    Dispatch::Verify {
        enforce_anti_csrf: enforce_override.unwrap_or(method != Method::GET),
    }
}

/// Session middleware for [`axum::middleware::from_fn_with_state`].
///
/// On success the [`Session`] is stored in the request extensions (read it
/// with [`VerifiedSession`](super::VerifiedSession)) and any rotated tokens
/// are written back on the response. On failure the downstream handler is
/// not called; the configured error handler produces the response.
pub async fn session_middleware<A: Authority>(
    State(guard): State<SessionGuard<A>>,
    mut request: Request,
    next: Next,
) -> Response {
    if bypasses(request.method()) {
        return next.run(request).await;
    }

    let protocol = guard.protocol();
    let handshake = match protocol.context().handshake(protocol.authority()).await {
        Ok(handshake) => handshake,
        Err(e) => return guard.fail(e, None),
    };

    let dispatch = classify(
        request.method(),
        request.uri().path(),
        &handshake.refresh_token_path,
        guard.options().enforce_anti_csrf(),
    );
    let tokens = cookies::read_tokens(request.headers());

    let outcome = match dispatch {
        Dispatch::PassThrough => return next.run(request).await,
        Dispatch::Refresh => refresh(&guard, &tokens).await,
        Dispatch::Verify { enforce_anti_csrf } => verify(&guard, &tokens, enforce_anti_csrf).await,
    };

    match outcome {
        Ok(session) => {
            request.extensions_mut().insert(session.clone());
            let mut response = next.run(request).await;
            if session.has_new_tokens() || session.anti_csrf_token.is_some() {
                cookies::write_session(&mut response, &session, &handshake);
            }
            response
        }
        Err(e) => guard.fail(e, Some(handshake.as_ref())),
    }
}

async fn verify<A: Authority>(
    guard: &SessionGuard<A>,
    tokens: &RequestTokens,
    enforce_anti_csrf: bool,
) -> Result<Session, Error> {
    if tokens.id_refresh_token.is_none() {
        return Err(Error::Unauthorized("missing id refresh token".into()));
    }
    let Some(access_token) = tokens.access_token.as_deref() else {
        return Err(Error::TryRefreshToken("missing access token".into()));
    };
    guard
        .protocol()
        .verify_session(
            access_token,
            tokens.anti_csrf_token.as_deref(),
            enforce_anti_csrf,
        )
        .await
}

async fn refresh<A: Authority>(
    guard: &SessionGuard<A>,
    tokens: &RequestTokens,
) -> Result<Session, Error> {
    let Some(refresh_token) = tokens.refresh_token.as_deref() else {
        return Err(Error::Unauthorized("missing refresh token".into()));
    };
    guard.protocol().refresh_session(refresh_token).await
}
