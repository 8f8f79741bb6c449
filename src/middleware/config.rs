use std::sync::Arc;

use axum::response::Response;

use super::error::ErrorHandlers;
use crate::error::Error;

/// Replaces the whole error classification for a middleware instance.
pub type ErrorHandler = Arc<dyn Fn(Error) -> Response + Send + Sync>;

/// Per-instance middleware options.
///
/// All fields are optional; unset fields fall back to request-derived or
/// process-wide defaults.
///
/// ```rust,ignore
/// use session_guard::middleware::MiddlewareOptions;
///
/// // Verify anti-CSRF even on GET, answer every failure with a bare 401.
/// let options = MiddlewareOptions::new()
///     .with_enforce_anti_csrf(true)
///     .with_on_error(|_err| axum::http::StatusCode::UNAUTHORIZED.into_response());
/// ```
#[derive(Clone, Default)]
pub struct MiddlewareOptions {
    pub(super) enforce_anti_csrf: Option<bool>,
    pub(super) on_error: Option<ErrorHandler>,
    pub(super) handlers: ErrorHandlers,
}

impl MiddlewareOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the anti-CSRF decision, which otherwise is "enforce unless GET".
    #[must_use]
    pub fn with_enforce_anti_csrf(mut self, enforce: bool) -> Self {
        self.enforce_anti_csrf = Some(enforce);
        self
    }

    /// Handle every failure with `handler`, bypassing the per-kind handlers.
    #[must_use]
    pub fn with_on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(Error) -> Response + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(handler));
        self
    }

    /// Override individual per-kind handlers; unset slots keep the defaults.
    #[must_use]
    pub fn with_error_handlers(mut self, handlers: ErrorHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    #[must_use]
    pub fn enforce_anti_csrf(&self) -> Option<bool> {
        self.enforce_anti_csrf
    }
}

impl std::fmt::Debug for MiddlewareOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareOptions")
            .field("enforce_anti_csrf", &self.enforce_anti_csrf)
            .field("on_error", &self.on_error.is_some())
            .field("handlers", &self.handlers)
            .finish()
    }
}
