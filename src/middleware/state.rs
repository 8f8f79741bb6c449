use std::sync::Arc;

use axum::response::Response;

use super::config::MiddlewareOptions;
use super::error::ErrorHandlers;
use crate::authority::Authority;
use crate::error::Error;
use crate::handshake::HandshakeInfo;
use crate::protocol::SessionProtocol;

/// State of one session middleware instance.
///
/// Clones share the protocol, its [`SessionContext`](crate::SessionContext)
/// and the process-wide handlers. Derive per-route instances with
/// [`with_options`](Self::with_options).
///
/// ```rust,ignore
/// let guard = SessionGuard::new(protocol);
/// let app = Router::new()
///     .route("/api/me", get(me))
///     .layer(axum::middleware::from_fn_with_state(guard, session_middleware));
/// ```
pub struct SessionGuard<A> {
    pub(super) protocol: SessionProtocol<A>,
    pub(super) options: Arc<MiddlewareOptions>,
    pub(super) process_handlers: Arc<ErrorHandlers>,
}

// Manual Clone: avoid derive adding an `A: Clone` bound.
impl<A> Clone for SessionGuard<A> {
    fn clone(&self) -> Self {
        Self {
            protocol: self.protocol.clone(),
            options: self.options.clone(),
            process_handlers: self.process_handlers.clone(),
        }
    }
}

impl<A: Authority> SessionGuard<A> {
    #[must_use]
    pub fn new(protocol: SessionProtocol<A>) -> Self {
        Self {
            protocol,
            options: Arc::new(MiddlewareOptions::default()),
            process_handlers: Arc::new(ErrorHandlers::default()),
        }
    }

    /// Set the handlers shared by every instance derived from this guard.
    #[must_use]
    pub fn with_process_handlers(mut self, handlers: ErrorHandlers) -> Self {
        self.process_handlers = Arc::new(handlers);
        self
    }

    /// Derive an instance with its own options, sharing everything else.
    #[must_use]
    pub fn with_options(&self, options: MiddlewareOptions) -> Self {
        Self {
            protocol: self.protocol.clone(),
            options: Arc::new(options),
            process_handlers: self.process_handlers.clone(),
        }
    }

    #[must_use]
    pub fn protocol(&self) -> &SessionProtocol<A> {
        &self.protocol
    }

    #[must_use]
    pub fn options(&self) -> &MiddlewareOptions {
        &self.options
    }

    /// Answer a failed request: `on_error` if set, else exactly one per-kind handler.
    pub(super) fn fail(&self, error: Error, handshake: Option<&HandshakeInfo>) -> Response {
        tracing::debug!(error = %error, kind = ?error.kind(), "Session check failed");
        if let Some(on_error) = &self.options.on_error {
            return on_error(error);
        }
        self.options
            .handlers
            .or(&self.process_handlers)
            .respond(&error, handshake)
    }
}
