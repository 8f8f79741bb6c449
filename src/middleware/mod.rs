//! Session verification middleware for Axum.
//!
//! Each request is classified and routed through [`SessionProtocol`](crate::SessionProtocol):
//!
//! - `OPTIONS` / `TRACE`: passed through untouched.
//! - `POST` to the authority's refresh path: the refresh token is exchanged
//!   and rotated cookies are written back.
//! - everything else: the access token is verified, locally when possible.
//!   Anti-CSRF is enforced for every method except `GET` unless overridden.
//!
//! Verified sessions are read with the [`VerifiedSession`] extractor. Failures
//! never reach the handler: they are answered by exactly one error handler.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use session_guard::middleware::{SessionGuard, VerifiedSession, session_middleware};
//! use session_guard::{AuthorityConfig, HttpAuthority, SessionProtocol};
//!
//! let authority = HttpAuthority::new(AuthorityConfig::from_env()?)?;
//! let guard = SessionGuard::new(SessionProtocol::new(authority));
//!
//! let app = axum::Router::new()
//!     .route("/api/me", axum::routing::get(me))
//!     .layer(axum::middleware::from_fn_with_state(guard, session_middleware));
//!
//! async fn me(VerifiedSession(session): VerifiedSession) -> String {
//!     session.user_id.to_string()
//! }
//! ```

mod config;
mod cookies;
mod dispatch;
mod error;
mod extractor;
mod state;

pub use config::{ErrorHandler, MiddlewareOptions};
pub use dispatch::{Dispatch, bypasses, classify, is_refresh_path, session_middleware};
pub use error::{ErrorHandlers, FailureHandler, MissingSession, TheftHandler};
pub use extractor::VerifiedSession;
pub use state::SessionGuard;
