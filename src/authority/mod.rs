//! The session authority: the remote service that mints, signs, persists and
//! revokes sessions.
//!
//! This crate is a pure client of the [`Authority`] contract. Two
//! implementations ship with it:
//!
//! - [`HttpAuthority`]: talks to the authority over HTTP(S), with host failover.
//! - [`InMemoryAuthority`]: an in-process authority for local development and tests.

mod config;
mod http;
mod memory;

use std::future::Future;

use serde_json::Value as JsonValue;

pub use config::AuthorityConfig;
pub use http::HttpAuthority;
pub use memory::InMemoryAuthority;

use crate::error::Error;
use crate::handshake::{HandshakeInfo, SigningConfig};
use crate::types::{Session, SessionHandle, UserId};

/// Input to [`Authority::create_session`].
#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: UserId,
    /// Embedded in the access token, readable without an authority call.
    pub user_data: JsonValue,
    /// Stored by the authority, read through [`Authority::get_session_data`].
    pub session_data: JsonValue,
}

/// Input to [`Authority::verify_session`].
#[derive(Debug, Clone, Copy)]
pub struct VerifyRequest<'a> {
    pub access_token: &'a str,
    pub anti_csrf_token: Option<&'a str>,
    pub enforce_anti_csrf: bool,
}

/// A session returned by the authority, with the signing key it currently
/// uses when it chose to report one.
#[derive(Debug, Clone)]
pub struct SessionGrant {
    pub session: Session,
    pub signing: Option<SigningConfig>,
}

/// Operations this crate relies on from the session authority.
///
/// Protocol outcomes are reported as errors: [`Error::Unauthorized`],
/// [`Error::TryRefreshToken`] and [`Error::TokenTheftDetected`]. Availability
/// failures are [`Error::Authority`] or [`Error::Http`].
pub trait Authority: Send + Sync + 'static {
    fn fetch_handshake(&self) -> impl Future<Output = Result<HandshakeInfo, Error>> + Send;

    /// Mints a handle and all token kinds for a new session.
    fn create_session(
        &self,
        session: NewSession,
    ) -> impl Future<Output = Result<SessionGrant, Error>> + Send;

    /// Authoritative verification. May return a rotated access token.
    fn verify_session(
        &self,
        request: VerifyRequest<'_>,
    ) -> impl Future<Output = Result<SessionGrant, Error>> + Send;

    /// Exchanges a refresh token exactly once. Reuse revokes the session and
    /// fails with [`Error::TokenTheftDetected`].
    fn refresh_session(
        &self,
        refresh_token: &str,
    ) -> impl Future<Output = Result<SessionGrant, Error>> + Send;

    /// Revokes the given handles. Returns those that were active.
    fn revoke_sessions(
        &self,
        handles: &[SessionHandle],
    ) -> impl Future<Output = Result<Vec<SessionHandle>, Error>> + Send;

    fn revoke_all_sessions_for_user(
        &self,
        user_id: &UserId,
    ) -> impl Future<Output = Result<Vec<SessionHandle>, Error>> + Send;

    fn list_session_handles(
        &self,
        user_id: &UserId,
    ) -> impl Future<Output = Result<Vec<SessionHandle>, Error>> + Send;

    fn get_session_data(
        &self,
        handle: &SessionHandle,
    ) -> impl Future<Output = Result<JsonValue, Error>> + Send;

    fn update_session_data(
        &self,
        handle: &SessionHandle,
        data: JsonValue,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}
