use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use pasetors::keys::{AsymmetricKeyPair, Generate};
use pasetors::version4::V4;
use serde_json::Value as JsonValue;
use time::{Duration, OffsetDateTime};
use ulid::Ulid;

use super::{Authority, NewSession, SessionGrant, VerifyRequest};
use crate::error::Error;
use crate::handshake::{HandshakeInfo, SameSite, SigningConfig};
use crate::secret;
use crate::token::{self, AccessTokenClaims, PublicKey, TokenError};
use crate::types::{KeyId, Session, SessionHandle, Token, UserId};

struct SigningKey {
    kid: KeyId,
    pair: AsymmetricKeyPair<V4>,
}

impl SigningKey {
    fn generate(kid: String) -> Self {
        Self {
            kid: KeyId(kid),
            pair: AsymmetricKeyPair::<V4>::generate()
                .expect("system RNG available for signing key generation"),
        }
    }

    fn public_key(&self) -> Result<PublicKey, Error> {
        token::parse_public_key_hex(&hex::encode(self.pair.public.as_bytes()))
    }

    fn config(&self) -> Result<SigningConfig, Error> {
        Ok(SigningConfig {
            key_id: self.kid.clone(),
            public_key: self.public_key()?,
            expires_at: None,
        })
    }
}

struct SessionRecord {
    user_id: UserId,
    user_data: JsonValue,
    session_data: JsonValue,
    anti_csrf_token: Option<String>,
    current_refresh_hash: String,
    consumed_refresh_hashes: HashSet<String>,
    refresh_expires_at: OffsetDateTime,
}

#[derive(Default)]
struct State {
    keys: Vec<SigningKey>,
    sessions: HashMap<SessionHandle, SessionRecord>,
    // Every refresh token ever issued, by hash. Entries outlive revocation so
    // reuse can still be told apart from garbage.
    refresh_index: HashMap<String, SessionHandle>,
}

impl State {
    fn current_key(&self) -> Result<&SigningKey, Error> {
        self.keys
            .last()
            .ok_or_else(|| Error::General("no signing key".into()))
    }

    fn key(&self, kid: &KeyId) -> Option<&SigningKey> {
        self.keys.iter().find(|k| &k.kid == kid)
    }
}

/// In-process session authority.
///
/// Honours the full [`Authority`] contract: one-time refresh tokens, theft
/// revocation, anti-CSRF toggling and signing-key rotation. Intended for local
/// development and tests; sessions live only as long as the value.
pub struct InMemoryAuthority {
    state: Mutex<State>,
    anti_csrf_enabled: bool,
    access_token_ttl: Duration,
    refresh_token_ttl: Duration,
    refresh_token_path: String,
    available: AtomicBool,
    handshake_fetches: AtomicUsize,
}

impl Default for InMemoryAuthority {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAuthority {
    /// Authority with anti-CSRF enabled, 1 hour access tokens and 100 day
    /// refresh tokens, refreshing at `/session/refresh`.
    #[must_use]
    pub fn new() -> Self {
        let state = State {
            keys: vec![SigningKey::generate("k1".into())],
            ..State::default()
        };
        Self {
            state: Mutex::new(state),
            anti_csrf_enabled: true,
            access_token_ttl: Duration::hours(1),
            refresh_token_ttl: Duration::days(100),
            refresh_token_path: "/session/refresh".into(),
            available: AtomicBool::new(true),
            handshake_fetches: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn with_anti_csrf(mut self, enabled: bool) -> Self {
        self.anti_csrf_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_access_token_ttl(mut self, ttl: Duration) -> Self {
        self.access_token_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_refresh_token_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_token_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_refresh_token_path(mut self, path: impl Into<String>) -> Self {
        self.refresh_token_path = path.into();
        self
    }

    /// Starts signing with a new key. Tokens signed with older keys stay valid.
    pub fn rotate_signing_key(&self) -> KeyId {
        let mut state = self.lock();
        let kid = format!("k{}", state.keys.len() + 1);
        state.keys.push(SigningKey::generate(kid.clone()));
        tracing::debug!(kid = %kid, "In-memory authority rotated signing key");
        KeyId(kid)
    }

    /// Simulates an outage: every operation fails with [`Error::Authority`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of handshake fetches served so far.
    #[must_use]
    pub fn handshake_fetches(&self) -> usize {
        self.handshake_fetches.load(Ordering::SeqCst)
    }

    /// Number of sessions that are neither revoked nor stolen.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn ensure_available(&self, operation: &'static str) -> Result<(), Error> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Authority {
                operation,
                status: None,
                detail: "authority unavailable".into(),
            })
        }
    }

    fn handshake(&self) -> Result<HandshakeInfo, Error> {
        let state = self.lock();
        Ok(HandshakeInfo {
            refresh_token_path: self.refresh_token_path.clone(),
            access_token_path: "/".into(),
            anti_csrf_enabled: self.anti_csrf_enabled,
            signing: state.current_key()?.config()?,
            cookie_domain: None,
            cookie_secure: false,
            cookie_same_site: SameSite::Lax,
            session_expired_status_code: 401,
        })
    }

    fn mint_access_token(
        &self,
        state: &State,
        handle: &SessionHandle,
        record: &SessionRecord,
        parent_refresh_token_hash: Option<String>,
    ) -> Result<Token, Error> {
        let now = OffsetDateTime::now_utc();
        let claims = AccessTokenClaims {
            session_handle: handle.clone(),
            user_id: record.user_id.clone(),
            user_data: record.user_data.clone(),
            anti_csrf_token: record.anti_csrf_token.clone(),
            parent_refresh_token_hash,
            exp: now + self.access_token_ttl,
            iat: now,
        };
        let key = state.current_key()?;
        let value = token::sign_access_token(&key.pair.secret, &key.kid, &claims)?;
        Ok(Token::new(value, claims.exp))
    }

    /// Issues a fresh refresh/id-refresh pair and access token for `handle`.
    fn issue_tokens(
        &self,
        state: &mut State,
        handle: &SessionHandle,
        parent_refresh_token_hash: Option<String>,
    ) -> Result<Session, Error> {
        let refresh_value = secret::generate_token_value();
        let refresh_hash = secret::hash_refresh_token(&refresh_value);
        let refresh_expires_at = OffsetDateTime::now_utc() + self.refresh_token_ttl;
        let anti_csrf_token = self
            .anti_csrf_enabled
            .then(secret::generate_anti_csrf_token);

        let record = state
            .sessions
            .get_mut(handle)
            .ok_or_else(|| Error::Unauthorized("session revoked".into()))?;
        record.current_refresh_hash = refresh_hash.clone();
        record.refresh_expires_at = refresh_expires_at;
        record.anti_csrf_token = anti_csrf_token.clone();
        state.refresh_index.insert(refresh_hash, handle.clone());

        let record = state
            .sessions
            .get(handle)
            .ok_or_else(|| Error::Unauthorized("session revoked".into()))?;
        let access_token =
            self.mint_access_token(state, handle, record, parent_refresh_token_hash)?;

        Ok(Session {
            access_token: Some(access_token),
            refresh_token: Some(Token::new(refresh_value, refresh_expires_at)),
            id_refresh_token: Some(Token::new(
                secret::generate_token_value(),
                refresh_expires_at,
            )),
            anti_csrf_token,
            ..Session::bare(handle.clone(), record.user_id.clone(), record.user_data.clone())
        })
    }

    fn grant(&self, state: &State, session: Session) -> Result<SessionGrant, Error> {
        Ok(SessionGrant {
            session,
            signing: Some(state.current_key()?.config()?),
        })
    }

    fn verify(&self, request: VerifyRequest<'_>) -> Result<SessionGrant, Error> {
        let state = self.lock();

        let kid = token::extract_kid_from_token(request.access_token)?;
        let key = state
            .key(&kid)
            .ok_or_else(|| Error::Unauthorized(format!("unknown signing key {kid}")))?;
        let claims = token::verify_access_token(&key.kid, &key.public_key()?, request.access_token)
            .map_err(|e| match e {
                TokenError::Expired => Error::TryRefreshToken(e.to_string()),
                TokenError::KeyMismatch { .. } | TokenError::Invalid(_) => {
                    Error::Unauthorized(e.to_string())
                }
            })?;

        let record = state
            .sessions
            .get(&claims.session_handle)
            .ok_or_else(|| Error::Unauthorized("session revoked".into()))?;

        if self.anti_csrf_enabled && request.enforce_anti_csrf {
            let matches = match (request.anti_csrf_token, claims.anti_csrf_token.as_deref()) {
                (Some(given), Some(expected)) => secret::constant_time_eq(given, expected),
                _ => false,
            };
            if !matches {
                return Err(Error::TryRefreshToken("anti-csrf check failed".into()));
            }
        }

        let mut session = Session::bare(
            claims.session_handle.clone(),
            claims.user_id.clone(),
            claims.user_data.clone(),
        );
        // First use after a refresh: commit by re-issuing without the parent hash.
        if claims.parent_refresh_token_hash.is_some() {
            session.access_token =
                Some(self.mint_access_token(&state, &claims.session_handle, record, None)?);
        }

        self.grant(&state, session)
    }

    fn refresh(&self, refresh_token: &str) -> Result<SessionGrant, Error> {
        let mut state = self.lock();
        let hash = secret::hash_refresh_token(refresh_token);

        let handle = state
            .refresh_index
            .get(&hash)
            .cloned()
            .ok_or_else(|| Error::Unauthorized("unknown refresh token".into()))?;
        let record = state
            .sessions
            .get_mut(&handle)
            .ok_or_else(|| Error::Unauthorized("session revoked".into()))?;

        if record.consumed_refresh_hashes.contains(&hash) {
            let user_id = record.user_id.clone();
            state.sessions.remove(&handle);
            tracing::warn!(handle = %handle, user_id = %user_id, "Refresh token reuse, session revoked");
            return Err(Error::TokenTheftDetected { handle, user_id });
        }
        if record.current_refresh_hash != hash {
            return Err(Error::Unauthorized("refresh token superseded".into()));
        }
        if record.refresh_expires_at <= OffsetDateTime::now_utc() {
            return Err(Error::Unauthorized("refresh token expired".into()));
        }

        record.consumed_refresh_hashes.insert(hash.clone());
        let session = self.issue_tokens(&mut state, &handle, Some(hash))?;
        self.grant(&state, session)
    }
}

impl Authority for InMemoryAuthority {
    async fn fetch_handshake(&self) -> Result<HandshakeInfo, Error> {
        self.ensure_available("handshake")?;
        self.handshake_fetches.fetch_add(1, Ordering::SeqCst);
        self.handshake()
    }

    async fn create_session(&self, session: NewSession) -> Result<SessionGrant, Error> {
        self.ensure_available("create session")?;
        let mut state = self.lock();
        let handle = SessionHandle(Ulid::new().to_string());
        state.sessions.insert(
            handle.clone(),
            SessionRecord {
                user_id: session.user_id,
                user_data: session.user_data,
                session_data: session.session_data,
                anti_csrf_token: None,
                current_refresh_hash: String::new(),
                consumed_refresh_hashes: HashSet::new(),
                refresh_expires_at: OffsetDateTime::now_utc(),
            },
        );
        let session = self.issue_tokens(&mut state, &handle, None)?;
        self.grant(&state, session)
    }

    async fn verify_session(&self, request: VerifyRequest<'_>) -> Result<SessionGrant, Error> {
        self.ensure_available("verify session")?;
        self.verify(request)
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<SessionGrant, Error> {
        self.ensure_available("refresh session")?;
        self.refresh(refresh_token)
    }

    async fn revoke_sessions(&self, handles: &[SessionHandle]) -> Result<Vec<SessionHandle>, Error> {
        self.ensure_available("revoke sessions")?;
        let mut state = self.lock();
        Ok(handles
            .iter()
            .filter(|handle| state.sessions.remove(*handle).is_some())
            .cloned()
            .collect())
    }

    async fn revoke_all_sessions_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<SessionHandle>, Error> {
        self.ensure_available("revoke user sessions")?;
        let mut state = self.lock();
        let mut revoked: Vec<SessionHandle> = state
            .sessions
            .iter()
            .filter(|(_, record)| &record.user_id == user_id)
            .map(|(handle, _)| handle.clone())
            .collect();
        for handle in &revoked {
            state.sessions.remove(handle);
        }
        revoked.sort();
        Ok(revoked)
    }

    async fn list_session_handles(&self, user_id: &UserId) -> Result<Vec<SessionHandle>, Error> {
        self.ensure_available("list sessions")?;
        let state = self.lock();
        let mut handles: Vec<SessionHandle> = state
            .sessions
            .iter()
            .filter(|(_, record)| &record.user_id == user_id)
            .map(|(handle, _)| handle.clone())
            .collect();
        handles.sort();
        Ok(handles)
    }

    async fn get_session_data(&self, handle: &SessionHandle) -> Result<JsonValue, Error> {
        self.ensure_available("get session data")?;
        self.lock()
            .sessions
            .get(handle)
            .map(|record| record.session_data.clone())
            .ok_or_else(|| Error::Unauthorized("session does not exist".into()))
    }

    async fn update_session_data(&self, handle: &SessionHandle, data: JsonValue) -> Result<(), Error> {
        self.ensure_available("update session data")?;
        let mut state = self.lock();
        let record = state
            .sessions
            .get_mut(handle)
            .ok_or_else(|| Error::Unauthorized("session does not exist".into()))?;
        record.session_data = data;
        Ok(())
    }
}
