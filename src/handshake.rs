use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::authority::Authority;
use crate::error::Error;
use crate::token::{PublicKey, parse_public_key_hex};
use crate::types::KeyId;

/// Access-token signing parameters published by the authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningConfig {
    pub key_id: KeyId,
    pub public_key: PublicKey,
    pub expires_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSite {
    #[default]
    Lax,
    Strict,
    None,
}

/// Authority-wide configuration cached by the client.
///
/// Replaced wholesale on refresh, never patched in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeInfo {
    pub refresh_token_path: String,
    pub access_token_path: String,
    pub anti_csrf_enabled: bool,
    pub signing: SigningConfig,
    pub cookie_domain: Option<String>,
    pub cookie_secure: bool,
    pub cookie_same_site: SameSite,
    pub session_expired_status_code: u16,
}

/// Handshake document as served by the authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct HandshakeDocument {
    pub refresh_token_path: String,
    #[serde(default = "default_access_token_path")]
    pub access_token_path: String,
    pub enable_anti_csrf: bool,
    pub signing_key: SigningKeyDocument,
    #[serde(default)]
    pub cookie_domain: Option<String>,
    #[serde(default)]
    pub cookie_secure: bool,
    #[serde(default)]
    pub cookie_same_site: SameSite,
    #[serde(default = "default_session_expired_status_code")]
    pub session_expired_status_code: u16,
}

/// Signing key as served by the authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct SigningKeyDocument {
    pub kid: String,
    pub public_key_hex: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

fn default_access_token_path() -> String {
    "/".into()
}

fn default_session_expired_status_code() -> u16 {
    401
}

impl SigningKeyDocument {
    #[must_use]
    pub fn new(kid: impl Into<String>, public_key_hex: impl Into<String>) -> Self {
        Self {
            kid: kid.into(),
            public_key_hex: public_key_hex.into(),
            expires_at: None,
        }
    }
}

impl TryFrom<SigningKeyDocument> for SigningConfig {
    type Error = Error;

    fn try_from(doc: SigningKeyDocument) -> Result<Self, Self::Error> {
        Ok(Self {
            key_id: KeyId(doc.kid),
            public_key: parse_public_key_hex(&doc.public_key_hex)?,
            expires_at: doc.expires_at,
        })
    }
}

impl From<&SigningConfig> for SigningKeyDocument {
    fn from(config: &SigningConfig) -> Self {
        Self {
            kid: config.key_id.0.clone(),
            public_key_hex: config.public_key.to_hex(),
            expires_at: config.expires_at,
        }
    }
}

impl TryFrom<HandshakeDocument> for HandshakeInfo {
    type Error = Error;

    fn try_from(doc: HandshakeDocument) -> Result<Self, Self::Error> {
        Ok(Self {
            refresh_token_path: doc.refresh_token_path,
            access_token_path: doc.access_token_path,
            anti_csrf_enabled: doc.enable_anti_csrf,
            signing: doc.signing_key.try_into()?,
            cookie_domain: doc.cookie_domain,
            cookie_secure: doc.cookie_secure,
            cookie_same_site: doc.cookie_same_site,
            session_expired_status_code: doc.session_expired_status_code,
        })
    }
}

impl From<&HandshakeInfo> for HandshakeDocument {
    fn from(info: &HandshakeInfo) -> Self {
        Self {
            refresh_token_path: info.refresh_token_path.clone(),
            access_token_path: info.access_token_path.clone(),
            enable_anti_csrf: info.anti_csrf_enabled,
            signing_key: (&info.signing).into(),
            cookie_domain: info.cookie_domain.clone(),
            cookie_secure: info.cookie_secure,
            cookie_same_site: info.cookie_same_site,
            session_expired_status_code: info.session_expired_status_code,
        }
    }
}

/// Lazily fetched snapshot of [`HandshakeInfo`].
///
/// The lock is held only to swap an `Arc`, never across the fetch. Concurrent
/// misses may fetch redundantly; the last writer wins with a complete value.
///
/// Staleness is tracked as the id of the pending signal (`0` when fresh). A
/// fetch only clears the signal it observed before starting, so a signal
/// raised while a fetch is in flight survives it.
#[derive(Debug, Default)]
pub struct HandshakeCache {
    slot: RwLock<Option<Arc<HandshakeInfo>>>,
    stale: AtomicU64,
    signals: AtomicU64,
}

impl HandshakeCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached value unless it is missing or marked stale.
    pub async fn cached(&self) -> Option<Arc<HandshakeInfo>> {
        if self.is_stale() {
            return None;
        }
        self.slot.read().await.clone()
    }

    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire) != 0
    }

    /// Returns the handshake info, fetching it from the authority on a miss.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandshakeUnavailable`] if the fetch fails. The cache is
    /// left untouched, so a later call retries.
    pub async fn get<A: Authority>(&self, authority: &A) -> Result<Arc<HandshakeInfo>, Error> {
        if let Some(info) = self.cached().await {
            return Ok(info);
        }

        let observed = self.stale.load(Ordering::Acquire);
        let info = authority.fetch_handshake().await.map_err(|e| {
            tracing::error!(error = %e, "Handshake fetch failed");
            Error::HandshakeUnavailable(e.to_string())
        })?;
        let info = Arc::new(info);

        self.install(info.clone(), observed).await;
        tracing::debug!(kid = %info.signing.key_id, "Handshake info cached");
        Ok(info)
    }

    async fn install(&self, info: Arc<HandshakeInfo>, observed: u64) {
        let mut slot = self.slot.write().await;
        *slot = Some(info);
        // Fails when a newer signal arrived during the fetch; it stays pending.
        let _ = self
            .stale
            .compare_exchange(observed, 0, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Forces the next [`get`](Self::get) to re-fetch.
    pub fn mark_stale(&self) {
        let id = self.signals.fetch_add(1, Ordering::Relaxed) + 1;
        self.stale.store(id, Ordering::Release);
    }

    /// Reconciles the cache with the signing key the authority reports as
    /// current.
    ///
    /// A matching key confirms the snapshot and clears a pending stale mark.
    /// A different key means the snapshot is outdated: it is marked stale so
    /// the next [`get`](Self::get) replaces it as a whole.
    pub async fn observe_signing(&self, signing: &SigningConfig) {
        let slot = self.slot.read().await;
        let Some(current) = slot.as_ref() else {
            return;
        };
        if current.signing == *signing {
            let pending = self.stale.load(Ordering::Acquire);
            if pending != 0 {
                let _ = self
                    .stale
                    .compare_exchange(pending, 0, Ordering::AcqRel, Ordering::Acquire);
                tracing::debug!(kid = %signing.key_id, "Cached signing key confirmed");
            }
            return;
        }
        tracing::debug!(
            cached = %current.signing.key_id,
            reported = %signing.key_id,
            "Authority reported a new signing key"
        );
        self.mark_stale();
    }

    /// Drops the cached value.
    pub async fn clear(&self) {
        *self.slot.write().await = None;
        self.stale.store(0, Ordering::Release);
    }
}
