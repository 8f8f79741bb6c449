use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use time::{Duration, OffsetDateTime};

use crate::authority::Authority;
use crate::error::Error;
use crate::events::{EventName, ProcessEventLog};
use crate::handshake::{HandshakeCache, HandshakeInfo};
use crate::types::SessionHandle;

/// Handles revoked through this process, consulted by local verification.
///
/// Entries are kept for `retention`, which should cover the access-token
/// lifetime: after that, tokens of the handle fail on expiry anyway.
#[derive(Debug)]
struct RevokedHandles {
    retention: Duration,
    handles: Mutex<HashMap<SessionHandle, OffsetDateTime>>,
}

impl RevokedHandles {
    fn new(retention: Duration) -> Self {
        Self {
            retention,
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn insert(&self, handles: impl IntoIterator<Item = SessionHandle>) {
        let now = OffsetDateTime::now_utc();
        let cutoff = now - self.retention;
        let mut map = self.lock();
        map.retain(|_, revoked_at| *revoked_at > cutoff);
        map.extend(handles.into_iter().map(|h| (h, now)));
    }

    fn contains(&self, handle: &SessionHandle) -> bool {
        let cutoff = OffsetDateTime::now_utc() - self.retention;
        self.lock()
            .get(handle)
            .is_some_and(|revoked_at| *revoked_at > cutoff)
    }

    fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionHandle, OffsetDateTime>> {
        match self.handles.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Process-wide state shared by every request: the handshake snapshot, the
/// event log and locally known revocations.
///
/// Constructed explicitly and injected into [`SessionProtocol`](crate::SessionProtocol),
/// so separate contexts never observe each other.
#[derive(Debug)]
pub struct SessionContext {
    handshake: HandshakeCache,
    events: ProcessEventLog,
    revoked: RevokedHandles,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self {
            handshake: HandshakeCache::new(),
            events: ProcessEventLog::new(),
            revoked: RevokedHandles::new(Duration::days(1)),
        }
    }
}

impl SessionContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.events = ProcessEventLog::with_capacity(capacity);
        self
    }

    /// How long a handle revoked through this process stays rejected by
    /// local verification (default 1 day).
    #[must_use]
    pub fn with_revocation_retention(mut self, retention: Duration) -> Self {
        self.revoked = RevokedHandles::new(retention);
        self
    }

    /// Returns the handshake info, fetching it on first use or after staleness.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandshakeUnavailable`] if the authority cannot be reached.
    pub async fn handshake<A: Authority>(&self, authority: &A) -> Result<Arc<HandshakeInfo>, Error> {
        if let Some(info) = self.handshake.cached().await {
            return Ok(info);
        }
        self.events.record(EventName::FetchingHandshake);
        self.handshake.get(authority).await
    }

    #[must_use]
    pub fn handshake_cache(&self) -> &HandshakeCache {
        &self.handshake
    }

    #[must_use]
    pub fn events(&self) -> &ProcessEventLog {
        &self.events
    }

    pub fn mark_revoked(&self, handles: impl IntoIterator<Item = SessionHandle>) {
        self.revoked.insert(handles);
    }

    #[must_use]
    pub fn is_revoked(&self, handle: &SessionHandle) -> bool {
        self.revoked.contains(handle)
    }

    /// Forgets the cached handshake, the event log and known revocations.
    pub async fn reset(&self) {
        self.handshake.clear().await;
        self.events.reset();
        self.revoked.clear();
    }
}
