use std::collections::VecDeque;
use std::sync::Mutex;

use time::OffsetDateTime;

const DEFAULT_CAPACITY: usize = 256;

/// Significant protocol events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    /// Local verification was insufficient and the authority was called.
    CallingServiceInVerify,
    FetchingHandshake,
    /// An access token named a signing key other than the cached one.
    SigningKeyStale,
    TokenTheftDetected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub name: EventName,
    pub timestamp: OffsetDateTime,
}

/// Bounded, ordered log of [`SessionEvent`]s.
///
/// Oldest events are dropped once `capacity` is reached.
#[derive(Debug)]
pub struct ProcessEventLog {
    capacity: usize,
    events: Mutex<VecDeque<SessionEvent>>,
}

impl Default for ProcessEventLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl ProcessEventLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn record(&self, name: EventName) {
        let event = SessionEvent {
            name,
            timestamp: OffsetDateTime::now_utc(),
        };
        let mut events = self.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Most recent event with the given name.
    #[must_use]
    pub fn last_event_by_name(&self, name: EventName) -> Option<SessionEvent> {
        self.lock().iter().rev().find(|e| e.name == name).cloned()
    }

    #[must_use]
    pub fn count(&self, name: EventName) -> usize {
        self.lock().iter().filter(|e| e.name == name).count()
    }

    /// Snapshot of all retained events, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<SessionEvent> {
        self.lock().iter().cloned().collect()
    }

    pub fn reset(&self) {
        self.lock().clear();
    }

    // A panic while holding the lock cannot leave the deque half-updated.
    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<SessionEvent>> {
        match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
