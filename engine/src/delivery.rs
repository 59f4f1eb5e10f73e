use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sync_api::MessageId;

/// Transient per-message delivery feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Sending,
    Sent,
    Delivered,
    Error,
}

struct Entry {
    state: DeliveryState,
    at: Instant,
}

/// Keyed store of short-lived delivery states. Not a strict state
/// machine: callers are trusted to move sending → sent → delivered (or
/// error), the tracker only records and expires.
pub struct DeliveryTracker {
    entries: Mutex<HashMap<MessageId, Entry>>,
    ttl: Duration,
}

impl DeliveryTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn set_state(&self, id: MessageId, state: DeliveryState) {
        let mut guard = self.entries.lock();
        guard.insert(
            id,
            Entry {
                state,
                at: Instant::now(),
            },
        );
    }

    pub fn get(&self, id: MessageId) -> Option<DeliveryState> {
        self.entries.lock().get(&id).map(|e| e.state)
    }

    /// Re-key a pending entry once the backend assigns the final id,
    /// keeping its age so expiry is unaffected.
    pub fn promote(&self, temp_id: MessageId, final_id: MessageId) {
        let mut guard = self.entries.lock();
        if let Some(entry) = guard.remove(&temp_id) {
            guard.insert(final_id, entry);
        }
    }

    /// Drop entries older than the ttl as seen from `now`. Returns how
    /// many were removed. The engine calls this on a fixed period; if it
    /// never ran, entries would accumulate without bound.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut guard = self.entries.lock();
        let before = guard.len();
        guard.retain(|_, e| now.duration_since(e.at) < self.ttl);
        before - guard.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
