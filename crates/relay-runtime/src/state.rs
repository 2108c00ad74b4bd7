//! Per-session opaque state, independent of message settlement.

use bytes::Bytes;
use dashmap::DashMap;
use relay_core::SessionKey;

/// Last-write-wins byte blobs keyed by session.
#[derive(Default)]
pub struct SessionStateStore {
    states: DashMap<SessionKey, Bytes>,
}

impl SessionStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// State for a session, if any was set.
    pub fn get(&self, key: &SessionKey) -> Option<Bytes> {
        self.states.get(key).map(|e| e.value().clone())
    }

    /// Replace a session's state. An empty blob clears it.
    pub fn set(&self, key: &SessionKey, state: Bytes) {
        if state.is_empty() {
            let _ = self.states.remove(key);
        } else {
            let _ = self.states.insert(key.clone(), state);
        }
    }

    /// Number of sessions with state.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether no session has state.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
