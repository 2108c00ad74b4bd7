//! Session queue table: per-session FIFO of pending messages.
//!
//! Every mutation happens under one lock, so no two workers can dequeue the
//! same message or lease the same session. Sessions are selected round-robin
//! in first-arrival order: a session handed out by
//! [`SessionQueueTable::peek_next_eligible`] moves to the back of the rotation.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use relay_core::{Message, SessionKey};
use tokio::sync::Notify;
use tracing::debug;

/// One session's pending messages and lease flag.
struct SessionEntry {
    pending: VecDeque<Message>,
    leased: bool,
    /// Notified on every arrival for this session (wakes its idle worker).
    arrived: Arc<Notify>,
}

impl SessionEntry {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            leased: false,
            arrived: Arc::new(Notify::new()),
        }
    }
}

#[derive(Default)]
struct TableInner {
    sessions: HashMap<SessionKey, SessionEntry>,
    rotation: VecDeque<SessionKey>,
}

impl TableInner {
    fn entry(&mut self, key: &SessionKey) -> &mut SessionEntry {
        if !self.sessions.contains_key(key) {
            self.rotation.push_back(key.clone());
        }
        self.sessions
            .entry(key.clone())
            .or_insert_with(SessionEntry::new)
    }

    fn close(&mut self, key: &SessionKey) {
        let _ = self.sessions.remove(key);
        self.rotation.retain(|k| k != key);
        debug!(session_key = %key, "session closed");
    }
}

/// Per-session ordered queues plus session lease flags.
#[derive(Default)]
pub struct SessionQueueTable {
    inner: Mutex<TableInner>,
    /// Notified when a session may have become eligible for selection.
    arrivals: Notify,
}

impl SessionQueueTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message to the tail of its session.
    pub fn enqueue(&self, key: &SessionKey, message: Message) {
        let arrived = {
            let mut inner = self.inner.lock();
            let entry = inner.entry(key);
            entry.pending.push_back(message);
            Arc::clone(&entry.arrived)
        };
        arrived.notify_one();
        self.arrivals.notify_one();
    }

    /// Put a message back at the head of its session (redelivery).
    pub fn requeue_front(&self, key: &SessionKey, message: Message) {
        let arrived = {
            let mut inner = self.inner.lock();
            let entry = inner.entry(key);
            entry.pending.push_front(message);
            Arc::clone(&entry.arrived)
        };
        arrived.notify_one();
        self.arrivals.notify_one();
    }

    /// A session with pending messages and no lease, if any.
    pub fn peek_next_session(&self) -> Option<SessionKey> {
        self.peek_next_eligible(|_| true)
    }

    /// Like [`Self::peek_next_session`], restricted to keys accepted by
    /// `eligible`. The returned session is rotated to the back.
    pub fn peek_next_eligible(&self, eligible: impl Fn(&SessionKey) -> bool) -> Option<SessionKey> {
        let mut inner = self.inner.lock();
        let TableInner { sessions, rotation } = &mut *inner;
        let idx = rotation.iter().position(|key| {
            sessions
                .get(key)
                .is_some_and(|e| !e.leased && !e.pending.is_empty())
                && eligible(key)
        })?;
        let key = rotation.remove(idx)?;
        rotation.push_back(key.clone());
        Some(key)
    }

    /// Claim a session for exclusive processing.
    ///
    /// Fails if the session is unknown, already leased, or has nothing pending.
    pub fn try_lease(&self, key: &SessionKey) -> bool {
        let mut inner = self.inner.lock();
        match inner.sessions.get_mut(key) {
            Some(entry) if !entry.leased && !entry.pending.is_empty() => {
                entry.leased = true;
                true
            }
            _ => false,
        }
    }

    /// Return a leased session to the pool. Closes it if nothing is pending.
    pub fn release(&self, key: &SessionKey) {
        let reselectable = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.sessions.get_mut(key) else {
                return;
            };
            entry.leased = false;
            if entry.pending.is_empty() {
                inner.close(key);
                false
            } else {
                true
            }
        };
        if reselectable {
            self.arrivals.notify_one();
        }
    }

    /// Pop the oldest message of a session. `None` for empty or unknown sessions.
    pub fn dequeue(&self, key: &SessionKey) -> Option<Message> {
        let mut inner = self.inner.lock();
        let entry = inner.sessions.get_mut(key)?;
        let message = entry.pending.pop_front();
        if entry.pending.is_empty() && !entry.leased {
            inner.close(key);
        }
        message
    }

    /// Arrival signal for a session, used by a leased worker waiting for more work.
    pub fn arrival_signal(&self, key: &SessionKey) -> Option<Arc<Notify>> {
        self.inner
            .lock()
            .sessions
            .get(key)
            .map(|e| Arc::clone(&e.arrived))
    }

    /// Wait until some session may have become selectable.
    pub async fn arrived(&self) {
        self.arrivals.notified().await;
    }

    /// Pending message count for a session.
    pub fn pending_len(&self, key: &SessionKey) -> usize {
        self.inner
            .lock()
            .sessions
            .get(key)
            .map_or(0, |e| e.pending.len())
    }

    /// Pending messages across all sessions.
    pub fn total_pending(&self) -> usize {
        self.inner
            .lock()
            .sessions
            .values()
            .map(|e| e.pending.len())
            .sum()
    }

    /// Whether a session is currently leased.
    pub fn is_leased(&self, key: &SessionKey) -> bool {
        self.inner.lock().sessions.get(key).is_some_and(|e| e.leased)
    }

    /// Number of open sessions (pending messages or leased).
    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }
}
