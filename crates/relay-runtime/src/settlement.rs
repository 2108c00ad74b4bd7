//! Settlement tracker: per-message lock and disposition state machine.
//!
//! ```text
//! Locked ──complete──▶ Completed            (terminal)
//!    │ ───dead_letter─▶ DeadLettered         (terminal)
//!    │ ───defer───────▶ Deferred ──receive_deferred──▶ Locked
//!    └───abandon / lock expiry──▶ Abandoned ──redelivery──▶ Locked
//!                          └─ delivery budget spent ─▶ DeadLettered
//! ```
//!
//! Every settlement must present the lock token of the current delivery.
//! Completing an already-completed message is rejected like any other
//! settlement outside `Locked`.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use relay_core::{LockToken, Message, MessageId, ReceivedMessage};
use serde::Serialize;
use tokio::time::Instant;

use crate::errors::DispatchError;

/// How many settled message ids are remembered for rejecting re-settlement.
const SETTLED_HISTORY_LIMIT: usize = 4096;

/// Disposition state of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementState {
    /// Delivered and exclusively held by a lock token.
    Locked,
    /// Processed successfully. Terminal.
    Completed,
    /// Given back for redelivery.
    Abandoned,
    /// Set aside until retrieved by id.
    Deferred,
    /// Moved to the dead-letter store. Terminal.
    DeadLettered,
}

impl SettlementState {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::DeadLettered)
    }
}

impl fmt::Display for SettlementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Locked => write!(f, "locked"),
            Self::Completed => write!(f, "completed"),
            Self::Abandoned => write!(f, "abandoned"),
            Self::Deferred => write!(f, "deferred"),
            Self::DeadLettered => write!(f, "dead_lettered"),
        }
    }
}

/// What an abandon (explicit or by lock expiry) turned into.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AbandonOutcome {
    /// Message goes back to its session for redelivery.
    Redeliver(Message),
    /// Delivery budget exhausted; message must be dead-lettered.
    DeadLettered(Message),
}

struct Record {
    state: SettlementState,
    /// Held while `Locked` or `Deferred`.
    message: Option<Message>,
    lock_token: Option<LockToken>,
    locked_until: Option<Instant>,
}

#[derive(Default)]
struct TrackerInner {
    records: HashMap<MessageId, Record>,
    settled: VecDeque<MessageId>,
}

impl TrackerInner {
    /// The record for `id`, if it is locked under `token`.
    fn locked(&mut self, id: &MessageId, token: &LockToken) -> Result<&mut Record, DispatchError> {
        let Some(record) = self.records.get_mut(id) else {
            return Err(invalid(id, "unknown"));
        };
        if record.state != SettlementState::Locked {
            return Err(invalid(id, &record.state.to_string()));
        }
        if record.lock_token.as_ref() != Some(token) {
            return Err(invalid(id, "locked by another delivery"));
        }
        Ok(record)
    }

    fn finish(&mut self, id: &MessageId, state: SettlementState) -> Option<Message> {
        let record = self.records.get_mut(id)?;
        record.state = state;
        record.lock_token = None;
        record.locked_until = None;
        let message = record.message.take();
        if state.is_terminal() {
            self.settled.push_back(id.clone());
            while self.settled.len() > SETTLED_HISTORY_LIMIT {
                if let Some(evicted) = self.settled.pop_front() {
                    let _ = self.records.remove(&evicted);
                }
            }
        }
        message
    }

    fn abandon_record(&mut self, id: &MessageId, max_delivery_count: u32) -> Option<AbandonOutcome> {
        let exhausted = self
            .records
            .get(id)?
            .message
            .as_ref()
            .is_some_and(|m| m.delivery_count >= max_delivery_count);
        if exhausted {
            self.finish(id, SettlementState::DeadLettered)
                .map(AbandonOutcome::DeadLettered)
        } else {
            self.finish(id, SettlementState::Abandoned)
                .map(AbandonOutcome::Redeliver)
        }
    }
}

fn invalid(id: &MessageId, state: &str) -> DispatchError {
    DispatchError::InvalidSettlementState {
        message_id: id.clone(),
        state: state.to_string(),
    }
}

/// Tracks locks and dispositions for every delivered message.
pub struct SettlementTracker {
    inner: Mutex<TrackerInner>,
    max_delivery_count: u32,
    lease_duration: Duration,
}

impl SettlementTracker {
    /// Create a tracker. `max_delivery_count` is raised to at least one.
    pub fn new(max_delivery_count: u32, lease_duration: Duration) -> Self {
        Self {
            inner: Mutex::new(TrackerInner::default()),
            max_delivery_count: max_delivery_count.max(1),
            lease_duration,
        }
    }

    /// Lock a message for delivery, counting the delivery and issuing a fresh token.
    pub fn lock(&self, mut message: Message) -> ReceivedMessage {
        message.delivery_count += 1;
        let lock_token = LockToken::new();
        let _ = self.inner.lock().records.insert(
            message.id.clone(),
            Record {
                state: SettlementState::Locked,
                message: Some(message.clone()),
                lock_token: Some(lock_token.clone()),
                locked_until: Some(Instant::now() + self.lease_duration),
            },
        );
        ReceivedMessage {
            message,
            lock_token,
        }
    }

    /// `Locked → Completed`.
    pub fn complete(&self, id: &MessageId, token: &LockToken) -> Result<Message, DispatchError> {
        let mut inner = self.inner.lock();
        let _ = inner.locked(id, token)?;
        inner
            .finish(id, SettlementState::Completed)
            .ok_or_else(|| invalid(id, "unknown"))
    }

    /// `Locked → Abandoned`, or `DeadLettered` once the delivery budget is spent.
    pub fn abandon(&self, id: &MessageId, token: &LockToken) -> Result<AbandonOutcome, DispatchError> {
        let mut inner = self.inner.lock();
        let _ = inner.locked(id, token)?;
        inner
            .abandon_record(id, self.max_delivery_count)
            .ok_or_else(|| invalid(id, "unknown"))
    }

    /// `Locked → Deferred`. The message stays here until [`Self::receive_deferred`].
    pub fn defer(&self, id: &MessageId, token: &LockToken) -> Result<(), DispatchError> {
        let mut inner = self.inner.lock();
        let record = inner.locked(id, token)?;
        record.state = SettlementState::Deferred;
        record.lock_token = None;
        record.locked_until = None;
        Ok(())
    }

    /// `Locked → DeadLettered`.
    pub fn dead_letter(&self, id: &MessageId, token: &LockToken) -> Result<Message, DispatchError> {
        let mut inner = self.inner.lock();
        let _ = inner.locked(id, token)?;
        inner
            .finish(id, SettlementState::DeadLettered)
            .ok_or_else(|| invalid(id, "unknown"))
    }

    /// `Deferred → Locked` with a new delivery.
    pub fn receive_deferred(&self, id: &MessageId) -> Result<ReceivedMessage, DispatchError> {
        let message = {
            let mut inner = self.inner.lock();
            let Some(record) = inner.records.get_mut(id) else {
                return Err(invalid(id, "unknown"));
            };
            if record.state != SettlementState::Deferred {
                return Err(invalid(id, &record.state.to_string()));
            }
            record
                .message
                .take()
                .ok_or_else(|| invalid(id, "deferred without body"))?
        };
        Ok(self.lock(message))
    }

    /// Extend a lock by one lease duration. Returns the new expiry.
    pub fn renew_lock(&self, id: &MessageId, token: &LockToken) -> Result<Instant, DispatchError> {
        let mut inner = self.inner.lock();
        let record = inner.locked(id, token)?;
        let until = Instant::now() + self.lease_duration;
        record.locked_until = Some(until);
        Ok(until)
    }

    /// Abandon every lock that expired at or before `now`.
    pub fn expire_locks(&self, now: Instant) -> Vec<AbandonOutcome> {
        let mut inner = self.inner.lock();
        let expired: Vec<MessageId> = inner
            .records
            .iter()
            .filter(|(_, r)| {
                r.state == SettlementState::Locked && r.locked_until.is_some_and(|t| t <= now)
            })
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .iter()
            .filter_map(|id| inner.abandon_record(id, self.max_delivery_count))
            .collect()
    }

    /// Current state of a message, if tracked.
    pub fn state(&self, id: &MessageId) -> Option<SettlementState> {
        self.inner.lock().records.get(id).map(|r| r.state)
    }

    /// Number of messages currently locked.
    pub fn locked_count(&self) -> usize {
        self.inner
            .lock()
            .records
            .values()
            .filter(|r| r.state == SettlementState::Locked)
            .count()
    }

    /// Configured lock duration.
    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    /// Configured delivery budget.
    pub fn max_delivery_count(&self) -> u32 {
        self.max_delivery_count
    }
}
