//! In-process broker entity.
//!
//! A [`Broker`] is one session-enabled queue: it owns the session queue
//! table, the settlement tracker, session state and the dead-letter store,
//! and applies settlement side effects (requeue, dead-letter, events,
//! metrics) consistently whichever caller triggers them. Its availability
//! can be switched off to model an unreachable transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use relay_core::{LockToken, Message, MessageId, ReceivedMessage, SessionKey};
use relay_settings::BrokerSettings;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::context::SettlementContext;
use crate::errors::DispatchError;
use crate::events::{Disposition, DispatchEvent, EventEmitter};
use crate::handler::{ErrorHandler, MessageHandler};
use crate::processor::{ProcessorOptions, SessionProcessor};
use crate::queue::SessionQueueTable;
use crate::sender::Sender;
use crate::settlement::{AbandonOutcome, SettlementTracker};
use crate::state::SessionStateStore;

/// Dead-letter reason used when the delivery budget runs out.
pub const MAX_DELIVERY_COUNT_EXCEEDED: &str = "MaxDeliveryCountExceeded";

/// Broker entity options.
#[derive(Clone, Debug)]
pub struct BrokerOptions {
    /// Namespace, reported in error contexts.
    pub namespace: String,
    /// Entity path, reported in error contexts.
    pub entity_path: String,
    /// Deliveries after which an abandoned message is dead-lettered.
    pub max_delivery_count: u32,
    /// Message lock duration.
    pub lease_duration: Duration,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self::from(&BrokerSettings::default())
    }
}

impl From<&BrokerSettings> for BrokerOptions {
    fn from(settings: &BrokerSettings) -> Self {
        Self {
            namespace: settings.namespace.clone(),
            entity_path: settings.entity_path.clone(),
            max_delivery_count: settings.max_delivery_count,
            lease_duration: Duration::from_millis(settings.lease_duration_ms),
        }
    }
}

/// A message moved to the dead-letter store.
#[derive(Clone, Debug)]
pub struct DeadLetteredMessage {
    /// The message as last delivered.
    pub message: Message,
    /// Why it was dead-lettered.
    pub reason: String,
    /// When it was dead-lettered.
    pub dead_lettered_at: DateTime<Utc>,
}

/// One session-enabled queue entity.
pub struct Broker {
    options: BrokerOptions,
    table: SessionQueueTable,
    tracker: SettlementTracker,
    states: SessionStateStore,
    dead_letters: Mutex<Vec<DeadLetteredMessage>>,
    /// `Some(reason)` while the transport is down.
    outage: Mutex<Option<String>>,
    sequence: AtomicU64,
    events: EventEmitter,
}

impl Broker {
    /// Create a broker entity.
    pub fn new(options: BrokerOptions) -> Self {
        let tracker = SettlementTracker::new(options.max_delivery_count, options.lease_duration);
        Self {
            options,
            table: SessionQueueTable::new(),
            tracker,
            states: SessionStateStore::new(),
            dead_letters: Mutex::new(Vec::new()),
            outage: Mutex::new(None),
            sequence: AtomicU64::new(0),
            events: EventEmitter::new(),
        }
    }

    /// Producer handle for this entity.
    pub fn create_sender(self: &Arc<Self>) -> Sender {
        Sender::new(Arc::clone(self))
    }

    /// Session processor for this entity.
    pub fn create_session_processor(
        self: &Arc<Self>,
        options: ProcessorOptions,
        handler: Arc<dyn MessageHandler>,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> SessionProcessor {
        SessionProcessor::new(Arc::clone(self), options, handler, error_handler)
    }

    // ── Transport ───────────────────────────────────────────────────

    /// Mark the transport unreachable.
    pub fn disconnect(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(entity_path = %self.options.entity_path, %reason, "transport disconnected");
        *self.outage.lock() = Some(reason);
    }

    /// Mark the transport reachable again.
    pub fn reconnect(&self) {
        info!(entity_path = %self.options.entity_path, "transport reconnected");
        *self.outage.lock() = None;
    }

    /// Whether the transport is reachable.
    pub fn is_available(&self) -> bool {
        self.outage.lock().is_none()
    }

    /// `Err(TransportUnavailable)` while disconnected.
    pub fn ensure_available(&self) -> Result<(), DispatchError> {
        match self.outage.lock().as_ref() {
            None => Ok(()),
            Some(reason) => Err(DispatchError::TransportUnavailable {
                entity_path: self.options.entity_path.clone(),
                reason: reason.clone(),
            }),
        }
    }

    // ── Producer side ───────────────────────────────────────────────

    /// Append a message to its session. Fails while disconnected.
    #[instrument(skip(self, payload), fields(entity_path = %self.options.entity_path))]
    pub fn enqueue(&self, session_key: SessionKey, payload: Bytes) -> Result<MessageId, DispatchError> {
        self.ensure_available()?;
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let message = Message::new(session_key, payload, sequence);
        let id = message.id.clone();
        debug!(session_key = %message.session_key, message_id = %id, sequence, "message enqueued");
        let key = message.session_key.clone();
        self.table.enqueue(&key, message);
        counter!("relay_messages_enqueued_total").increment(1);
        Ok(id)
    }

    // ── Delivery ────────────────────────────────────────────────────

    /// Lock and return the oldest pending message of a session.
    pub fn deliver(&self, session_key: &SessionKey) -> Option<ReceivedMessage> {
        let message = self.table.dequeue(session_key)?;
        let received = self.tracker.lock(message);
        if self.events.observer_count() > 0 {
            let _ = self.events.emit(DispatchEvent::MessageDelivered {
                session_key: session_key.clone(),
                message_id: received.id().clone(),
                delivery_count: received.delivery_count(),
            });
        }
        Some(received)
    }

    /// Re-lock a deferred message and hand it back with a settlement capability.
    pub fn receive_deferred(
        self: &Arc<Self>,
        id: &MessageId,
    ) -> Result<(ReceivedMessage, SettlementContext), DispatchError> {
        self.ensure_available()?;
        let received = self.tracker.receive_deferred(id)?;
        let ctx = SettlementContext::standalone(Arc::clone(self), &received);
        Ok((received, ctx))
    }

    // ── Settlement ──────────────────────────────────────────────────

    /// Complete a locked message.
    pub fn complete(&self, id: &MessageId, token: &LockToken) -> Result<(), DispatchError> {
        let message = self.tracker.complete(id, token)?;
        self.settled(&message.session_key, id, Disposition::Completed);
        Ok(())
    }

    /// Abandon a locked message; it is redelivered or, once the delivery
    /// budget is spent, dead-lettered.
    pub fn abandon(&self, id: &MessageId, token: &LockToken) -> Result<Disposition, DispatchError> {
        let outcome = self.tracker.abandon(id, token)?;
        Ok(self.apply_abandon(outcome))
    }

    /// Defer a locked message until [`Self::receive_deferred`].
    pub fn defer(&self, id: &MessageId, token: &LockToken, session_key: &SessionKey) -> Result<(), DispatchError> {
        self.tracker.defer(id, token)?;
        self.settled(session_key, id, Disposition::Deferred);
        Ok(())
    }

    /// Dead-letter a locked message with a reason.
    pub fn dead_letter(
        &self,
        id: &MessageId,
        token: &LockToken,
        reason: impl Into<String>,
    ) -> Result<(), DispatchError> {
        let message = self.tracker.dead_letter(id, token)?;
        self.push_dead_letter(message, reason.into());
        Ok(())
    }

    /// Extend a message lock by one lease duration.
    pub fn renew_lock(&self, id: &MessageId, token: &LockToken) -> Result<Instant, DispatchError> {
        self.ensure_available()?;
        self.tracker.renew_lock(id, token)
    }

    /// Return every expired lock to delivery. Returns how many expired.
    pub fn expire_locks(&self) -> usize {
        let outcomes = self.tracker.expire_locks(Instant::now());
        let expired = outcomes.len();
        for outcome in outcomes {
            let message = match &outcome {
                AbandonOutcome::Redeliver(m) | AbandonOutcome::DeadLettered(m) => m,
            };
            let err = DispatchError::LeaseExpired(message.id.clone());
            warn!(session_key = %message.session_key, error = %err, "message lock expired");
            counter!("relay_lock_expirations_total").increment(1);
            let _ = self.events.emit(DispatchEvent::LockExpired {
                session_key: message.session_key.clone(),
                message_id: message.id.clone(),
            });
            let _ = self.apply_abandon(outcome);
        }
        expired
    }

    fn apply_abandon(&self, outcome: AbandonOutcome) -> Disposition {
        match outcome {
            AbandonOutcome::Redeliver(message) => {
                let key = message.session_key.clone();
                let id = message.id.clone();
                debug!(session_key = %key, message_id = %id, delivery_count = message.delivery_count, "message returned for redelivery");
                self.table.requeue_front(&key, message);
                self.settled(&key, &id, Disposition::Abandoned);
                Disposition::Abandoned
            }
            AbandonOutcome::DeadLettered(message) => {
                self.push_dead_letter(message, MAX_DELIVERY_COUNT_EXCEEDED.to_string());
                Disposition::DeadLettered
            }
        }
    }

    fn push_dead_letter(&self, message: Message, reason: String) {
        let key = message.session_key.clone();
        let id = message.id.clone();
        warn!(session_key = %key, message_id = %id, %reason, delivery_count = message.delivery_count, "message dead-lettered");
        self.dead_letters.lock().push(DeadLetteredMessage {
            message,
            reason,
            dead_lettered_at: Utc::now(),
        });
        self.settled(&key, &id, Disposition::DeadLettered);
    }

    fn settled(&self, session_key: &SessionKey, id: &MessageId, disposition: Disposition) {
        counter!("relay_messages_settled_total", "disposition" => disposition.as_str()).increment(1);
        if self.events.observer_count() > 0 {
            let _ = self.events.emit(DispatchEvent::MessageSettled {
                session_key: session_key.clone(),
                message_id: id.clone(),
                disposition,
            });
        }
    }

    // ── Session state ───────────────────────────────────────────────

    /// State blob of a session.
    pub fn session_state(&self, key: &SessionKey) -> Option<Bytes> {
        self.states.get(key)
    }

    /// Replace the state blob of a session.
    pub fn set_session_state(&self, key: &SessionKey, state: Bytes) {
        self.states.set(key, state);
    }

    // ── Accessors ───────────────────────────────────────────────────

    /// Snapshot of the dead-letter store.
    pub fn dead_letters(&self) -> Vec<DeadLetteredMessage> {
        self.dead_letters.lock().clone()
    }

    /// Session queue table.
    pub fn table(&self) -> &SessionQueueTable {
        &self.table
    }

    /// Settlement tracker.
    pub fn tracker(&self) -> &SettlementTracker {
        &self.tracker
    }

    /// Event emitter.
    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Options this entity was created with.
    pub fn options(&self) -> &BrokerOptions {
        &self.options
    }
}
