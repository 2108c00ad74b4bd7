//! Settlement capability handed to message handlers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use relay_core::{LockToken, MessageId, ReceivedMessage, SessionKey};
use tokio::time::Instant;

use crate::broker::Broker;
use crate::errors::DispatchError;

/// Settles one delivered message and reads or writes its session's state.
///
/// Cloning is cheap and every clone refers to the same delivery: once any
/// clone settles the message, the others see [`Self::is_settled`].
#[derive(Clone)]
pub struct SettlementContext {
    broker: Arc<Broker>,
    session_key: SessionKey,
    message_id: MessageId,
    lock_token: LockToken,
    settled: Arc<AtomicBool>,
    release_requested: Arc<AtomicBool>,
}

impl SettlementContext {
    pub(crate) fn new(
        broker: Arc<Broker>,
        received: &ReceivedMessage,
        release_requested: Arc<AtomicBool>,
    ) -> Self {
        Self {
            broker,
            session_key: received.session_key().clone(),
            message_id: received.id().clone(),
            lock_token: received.lock_token.clone(),
            settled: Arc::new(AtomicBool::new(false)),
            release_requested,
        }
    }

    /// Context for a message received outside a session worker.
    pub(crate) fn standalone(broker: Arc<Broker>, received: &ReceivedMessage) -> Self {
        Self::new(broker, received, Arc::new(AtomicBool::new(false)))
    }

    /// Mark the message processed.
    pub fn complete(&self) -> Result<(), DispatchError> {
        self.broker.complete(&self.message_id, &self.lock_token)?;
        self.mark_settled();
        Ok(())
    }

    /// Return the message for redelivery (or dead-letter it once its
    /// delivery budget is spent).
    pub fn abandon(&self) -> Result<(), DispatchError> {
        let _ = self.broker.abandon(&self.message_id, &self.lock_token)?;
        self.mark_settled();
        Ok(())
    }

    /// Set the message aside; it is only retrievable by id afterwards.
    pub fn defer(&self) -> Result<(), DispatchError> {
        self.broker
            .defer(&self.message_id, &self.lock_token, &self.session_key)?;
        self.mark_settled();
        Ok(())
    }

    /// Move the message to the dead-letter store.
    pub fn dead_letter(&self, reason: impl Into<String>) -> Result<(), DispatchError> {
        self.broker
            .dead_letter(&self.message_id, &self.lock_token, reason)?;
        self.mark_settled();
        Ok(())
    }

    /// Extend the message lock by one lease duration.
    pub fn renew_lock(&self) -> Result<Instant, DispatchError> {
        self.broker.renew_lock(&self.message_id, &self.lock_token)
    }

    /// Replace the session's state blob.
    pub fn set_session_state(&self, state: impl Into<Bytes>) {
        self.broker.set_session_state(&self.session_key, state.into());
    }

    /// Current session state blob.
    pub fn get_session_state(&self) -> Option<Bytes> {
        self.broker.session_state(&self.session_key)
    }

    /// Ask the worker to give the session lease back once in-flight calls finish.
    pub fn release_session(&self) {
        self.release_requested.store(true, Ordering::Release);
    }

    /// Whether a disposition has been applied through this context.
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Session of the message.
    pub fn session_key(&self) -> &SessionKey {
        &self.session_key
    }

    /// Id of the message.
    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    /// Lock token of this delivery.
    pub fn lock_token(&self) -> &LockToken {
        &self.lock_token
    }

    fn mark_settled(&self) {
        self.settled.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for SettlementContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementContext")
            .field("session_key", &self.session_key)
            .field("message_id", &self.message_id)
            .field("settled", &self.is_settled())
            .finish_non_exhaustive()
    }
}
