//! Producer handle.

use std::sync::Arc;

use bytes::Bytes;
use relay_core::{MessageId, SessionKey};

use crate::broker::Broker;
use crate::errors::DispatchError;
use crate::router::SessionRouter;

/// Appends messages to the sessions of one broker entity.
#[derive(Clone)]
pub struct Sender {
    broker: Arc<Broker>,
}

impl Sender {
    pub(crate) fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }

    /// Send one message to a session.
    ///
    /// Once this returns `Ok`, the message will be delivered after every
    /// message previously sent to the same session.
    pub fn send(
        &self,
        payload: impl Into<Bytes>,
        session_key: impl Into<SessionKey>,
    ) -> Result<MessageId, DispatchError> {
        self.broker.enqueue(session_key.into(), payload.into())
    }

    /// Send one message to the session chosen by `router`.
    pub fn send_routed(
        &self,
        payload: impl Into<Bytes>,
        router: &dyn SessionRouter,
    ) -> Result<MessageId, DispatchError> {
        let payload = payload.into();
        let session_key = router.route(&payload);
        self.broker.enqueue(session_key, payload)
    }

    /// Send several messages to one session, in order.
    ///
    /// Checks the transport once up front so a disconnected entity rejects
    /// the whole batch.
    pub fn send_batch<I, P>(
        &self,
        payloads: I,
        session_key: impl Into<SessionKey>,
    ) -> Result<Vec<MessageId>, DispatchError>
    where
        I: IntoIterator<Item = P>,
        P: Into<Bytes>,
    {
        self.broker.ensure_available()?;
        let session_key = session_key.into();
        payloads
            .into_iter()
            .map(|payload| self.broker.enqueue(session_key.clone(), payload.into()))
            .collect()
    }

    /// Broker this sender writes to.
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }
}
