//! Message types.
//!
//! A [`Message`] is what the broker stores: payload, session key and
//! delivery bookkeeping. A [`ReceivedMessage`] is a locked delivery of a
//! message, handed to exactly one handler invocation.

use std::borrow::Cow;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{LockToken, MessageId, SessionKey};

/// A message held by the broker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Broker-assigned identifier.
    pub id: MessageId,
    /// Session the message belongs to.
    pub session_key: SessionKey,
    /// Opaque payload.
    pub payload: Bytes,
    /// Monotonic sequence number assigned on enqueue.
    pub sequence_number: u64,
    /// Wall-clock enqueue time.
    pub enqueued_at: DateTime<Utc>,
    /// Number of times the message has been delivered to a handler.
    pub delivery_count: u32,
}

impl Message {
    /// Create a fresh, never-delivered message.
    pub fn new(session_key: SessionKey, payload: Bytes, sequence_number: u64) -> Self {
        Self {
            id: MessageId::new(),
            session_key,
            payload,
            sequence_number,
            enqueued_at: Utc::now(),
            delivery_count: 0,
        }
    }

    /// Payload rendered as UTF-8, replacing invalid sequences.
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// A locked delivery of a [`Message`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// The delivered message. `delivery_count` already includes this delivery.
    pub message: Message,
    /// Token that must accompany settlement of this delivery.
    pub lock_token: LockToken,
}

impl ReceivedMessage {
    /// Message identifier.
    pub fn id(&self) -> &MessageId {
        &self.message.id
    }

    /// Session key.
    pub fn session_key(&self) -> &SessionKey {
        &self.message.session_key
    }

    /// Raw payload.
    pub fn payload(&self) -> &Bytes {
        &self.message.payload
    }

    /// Payload rendered as UTF-8.
    pub fn body_text(&self) -> Cow<'_, str> {
        self.message.body_text()
    }

    /// Delivery count including this delivery.
    pub fn delivery_count(&self) -> u32 {
        self.message.delivery_count
    }
}
