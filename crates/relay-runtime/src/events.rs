//! Broadcast-based dispatch lifecycle events.

use relay_core::{MessageId, SessionKey};
use serde::Serialize;
use tokio::sync::broadcast;

/// Default broadcast channel capacity.
const DEFAULT_CAPACITY: usize = 1024;

/// Final or intermediate disposition applied to a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Completed.
    Completed,
    /// Abandoned and returned for redelivery.
    Abandoned,
    /// Deferred.
    Deferred,
    /// Dead-lettered.
    DeadLettered,
}

impl Disposition {
    /// Metrics label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
            Self::Deferred => "deferred",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

/// Something that happened inside the broker or the dispatch loop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    /// A session lease was granted to a worker.
    SessionAccepted {
        /// Leased session.
        session_key: SessionKey,
    },
    /// A worker gave its session lease back.
    SessionReleased {
        /// Released session.
        session_key: SessionKey,
        /// Messages dispatched under this lease.
        dispatched: usize,
    },
    /// A message was locked and handed to a handler.
    MessageDelivered {
        /// Session of the message.
        session_key: SessionKey,
        /// Delivered message.
        message_id: MessageId,
        /// Delivery count including this delivery.
        delivery_count: u32,
    },
    /// A message was settled.
    MessageSettled {
        /// Session of the message.
        session_key: SessionKey,
        /// Settled message.
        message_id: MessageId,
        /// Applied disposition.
        disposition: Disposition,
    },
    /// A message lock lapsed before settlement.
    LockExpired {
        /// Session of the message.
        session_key: SessionKey,
        /// Message whose lock expired.
        message_id: MessageId,
    },
}

/// Fan-out of [`DispatchEvent`]s to observers of one broker.
///
/// Emitting happens inside settlement and lease paths, so it must not wait
/// on observers: a subscriber that falls more than the channel capacity
/// behind sees `Lagged` and skips ahead.
pub struct EventEmitter {
    tx: broadcast::Sender<DispatchEvent>,
}

impl EventEmitter {
    /// Emitter holding up to 1024 undelivered events per subscriber.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Emitter holding up to `capacity` undelivered events per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish `event`; returns the number of observers it reached.
    pub fn emit(&self, event: DispatchEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Observe events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.tx.subscribe()
    }

    /// Number of live observers.
    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn released(key: &str, dispatched: usize) -> DispatchEvent {
        DispatchEvent::SessionReleased {
            session_key: key.into(),
            dispatched,
        }
    }

    #[test]
    fn unobserved_events_are_discarded() {
        let emitter = EventEmitter::new();
        assert_eq!(emitter.observer_count(), 0);
        assert_eq!(emitter.emit(released("s1", 3)), 0);
    }

    #[tokio::test]
    async fn every_observer_sees_each_event() {
        let emitter = EventEmitter::new();
        let mut first = emitter.subscribe();
        let mut second = emitter.subscribe();
        assert_eq!(emitter.emit(released("s1", 3)), 2);
        assert_eq!(first.recv().await.unwrap(), released("s1", 3));
        assert_eq!(second.recv().await.unwrap(), released("s1", 3));

        drop(second);
        assert_eq!(emitter.observer_count(), 1);
    }

    #[tokio::test]
    async fn lagging_observer_skips_to_newest() {
        let emitter = EventEmitter::with_capacity(2);
        let mut rx = emitter.subscribe();
        for dispatched in 1..=3 {
            let _ = emitter.emit(released("s1", dispatched));
        }
        assert_matches!(rx.recv().await, Err(broadcast::error::RecvError::Lagged(1)));
        assert_eq!(rx.recv().await.unwrap(), released("s1", 2));
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let json = serde_json::to_value(DispatchEvent::MessageSettled {
            session_key: "s1".into(),
            message_id: MessageId::from("m1"),
            disposition: Disposition::DeadLettered,
        })
        .unwrap();
        assert_eq!(json["type"], "message_settled");
        assert_eq!(json["disposition"], "dead_lettered");
    }
}
