//! Shared fixtures for dispatch integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use relay_runtime::{
    Broker, BrokerOptions, DispatchEvent, ErrorContext, ErrorHandler, ProcessorOptions,
    error_handler,
};
use tokio::sync::broadcast;
use tokio::time::Instant;

pub fn broker(max_delivery_count: u32, lease_duration: Duration) -> Arc<Broker> {
    Arc::new(Broker::new(BrokerOptions {
        namespace: "test.local".into(),
        entity_path: "orders".into(),
        max_delivery_count,
        lease_duration,
    }))
}

pub fn default_broker() -> Arc<Broker> {
    broker(10, Duration::from_secs(30))
}

/// Processor options tuned for tests: fast polling, short grace period.
pub fn options() -> ProcessorOptions {
    ProcessorOptions {
        accept_poll_interval: Duration::from_millis(10),
        shutdown_grace_period: Duration::from_secs(2),
        ..ProcessorOptions::default()
    }
}

/// Collects every error context handed to the error handler.
#[derive(Clone, Default)]
pub struct ErrorLog(Arc<Mutex<Vec<ErrorContext>>>);

impl ErrorLog {
    pub fn handler(&self) -> Arc<dyn ErrorHandler> {
        let log = Arc::clone(&self.0);
        error_handler(move |ctx| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push(ctx);
            }
        })
    }

    pub fn snapshot(&self) -> Vec<ErrorContext> {
        self.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }
}

/// Poll `cond` until it holds, failing the test after 30 (virtual) seconds.
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Every event currently buffered in `rx`.
pub fn drain_events(rx: &mut broadcast::Receiver<DispatchEvent>) -> Vec<DispatchEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
