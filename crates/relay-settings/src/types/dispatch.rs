//! Broker and session processor settings.

use serde::{Deserialize, Serialize};

/// Queue entity settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerSettings {
    /// Namespace the entity lives in. Reported in error contexts.
    pub namespace: String,
    /// Entity (queue) path. Reported in error contexts.
    pub entity_path: String,
    /// Deliveries after which an abandoned message is dead-lettered.
    pub max_delivery_count: u32,
    /// Message lock duration in milliseconds.
    pub lease_duration_ms: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            namespace: "relay.local".to_string(),
            entity_path: "default".to_string(),
            max_delivery_count: 10,
            lease_duration_ms: 30_000,
        }
    }
}

/// Session processor settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessorSettings {
    /// Complete a message automatically when its handler returns `Ok`
    /// without settling it.
    pub auto_complete_messages: bool,
    /// Maximum number of sessions processed in parallel.
    pub max_concurrent_sessions: usize,
    /// Maximum number of concurrent handler calls within one session.
    pub max_concurrent_calls_per_session: usize,
    /// Restrict processing to these session keys. Empty means all sessions.
    pub session_ids: Vec<String>,
    /// Total time a running handler's message lock is renewed for, in
    /// milliseconds. Zero disables renewal.
    pub max_auto_lease_renewal_ms: u64,
    /// How long a drained session stays leased waiting for new messages, in
    /// milliseconds.
    pub session_idle_timeout_ms: u64,
    /// Messages dispatched per session lease before the session is rotated
    /// out. Zero means no limit.
    pub max_messages_per_lease: usize,
    /// How long `stop` waits for in-flight handlers before aborting them, in
    /// milliseconds.
    pub shutdown_grace_period_ms: u64,
    /// Upper bound on how long the accept loop sleeps between eligibility
    /// checks, in milliseconds.
    pub accept_poll_interval_ms: u64,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            auto_complete_messages: true,
            max_concurrent_sessions: 8,
            max_concurrent_calls_per_session: 1,
            session_ids: Vec::new(),
            max_auto_lease_renewal_ms: 300_000,
            session_idle_timeout_ms: 0,
            max_messages_per_lease: 64,
            shutdown_grace_period_ms: 30_000,
            accept_poll_interval_ms: 250,
        }
    }
}
