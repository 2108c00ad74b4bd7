//! Session processor options.

use std::collections::HashSet;
use std::time::Duration;

use relay_core::SessionKey;
use relay_settings::ProcessorSettings;

use crate::admission::AdmissionConfig;

/// Options controlling one [`SessionProcessor`](super::SessionProcessor).
#[derive(Clone, Debug)]
pub struct ProcessorOptions {
    /// Complete messages whose handler returned `Ok` without settling them.
    pub auto_complete_messages: bool,
    /// Sessions processed in parallel. Values below one are raised to one.
    pub max_concurrent_sessions: usize,
    /// Handler calls in flight per session. Values below one are raised to one.
    pub max_concurrent_calls_per_session: usize,
    /// Only these sessions are processed. Empty means every session.
    pub session_ids: Vec<SessionKey>,
    /// Budget for renewing a running handler's message lock. Zero disables renewal.
    pub max_auto_lease_renewal: Duration,
    /// How long a drained session stays leased waiting for new messages.
    pub session_idle_timeout: Duration,
    /// Messages per lease before the session is rotated out. Zero means no limit.
    pub max_messages_per_lease: usize,
    /// How long `stop` waits for in-flight handlers before aborting them.
    pub shutdown_grace_period: Duration,
    /// Longest the accept loop sleeps between eligibility checks.
    pub accept_poll_interval: Duration,
}

impl ProcessorOptions {
    /// Admission limits derived from these options.
    pub fn admission_config(&self) -> AdmissionConfig {
        AdmissionConfig {
            max_concurrent_sessions: self.max_concurrent_sessions,
            max_concurrent_calls_per_session: self.max_concurrent_calls_per_session,
            session_id_filter: (!self.session_ids.is_empty())
                .then(|| self.session_ids.iter().cloned().collect::<HashSet<_>>()),
        }
    }
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self::from(&ProcessorSettings::default())
    }
}

impl From<&ProcessorSettings> for ProcessorOptions {
    fn from(settings: &ProcessorSettings) -> Self {
        Self {
            auto_complete_messages: settings.auto_complete_messages,
            max_concurrent_sessions: settings.max_concurrent_sessions,
            max_concurrent_calls_per_session: settings.max_concurrent_calls_per_session,
            session_ids: settings
                .session_ids
                .iter()
                .map(|s| SessionKey::new(s.as_str()))
                .collect(),
            max_auto_lease_renewal: Duration::from_millis(settings.max_auto_lease_renewal_ms),
            session_idle_timeout: Duration::from_millis(settings.session_idle_timeout_ms),
            max_messages_per_lease: settings.max_messages_per_lease,
            shutdown_grace_period: Duration::from_millis(settings.shutdown_grace_period_ms),
            accept_poll_interval: Duration::from_millis(settings.accept_poll_interval_ms),
        }
    }
}
