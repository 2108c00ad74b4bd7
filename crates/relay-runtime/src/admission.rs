//! Concurrency admission: session and per-session call ceilings.
//!
//! Both ceilings are semaphores. A [`SessionLease`] holds one session permit
//! and owns the call semaphore for its session; a [`CallPermit`] holds one
//! call permit. Dropping either releases it, so the ledger cannot go negative
//! or double-count a slot.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use metrics::gauge;
use relay_core::SessionKey;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::errors::DispatchError;

/// Admission limits.
#[derive(Clone, Debug)]
pub struct AdmissionConfig {
    /// Maximum sessions leased at once.
    pub max_concurrent_sessions: usize,
    /// Maximum handler calls in flight per session.
    pub max_concurrent_calls_per_session: usize,
    /// When set, only these sessions are ever admitted.
    pub session_id_filter: Option<HashSet<SessionKey>>,
}

/// State shared with outstanding leases.
struct Ledger {
    max_sessions: usize,
    max_calls: usize,
    sessions: Arc<Semaphore>,
    calls: DashMap<SessionKey, Arc<Semaphore>>,
    released: Notify,
}

impl Ledger {
    fn active_sessions(&self) -> usize {
        self.max_sessions - self.sessions.available_permits()
    }

    fn active_calls_total(&self) -> usize {
        self.calls
            .iter()
            .map(|e| self.max_calls - e.value().available_permits())
            .sum()
    }
}

/// Grants session leases and call slots under hard ceilings.
pub struct AdmissionController {
    config: AdmissionConfig,
    ledger: Arc<Ledger>,
}

impl AdmissionController {
    /// Create a controller. Zero ceilings are raised to one.
    pub fn new(config: AdmissionConfig) -> Self {
        let max_sessions = config.max_concurrent_sessions.max(1);
        let max_calls = config.max_concurrent_calls_per_session.max(1);
        Self {
            config,
            ledger: Arc::new(Ledger {
                max_sessions,
                max_calls,
                sessions: Arc::new(Semaphore::new(max_sessions)),
                calls: DashMap::new(),
                released: Notify::new(),
            }),
        }
    }

    /// Whether the session filter admits this key at all.
    pub fn is_eligible(&self, key: &SessionKey) -> bool {
        self.config
            .session_id_filter
            .as_ref()
            .is_none_or(|allowed| allowed.contains(key))
    }

    /// Lease a session slot for `key`, or say why not.
    pub fn admit(&self, key: &SessionKey) -> Result<SessionLease, DispatchError> {
        if !self.is_eligible(key) {
            return Err(DispatchError::AdmissionDenied(format!(
                "session {key} is not in the session filter"
            )));
        }
        let Entry::Vacant(slot) = self.ledger.calls.entry(key.clone()) else {
            return Err(DispatchError::AdmissionDenied(format!(
                "session {key} is already leased"
            )));
        };
        let permit = Arc::clone(&self.ledger.sessions)
            .try_acquire_owned()
            .map_err(|_| {
                DispatchError::AdmissionDenied(format!(
                    "{} of {} sessions active",
                    self.ledger.active_sessions(),
                    self.ledger.max_sessions
                ))
            })?;
        let calls = Arc::clone(slot.insert(Arc::new(Semaphore::new(self.ledger.max_calls))).value());
        gauge!("relay_sessions_active").set(self.ledger.active_sessions() as f64);
        debug!(session_key = %key, "session lease granted");
        Ok(SessionLease {
            session_key: key.clone(),
            calls,
            permit: Some(permit),
            ledger: Arc::clone(&self.ledger),
        })
    }

    /// Lease a session slot if capacity remains.
    pub fn try_acquire_session(&self, key: &SessionKey) -> Option<SessionLease> {
        self.admit(key).ok()
    }

    /// Take a call slot for a leased session if one is free.
    pub fn try_acquire_call(&self, key: &SessionKey) -> Option<CallPermit> {
        let calls = self.ledger.calls.get(key).map(|e| Arc::clone(e.value()))?;
        let permit = calls.try_acquire_owned().ok()?;
        Some(CallPermit::new(key.clone(), permit, Arc::clone(&self.ledger)))
    }

    /// Wait for a call slot on a leased session.
    pub async fn acquire_call(&self, lease: &SessionLease) -> Option<CallPermit> {
        let permit = Arc::clone(&lease.calls).acquire_owned().await.ok()?;
        Some(CallPermit::new(
            lease.session_key.clone(),
            permit,
            Arc::clone(&self.ledger),
        ))
    }

    /// Give back a call slot.
    pub fn release_call(&self, permit: CallPermit) {
        drop(permit);
    }

    /// Give back a session lease.
    pub fn release_session(&self, lease: SessionLease) {
        drop(lease);
    }

    /// Wait until a session lease is released.
    pub async fn released(&self) {
        self.ledger.released.notified().await;
    }

    /// Sessions currently leased.
    pub fn active_sessions(&self) -> usize {
        self.ledger.active_sessions()
    }

    /// Calls currently in flight for a session.
    pub fn active_calls(&self, key: &SessionKey) -> usize {
        self.ledger
            .calls
            .get(key)
            .map_or(0, |e| self.ledger.max_calls - e.value().available_permits())
    }

    /// Configured limits.
    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }
}

/// Exclusive claim on a session slot. Released on drop.
pub struct SessionLease {
    session_key: SessionKey,
    calls: Arc<Semaphore>,
    permit: Option<OwnedSemaphorePermit>,
    ledger: Arc<Ledger>,
}

impl SessionLease {
    /// Leased session.
    pub fn session_key(&self) -> &SessionKey {
        &self.session_key
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("session_key", &self.session_key)
            .finish_non_exhaustive()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        let _ = self.ledger.calls.remove(&self.session_key);
        // Return the permit before waking waiters so they can take it.
        drop(self.permit.take());
        gauge!("relay_sessions_active").set(self.ledger.active_sessions() as f64);
        self.ledger.released.notify_one();
        debug!(session_key = %self.session_key, "session lease released");
    }
}

/// One handler-call slot within a session. Released on drop.
pub struct CallPermit {
    session_key: SessionKey,
    permit: Option<OwnedSemaphorePermit>,
    ledger: Arc<Ledger>,
}

impl CallPermit {
    fn new(session_key: SessionKey, permit: OwnedSemaphorePermit, ledger: Arc<Ledger>) -> Self {
        gauge!("relay_calls_active").increment(1.0);
        Self {
            session_key,
            permit: Some(permit),
            ledger,
        }
    }

    /// Session the slot belongs to.
    pub fn session_key(&self) -> &SessionKey {
        &self.session_key
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        drop(self.permit.take());
        gauge!("relay_calls_active").set(self.ledger.active_calls_total() as f64);
    }
}
