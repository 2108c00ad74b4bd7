//! Accept loop: select, admit and lease sessions.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::ProcessorShared;
use super::worker;
use crate::broker::Broker;
use crate::errors::{DispatchError, ErrorSource};

/// Run until cancelled or the transport becomes unreachable.
pub(super) async fn run(
    shared: Arc<ProcessorShared>,
    cancel: CancellationToken,
) -> Result<(), DispatchError> {
    let sweeper_cancel = cancel.child_token();
    let sweeper = tokio::spawn(sweep_locks(
        Arc::clone(&shared.broker),
        sweeper_cancel.clone(),
    ));
    let workers_cancel = cancel.child_token();
    let mut workers = JoinSet::new();

    let result = loop {
        if cancel.is_cancelled() {
            break Ok(());
        }
        if let Err(err) = shared.broker.ensure_available() {
            error!(error = %err, "transport unavailable, dispatch loop stopping");
            shared.report(ErrorSource::Accept, None, err.clone()).await;
            break Err(err);
        }
        while let Some(joined) = workers.try_join_next() {
            if let Err(join_err) = joined {
                warn!(error = %join_err, "session worker ended abnormally");
            }
        }

        if accept_one(&shared, &workers_cancel, &mut workers) {
            continue;
        }

        tokio::select! {
            () = cancel.cancelled() => {}
            () = shared.broker.table().arrived() => {}
            () = shared.admission.released() => {}
            () = tokio::time::sleep(shared.options.accept_poll_interval) => {}
        }
    };

    workers_cancel.cancel();
    while let Some(joined) = workers.join_next().await {
        if let Err(join_err) = joined {
            warn!(error = %join_err, "session worker ended abnormally");
        }
    }
    sweeper_cancel.cancel();
    let _ = sweeper.await;
    result
}

/// Lease one eligible session and spawn its worker. Returns whether a
/// session was accepted.
fn accept_one(
    shared: &Arc<ProcessorShared>,
    cancel: &CancellationToken,
    workers: &mut JoinSet<()>,
) -> bool {
    let admission = &shared.admission;
    if admission.active_sessions() >= admission.config().max_concurrent_sessions.max(1) {
        return false;
    }
    let table = shared.broker.table();
    let Some(key) = table.peek_next_eligible(|k| admission.is_eligible(k)) else {
        return false;
    };
    let lease = match admission.admit(&key) {
        Ok(lease) => lease,
        Err(err) => {
            debug!(session_key = %key, reason = %err, "session not admitted");
            return false;
        }
    };
    if !table.try_lease(&key) {
        debug!(session_key = %key, "session no longer leasable");
        return false;
    }
    let _ = workers.spawn(worker::run(Arc::clone(shared), lease, cancel.child_token()));
    true
}

/// Periodically return expired message locks to delivery.
async fn sweep_locks(broker: Arc<Broker>, cancel: CancellationToken) {
    let period = (broker.options().lease_duration / 4)
        .min(Duration::from_secs(1))
        .max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let expired = broker.expire_locks();
                if expired > 0 {
                    debug!(expired, "expired message locks returned");
                }
            }
        }
    }
}
