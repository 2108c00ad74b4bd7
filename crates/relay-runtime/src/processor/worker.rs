//! Session worker: dispatch one leased session's messages in order.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use metrics::{counter, histogram};
use parking_lot::Mutex;
use relay_core::{LockToken, MessageId, ReceivedMessage, SessionKey};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use super::ProcessorShared;
use crate::admission::{CallPermit, SessionLease};
use crate::broker::Broker;
use crate::context::SettlementContext;
use crate::errors::{DispatchError, ErrorSource};
use crate::events::DispatchEvent;

/// Locks of messages whose handler is still running.
type InFlight = Arc<Mutex<HashMap<MessageId, LockToken>>>;

/// Returns the session to the table and the lease to admission on drop.
struct LeasedSession {
    broker: Arc<Broker>,
    lease: Option<SessionLease>,
    key: SessionKey,
}

impl Drop for LeasedSession {
    fn drop(&mut self) {
        // Unclaim in the table first so the released admission slot finds it selectable.
        self.broker.table().release(&self.key);
        drop(self.lease.take());
    }
}

pub(super) async fn run(shared: Arc<ProcessorShared>, lease: SessionLease, cancel: CancellationToken) {
    let key = lease.session_key().clone();
    let session = LeasedSession {
        broker: Arc::clone(&shared.broker),
        lease: Some(lease),
        key: key.clone(),
    };
    info!(session_key = %key, "session accepted");
    let _ = shared.broker.events().emit(DispatchEvent::SessionAccepted {
        session_key: key.clone(),
    });

    let release_requested = Arc::new(AtomicBool::new(false));
    let in_flight: InFlight = Arc::default();
    let mut calls = JoinSet::new();
    let mut dispatched = 0usize;
    let limit = shared.options.max_messages_per_lease;

    loop {
        if cancel.is_cancelled() || release_requested.load(Ordering::Acquire) {
            break;
        }
        if limit > 0 && dispatched >= limit {
            debug!(session_key = %key, dispatched, "rotating session");
            break;
        }
        while calls.try_join_next().is_some() {}

        let Some(lease) = session.lease.as_ref() else {
            break;
        };
        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            permit = shared.admission.acquire_call(lease) => match permit {
                Some(permit) => permit,
                None => break,
            },
        };
        // The previous handler may have released the session while we waited.
        if release_requested.load(Ordering::Acquire) {
            break;
        }

        let Some(received) = shared.broker.deliver(&key) else {
            drop(permit);
            match wait_for_work(&shared, &key, &mut calls, &cancel).await {
                Idle::Retry => continue,
                Idle::Stop => break,
            }
        };

        dispatched += 1;
        let _ = in_flight
            .lock()
            .insert(received.id().clone(), received.lock_token.clone());
        let ctx = SettlementContext::new(
            Arc::clone(&shared.broker),
            &received,
            Arc::clone(&release_requested),
        );
        let _ = calls.spawn(dispatch_one(
            Arc::clone(&shared),
            received,
            ctx,
            permit,
            Arc::clone(&in_flight),
        ));
    }

    drain_calls(&shared, &key, &mut calls, &in_flight, &cancel).await;

    info!(session_key = %key, dispatched, "session released");
    let _ = shared.broker.events().emit(DispatchEvent::SessionReleased {
        session_key: key,
        dispatched,
    });
    drop(session);
}

/// What a worker does after finding its session empty.
enum Idle {
    Retry,
    Stop,
}

/// Wait for more work on a drained session.
async fn wait_for_work(
    shared: &ProcessorShared,
    key: &SessionKey,
    calls: &mut JoinSet<()>,
    cancel: &CancellationToken,
) -> Idle {
    let arrived = shared.broker.table().arrival_signal(key);
    if !calls.is_empty() {
        // A running call may still abandon its message back to the front.
        return tokio::select! {
            () = cancel.cancelled() => Idle::Stop,
            _ = calls.join_next() => Idle::Retry,
            () = wait_for(arrived) => Idle::Retry,
        };
    }
    let idle = shared.options.session_idle_timeout;
    if idle.is_zero() {
        return Idle::Stop;
    }
    tokio::select! {
        () = cancel.cancelled() => Idle::Stop,
        () = wait_for(arrived) => Idle::Retry,
        () = tokio::time::sleep(idle) => {
            debug!(session_key = %key, "session idle timeout");
            Idle::Stop
        }
    }
}

async fn wait_for(signal: Option<Arc<Notify>>) {
    match signal {
        Some(signal) => signal.notified().await,
        None => std::future::pending().await,
    }
}

/// Wait for in-flight calls. After cancellation they get the shutdown grace
/// period; whatever still runs then is aborted and its message abandoned.
async fn drain_calls(
    shared: &ProcessorShared,
    key: &SessionKey,
    calls: &mut JoinSet<()>,
    in_flight: &InFlight,
    cancel: &CancellationToken,
) {
    loop {
        tokio::select! {
            joined = calls.join_next() => {
                if joined.is_none() {
                    return;
                }
            }
            () = cancel.cancelled() => break,
        }
    }

    let deadline = Instant::now() + shared.options.shutdown_grace_period;
    while let Ok(Some(_)) = tokio::time::timeout_at(deadline, calls.join_next()).await {}
    if calls.is_empty() {
        return;
    }

    warn!(session_key = %key, remaining = calls.len(), "grace period elapsed, aborting handlers");
    calls.abort_all();
    while calls.join_next().await.is_some() {}

    let orphans: Vec<_> = in_flight.lock().drain().collect();
    for (id, token) in orphans {
        match shared.broker.abandon(&id, &token) {
            Ok(disposition) => {
                debug!(session_key = %key, message_id = %id, disposition = disposition.as_str(), "aborted message abandoned");
            }
            Err(err) => debug!(session_key = %key, message_id = %id, error = %err, "aborted message already settled"),
        }
    }
}

/// Run the handler for one message and reconcile its outcome.
async fn dispatch_one(
    shared: Arc<ProcessorShared>,
    received: ReceivedMessage,
    ctx: SettlementContext,
    permit: CallPermit,
    in_flight: InFlight,
) {
    let key = received.session_key().clone();
    let id = received.id().clone();
    debug!(
        session_key = %key,
        message_id = %id,
        delivery_count = received.delivery_count(),
        "dispatching message"
    );

    let renewal = spawn_renewal(&shared, ctx.clone());
    let started = Instant::now();
    let outcome = AssertUnwindSafe(shared.handler.handle(received, ctx.clone()))
        .catch_unwind()
        .await;
    drop(renewal);
    histogram!("relay_handler_duration_seconds").record(started.elapsed().as_secs_f64());

    let fault = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(format!("{err:#}")),
        Err(panic) => Some(panic_message(panic.as_ref())),
    };

    match fault {
        None => {
            if shared.options.auto_complete_messages && !ctx.is_settled() {
                if let Err(err) = ctx.complete() {
                    warn!(session_key = %key, message_id = %id, error = %err, "auto-complete failed");
                }
            }
        }
        Some(reason) => {
            counter!("relay_handler_faults_total").increment(1);
            warn!(session_key = %key, message_id = %id, %reason, "handler fault");
            if !ctx.is_settled() {
                if let Err(err) = ctx.abandon() {
                    warn!(session_key = %key, message_id = %id, error = %err, "abandon after fault failed");
                }
            }
            shared
                .report(
                    ErrorSource::ProcessMessage,
                    Some(&key),
                    DispatchError::HandlerFault(reason),
                )
                .await;
        }
    }

    let _ = in_flight.lock().remove(&id);
    drop(permit);
}

/// Renew the message lock every half lease while the handler runs, within
/// the renewal budget. Stops when the returned guard is dropped.
fn spawn_renewal(shared: &Arc<ProcessorShared>, ctx: SettlementContext) -> Option<DropGuard> {
    let budget = shared.options.max_auto_lease_renewal;
    if budget.is_zero() {
        return None;
    }
    let interval = (shared.broker.options().lease_duration / 2).max(Duration::from_millis(1));
    let stop = CancellationToken::new();
    let stopped = stop.clone();
    let shared = Arc::clone(shared);
    let _ = tokio::spawn(async move {
        let deadline = Instant::now() + budget;
        loop {
            tokio::select! {
                () = stopped.cancelled() => return,
                () = tokio::time::sleep(interval) => {}
            }
            if ctx.is_settled() || Instant::now() >= deadline {
                return;
            }
            if !renew_once(&shared, &ctx).await {
                return;
            }
        }
    });
    Some(stop.drop_guard())
}

/// Renew the message lock once. Returns whether renewal should continue.
///
/// A failure caused by the handler settling the message concurrently is not
/// reported.
async fn renew_once(shared: &ProcessorShared, ctx: &SettlementContext) -> bool {
    match ctx.renew_lock() {
        Ok(_) => {
            debug!(session_key = %ctx.session_key(), message_id = %ctx.message_id(), "lock renewed");
            true
        }
        Err(_) if ctx.is_settled() => false,
        Err(err) => {
            warn!(session_key = %ctx.session_key(), message_id = %ctx.message_id(), error = %err, "lock renewal failed");
            shared
                .report(ErrorSource::LockRenewal, Some(ctx.session_key()), err)
                .await;
            false
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}
