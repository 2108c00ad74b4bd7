//! Settlement outcomes driven through the dispatch loop.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use assert_matches::assert_matches;
use parking_lot::Mutex;
use relay_core::MessageId;
use relay_runtime::broker::MAX_DELIVERY_COUNT_EXCEEDED;
use relay_runtime::settlement::SettlementState;
use relay_runtime::{DispatchError, ErrorSource, ProcessorOptions, message_handler};

use common::{ErrorLog, broker, default_broker, eventually, options};

#[tokio::test(start_paused = true)]
async fn expired_lock_is_redelivered_with_incremented_count() {
    let broker = broker(10, Duration::from_secs(1));
    let sender = broker.create_sender();
    let deliveries = Arc::new(Mutex::new(Vec::<u32>::new()));
    let sink = Arc::clone(&deliveries);
    let processor = broker.create_session_processor(
        ProcessorOptions {
            auto_complete_messages: false,
            max_auto_lease_renewal: Duration::ZERO,
            ..options()
        },
        message_handler(move |msg, ctx| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(msg.delivery_count());
                // Leave the first delivery locked so its lease runs out.
                if msg.delivery_count() > 1 {
                    ctx.complete()?;
                }
                anyhow::Ok(())
            }
        }),
        ErrorLog::default().handler(),
    );

    let id = sender.send("slow", "s1").unwrap();
    processor.start().unwrap();

    eventually("redelivery", || deliveries.lock().len() == 2).await;
    eventually("completion", || {
        broker.tracker().state(&id) == Some(SettlementState::Completed)
    })
    .await;
    processor.stop().await.unwrap();

    assert_eq!(*deliveries.lock(), vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn lock_renewal_keeps_slow_handler_from_expiring() {
    let broker = broker(10, Duration::from_secs(1));
    let sender = broker.create_sender();
    let deliveries = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&deliveries);
    let processor = broker.create_session_processor(
        ProcessorOptions {
            max_auto_lease_renewal: Duration::from_secs(60),
            ..options()
        },
        message_handler(move |_msg, _ctx| {
            let sink = Arc::clone(&sink);
            async move {
                *sink.lock() += 1;
                tokio::time::sleep(Duration::from_secs(5)).await;
                anyhow::Ok(())
            }
        }),
        ErrorLog::default().handler(),
    );

    let id = sender.send("slow", "s1").unwrap();
    processor.start().unwrap();

    eventually("completion", || {
        broker.tracker().state(&id) == Some(SettlementState::Completed)
    })
    .await;
    processor.stop().await.unwrap();

    assert_eq!(*deliveries.lock(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_lock_renewal_is_reported_with_session() {
    let broker = broker(10, Duration::from_secs(1));
    let sender = broker.create_sender();
    let errors = ErrorLog::default();
    let started = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&started);
    let processor = broker.create_session_processor(
        ProcessorOptions {
            max_auto_lease_renewal: Duration::from_secs(60),
            ..options()
        },
        message_handler(move |_msg, _ctx| {
            let flag = Arc::clone(&flag);
            async move {
                flag.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(5)).await;
                anyhow::Ok(())
            }
        }),
        errors.handler(),
    );

    let _ = sender.send("slow", "s1").unwrap();
    processor.start().unwrap();
    eventually("handler started", || started.load(Ordering::SeqCst)).await;

    broker.disconnect("broker restarting");
    eventually("renewal report", || {
        errors
            .snapshot()
            .iter()
            .any(|r| r.source == ErrorSource::LockRenewal)
    })
    .await;
    assert_matches!(
        processor.wait().await,
        Err(DispatchError::TransportUnavailable { .. })
    );

    let reports = errors.snapshot();
    let renewal = reports
        .iter()
        .find(|r| r.source == ErrorSource::LockRenewal)
        .unwrap();
    assert_eq!(renewal.session_key.as_ref().map(|k| k.as_str()), Some("s1"));
    assert_eq!(renewal.entity_path, "orders");
    assert_matches!(
        renewal.error.as_ref(),
        DispatchError::TransportUnavailable { .. }
    );
    assert!(reports.iter().any(|r| r.source == ErrorSource::Accept));
}

#[tokio::test(start_paused = true)]
async fn repeated_faults_dead_letter_after_max_deliveries() {
    let broker = broker(3, Duration::from_secs(30));
    let sender = broker.create_sender();
    let errors = ErrorLog::default();
    let deliveries = Arc::new(Mutex::new(Vec::<u32>::new()));
    let sink = Arc::clone(&deliveries);
    let processor = broker.create_session_processor(
        options(),
        message_handler(move |msg, _ctx| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(msg.delivery_count());
                let result: anyhow::Result<()> = Err(anyhow!("cannot process {}", msg.body_text()));
                result
            }
        }),
        errors.handler(),
    );

    let id = sender.send("poison", "s1").unwrap();
    processor.start().unwrap();

    eventually("dead letter", || broker.dead_letters().len() == 1).await;
    eventually("three fault reports", || errors.len() == 3).await;
    processor.stop().await.unwrap();

    assert_eq!(*deliveries.lock(), vec![1, 2, 3]);
    let dead = broker.dead_letters();
    assert_eq!(dead[0].message.id, id);
    assert_eq!(dead[0].reason, MAX_DELIVERY_COUNT_EXCEEDED);
    assert_eq!(broker.tracker().state(&id), Some(SettlementState::DeadLettered));

    for report in errors.snapshot() {
        assert_eq!(report.source, ErrorSource::ProcessMessage);
        assert_eq!(report.entity_path, "orders");
        assert_eq!(report.namespace, "test.local");
        assert_eq!(report.session_key.as_ref().map(|k| k.as_str()), Some("s1"));
        assert_matches!(report.error.as_ref(), DispatchError::HandlerFault(reason) if reason.contains("poison"));
    }
}

#[tokio::test(start_paused = true)]
async fn panicking_handler_is_abandoned_and_reported() {
    let broker = default_broker();
    let sender = broker.create_sender();
    let errors = ErrorLog::default();
    let deliveries = Arc::new(Mutex::new(Vec::<u32>::new()));
    let sink = Arc::clone(&deliveries);
    let processor = broker.create_session_processor(
        options(),
        message_handler(move |msg, _ctx| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(msg.delivery_count());
                if msg.body_text() == "fragile" {
                    assert!(msg.delivery_count() > 1, "first delivery blows up");
                }
                anyhow::Ok(())
            }
        }),
        errors.handler(),
    );

    let id = sender.send("fragile", "s1").unwrap();
    let _ = sender.send("next", "s1").unwrap();
    processor.start().unwrap();

    eventually("completion", || {
        broker.tracker().state(&id) == Some(SettlementState::Completed)
    })
    .await;
    eventually("report", || errors.len() == 1).await;
    processor.stop().await.unwrap();

    // The abandoned message goes back to the head of its session.
    assert_eq!(*deliveries.lock(), vec![1, 2, 1]);
    assert_eq!(errors.len(), 1);
    let report = &errors.snapshot()[0];
    assert_eq!(report.source, ErrorSource::ProcessMessage);
    assert_matches!(report.error.as_ref(), DispatchError::HandlerFault(reason) if reason.contains("first delivery blows up"));
}

#[tokio::test(start_paused = true)]
async fn settled_message_is_not_abandoned_on_fault() {
    let broker = default_broker();
    let sender = broker.create_sender();
    let errors = ErrorLog::default();
    let processor = broker.create_session_processor(
        options(),
        message_handler(|_msg, ctx| async move {
            ctx.dead_letter("ValidationFailed")?;
            let result: anyhow::Result<()> = Err(anyhow!("rejected after dead-lettering"));
            result
        }),
        errors.handler(),
    );

    let id = sender.send("bad", "s1").unwrap();
    processor.start().unwrap();

    eventually("report", || errors.len() == 1).await;
    processor.stop().await.unwrap();

    assert_eq!(broker.tracker().state(&id), Some(SettlementState::DeadLettered));
    let dead = broker.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, "ValidationFailed");
    assert_eq!(dead[0].message.delivery_count, 1);
}

#[tokio::test(start_paused = true)]
async fn deferred_message_is_retrieved_by_id() {
    let broker = default_broker();
    let sender = broker.create_sender();
    let deferred = Arc::new(Mutex::new(None::<MessageId>));
    let sink = Arc::clone(&deferred);
    let processor = broker.create_session_processor(
        options(),
        message_handler(move |msg, ctx| {
            let sink = Arc::clone(&sink);
            async move {
                ctx.defer()?;
                *sink.lock() = Some(msg.id().clone());
                anyhow::Ok(())
            }
        }),
        ErrorLog::default().handler(),
    );

    let id = sender.send("later", "s1").unwrap();
    processor.start().unwrap();
    eventually("deferral", || deferred.lock().is_some()).await;
    processor.stop().await.unwrap();

    assert_eq!(deferred.lock().as_ref(), Some(&id));
    assert_eq!(broker.tracker().state(&id), Some(SettlementState::Deferred));
    assert_eq!(broker.table().total_pending(), 0);

    let (received, ctx) = broker.receive_deferred(&id).unwrap();
    assert_eq!(received.body_text(), "later");
    assert_eq!(received.delivery_count(), 2);
    ctx.complete().unwrap();
    assert_eq!(broker.tracker().state(&id), Some(SettlementState::Completed));
    assert_matches!(
        broker.receive_deferred(&id),
        Err(DispatchError::InvalidSettlementState { .. })
    );
}
