//! Session processor: the dispatch loop.
//!
//! [`SessionProcessor::start`] spawns an accept loop that selects eligible
//! sessions round-robin, leases them through the admission controller and
//! hands each lease to a session worker. A worker dispatches the session's
//! messages in order, at most `max_concurrent_calls_per_session` at a time,
//! and gives the lease back once the session drains, is rotated out or is
//! released by a handler. A sweeper task returns expired message locks to
//! delivery.
//!
//! Message-level failures are reported to the [`ErrorHandler`] and never stop
//! the loop. An unreachable transport is reported with source `Accept` and
//! ends the loop; [`SessionProcessor::wait`] and [`SessionProcessor::stop`]
//! return that error.

mod accept;
mod options;
mod worker;

pub use options::ProcessorOptions;

use std::sync::Arc;

use parking_lot::Mutex;
use relay_core::SessionKey;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::admission::AdmissionController;
use crate::broker::Broker;
use crate::errors::{DispatchError, ErrorContext, ErrorSource};
use crate::handler::{ErrorHandler, MessageHandler};

/// Everything the accept loop, workers and dispatch tasks share.
pub(crate) struct ProcessorShared {
    pub(crate) broker: Arc<Broker>,
    pub(crate) admission: AdmissionController,
    pub(crate) options: ProcessorOptions,
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub(crate) error_handler: Arc<dyn ErrorHandler>,
}

impl ProcessorShared {
    /// Hand a failure to the error handler.
    pub(crate) async fn report(
        &self,
        source: ErrorSource,
        session_key: Option<&SessionKey>,
        error: DispatchError,
    ) {
        let broker = self.broker.options();
        self.error_handler
            .handle_error(ErrorContext {
                source,
                namespace: broker.namespace.clone(),
                entity_path: broker.entity_path.clone(),
                session_key: session_key.cloned(),
                error: Arc::new(error),
            })
            .await;
    }
}

struct Running {
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<(), DispatchError>>>,
}

/// Processes the sessions of one broker entity.
pub struct SessionProcessor {
    shared: Arc<ProcessorShared>,
    running: Mutex<Option<Running>>,
}

impl SessionProcessor {
    /// Create a stopped processor.
    pub fn new(
        broker: Arc<Broker>,
        options: ProcessorOptions,
        handler: Arc<dyn MessageHandler>,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> Self {
        let admission = AdmissionController::new(options.admission_config());
        Self {
            shared: Arc::new(ProcessorShared {
                broker,
                admission,
                options,
                handler,
                error_handler,
            }),
            running: Mutex::new(None),
        }
    }

    /// Start the dispatch loop.
    ///
    /// Fails with `AlreadyProcessing` while a previous start is still
    /// running, and with `TransportUnavailable` if the entity is unreachable.
    #[instrument(skip(self), fields(entity_path = %self.shared.broker.options().entity_path))]
    pub fn start(&self) -> Result<(), DispatchError> {
        let mut running = self.running.lock();
        if running
            .as_ref()
            .is_some_and(|r| r.task.as_ref().is_none_or(|t| !t.is_finished()))
        {
            return Err(DispatchError::AlreadyProcessing);
        }
        self.shared.broker.ensure_available()?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept::run(Arc::clone(&self.shared), cancel.clone()));
        *running = Some(Running {
            cancel,
            task: Some(task),
        });
        info!(
            max_sessions = self.shared.options.max_concurrent_sessions,
            max_calls = self.shared.options.max_concurrent_calls_per_session,
            "session processor started"
        );
        Ok(())
    }

    /// Stop accepting sessions and wait for the loop to finish.
    ///
    /// In-flight handlers get `shutdown_grace_period` to finish; after that
    /// they are aborted and their messages abandoned. Returns the fatal
    /// error that ended the loop, if any.
    #[instrument(skip(self), fields(entity_path = %self.shared.broker.options().entity_path))]
    pub async fn stop(&self) -> Result<(), DispatchError> {
        let cancel = self.running.lock().as_ref().map(|r| r.cancel.clone());
        let Some(cancel) = cancel else {
            return Ok(());
        };
        cancel.cancel();
        let result = self.wait().await;
        info!("session processor stopped");
        result
    }

    /// Wait for the dispatch loop to end without stopping it.
    pub async fn wait(&self) -> Result<(), DispatchError> {
        let task = self.running.lock().as_mut().and_then(|r| r.task.take());
        let Some(task) = task else {
            return Ok(());
        };
        let result = match task.await {
            Ok(result) => result,
            Err(join_err) => Err(DispatchError::Internal(format!(
                "dispatch loop panicked: {join_err}"
            ))),
        };
        *self.running.lock() = None;
        result
    }

    /// Whether the dispatch loop is running.
    pub fn is_processing(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| r.task.as_ref().is_none_or(|t| !t.is_finished()))
    }

    /// Admission controller of this processor.
    pub fn admission(&self) -> &AdmissionController {
        &self.shared.admission
    }

    /// Options this processor was created with.
    pub fn options(&self) -> &ProcessorOptions {
        &self.shared.options
    }
}

impl Drop for SessionProcessor {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}
