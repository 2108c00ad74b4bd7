//! Message handler and error handler boundaries.
//!
//! The dispatch loop calls a [`MessageHandler`] once per delivered message
//! and an [`ErrorHandler`] for every failure it observes. Closures can be
//! used directly through [`message_handler`] and [`error_handler`].

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use relay_core::ReceivedMessage;
use tracing::{error, warn};

use crate::context::SettlementContext;
use crate::errors::ErrorContext;

/// User message processing.
///
/// # Settlement
///
/// The handler may settle the message through the [`SettlementContext`].
/// When it returns `Ok` without settling and auto-complete is on, the
/// message is completed. When it returns `Err` (or panics) without settling,
/// the message is abandoned and the error is reported to the
/// [`ErrorHandler`] with source `ProcessMessage`.
///
/// Messages of one session are delivered in order; with more than one call
/// per session, handlers for consecutive messages may overlap.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one message.
    async fn handle(&self, message: ReceivedMessage, ctx: SettlementContext) -> anyhow::Result<()>;
}

/// Receives every failure observed by the dispatch loop.
///
/// Called on the failing task; a slow error handler delays that task only.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    /// Observe one failure.
    async fn handle_error(&self, ctx: ErrorContext);
}

/// Error handler that logs through `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogErrorHandler;

#[async_trait]
impl ErrorHandler for LogErrorHandler {
    async fn handle_error(&self, ctx: ErrorContext) {
        let session_key = ctx.session_key.as_ref().map(ToString::to_string);
        if ctx.error.is_fatal() {
            error!(
                source = %ctx.source,
                namespace = %ctx.namespace,
                entity_path = %ctx.entity_path,
                session_key = ?session_key,
                category = ctx.error.category(),
                error = %ctx.error,
                "dispatch error"
            );
        } else {
            warn!(
                source = %ctx.source,
                entity_path = %ctx.entity_path,
                session_key = ?session_key,
                category = ctx.error.category(),
                error = %ctx.error,
                "dispatch error"
            );
        }
    }
}

/// [`MessageHandler`] backed by a closure.
pub struct FnMessageHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnMessageHandler<F, Fut>
where
    F: Fn(ReceivedMessage, SettlementContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: ReceivedMessage, ctx: SettlementContext) -> anyhow::Result<()> {
        (self.f)(message, ctx).await
    }
}

/// [`ErrorHandler`] backed by a closure.
pub struct FnErrorHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> ErrorHandler for FnErrorHandler<F, Fut>
where
    F: Fn(ErrorContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle_error(&self, ctx: ErrorContext) {
        (self.f)(ctx).await;
    }
}

/// Wrap an async closure as a message handler.
pub fn message_handler<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(ReceivedMessage, SettlementContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnMessageHandler {
        f,
        _fut: PhantomData,
    })
}

/// Wrap an async closure as an error handler.
pub fn error_handler<F, Fut>(f: F) -> Arc<dyn ErrorHandler>
where
    F: Fn(ErrorContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnErrorHandler {
        f,
        _fut: PhantomData,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::errors::{DispatchError, ErrorSource};

    fn context(source: ErrorSource) -> ErrorContext {
        ErrorContext {
            source,
            namespace: "test.local".into(),
            entity_path: "orders".into(),
            session_key: Some("s1".into()),
            error: Arc::new(DispatchError::HandlerFault("boom".into())),
        }
    }

    #[tokio::test]
    async fn closure_error_handler_receives_context() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let handler = error_handler(move |ctx| {
            let counter = Arc::clone(&counter);
            async move {
                assert_eq!(ctx.source, ErrorSource::ProcessMessage);
                let _ = counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        handler.handle_error(context(ErrorSource::ProcessMessage)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn log_error_handler_does_not_panic() {
        LogErrorHandler.handle_error(context(ErrorSource::Accept)).await;
        let mut fatal = context(ErrorSource::Accept);
        fatal.error = Arc::new(DispatchError::TransportUnavailable {
            entity_path: "orders".into(),
            reason: "down".into(),
        });
        fatal.session_key = None;
        LogErrorHandler.handle_error(fatal).await;
    }
}
