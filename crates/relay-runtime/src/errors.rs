//! Dispatch error types and the error-boundary context.

use std::fmt;
use std::sync::Arc;

use relay_core::{MessageId, SessionKey};
use serde::Serialize;

/// Errors raised by the broker and the dispatch loop.
#[derive(Clone, Debug, thiserror::Error)]
pub enum DispatchError {
    /// The broker entity cannot be reached. Fatal to the dispatch loop.
    #[error("Transport unavailable: {entity_path}: {reason}")]
    TransportUnavailable {
        /// Entity that could not be reached.
        entity_path: String,
        /// Why it is unreachable.
        reason: String,
    },

    /// A settlement was attempted on a message the caller does not hold locked.
    #[error("Invalid settlement state: message {message_id} is {state}")]
    InvalidSettlementState {
        /// Message the settlement targeted.
        message_id: MessageId,
        /// Observed state of the message.
        state: String,
    },

    /// Admission refused a session or call slot. Internal control signal.
    #[error("Admission denied: {0}")]
    AdmissionDenied(String),

    /// A message lock expired before the message was settled.
    #[error("Lease expired: message {0}")]
    LeaseExpired(MessageId),

    /// The message handler returned an error or panicked.
    #[error("Handler fault: {0}")]
    HandlerFault(String),

    /// `start` was called on a processor that is already running.
    #[error("Processor is already running")]
    AlreadyProcessing,

    /// Internal / unexpected error (e.g. the dispatch task panicked).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Whether this error terminates the dispatch loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::TransportUnavailable { .. } | Self::Internal(_))
    }

    /// Error category string for logs and metrics labels.
    pub fn category(&self) -> &'static str {
        match self {
            Self::TransportUnavailable { .. } => "transport_unavailable",
            Self::InvalidSettlementState { .. } => "invalid_settlement_state",
            Self::AdmissionDenied(_) => "admission_denied",
            Self::LeaseExpired(_) => "lease_expired",
            Self::HandlerFault(_) => "handler_fault",
            Self::AlreadyProcessing => "already_processing",
            Self::Internal(_) => "internal",
        }
    }
}

/// Phase of processing in which an error surfaced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSource {
    /// Selecting or leasing a session, or reaching the entity at all.
    Accept,
    /// Renewing a message lock while its handler runs.
    LockRenewal,
    /// Running the user message handler.
    ProcessMessage,
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accept => write!(f, "accept"),
            Self::LockRenewal => write!(f, "lock_renewal"),
            Self::ProcessMessage => write!(f, "process_message"),
        }
    }
}

/// Everything the error handler learns about a failure.
#[derive(Clone, Debug)]
pub struct ErrorContext {
    /// Phase the error surfaced in.
    pub source: ErrorSource,
    /// Namespace of the faulting entity.
    pub namespace: String,
    /// Path of the faulting entity.
    pub entity_path: String,
    /// Session being processed, when the error is session-scoped.
    pub session_key: Option<SessionKey>,
    /// Underlying cause.
    pub error: Arc<DispatchError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_unavailable_display() {
        let err = DispatchError::TransportUnavailable {
            entity_path: "orders".into(),
            reason: "connection refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "Transport unavailable: orders: connection refused"
        );
        assert!(err.is_fatal());
    }

    #[test]
    fn invalid_settlement_display() {
        let err = DispatchError::InvalidSettlementState {
            message_id: MessageId::from("m-1"),
            state: "completed".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid settlement state: message m-1 is completed"
        );
        assert!(!err.is_fatal());
    }

    #[test]
    fn message_scoped_errors_are_not_fatal() {
        assert!(!DispatchError::HandlerFault("boom".into()).is_fatal());
        assert!(!DispatchError::LeaseExpired(MessageId::from("m")).is_fatal());
        assert!(!DispatchError::AdmissionDenied("full".into()).is_fatal());
    }

    #[test]
    fn categories() {
        assert_eq!(
            DispatchError::HandlerFault("x".into()).category(),
            "handler_fault"
        );
        assert_eq!(
            DispatchError::LeaseExpired(MessageId::from("m")).category(),
            "lease_expired"
        );
        assert_eq!(DispatchError::Internal("x".into()).category(), "internal");
    }

    #[test]
    fn error_source_display_and_serde() {
        assert_eq!(ErrorSource::LockRenewal.to_string(), "lock_renewal");
        assert_eq!(
            serde_json::to_string(&ErrorSource::ProcessMessage).unwrap(),
            "\"process_message\""
        );
    }
}
