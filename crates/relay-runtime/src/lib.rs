//! # relay-runtime
//!
//! Session-partitioned, concurrency-bounded message dispatch.
//!
//! - **Router**: [`router::RuleRouter`] maps payloads to session keys, first matching rule wins
//! - **Queue table**: [`queue::SessionQueueTable`] holds per-session FIFOs and lease flags
//! - **Admission**: [`admission::AdmissionController`] enforces session and per-session call ceilings
//! - **Settlement**: [`settlement::SettlementTracker`] runs the lock/complete/abandon/defer/dead-letter state machine
//! - **Broker**: [`broker::Broker`] ties the above into one queue entity with session state and a dead-letter store
//! - **Dispatch loop**: [`processor::SessionProcessor`] leases sessions and invokes the [`handler::MessageHandler`]
//!
//! ## Crate Position
//!
//! Depends on relay-core and relay-settings. Top of the dependency graph.

#![deny(unsafe_code)]

pub mod admission;
pub mod broker;
pub mod context;
pub mod errors;
pub mod events;
pub mod handler;
pub mod processor;
pub mod queue;
pub mod router;
pub mod sender;
pub mod settlement;
pub mod state;

pub use broker::{Broker, BrokerOptions, DeadLetteredMessage};
pub use context::SettlementContext;
pub use errors::{DispatchError, ErrorContext, ErrorSource};
pub use events::{Disposition, DispatchEvent, EventEmitter};
pub use handler::{ErrorHandler, LogErrorHandler, MessageHandler, error_handler, message_handler};
pub use processor::{ProcessorOptions, SessionProcessor};
pub use router::{RuleRouter, SessionRouter};
pub use sender::Sender;
