//! # relay-core
//!
//! Foundation types shared by every relay crate:
//!
//! - **Branded IDs**: [`ids::MessageId`], [`ids::LockToken`] as UUID v7 newtypes,
//!   and the caller-chosen [`ids::SessionKey`]
//! - **Messages**: [`message::Message`] as stored by the broker and
//!   [`message::ReceivedMessage`] as seen by a handler
//! - **Logging**: [`logging::init_subscriber`] for the `tracing` subscriber
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by relay-settings and relay-runtime.

#![deny(unsafe_code)]

pub mod ids;
pub mod logging;
pub mod message;

pub use ids::{LockToken, MessageId, SessionKey};
pub use message::{Message, ReceivedMessage};
