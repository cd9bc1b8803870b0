//! # MedBridge Protocol
//!
//! Wire and domain types shared by the MedBridge sync engine and server.
//!
//! This crate provides:
//! - `ChangeEvent` for captured row mutations
//! - `Direction` for the two sync directions
//! - `OutboxRow` and its status lifecycle
//! - `Statement` for translated writes
//! - HTTP request/response messages
//!
//! This is a pure types crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod direction;
mod event;
mod messages;
mod outbox;
mod statement;

pub use direction::{Direction, ParseDirectionError};
pub use event::{ChangeEvent, ChangeOp, ChangeOrigin, RowImage};
pub use messages::{
    BackfillReport, DeadLetterEntry, DirectionHealth, DrainReport, QueueGauges, StatusReport,
    SweepReport, SyncCounters, TriggerReport, TriggerRequest, WebhookAck, WebhookPayload,
    WebhookStatus,
};
pub use outbox::{OutboxRow, OutboxStatus};
pub use statement::{Statement, WriteGuard};
