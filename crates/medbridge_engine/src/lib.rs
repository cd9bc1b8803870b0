//! # MedBridge Sync Engine
//!
//! Bidirectional synchronization between the clinic's on-premises store
//! (primary) and the cloud portal store (secondary).
//!
//! This crate provides:
//! - Mapping catalog and translator (schema/type/key translation)
//! - Durable idempotency ledger, cross-reference key map, and sync state
//! - Outbound queue processor draining the primary store's outbox
//! - Inbound webhook processor applying secondary-store changes
//! - Reconciler sweep and health reporting
//!
//! ## Architecture
//!
//! Changes on the primary store are captured as outbox rows in the same
//! transaction as the business write. The queue processor drains the outbox
//! per table, in per-key sequence order, translating each event and pushing
//! it to the secondary store. Changes on the secondary store arrive as
//! webhooks and take the symmetric path into the primary store.
//!
//! ## Key Invariants
//!
//! - At most one idempotency record per (event id, direction); the ledger's
//!   check-then-insert is atomic
//! - Statements are naturally idempotent (upsert by mapped key,
//!   delete-if-exists), so at-least-once delivery yields effectively-once
//!   application
//! - Rows for the same primary key apply in non-decreasing sequence order
//! - A change pushed outbound is never re-applied when the secondary store
//!   echoes it back

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod engine;
mod error;
mod health;
mod inbound;
mod mapping;
mod outbound;
mod reconcile;
mod state;
mod stats;
pub mod stores;
mod translate;

pub use config::{EngineConfig, RetryConfig};
pub use engine::SyncEngine;
pub use error::{MappingError, SyncError, SyncResult};
pub use health::HealthReporter;
pub use inbound::WebhookProcessor;
pub use mapping::{
    ColumnMapping, Coercion, KeyMapping, KeyStrategy, MappingCatalog, ReferenceMapping,
    TableMapping, ValueMapEntry,
};
pub use outbound::QueueProcessor;
pub use reconcile::Reconciler;
pub use state::{DirectionState, StateStore};
pub use stats::EngineStats;
pub use translate::{key_display, KeyResolver, MemoryKeyMap, Translator};
