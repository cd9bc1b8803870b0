//! Store boundaries: the on-premises primary store (outbox + clinic tables)
//! and the cloud secondary store (portal row API).
//!
//! Both sides are `#[async_trait]` traits with in-memory implementations for
//! tests and durable implementations for production. Statements are applied
//! idempotently on both sides: upsert by mapped key, delete-if-exists.

mod memory;
mod rest;
mod sqlite;

pub use memory::{MemoryPrimaryStore, MemorySecondaryStore};
pub use rest::RestSecondaryStore;
pub use sqlite::SqlitePrimaryStore;

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use medbridge_protocol::{ChangeEvent, OutboxRow, Statement};
use serde_json::Value;

/// Rejects table/column names that cannot be spliced into SQL or URLs.
///
/// Identifiers come from the mapping catalog, but statements also flow in
/// from the webhook path, so they are checked at the store boundary.
pub(crate) fn check_identifier(name: &str) -> SyncResult<()> {
    let valid = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SyncError::InvalidEvent(format!(
            "invalid identifier: {name:?}"
        )))
    }
}

/// Parses a stored timestamp in either store's native text form.
pub(crate) fn parse_any_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Result of applying one statement to a store.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The write landed. `key` carries the target-side key when the store
    /// resolved or generated one.
    Applied {
        /// Target-side key of the affected row, when known.
        key: Option<Value>,
    },
    /// A timestamp guard found a newer stored row and skipped the write.
    Superseded,
}

impl ApplyOutcome {
    /// Target-side key, when the outcome carries one.
    pub fn key(&self) -> Option<&Value> {
        match self {
            ApplyOutcome::Applied { key } => key.as_ref(),
            ApplyOutcome::Superseded => None,
        }
    }
}

/// The on-premises store: clinic tables plus the outbox.
///
/// `enqueue` is the capture contract: the application inserts the outbox row
/// in the same transaction as the business write and then notifies the
/// engine. Everything else serves the queue processor and the reconciler.
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    /// Appends a captured change to the outbox. Returns the sequence number.
    async fn enqueue(&self, pk: &str, event: &ChangeEvent) -> SyncResult<i64>;

    /// Tables that currently have due outbox work.
    async fn tables_with_work(&self, now: DateTime<Utc>) -> SyncResult<Vec<String>>;

    /// Due rows (Pending, or Failed past their retry time) ordered by
    /// (table, primary key, sequence number).
    async fn due_rows(
        &self,
        table: Option<&str>,
        now: DateTime<Utc>,
        limit: u32,
    ) -> SyncResult<Vec<OutboxRow>>;

    /// Marks a row Processing.
    async fn mark_processing(&self, seq: i64) -> SyncResult<()>;

    /// Marks a row Completed.
    async fn mark_completed(&self, seq: i64) -> SyncResult<()>;

    /// Marks a row Failed with its retry schedule.
    async fn mark_failed(
        &self,
        seq: i64,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> SyncResult<()>;

    /// Marks a row DeadLettered. Terminal.
    async fn mark_dead_lettered(&self, seq: i64, attempts: u32, error: &str) -> SyncResult<()>;

    /// Returns Processing rows older than the cutoff to Pending.
    /// Covers queue-processor runs that died mid-flight.
    async fn requeue_stale(&self, cutoff: DateTime<Utc>) -> SyncResult<u64>;

    /// Non-terminal rows created before the cutoff.
    async fn stuck_count(&self, cutoff: DateTime<Utc>) -> SyncResult<u64>;

    /// Rows waiting to be pushed (Pending or Failed).
    async fn pending_count(&self) -> SyncResult<u64>;

    /// Deletes Completed rows older than the cutoff. Returns rows removed.
    async fn purge_completed(&self, cutoff: DateTime<Utc>) -> SyncResult<u64>;

    /// Applies a translated inbound statement inside one transaction.
    async fn apply(&self, statement: &Statement) -> SyncResult<ApplyOutcome>;
}

/// The cloud store behind the referrer portal.
#[async_trait]
pub trait SecondaryStore: Send + Sync {
    /// Applies a translated outbound statement.
    async fn apply(&self, statement: &Statement) -> SyncResult<ApplyOutcome>;

    /// Recent changes committed after the cursor position, oldest first.
    /// Backs the pull fallback; replays are safe behind the ledger.
    async fn changes_since(
        &self,
        cursor: Option<&str>,
        limit: u32,
    ) -> SyncResult<Vec<ChangeEvent>>;
}
