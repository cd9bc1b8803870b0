//! Outbox rows and their status lifecycle.

use crate::event::ChangeEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Processing status of an outbox row.
///
/// Transitions: Pending → Processing → Completed, or Processing → Failed
/// (→ Pending again once the retry delay elapses) → DeadLettered after the
/// retry ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting to be picked up by a drain.
    Pending,
    /// Claimed by a drain that is currently applying it.
    Processing,
    /// Applied to the secondary store.
    Completed,
    /// Last attempt failed; eligible again once the retry delay elapses.
    Failed,
    /// Retry ceiling reached; requires manual intervention.
    DeadLettered,
}

impl OutboxStatus {
    /// Returns the storage name for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Completed => "completed",
            OutboxStatus::Failed => "failed",
            OutboxStatus::DeadLettered => "dead_lettered",
        }
    }

    /// Parses a storage name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OutboxStatus::Pending),
            "processing" => Some(OutboxStatus::Processing),
            "completed" => Some(OutboxStatus::Completed),
            "failed" => Some(OutboxStatus::Failed),
            "dead_lettered" => Some(OutboxStatus::DeadLettered),
            _ => None,
        }
    }

    /// Returns true if the row will never be processed again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Completed | OutboxStatus::DeadLettered)
    }
}

/// A change event captured on the primary store, awaiting propagation.
///
/// The sequence number is monotonic per table and drives per-key ordering:
/// rows for the same primary key are applied in non-decreasing sequence
/// order, never reordered even when retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRow {
    /// Sequence number, monotonic per table.
    pub seq: i64,
    /// Source primary key, rendered as a string for ordering and grouping.
    pub pk: String,
    /// The captured change.
    pub event: ChangeEvent,
    /// Current processing status.
    pub status: OutboxStatus,
    /// Number of apply attempts so far.
    pub attempts: u32,
    /// Earliest time the next attempt may run, for Failed rows.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Message from the most recent failure.
    pub last_error: Option<String>,
    /// Capture time.
    pub created_at: DateTime<Utc>,
}

impl OutboxRow {
    /// Creates a pending row for a freshly captured event.
    pub fn new(seq: i64, pk: impl Into<String>, event: ChangeEvent) -> Self {
        Self {
            seq,
            pk: pk.into(),
            event,
            status: OutboxStatus::Pending,
            attempts: 0,
            next_attempt_at: None,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    /// Returns true if the row is due for processing at `now`.
    ///
    /// Pending rows are always due; Failed rows become due once their retry
    /// delay has elapsed. Terminal and in-flight rows are never due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            OutboxStatus::Pending => true,
            OutboxStatus::Failed => self
                .next_attempt_at
                .map(|at| at <= now)
                .unwrap_or(true),
            _ => false,
        }
    }
}
