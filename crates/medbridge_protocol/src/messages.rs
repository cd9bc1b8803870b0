//! HTTP request and response messages.

use crate::direction::Direction;
use crate::event::{ChangeEvent, ChangeOp, ChangeOrigin, RowImage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inbound change notification posted by the secondary store.
///
/// Body of `POST /api/sync/webhook`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// Secondary-side table name.
    pub table: String,
    /// Mutation kind.
    #[serde(rename = "type")]
    pub op: ChangeOp,
    /// Row values after the change.
    pub record: RowImage,
    /// Row values before the change, when provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_record: Option<RowImage>,
    /// Origin commit time.
    pub timestamp: DateTime<Utc>,
    /// Globally unique event id assigned by the secondary store's capture.
    pub event_id: String,
}

impl WebhookPayload {
    /// Converts the payload into a secondary-origin change event.
    pub fn into_event(self) -> ChangeEvent {
        ChangeEvent {
            event_id: self.event_id,
            origin: ChangeOrigin::Secondary,
            table: self.table,
            op: self.op,
            record: self.record,
            old_record: self.old_record,
            timestamp: self.timestamp,
        }
    }
}

impl From<ChangeEvent> for WebhookPayload {
    fn from(event: ChangeEvent) -> Self {
        Self {
            table: event.table,
            op: event.op,
            record: event.record,
            old_record: event.old_record,
            timestamp: event.timestamp,
            event_id: event.event_id,
        }
    }
}

/// Outcome category reported for a handled webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    /// The change was applied to the primary store.
    Applied,
    /// The event id was already applied in the inbound direction.
    Duplicate,
    /// The event was an echo of a change this engine pushed outbound.
    Echo,
    /// The event exhausted its retry budget and was set aside.
    DeadLettered,
}

/// Response body for a handled webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookAck {
    /// Whether a write was performed.
    pub applied: bool,
    /// Outcome category.
    pub status: WebhookStatus,
}

impl WebhookAck {
    /// The change was applied.
    pub fn applied() -> Self {
        Self {
            applied: true,
            status: WebhookStatus::Applied,
        }
    }

    /// The change was a duplicate delivery.
    pub fn duplicate() -> Self {
        Self {
            applied: false,
            status: WebhookStatus::Duplicate,
        }
    }

    /// The change was an echo of an outbound push.
    pub fn echo() -> Self {
        Self {
            applied: false,
            status: WebhookStatus::Echo,
        }
    }

    /// The change was dead-lettered.
    pub fn dead_lettered() -> Self {
        Self {
            applied: false,
            status: WebhookStatus::DeadLettered,
        }
    }
}

/// Body of `POST /api/sync/trigger`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRequest {
    /// Direction to sync; both when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
}

/// Result of one outbox drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    /// Rows applied and marked Completed.
    pub processed: u64,
    /// Rows that failed and will be retried.
    pub failed: u64,
    /// Rows moved to DeadLettered this drain.
    pub dead_lettered: u64,
}

impl DrainReport {
    /// Folds another report into this one.
    pub fn merge(&mut self, other: DrainReport) {
        self.processed += other.processed;
        self.failed += other.failed;
        self.dead_lettered += other.dead_lettered;
    }
}

/// Result of one reconciler sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Stale rows returned to Pending and re-drained.
    pub requeued: u64,
    /// Rows still not Completed after the sweep's drain.
    pub still_stuck: u64,
    /// Outcome of the drain the sweep ran.
    pub drained: DrainReport,
}

/// Result of an inbound pull-based replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillReport {
    /// Events fetched from the secondary store.
    pub fetched: u64,
    /// Events applied to the primary store.
    pub applied: u64,
    /// Events skipped as duplicates or echoes.
    pub skipped: u64,
    /// Events that failed and were left for the next pass.
    pub failed: u64,
}

/// Response body for a manual trigger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerReport {
    /// Outbound drain outcome, when that direction ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outbound: Option<DrainReport>,
    /// Inbound backfill outcome, when that direction ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inbound: Option<BackfillReport>,
}

/// Health of one sync direction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectionHealth {
    /// True when the last successful sync is within the freshness window.
    pub healthy: bool,
    /// Time of the last successful apply in this direction.
    pub last_sync: Option<DateTime<Utc>>,
    /// Seconds since the last successful apply.
    pub lag_seconds: Option<i64>,
    /// Most recent error recorded for this direction.
    pub last_error: Option<String>,
}

/// Outbox queue gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueGauges {
    /// Rows waiting or retrying.
    pub pending: u64,
    /// Rows set aside for manual intervention (both directions).
    pub dead_lettered: u64,
}

/// Cumulative engine counters since process start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCounters {
    /// Changes applied to the secondary store.
    pub outbound_applied: u64,
    /// Changes applied to the primary store.
    pub inbound_applied: u64,
    /// Duplicate deliveries rejected by the ledger.
    pub duplicates: u64,
    /// Echoes suppressed.
    pub echoes_suppressed: u64,
    /// Events dead-lettered (both directions).
    pub dead_lettered: u64,
    /// Reconciler sweeps completed.
    pub sweeps: u64,
}

/// Response body of `GET /api/sync/status`.
///
/// Top-level fields reflect the worst direction: `lastSync` is the older of
/// the two per-direction marks and `healthy` requires both directions to be
/// fresh.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// Overall health.
    pub healthy: bool,
    /// Oldest per-direction last-sync mark.
    pub last_sync: Option<DateTime<Utc>>,
    /// Lag of the most stale direction.
    pub lag_seconds: Option<i64>,
    /// Outbound (primary → secondary) detail.
    pub outbound: DirectionHealth,
    /// Inbound (secondary → primary) detail.
    pub inbound: DirectionHealth,
    /// Outbox gauges.
    pub queue: QueueGauges,
    /// Cumulative counters.
    pub counters: SyncCounters,
}

/// One dead-lettered change, for operator inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    /// Direction the change was travelling.
    pub direction: Direction,
    /// Event id of the failed change.
    pub event_id: String,
    /// Source table name.
    pub table: String,
    /// Why the change was set aside.
    pub reason: String,
    /// When it was dead-lettered.
    pub at: DateTime<Utc>,
    /// The full captured payload.
    pub event: ChangeEvent,
}
