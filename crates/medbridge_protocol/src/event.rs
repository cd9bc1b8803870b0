//! Captured change events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The values of a row at capture time, keyed by source column name.
pub type RowImage = serde_json::Map<String, Value>;

/// The kind of mutation a change event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    /// A new row was created.
    Insert,
    /// An existing row was modified.
    Update,
    /// A row was removed.
    Delete,
}

impl ChangeOp {
    /// Returns the wire name for this operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Insert => "insert",
            ChangeOp::Update => "update",
            ChangeOp::Delete => "delete",
        }
    }

    /// Parses a wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(ChangeOp::Insert),
            "update" => Some(ChangeOp::Update),
            "delete" => Some(ChangeOp::Delete),
            _ => None,
        }
    }
}

/// Which store a change originated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOrigin {
    /// The on-premises clinic store.
    Primary,
    /// The cloud portal store.
    Secondary,
}

/// One captured mutation, in the originating store's native representation.
///
/// # Fields
///
/// - `event_id`: globally unique identifier, assigned at capture time
/// - `origin`: which store produced the change
/// - `table`: source table name (origin-side naming)
/// - `op`: insert, update, or delete
/// - `record`: full row image after the change (before it, for deletes)
/// - `old_record`: row image before the change, when the capture provides one
/// - `timestamp`: origin commit time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Globally unique event identifier.
    pub event_id: String,
    /// Originating store.
    pub origin: ChangeOrigin,
    /// Source table name.
    pub table: String,
    /// Mutation kind.
    pub op: ChangeOp,
    /// Row values after the change (for deletes, the removed row).
    pub record: RowImage,
    /// Row values before the change, if captured.
    pub old_record: Option<RowImage>,
    /// Origin commit timestamp.
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    /// Creates an event with a fresh event id and the current time.
    pub fn new(origin: ChangeOrigin, table: impl Into<String>, op: ChangeOp, record: RowImage) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            origin,
            table: table.into(),
            op,
            record,
            old_record: None,
            timestamp: Utc::now(),
        }
    }

    /// Creates an insert event captured on the primary store.
    pub fn primary_insert(table: impl Into<String>, record: RowImage) -> Self {
        Self::new(ChangeOrigin::Primary, table, ChangeOp::Insert, record)
    }

    /// Creates an update event captured on the primary store.
    pub fn primary_update(table: impl Into<String>, record: RowImage) -> Self {
        Self::new(ChangeOrigin::Primary, table, ChangeOp::Update, record)
    }

    /// Creates a delete event captured on the primary store.
    ///
    /// `record` carries the removed row's values so the key can still be
    /// resolved.
    pub fn primary_delete(table: impl Into<String>, record: RowImage) -> Self {
        Self::new(ChangeOrigin::Primary, table, ChangeOp::Delete, record)
    }

    /// Sets the prior row image.
    pub fn with_old_record(mut self, old: RowImage) -> Self {
        self.old_record = Some(old);
        self
    }

    /// Sets the event id.
    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }

    /// Sets the origin timestamp.
    pub fn with_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.timestamp = at;
        self
    }

    /// Returns a column value from the row image, if present.
    pub fn value(&self, column: &str) -> Option<&Value> {
        self.record.get(column)
    }
}
