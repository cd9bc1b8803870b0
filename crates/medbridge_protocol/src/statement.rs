//! Translated statements, the unit a store applies.

use crate::event::RowImage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Last-writer-wins guard attached to an upsert.
///
/// The applying store compares `timestamp` against the existing row's value
/// in `column` and skips the write when the existing row is strictly newer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteGuard {
    /// Target-side column holding the row's last-modified time.
    pub column: String,
    /// Origin commit time of the incoming change.
    pub timestamp: DateTime<Utc>,
}

/// A mutation expressed in the target store's schema.
///
/// Statements are constructed to be naturally idempotent: an upsert keyed by
/// the mapped primary key, or a delete-if-exists. Applying the same statement
/// twice leaves the target in the same state as applying it once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    /// Insert the row or update it in place.
    Upsert {
        /// Target table name.
        table: String,
        /// Target key column name.
        key_column: String,
        /// Target key value. `None` when the target generates the key
        /// (first sync of a cross-referenced row); the apply reports the
        /// generated value back.
        key: Option<Value>,
        /// Target column values.
        values: RowImage,
        /// Optional last-writer-wins guard.
        guard: Option<WriteGuard>,
    },
    /// Remove the row if it exists.
    Delete {
        /// Target table name.
        table: String,
        /// Target key column name.
        key_column: String,
        /// Target key value.
        key: Value,
    },
}

impl Statement {
    /// Returns the target table this statement writes to.
    pub fn table(&self) -> &str {
        match self {
            Statement::Upsert { table, .. } => table,
            Statement::Delete { table, .. } => table,
        }
    }

    /// Returns true for upserts.
    pub fn is_upsert(&self) -> bool {
        matches!(self, Statement::Upsert { .. })
    }
}
