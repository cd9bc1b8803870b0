//! Error types for the sync engine.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while moving a change between stores.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Translation failed; see [`MappingError`] for whether a re-queue can
    /// help.
    #[error(transparent)]
    Mapping(#[from] MappingError),

    /// A store round-trip failed.
    #[error("store error: {message}")]
    Store {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The durable state store (ledger, key map, sync state) failed.
    #[error("state store error: {0}")]
    State(String),

    /// An apply did not complete within its bounded timeout.
    #[error("apply timed out")]
    Timeout,

    /// The event itself is malformed (missing key column, bad payload).
    #[error("invalid change event: {0}")]
    InvalidEvent(String),

    /// Configuration problem detected at load time.
    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Creates a retryable store error.
    pub fn store_retryable(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable store error.
    pub fn store_fatal(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if retrying the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Store { retryable, .. } => *retryable,
            SyncError::State(_) => true,
            SyncError::Timeout => true,
            SyncError::Mapping(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::State(err.to_string())
    }
}

/// Errors raised by the translator.
#[derive(Error, Debug)]
pub enum MappingError {
    /// The source table has no configured mapping.
    #[error("no mapping configured for table {0}")]
    UnknownTable(String),

    /// A column in the row image has no mapping and is not marked skipped.
    #[error("no mapping for column {column} of table {table}")]
    UnknownColumn {
        /// Source table name.
        table: String,
        /// Source column name.
        column: String,
    },

    /// The row image does not carry the configured key column.
    #[error("row for table {table} is missing key column {column}")]
    MissingKey {
        /// Source table name.
        table: String,
        /// Key column name.
        column: String,
    },

    /// A key or foreign-key value has no cross-reference entry yet.
    ///
    /// Retryable: the referenced row may simply not have synchronized yet,
    /// so the event is re-queued rather than discarded.
    #[error("unresolved reference: {table}.{column} = {value}")]
    UnresolvedReference {
        /// Table the reference points at.
        table: String,
        /// Referencing column.
        column: String,
        /// The unmapped value, rendered for the log.
        value: String,
    },

    /// A value could not be coerced to the target representation.
    #[error("cannot coerce column {column}: {message}")]
    Coercion {
        /// Source column name.
        column: String,
        /// What went wrong.
        message: String,
    },
}

impl MappingError {
    /// Returns true if a re-queue may resolve the error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MappingError::UnresolvedReference { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::store_retryable("connection reset").is_retryable());
        assert!(!SyncError::store_fatal("unknown endpoint").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::State("database is locked".into()).is_retryable());
        assert!(!SyncError::InvalidEvent("no record".into()).is_retryable());
    }

    #[test]
    fn unresolved_reference_is_retryable() {
        let err = SyncError::from(MappingError::UnresolvedReference {
            table: "patients".into(),
            column: "patient_id".into(),
            value: "17".into(),
        });
        assert!(err.is_retryable());

        let err = SyncError::from(MappingError::UnknownTable("invoices".into()));
        assert!(!err.is_retryable());
    }

    #[test]
    fn error_display() {
        let err = MappingError::UnknownColumn {
            table: "patients".into(),
            column: "nickname".into(),
        };
        assert!(err.to_string().contains("nickname"));
        assert!(err.to_string().contains("patients"));
    }
}
