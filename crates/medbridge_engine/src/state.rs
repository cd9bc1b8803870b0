//! Durable engine state: idempotency ledger, cross-reference key map,
//! per-direction sync state, inbound failure tallies and dead letters.
//!
//! Everything lives in one SQLite database in WAL mode. The ledger is the
//! piece that makes delivery exactly-once-effectively: applying an event and
//! recording its id happen against the same database, and the primary key on
//! `(event_id, direction)` turns the check-then-insert into a single atomic
//! statement.

use crate::error::{SyncError, SyncResult};
use crate::translate::{canonical_key, KeyResolver};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use medbridge_protocol::{DeadLetterEntry, Direction};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

const BUSY_RETRY_MAX_ATTEMPTS: u32 = 5;
const BUSY_RETRY_BASE_DELAY_MS: u64 = 10;
const BUSY_RETRY_MAX_DELAY_MS: u64 = 500;

/// Inbound backfill position, stored under a fixed cursor name.
const BACKFILL_CURSOR: &str = "inbound_backfill";

pub(crate) fn is_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Runs a statement with retry on SQLITE_BUSY/SQLITE_LOCKED.
pub(crate) async fn with_busy_retry<F, Fut, T>(
    operation: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = BUSY_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation, attempts, "statement succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_busy_error(&e) && attempts < BUSY_RETRY_MAX_ATTEMPTS => {
                warn!(operation, attempts, delay_ms, "database busy, retrying");
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(BUSY_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Health bookkeeping for one direction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirectionState {
    /// When the direction last completed a successful apply or pass.
    pub last_success: Option<DateTime<Utc>>,
    /// Most recent failure message, cleared on success.
    pub last_error: Option<String>,
    /// When the most recent failure happened.
    pub last_error_at: Option<DateTime<Utc>>,
    /// Failures since the last success.
    pub consecutive_failures: u32,
}

/// SQLite-backed engine state.
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    /// Opens (or creates) the state database at the given path.
    pub async fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path_str}?mode=rwc"))
            .map_err(|e| SyncError::Config(format!("invalid state db path: {e}")))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        for ddl in [
            r#"
            CREATE TABLE IF NOT EXISTS idempotency (
                event_id   TEXT NOT NULL,
                direction  TEXT NOT NULL,
                applied_at TEXT NOT NULL,
                PRIMARY KEY (event_id, direction)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS key_map (
                table_name    TEXT NOT NULL,
                primary_key   TEXT NOT NULL,
                secondary_key TEXT NOT NULL,
                PRIMARY KEY (table_name, primary_key),
                UNIQUE (table_name, secondary_key)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS sync_state (
                direction            TEXT PRIMARY KEY,
                last_success_at      TEXT,
                last_error           TEXT,
                last_error_at        TEXT,
                consecutive_failures INTEGER NOT NULL DEFAULT 0
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS inbound_failures (
                event_id   TEXT PRIMARY KEY,
                attempts   INTEGER NOT NULL,
                last_error TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS dead_letters (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                direction  TEXT NOT NULL,
                event_id   TEXT NOT NULL,
                table_name TEXT NOT NULL,
                reason     TEXT NOT NULL,
                at         TEXT NOT NULL,
                event_json TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS cursors (
                name       TEXT PRIMARY KEY,
                position   TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        ] {
            sqlx::query(ddl).execute(&pool).await?;
        }

        Ok(Self { pool })
    }

    /// Reserves an event id in the ledger for one direction.
    ///
    /// Returns `true` when this call recorded the id, `false` when it was
    /// already present. Concurrent callers race through the primary key, so
    /// exactly one of them sees `true`.
    pub async fn reserve_event(&self, event_id: &str, direction: Direction) -> SyncResult<bool> {
        let pool = &self.pool;
        let now = Utc::now();
        let result = with_busy_retry("ledger_reserve", || async {
            sqlx::query(
                "INSERT OR IGNORE INTO idempotency (event_id, direction, applied_at) VALUES (?, ?, ?)",
            )
            .bind(event_id)
            .bind(direction.as_str())
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Releases a reservation so a later retry can apply the event.
    pub async fn release_event(&self, event_id: &str, direction: Direction) -> SyncResult<()> {
        let pool = &self.pool;
        with_busy_retry("ledger_release", || async {
            sqlx::query("DELETE FROM idempotency WHERE event_id = ? AND direction = ?")
                .bind(event_id)
                .bind(direction.as_str())
                .execute(pool)
                .await
        })
        .await?;
        Ok(())
    }

    /// Whether an event id is recorded for a direction.
    ///
    /// Checking the opposite direction's ledger is how echoes are detected.
    pub async fn seen(&self, event_id: &str, direction: Direction) -> SyncResult<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM idempotency WHERE event_id = ? AND direction = ?",
        )
        .bind(event_id)
        .bind(direction.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Drops ledger entries recorded before the cutoff. Returns rows removed.
    pub async fn prune_ledger(&self, cutoff: DateTime<Utc>) -> SyncResult<u64> {
        let pool = &self.pool;
        let result = with_busy_retry("ledger_prune", || async {
            sqlx::query("DELETE FROM idempotency WHERE applied_at < ?")
                .bind(cutoff)
                .execute(pool)
                .await
        })
        .await?;
        Ok(result.rows_affected())
    }

    /// Records (or refreshes) a key correspondence for a table.
    pub async fn put_key_mapping(
        &self,
        table: &str,
        primary: &Value,
        secondary: &Value,
    ) -> SyncResult<()> {
        let pool = &self.pool;
        let primary_text = canonical_key(primary);
        let secondary_text = canonical_key(secondary);
        with_busy_retry("key_map_put", || async {
            sqlx::query(
                r#"
                INSERT INTO key_map (table_name, primary_key, secondary_key)
                VALUES (?, ?, ?)
                ON CONFLICT(table_name, primary_key) DO UPDATE SET
                    secondary_key = excluded.secondary_key
                "#,
            )
            .bind(table)
            .bind(&primary_text)
            .bind(&secondary_text)
            .execute(pool)
            .await
        })
        .await?;
        Ok(())
    }

    /// Removes the correspondence for a primary-side key.
    pub async fn remove_key_mapping(&self, table: &str, primary: &Value) -> SyncResult<()> {
        let pool = &self.pool;
        let primary_text = canonical_key(primary);
        with_busy_retry("key_map_remove", || async {
            sqlx::query("DELETE FROM key_map WHERE table_name = ? AND primary_key = ?")
                .bind(table)
                .bind(&primary_text)
                .execute(pool)
                .await
        })
        .await?;
        Ok(())
    }

    /// Marks a success for a direction, resetting its failure streak.
    pub async fn record_success(&self, direction: Direction, at: DateTime<Utc>) -> SyncResult<()> {
        let pool = &self.pool;
        with_busy_retry("state_success", || async {
            sqlx::query(
                r#"
                INSERT INTO sync_state (direction, last_success_at, last_error, last_error_at, consecutive_failures)
                VALUES (?, ?, NULL, NULL, 0)
                ON CONFLICT(direction) DO UPDATE SET
                    last_success_at = excluded.last_success_at,
                    last_error = NULL,
                    last_error_at = NULL,
                    consecutive_failures = 0
                "#,
            )
            .bind(direction.as_str())
            .bind(at)
            .execute(pool)
            .await
        })
        .await?;
        Ok(())
    }

    /// Marks a failure for a direction, extending its failure streak.
    pub async fn record_failure(
        &self,
        direction: Direction,
        error: &str,
        at: DateTime<Utc>,
    ) -> SyncResult<()> {
        let pool = &self.pool;
        with_busy_retry("state_failure", || async {
            sqlx::query(
                r#"
                INSERT INTO sync_state (direction, last_success_at, last_error, last_error_at, consecutive_failures)
                VALUES (?, NULL, ?, ?, 1)
                ON CONFLICT(direction) DO UPDATE SET
                    last_error = excluded.last_error,
                    last_error_at = excluded.last_error_at,
                    consecutive_failures = sync_state.consecutive_failures + 1
                "#,
            )
            .bind(direction.as_str())
            .bind(error)
            .bind(at)
            .execute(pool)
            .await
        })
        .await?;
        Ok(())
    }

    /// Current health bookkeeping for a direction.
    pub async fn direction_state(&self, direction: Direction) -> SyncResult<DirectionState> {
        let row: Option<(
            Option<DateTime<Utc>>,
            Option<String>,
            Option<DateTime<Utc>>,
            i64,
        )> = sqlx::query_as(
            r#"
            SELECT last_success_at, last_error, last_error_at, consecutive_failures
            FROM sync_state WHERE direction = ?
            "#,
        )
        .bind(direction.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .map(
                |(last_success, last_error, last_error_at, failures)| DirectionState {
                    last_success,
                    last_error,
                    last_error_at,
                    consecutive_failures: failures.max(0) as u32,
                },
            )
            .unwrap_or_default())
    }

    /// Bumps the failure tally for an inbound event. Returns the new count.
    pub async fn record_inbound_failure(&self, event_id: &str, error: &str) -> SyncResult<u32> {
        let pool = &self.pool;
        let now = Utc::now();
        with_busy_retry("inbound_failure", || async {
            sqlx::query(
                r#"
                INSERT INTO inbound_failures (event_id, attempts, last_error, updated_at)
                VALUES (?, 1, ?, ?)
                ON CONFLICT(event_id) DO UPDATE SET
                    attempts = inbound_failures.attempts + 1,
                    last_error = excluded.last_error,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(event_id)
            .bind(error)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        let attempts: i64 =
            sqlx::query_scalar("SELECT attempts FROM inbound_failures WHERE event_id = ?")
                .bind(event_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(attempts.max(0) as u32)
    }

    /// Clears the failure tally once an inbound event resolves.
    pub async fn clear_inbound_failure(&self, event_id: &str) -> SyncResult<()> {
        let pool = &self.pool;
        with_busy_retry("inbound_failure_clear", || async {
            sqlx::query("DELETE FROM inbound_failures WHERE event_id = ?")
                .bind(event_id)
                .execute(pool)
                .await
        })
        .await?;
        Ok(())
    }

    /// Appends a dead letter.
    pub async fn record_dead_letter(&self, entry: &DeadLetterEntry) -> SyncResult<()> {
        let pool = &self.pool;
        let event_json = serde_json::to_string(&entry.event)
            .map_err(|e| SyncError::State(format!("dead letter encode: {e}")))?;
        with_busy_retry("dead_letter", || async {
            sqlx::query(
                r#"
                INSERT INTO dead_letters (direction, event_id, table_name, reason, at, event_json)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(entry.direction.as_str())
            .bind(&entry.event_id)
            .bind(&entry.table)
            .bind(&entry.reason)
            .bind(entry.at)
            .bind(&event_json)
            .execute(pool)
            .await
        })
        .await?;
        Ok(())
    }

    /// Most recent dead letters, newest first.
    pub async fn dead_letters(&self, limit: u32) -> SyncResult<Vec<DeadLetterEntry>> {
        let rows: Vec<(String, String, String, String, DateTime<Utc>, String)> = sqlx::query_as(
            r#"
            SELECT direction, event_id, table_name, reason, at, event_json
            FROM dead_letters ORDER BY id DESC LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(direction, event_id, table, reason, at, event_json)| {
                let direction = direction
                    .parse::<Direction>()
                    .map_err(|e| SyncError::State(e.to_string()))?;
                let event = serde_json::from_str(&event_json)
                    .map_err(|e| SyncError::State(format!("dead letter decode: {e}")))?;
                Ok(DeadLetterEntry {
                    direction,
                    event_id,
                    table,
                    reason,
                    at,
                    event,
                })
            })
            .collect()
    }

    /// Number of dead letters on record.
    pub async fn dead_letter_count(&self) -> SyncResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Last position the inbound backfill pulled through.
    pub async fn backfill_cursor(&self) -> SyncResult<Option<String>> {
        let position: Option<String> =
            sqlx::query_scalar("SELECT position FROM cursors WHERE name = ?")
                .bind(BACKFILL_CURSOR)
                .fetch_optional(&self.pool)
                .await?;
        Ok(position)
    }

    /// Advances the inbound backfill position.
    pub async fn set_backfill_cursor(&self, position: &str) -> SyncResult<()> {
        let pool = &self.pool;
        let now = Utc::now();
        with_busy_retry("cursor_set", || async {
            sqlx::query(
                r#"
                INSERT INTO cursors (name, position, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(name) DO UPDATE SET
                    position = excluded.position,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(BACKFILL_CURSOR)
            .bind(position)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;
        Ok(())
    }

    /// Flushes the WAL and closes the pool.
    pub async fn close(&self) {
        if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
        {
            warn!(error = %e, "checkpoint on close failed");
        }
        self.pool.close().await;
    }
}

#[async_trait]
impl KeyResolver for StateStore {
    async fn secondary_key(&self, table: &str, primary_key: &Value) -> SyncResult<Option<Value>> {
        let primary_text = canonical_key(primary_key);
        let stored: Option<String> = sqlx::query_scalar(
            "SELECT secondary_key FROM key_map WHERE table_name = ? AND primary_key = ?",
        )
        .bind(table)
        .bind(&primary_text)
        .fetch_optional(&self.pool)
        .await?;
        decode_key(stored)
    }

    async fn primary_key(&self, table: &str, secondary_key: &Value) -> SyncResult<Option<Value>> {
        let secondary_text = canonical_key(secondary_key);
        let stored: Option<String> = sqlx::query_scalar(
            "SELECT primary_key FROM key_map WHERE table_name = ? AND secondary_key = ?",
        )
        .bind(table)
        .bind(&secondary_text)
        .fetch_optional(&self.pool)
        .await?;
        decode_key(stored)
    }
}

fn decode_key(stored: Option<String>) -> SyncResult<Option<Value>> {
    stored
        .map(|text| {
            serde_json::from_str(&text).map_err(|e| SyncError::State(format!("key decode: {e}")))
        })
        .transpose()
}
