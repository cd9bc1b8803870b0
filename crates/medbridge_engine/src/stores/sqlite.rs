//! SQLite-backed primary store.
//!
//! Owns the outbox table inside the clinic database and applies translated
//! inbound statements to the business tables transactionally. The business
//! tables themselves belong to the application; this store only writes the
//! rows the translator hands it.

use super::{check_identifier, ApplyOutcome, PrimaryStore};
use crate::error::{SyncError, SyncResult};
use crate::state::with_busy_retry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use medbridge_protocol::{ChangeEvent, OutboxRow, OutboxStatus, RowImage, Statement};
use serde_json::Value;
use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row};
use std::path::Path;
use std::str::FromStr;

type OutboxTuple = (
    i64,
    String,
    String,
    String,
    i64,
    Option<DateTime<Utc>>,
    Option<String>,
    DateTime<Utc>,
);

const OUTBOX_COLUMNS: &str =
    "seq, pk, event_json, status, attempts, next_attempt_at, last_error, created_at";

/// Primary store on SQLite.
pub struct SqlitePrimaryStore {
    pool: SqlitePool,
}

impl SqlitePrimaryStore {
    /// Opens (or creates) the clinic database and ensures the outbox exists.
    pub async fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path_str}?mode=rwc"))
            .map_err(|e| SyncError::Config(format!("invalid primary db path: {e}")))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox (
                seq             INTEGER PRIMARY KEY AUTOINCREMENT,
                pk              TEXT NOT NULL,
                event_id        TEXT NOT NULL UNIQUE,
                table_name      TEXT NOT NULL,
                event_json      TEXT NOT NULL,
                status          TEXT NOT NULL DEFAULT 'pending',
                attempts        INTEGER NOT NULL DEFAULT 0,
                next_attempt_at TEXT,
                last_error      TEXT,
                created_at      TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_outbox_status ON outbox (status, table_name, pk, seq)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// The underlying pool, for the application's own schema and reads.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Flushes the WAL and closes the pool.
    pub async fn close(&self) {
        let _ = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await;
        self.pool.close().await;
    }

    fn decode_rows(rows: Vec<OutboxTuple>) -> SyncResult<Vec<OutboxRow>> {
        rows.into_iter()
            .map(
                |(seq, pk, event_json, status, attempts, next_attempt_at, last_error, created_at)| {
                    let event: ChangeEvent = serde_json::from_str(&event_json)
                        .map_err(|e| SyncError::State(format!("outbox decode: {e}")))?;
                    let status = OutboxStatus::parse(&status).ok_or_else(|| {
                        SyncError::State(format!("unknown outbox status: {status}"))
                    })?;
                    Ok(OutboxRow {
                        seq,
                        pk,
                        event,
                        status,
                        attempts: attempts.max(0) as u32,
                        next_attempt_at,
                        last_error,
                        created_at,
                    })
                },
            )
            .collect()
    }
}

/// Appends a JSON value as a bound SQL parameter.
fn push_value(qb: &mut QueryBuilder<'_, Sqlite>, value: &Value) {
    match value {
        Value::Null => qb.push_bind(None::<String>),
        Value::Bool(b) => qb.push_bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                qb.push_bind(i)
            } else {
                qb.push_bind(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => qb.push_bind(s.clone()),
        other => qb.push_bind(other.to_string()),
    };
}

fn decode_returned_key(row: &sqlx::sqlite::SqliteRow) -> SyncResult<Value> {
    if let Ok(i) = row.try_get::<i64, _>(0) {
        return Ok(Value::from(i));
    }
    if let Ok(s) = row.try_get::<String, _>(0) {
        return Ok(Value::from(s));
    }
    Err(SyncError::State("unreadable generated key".into()))
}

fn upsert_sql(
    table: &str,
    key_column: &str,
    values: &RowImage,
    key: &Value,
    guard_column: Option<&str>,
) -> SyncResult<QueryBuilder<'static, Sqlite>> {
    check_identifier(table)?;
    check_identifier(key_column)?;
    for column in values.keys() {
        check_identifier(column)?;
    }
    if let Some(column) = guard_column {
        check_identifier(column)?;
    }

    let mut qb = QueryBuilder::new(format!("INSERT INTO {table} ({key_column}"));
    for column in values.keys() {
        qb.push(format!(", {column}"));
    }
    qb.push(") VALUES (");
    push_value(&mut qb, key);
    for value in values.values() {
        qb.push(", ");
        push_value(&mut qb, value);
    }
    qb.push(format!(") ON CONFLICT({key_column}) DO "));

    if values.is_empty() {
        qb.push("NOTHING");
        return Ok(qb);
    }

    qb.push("UPDATE SET ");
    for (i, column) in values.keys().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        qb.push(format!("{column} = excluded.{column}"));
    }
    if let Some(guard) = guard_column {
        qb.push(format!(
            " WHERE {table}.{guard} IS NULL OR excluded.{guard} >= {table}.{guard}"
        ));
    }
    Ok(qb)
}

#[async_trait]
impl PrimaryStore for SqlitePrimaryStore {
    async fn enqueue(&self, pk: &str, event: &ChangeEvent) -> SyncResult<i64> {
        let pool = &self.pool;
        let event_json = serde_json::to_string(event)
            .map_err(|e| SyncError::State(format!("outbox encode: {e}")))?;
        let now = Utc::now();
        let seq: i64 = with_busy_retry("outbox_enqueue", || async {
            sqlx::query_scalar(
                r#"
                INSERT INTO outbox (pk, event_id, table_name, event_json, status, attempts, created_at)
                VALUES (?, ?, ?, ?, 'pending', 0, ?)
                RETURNING seq
                "#,
            )
            .bind(pk)
            .bind(&event.event_id)
            .bind(&event.table)
            .bind(&event_json)
            .bind(now)
            .fetch_one(pool)
            .await
        })
        .await?;
        Ok(seq)
    }

    async fn tables_with_work(&self, now: DateTime<Utc>) -> SyncResult<Vec<String>> {
        let tables: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT table_name FROM outbox
            WHERE status = 'pending' OR (status = 'failed' AND next_attempt_at <= ?)
            ORDER BY table_name
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(tables)
    }

    async fn due_rows(
        &self,
        table: Option<&str>,
        now: DateTime<Utc>,
        limit: u32,
    ) -> SyncResult<Vec<OutboxRow>> {
        let rows: Vec<OutboxTuple> = match table {
            Some(table) => {
                sqlx::query_as(&format!(
                    r#"
                    SELECT {OUTBOX_COLUMNS} FROM outbox
                    WHERE table_name = ?
                      AND (status = 'pending' OR (status = 'failed' AND next_attempt_at <= ?))
                    ORDER BY table_name, pk, seq
                    LIMIT ?
                    "#
                ))
                .bind(table)
                .bind(now)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    r#"
                    SELECT {OUTBOX_COLUMNS} FROM outbox
                    WHERE status = 'pending' OR (status = 'failed' AND next_attempt_at <= ?)
                    ORDER BY table_name, pk, seq
                    LIMIT ?
                    "#
                ))
                .bind(now)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Self::decode_rows(rows)
    }

    async fn mark_processing(&self, seq: i64) -> SyncResult<()> {
        let pool = &self.pool;
        with_busy_retry("outbox_processing", || async {
            sqlx::query("UPDATE outbox SET status = 'processing' WHERE seq = ?")
                .bind(seq)
                .execute(pool)
                .await
        })
        .await?;
        Ok(())
    }

    async fn mark_completed(&self, seq: i64) -> SyncResult<()> {
        let pool = &self.pool;
        with_busy_retry("outbox_completed", || async {
            sqlx::query(
                "UPDATE outbox SET status = 'completed', next_attempt_at = NULL, last_error = NULL WHERE seq = ?",
            )
            .bind(seq)
            .execute(pool)
            .await
        })
        .await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        seq: i64,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> SyncResult<()> {
        let pool = &self.pool;
        with_busy_retry("outbox_failed", || async {
            sqlx::query(
                r#"
                UPDATE outbox
                SET status = 'failed', attempts = ?, next_attempt_at = ?, last_error = ?
                WHERE seq = ?
                "#,
            )
            .bind(attempts)
            .bind(next_attempt_at)
            .bind(error)
            .bind(seq)
            .execute(pool)
            .await
        })
        .await?;
        Ok(())
    }

    async fn mark_dead_lettered(&self, seq: i64, attempts: u32, error: &str) -> SyncResult<()> {
        let pool = &self.pool;
        with_busy_retry("outbox_dead_letter", || async {
            sqlx::query(
                r#"
                UPDATE outbox
                SET status = 'dead_lettered', attempts = ?, next_attempt_at = NULL, last_error = ?
                WHERE seq = ?
                "#,
            )
            .bind(attempts)
            .bind(error)
            .bind(seq)
            .execute(pool)
            .await
        })
        .await?;
        Ok(())
    }

    async fn requeue_stale(&self, cutoff: DateTime<Utc>) -> SyncResult<u64> {
        let pool = &self.pool;
        let result = with_busy_retry("outbox_requeue", || async {
            sqlx::query(
                "UPDATE outbox SET status = 'pending' WHERE status = 'processing' AND created_at < ?",
            )
            .bind(cutoff)
            .execute(pool)
            .await
        })
        .await?;
        Ok(result.rows_affected())
    }

    async fn stuck_count(&self, cutoff: DateTime<Utc>) -> SyncResult<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM outbox
            WHERE status IN ('pending', 'processing', 'failed') AND created_at < ?
            "#,
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn pending_count(&self) -> SyncResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM outbox WHERE status IN ('pending', 'failed')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn purge_completed(&self, cutoff: DateTime<Utc>) -> SyncResult<u64> {
        let pool = &self.pool;
        let result = with_busy_retry("outbox_purge", || async {
            sqlx::query("DELETE FROM outbox WHERE status = 'completed' AND created_at < ?")
                .bind(cutoff)
                .execute(pool)
                .await
        })
        .await?;
        Ok(result.rows_affected())
    }

    async fn apply(&self, statement: &Statement) -> SyncResult<ApplyOutcome> {
        let mut tx = self.pool.begin().await?;

        let outcome = match statement {
            Statement::Upsert {
                table,
                key_column,
                key: Some(key),
                values,
                guard,
            } => {
                let guard_column = guard.as_ref().map(|g| g.column.as_str());
                let mut qb = upsert_sql(table, key_column, values, key, guard_column)?;
                let result = qb.build().execute(&mut *tx).await?;
                if guard.is_some() && !values.is_empty() && result.rows_affected() == 0 {
                    ApplyOutcome::Superseded
                } else {
                    ApplyOutcome::Applied {
                        key: Some(key.clone()),
                    }
                }
            }
            Statement::Upsert {
                table,
                key_column,
                key: None,
                values,
                ..
            } => {
                // First sync of a cross-referenced row: the store assigns
                // the primary key.
                check_identifier(table)?;
                check_identifier(key_column)?;
                for column in values.keys() {
                    check_identifier(column)?;
                }
                let mut qb = QueryBuilder::new(format!("INSERT INTO {table} ("));
                for (i, column) in values.keys().enumerate() {
                    if i > 0 {
                        qb.push(", ");
                    }
                    qb.push(column.clone());
                }
                qb.push(") VALUES (");
                for (i, value) in values.values().enumerate() {
                    if i > 0 {
                        qb.push(", ");
                    }
                    push_value(&mut qb, value);
                }
                qb.push(format!(") RETURNING {key_column}"));
                let row = qb.build().fetch_one(&mut *tx).await?;
                ApplyOutcome::Applied {
                    key: Some(decode_returned_key(&row)?),
                }
            }
            Statement::Delete {
                table,
                key_column,
                key,
            } => {
                check_identifier(table)?;
                check_identifier(key_column)?;
                let mut qb =
                    QueryBuilder::new(format!("DELETE FROM {table} WHERE {key_column} = "));
                push_value(&mut qb, key);
                qb.build().execute(&mut *tx).await?;
                // Absent rows delete cleanly; the statement is idempotent.
                ApplyOutcome::Applied {
                    key: Some(key.clone()),
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use medbridge_protocol::WriteGuard;
    use serde_json::json;
    use tempfile::tempdir;

    async fn open_store(dir: &tempfile::TempDir) -> SqlitePrimaryStore {
        SqlitePrimaryStore::open(dir.path().join("clinic.db"))
            .await
            .unwrap()
    }

    fn row(pairs: &[(&str, Value)]) -> RowImage {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn outbox_lifecycle() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let now = Utc::now();

        let event = ChangeEvent::primary_insert("patients", row(&[("id", json!(1))]));
        let seq = store.enqueue("1", &event).await.unwrap();

        let due = store.due_rows(None, now, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].seq, seq);
        assert_eq!(due[0].status, OutboxStatus::Pending);
        assert_eq!(due[0].event.event_id, event.event_id);
        assert_eq!(
            store.tables_with_work(now).await.unwrap(),
            vec!["patients".to_string()]
        );

        store.mark_processing(seq).await.unwrap();
        assert!(store.due_rows(None, now, 10).await.unwrap().is_empty());

        store
            .mark_failed(seq, 1, now - Duration::seconds(1), "portal down")
            .await
            .unwrap();
        let due = store.due_rows(None, now, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempts, 1);
        assert_eq!(due[0].last_error.as_deref(), Some("portal down"));

        store.mark_completed(seq).await.unwrap();
        assert_eq!(store.pending_count().await.unwrap(), 0);

        let purged = store
            .purge_completed(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);

        store.close().await;
    }

    #[tokio::test]
    async fn dead_lettered_rows_are_not_due() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        let event = ChangeEvent::primary_insert("patients", row(&[("id", json!(1))]));
        let seq = store.enqueue("1", &event).await.unwrap();
        store
            .mark_dead_lettered(seq, 10, "mapping failed")
            .await
            .unwrap();

        assert!(store
            .due_rows(None, Utc::now(), 10)
            .await
            .unwrap()
            .is_empty());
        let (status, attempts): (String, i64) =
            sqlx::query_as("SELECT status, attempts FROM outbox WHERE seq = ?")
                .bind(seq)
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(status, "dead_lettered");
        assert_eq!(attempts, 10);
        assert_eq!(
            store.stuck_count(Utc::now() + Duration::hours(1)).await.unwrap(),
            0
        );

        store.close().await;
    }

    #[tokio::test]
    async fn apply_upserts_with_guard() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        sqlx::query(
            "CREATE TABLE patients (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT, updated_at TEXT)",
        )
        .execute(store.pool())
        .await
        .unwrap();

        // Generated key on first insert.
        let outcome = store
            .apply(&Statement::Upsert {
                table: "patients".into(),
                key_column: "id".into(),
                key: None,
                values: row(&[
                    ("name", json!("Ada")),
                    ("updated_at", json!("2024-03-01 12:00:00")),
                ]),
                guard: None,
            })
            .await
            .unwrap();
        let key = outcome.key().cloned().unwrap();
        assert_eq!(key, json!(1));

        // Older write is skipped by the guard.
        let stale = store
            .apply(&Statement::Upsert {
                table: "patients".into(),
                key_column: "id".into(),
                key: Some(key.clone()),
                values: row(&[
                    ("name", json!("Old Ada")),
                    ("updated_at", json!("2024-03-01 09:00:00")),
                ]),
                guard: Some(WriteGuard {
                    column: "updated_at".into(),
                    timestamp: Utc::now(),
                }),
            })
            .await
            .unwrap();
        assert_eq!(stale, ApplyOutcome::Superseded);

        let name: String = sqlx::query_scalar("SELECT name FROM patients WHERE id = 1")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(name, "Ada");

        // Newer write goes through.
        let fresh = store
            .apply(&Statement::Upsert {
                table: "patients".into(),
                key_column: "id".into(),
                key: Some(key.clone()),
                values: row(&[
                    ("name", json!("Ada Lovelace")),
                    ("updated_at", json!("2024-03-01 15:00:00")),
                ]),
                guard: Some(WriteGuard {
                    column: "updated_at".into(),
                    timestamp: Utc::now(),
                }),
            })
            .await
            .unwrap();
        assert!(matches!(fresh, ApplyOutcome::Applied { .. }));

        // Delete is idempotent.
        let statement = Statement::Delete {
            table: "patients".into(),
            key_column: "id".into(),
            key: key.clone(),
        };
        store.apply(&statement).await.unwrap();
        store.apply(&statement).await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM patients")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);

        store.close().await;
    }

    #[tokio::test]
    async fn apply_rejects_hostile_identifiers() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        let err = store
            .apply(&Statement::Delete {
                table: "patients; DROP TABLE outbox".into(),
                key_column: "id".into(),
                key: json!(1),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidEvent(_)));

        store.close().await;
    }
}
