//! In-memory store implementations for tests.

use super::{parse_any_timestamp, ApplyOutcome, PrimaryStore, SecondaryStore};
use crate::error::{SyncError, SyncResult};
use crate::translate::canonical_key;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use medbridge_protocol::{ChangeEvent, OutboxRow, OutboxStatus, RowImage, Statement, WriteGuard};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// True when the stored row is newer than the incoming write.
fn guard_blocks(existing: Option<&RowImage>, guard: Option<&WriteGuard>) -> bool {
    let (Some(existing), Some(guard)) = (existing, guard) else {
        return false;
    };
    let Some(Value::String(stored)) = existing.get(&guard.column) else {
        return false;
    };
    parse_any_timestamp(stored).is_some_and(|stored| stored > guard.timestamp)
}

#[derive(Default)]
struct PrimaryInner {
    outbox: Vec<OutboxRow>,
    next_seq: i64,
    tables: HashMap<String, BTreeMap<String, RowImage>>,
    next_ids: HashMap<String, i64>,
    injected_failures: VecDeque<SyncError>,
}

/// In-memory primary store: clinic tables plus the outbox, behind one lock.
#[derive(Default)]
pub struct MemoryPrimaryStore {
    inner: Mutex<PrimaryInner>,
    apply_calls: AtomicU64,
}

impl MemoryPrimaryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a row directly, bypassing capture.
    pub fn put_row(&self, table: &str, key: &Value, row: RowImage) {
        self.inner
            .lock()
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(canonical_key(key), row);
    }

    /// Reads a row back.
    pub fn row(&self, table: &str, key: &Value) -> Option<RowImage> {
        self.inner
            .lock()
            .tables
            .get(table)
            .and_then(|rows| rows.get(&canonical_key(key)))
            .cloned()
    }

    /// Number of rows in a table.
    pub fn row_count(&self, table: &str) -> usize {
        self.inner
            .lock()
            .tables
            .get(table)
            .map(|rows| rows.len())
            .unwrap_or(0)
    }

    /// Reads an outbox row by sequence number.
    pub fn outbox_row(&self, seq: i64) -> Option<OutboxRow> {
        self.inner
            .lock()
            .outbox
            .iter()
            .find(|row| row.seq == seq)
            .cloned()
    }

    /// Queues an error for the next `apply` call.
    pub fn fail_with(&self, error: SyncError) {
        self.inner.lock().injected_failures.push_back(error);
    }

    /// How many times `apply` was invoked.
    pub fn apply_calls(&self) -> u64 {
        self.apply_calls.load(Ordering::Relaxed)
    }

    fn with_row_mut<R>(
        &self,
        seq: i64,
        f: impl FnOnce(&mut OutboxRow) -> R,
    ) -> SyncResult<R> {
        let mut inner = self.inner.lock();
        inner
            .outbox
            .iter_mut()
            .find(|row| row.seq == seq)
            .map(f)
            .ok_or_else(|| SyncError::State(format!("outbox row {seq} not found")))
    }
}

#[async_trait]
impl PrimaryStore for MemoryPrimaryStore {
    async fn enqueue(&self, pk: &str, event: &ChangeEvent) -> SyncResult<i64> {
        let mut inner = self.inner.lock();
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.outbox.push(OutboxRow::new(seq, pk, event.clone()));
        Ok(seq)
    }

    async fn tables_with_work(&self, now: DateTime<Utc>) -> SyncResult<Vec<String>> {
        let inner = self.inner.lock();
        let mut tables: Vec<String> = inner
            .outbox
            .iter()
            .filter(|row| row.is_due(now))
            .map(|row| row.event.table.clone())
            .collect();
        tables.sort();
        tables.dedup();
        Ok(tables)
    }

    async fn due_rows(
        &self,
        table: Option<&str>,
        now: DateTime<Utc>,
        limit: u32,
    ) -> SyncResult<Vec<OutboxRow>> {
        let inner = self.inner.lock();
        let mut due: Vec<OutboxRow> = inner
            .outbox
            .iter()
            .filter(|row| row.is_due(now))
            .filter(|row| table.is_none_or(|t| row.event.table == t))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            (&a.event.table, &a.pk, a.seq).cmp(&(&b.event.table, &b.pk, b.seq))
        });
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn mark_processing(&self, seq: i64) -> SyncResult<()> {
        self.with_row_mut(seq, |row| row.status = OutboxStatus::Processing)
    }

    async fn mark_completed(&self, seq: i64) -> SyncResult<()> {
        self.with_row_mut(seq, |row| {
            row.status = OutboxStatus::Completed;
            row.next_attempt_at = None;
            row.last_error = None;
        })
    }

    async fn mark_failed(
        &self,
        seq: i64,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> SyncResult<()> {
        self.with_row_mut(seq, |row| {
            row.status = OutboxStatus::Failed;
            row.attempts = attempts;
            row.next_attempt_at = Some(next_attempt_at);
            row.last_error = Some(error.to_string());
        })
    }

    async fn mark_dead_lettered(&self, seq: i64, attempts: u32, error: &str) -> SyncResult<()> {
        self.with_row_mut(seq, |row| {
            row.status = OutboxStatus::DeadLettered;
            row.attempts = attempts;
            row.next_attempt_at = None;
            row.last_error = Some(error.to_string());
        })
    }

    async fn requeue_stale(&self, cutoff: DateTime<Utc>) -> SyncResult<u64> {
        let mut inner = self.inner.lock();
        let mut requeued = 0;
        for row in &mut inner.outbox {
            if row.status == OutboxStatus::Processing && row.created_at < cutoff {
                row.status = OutboxStatus::Pending;
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn stuck_count(&self, cutoff: DateTime<Utc>) -> SyncResult<u64> {
        let inner = self.inner.lock();
        Ok(inner
            .outbox
            .iter()
            .filter(|row| !row.status.is_terminal() && row.created_at < cutoff)
            .count() as u64)
    }

    async fn pending_count(&self) -> SyncResult<u64> {
        let inner = self.inner.lock();
        Ok(inner
            .outbox
            .iter()
            .filter(|row| {
                matches!(row.status, OutboxStatus::Pending | OutboxStatus::Failed)
            })
            .count() as u64)
    }

    async fn purge_completed(&self, cutoff: DateTime<Utc>) -> SyncResult<u64> {
        let mut inner = self.inner.lock();
        let before = inner.outbox.len();
        inner
            .outbox
            .retain(|row| !(row.status == OutboxStatus::Completed && row.created_at < cutoff));
        Ok((before - inner.outbox.len()) as u64)
    }

    async fn apply(&self, statement: &Statement) -> SyncResult<ApplyOutcome> {
        self.apply_calls.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        if let Some(error) = inner.injected_failures.pop_front() {
            return Err(error);
        }

        match statement {
            Statement::Upsert {
                table,
                key_column,
                key,
                values,
                guard,
            } => {
                let key = match key {
                    Some(key) => key.clone(),
                    None => {
                        let next = inner.next_ids.entry(table.clone()).or_insert(0);
                        *next += 1;
                        json!(*next)
                    }
                };
                let rows = inner.tables.entry(table.clone()).or_default();
                let slot = rows.get(&canonical_key(&key));
                if guard_blocks(slot, guard.as_ref()) {
                    return Ok(ApplyOutcome::Superseded);
                }
                let mut row = slot.cloned().unwrap_or_default();
                row.insert(key_column.clone(), key.clone());
                for (column, value) in values {
                    row.insert(column.clone(), value.clone());
                }
                rows.insert(canonical_key(&key), row);
                Ok(ApplyOutcome::Applied { key: Some(key) })
            }
            Statement::Delete {
                table,
                key_column: _,
                key,
            } => {
                if let Some(rows) = inner.tables.get_mut(table) {
                    rows.remove(&canonical_key(key));
                }
                Ok(ApplyOutcome::Applied {
                    key: Some(key.clone()),
                })
            }
        }
    }
}

#[derive(Default)]
struct SecondaryInner {
    tables: HashMap<String, BTreeMap<String, RowImage>>,
    changes: Vec<ChangeEvent>,
    injected_failures: VecDeque<SyncError>,
}

/// In-memory secondary store with a synthetic changes feed.
#[derive(Default)]
pub struct MemorySecondaryStore {
    inner: Mutex<SecondaryInner>,
    apply_calls: AtomicU64,
}

impl MemorySecondaryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a row directly.
    pub fn put_row(&self, table: &str, key: &Value, row: RowImage) {
        self.inner
            .lock()
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(canonical_key(key), row);
    }

    /// Reads a row back.
    pub fn row(&self, table: &str, key: &Value) -> Option<RowImage> {
        self.inner
            .lock()
            .tables
            .get(table)
            .and_then(|rows| rows.get(&canonical_key(key)))
            .cloned()
    }

    /// Number of rows in a table.
    pub fn row_count(&self, table: &str) -> usize {
        self.inner
            .lock()
            .tables
            .get(table)
            .map(|rows| rows.len())
            .unwrap_or(0)
    }

    /// Appends an event to the synthetic changes feed.
    pub fn push_change(&self, event: ChangeEvent) {
        self.inner.lock().changes.push(event);
    }

    /// Queues an error for the next `apply` call.
    pub fn fail_with(&self, error: SyncError) {
        self.inner.lock().injected_failures.push_back(error);
    }

    /// Queues `n` retryable failures for upcoming `apply` calls.
    pub fn fail_next(&self, n: u32) {
        let mut inner = self.inner.lock();
        for _ in 0..n {
            inner
                .injected_failures
                .push_back(SyncError::store_retryable("injected failure"));
        }
    }

    /// How many times `apply` was invoked.
    pub fn apply_calls(&self) -> u64 {
        self.apply_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SecondaryStore for MemorySecondaryStore {
    async fn apply(&self, statement: &Statement) -> SyncResult<ApplyOutcome> {
        self.apply_calls.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        if let Some(error) = inner.injected_failures.pop_front() {
            return Err(error);
        }

        match statement {
            Statement::Upsert {
                table,
                key_column,
                key,
                values,
                guard,
            } => {
                let key = match key {
                    Some(key) => key.clone(),
                    None => json!(Uuid::new_v4().to_string()),
                };
                let rows = inner.tables.entry(table.clone()).or_default();
                let slot = rows.get(&canonical_key(&key));
                if guard_blocks(slot, guard.as_ref()) {
                    return Ok(ApplyOutcome::Superseded);
                }
                let mut row = slot.cloned().unwrap_or_default();
                row.insert(key_column.clone(), key.clone());
                for (column, value) in values {
                    row.insert(column.clone(), value.clone());
                }
                rows.insert(canonical_key(&key), row);
                Ok(ApplyOutcome::Applied { key: Some(key) })
            }
            Statement::Delete {
                table,
                key_column: _,
                key,
            } => {
                if let Some(rows) = inner.tables.get_mut(table) {
                    rows.remove(&canonical_key(key));
                }
                Ok(ApplyOutcome::Applied {
                    key: Some(key.clone()),
                })
            }
        }
    }

    async fn changes_since(
        &self,
        cursor: Option<&str>,
        limit: u32,
    ) -> SyncResult<Vec<ChangeEvent>> {
        let cutoff = cursor.and_then(parse_any_timestamp);
        let inner = self.inner.lock();
        let mut events: Vec<ChangeEvent> = inner
            .changes
            .iter()
            .filter(|event| cutoff.is_none_or(|cutoff| event.timestamp > cutoff))
            .cloned()
            .collect();
        events.sort_by_key(|event| event.timestamp);
        events.truncate(limit as usize);
        Ok(events)
    }
}
