//! Outbound queue processor: drains the primary store's outbox into the
//! secondary store.
//!
//! Rows are processed in (table, primary key, sequence) order. A failure
//! blocks the failing row's primary key for the rest of the pass so retries
//! can never reorder writes to the same row, while other keys keep flowing.
//! Drains of the same table are single-flight; independent tables drain
//! concurrently.

use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::mapping::KeyStrategy;
use crate::state::StateStore;
use crate::stats::EngineStats;
use crate::stores::{PrimaryStore, SecondaryStore};
use crate::translate::Translator;
use chrono::Utc;
use futures::future::join_all;
use medbridge_protocol::{ChangeOp, DeadLetterEntry, Direction, DrainReport, OutboxRow};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// How a single outbox row fared within one pass.
enum RowDisposition {
    Completed,
    Failed,
    DeadLettered,
}

/// Drains the outbox and pushes translated changes to the secondary store.
pub struct QueueProcessor {
    primary: Arc<dyn PrimaryStore>,
    secondary: Arc<dyn SecondaryStore>,
    state: Arc<StateStore>,
    translator: Translator,
    config: EngineConfig,
    stats: Arc<EngineStats>,
    table_locks: Mutex<HashMap<String, Arc<TokioMutex<()>>>>,
}

impl QueueProcessor {
    /// Creates a processor over the given stores.
    pub fn new(
        primary: Arc<dyn PrimaryStore>,
        secondary: Arc<dyn SecondaryStore>,
        state: Arc<StateStore>,
        translator: Translator,
        config: EngineConfig,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            primary,
            secondary,
            state,
            translator,
            config,
            stats,
            table_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Drains due outbox rows; all tables when `table` is `None`.
    pub async fn drain(&self, table: Option<&str>) -> SyncResult<DrainReport> {
        match table {
            Some(table) => self.drain_table(table).await,
            None => {
                let tables = self.primary.tables_with_work(Utc::now()).await?;
                let passes = join_all(tables.iter().map(|table| self.drain_table(table))).await;

                let mut report = DrainReport::default();
                for (table, pass) in tables.iter().zip(passes) {
                    match pass {
                        Ok(pass) => report.merge(pass),
                        Err(e) => {
                            warn!(table, error = %e, "table drain failed");
                            self.state
                                .record_failure(Direction::Outbound, &e.to_string(), Utc::now())
                                .await?;
                        }
                    }
                }
                Ok(report)
            }
        }
    }

    /// Drains one table under its single-flight lock.
    async fn drain_table(&self, table: &str) -> SyncResult<DrainReport> {
        let lock = self.table_lock(table);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let rows = self
            .primary
            .due_rows(Some(table), now, self.config.drain_batch_size)
            .await?;
        if rows.is_empty() {
            return Ok(DrainReport::default());
        }
        debug!(table, rows = rows.len(), "draining outbox");

        let mut report = DrainReport::default();
        let mut blocked: HashSet<String> = HashSet::new();
        let mut last_error: Option<String> = None;

        for row in rows {
            if blocked.contains(&row.pk) {
                // An earlier change to this key failed; successors wait so
                // the target never sees them out of order.
                continue;
            }

            let disposition = match self.process_row(&row).await {
                Ok(()) => RowDisposition::Completed,
                Err(e) => {
                    last_error = Some(e.to_string());
                    self.settle_failure(&row, e).await?
                }
            };

            match disposition {
                RowDisposition::Completed => report.processed += 1,
                RowDisposition::Failed => {
                    report.failed += 1;
                    blocked.insert(row.pk.clone());
                }
                RowDisposition::DeadLettered => {
                    report.dead_lettered += 1;
                    blocked.insert(row.pk.clone());
                }
            }
        }

        if report.processed > 0 {
            self.state
                .record_success(Direction::Outbound, Utc::now())
                .await?;
        } else if let Some(message) = last_error {
            self.state
                .record_failure(Direction::Outbound, &message, Utc::now())
                .await?;
        }

        Ok(report)
    }

    /// Pushes one row. Marks it Completed on every success-like path; the
    /// caller settles failures.
    async fn process_row(&self, row: &OutboxRow) -> SyncResult<()> {
        self.primary.mark_processing(row.seq).await?;
        let event = &row.event;

        // A change the inbound path already applied to the primary store can
        // be re-captured by the application's outbox trigger. Pushing it back
        // would bounce the write between the stores forever.
        if self.state.seen(&event.event_id, Direction::Inbound).await? {
            debug!(seq = row.seq, event_id = %event.event_id, "suppressing echo");
            self.stats.record_echo_suppressed();
            return self.primary.mark_completed(row.seq).await;
        }

        // Already pushed in an earlier run that died before marking the row.
        if self.state.seen(&event.event_id, Direction::Outbound).await? {
            self.stats.record_duplicate();
            return self.primary.mark_completed(row.seq).await;
        }

        let statement = self
            .translator
            .to_target(event, Direction::Outbound, self.state.as_ref())
            .await?;
        let outcome = timeout(self.config.apply_timeout, self.secondary.apply(&statement))
            .await
            .map_err(|_| SyncError::Timeout)??;

        if self.translator.key_strategy(event, Direction::Outbound)? == KeyStrategy::CrossReference
        {
            let source_key = self.translator.source_key(event, Direction::Outbound)?;
            match (event.op, outcome.key()) {
                (ChangeOp::Delete, _) => {
                    self.state
                        .remove_key_mapping(&event.table, &source_key)
                        .await?;
                }
                (_, Some(secondary_key)) => {
                    self.state
                        .put_key_mapping(&event.table, &source_key, secondary_key)
                        .await?;
                }
                _ => {}
            }
        }

        self.state
            .reserve_event(&event.event_id, Direction::Outbound)
            .await?;
        self.primary.mark_completed(row.seq).await?;
        self.stats.record_outbound_applied();
        Ok(())
    }

    /// Schedules a retry or dead-letters the row.
    async fn settle_failure(
        &self,
        row: &OutboxRow,
        cause: SyncError,
    ) -> SyncResult<RowDisposition> {
        let attempts = row.attempts + 1;
        let message = cause.to_string();

        if cause.is_retryable() && attempts < self.config.retry.max_attempts {
            let delay = self.config.retry.delay_for_attempt(attempts);
            let next_attempt_at =
                Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
            warn!(
                seq = row.seq,
                table = %row.event.table,
                event_id = %row.event.event_id,
                attempts,
                error = %message,
                "outbox row failed, will retry"
            );
            self.primary
                .mark_failed(row.seq, attempts, next_attempt_at, &message)
                .await?;
            return Ok(RowDisposition::Failed);
        }

        error!(
            seq = row.seq,
            table = %row.event.table,
            event_id = %row.event.event_id,
            attempts,
            error = %message,
            "outbox row dead-lettered"
        );
        self.primary
            .mark_dead_lettered(row.seq, attempts, &message)
            .await?;
        self.state
            .record_dead_letter(&DeadLetterEntry {
                direction: Direction::Outbound,
                event_id: row.event.event_id.clone(),
                table: row.event.table.clone(),
                reason: message,
                at: Utc::now(),
                event: row.event.clone(),
            })
            .await?;
        self.stats.record_dead_lettered();
        Ok(RowDisposition::DeadLettered)
    }

    fn table_lock(&self, table: &str) -> Arc<TokioMutex<()>> {
        let mut locks = self.table_locks.lock();
        locks
            .entry(table.to_string())
            .or_insert_with(|| Arc::new(TokioMutex::new(())))
            .clone()
    }
}
