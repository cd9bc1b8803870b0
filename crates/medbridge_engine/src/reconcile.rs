//! Reconciler: the periodic safety net behind the notification-driven paths.
//!
//! Notifications are fire-and-forget, so a crashed drain or a lost wake-up
//! leaves rows sitting in the outbox. The sweep returns stale Processing rows
//! to Pending, drains until the queue stops moving, and applies the retention
//! windows to the ledger and the completed outbox tail.

use crate::config::EngineConfig;
use crate::error::SyncResult;
use crate::outbound::QueueProcessor;
use crate::state::StateStore;
use crate::stats::EngineStats;
use crate::stores::PrimaryStore;
use chrono::{DateTime, Utc};
use medbridge_protocol::{DrainReport, SweepReport};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

fn cutoff(window: Duration) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::milliseconds(window.as_millis() as i64)
}

/// Periodic sweep over the outbox and durable state.
pub struct Reconciler {
    primary: Arc<dyn PrimaryStore>,
    state: Arc<StateStore>,
    queue: Arc<QueueProcessor>,
    config: EngineConfig,
    stats: Arc<EngineStats>,
}

impl Reconciler {
    /// Creates a reconciler over the given stores and drain path.
    pub fn new(
        primary: Arc<dyn PrimaryStore>,
        state: Arc<StateStore>,
        queue: Arc<QueueProcessor>,
        config: EngineConfig,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            primary,
            state,
            queue,
            config,
            stats,
        }
    }

    /// Runs one sweep. Time-boxed; anything left over waits for the next one.
    pub async fn sweep(&self) -> SyncResult<SweepReport> {
        let started = Instant::now();

        let requeued = self
            .primary
            .requeue_stale(cutoff(self.config.stale_after))
            .await?;
        if requeued > 0 {
            info!(requeued, "requeued stale outbox rows");
        }

        // Drain until a pass moves nothing. Retry backoff guarantees this
        // terminates; the budget caps it at batch granularity regardless.
        let mut drained = DrainReport::default();
        loop {
            let pass = self.queue.drain(None).await?;
            let moved = pass.processed + pass.failed + pass.dead_lettered;
            drained.merge(pass);
            if moved == 0 || started.elapsed() >= self.config.sweep_budget {
                break;
            }
        }

        let pruned = self
            .state
            .prune_ledger(cutoff(self.config.ledger_retention))
            .await?;
        let purged = self
            .primary
            .purge_completed(cutoff(self.config.outbox_retention))
            .await?;
        if pruned > 0 || purged > 0 {
            debug!(pruned, purged, "retention pass");
        }

        let still_stuck = self
            .primary
            .stuck_count(cutoff(self.config.stale_after))
            .await?;
        self.stats.record_sweep();
        info!(
            requeued,
            still_stuck,
            processed = drained.processed,
            failed = drained.failed,
            dead_lettered = drained.dead_lettered,
            "sweep complete"
        );

        Ok(SweepReport {
            requeued,
            still_stuck,
            drained,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::mapping::{Coercion, KeyMapping, MappingCatalog, TableMapping};
    use crate::stores::{MemoryPrimaryStore, MemorySecondaryStore};
    use crate::translate::Translator;
    use medbridge_protocol::{ChangeEvent, RowImage};
    use serde_json::json;
    use tempfile::tempdir;

    struct Fixture {
        primary: Arc<MemoryPrimaryStore>,
        secondary: Arc<MemorySecondaryStore>,
        state: Arc<StateStore>,
        reconciler: Reconciler,
        _dir: tempfile::TempDir,
    }

    async fn fixture(config: EngineConfig) -> Fixture {
        let dir = tempdir().unwrap();
        let state = Arc::new(StateStore::open(dir.path().join("state.db")).await.unwrap());
        let primary = Arc::new(MemoryPrimaryStore::new());
        let secondary = Arc::new(MemorySecondaryStore::new());
        let catalog = Arc::new(
            MappingCatalog::new(vec![TableMapping::new(
                "patients",
                "portal_patients",
                KeyMapping::cross_reference("id", "patient_id"),
            )
            .with_column("name", "full_name", Coercion::Identity)])
            .unwrap(),
        );
        let stats = Arc::new(EngineStats::new());
        let queue = Arc::new(QueueProcessor::new(
            primary.clone(),
            secondary.clone(),
            state.clone(),
            Translator::new(catalog),
            config.clone(),
            stats.clone(),
        ));
        let reconciler = Reconciler::new(primary.clone(), state.clone(), queue, config, stats);
        Fixture {
            primary,
            secondary,
            state,
            reconciler,
            _dir: dir,
        }
    }

    fn patient_event(id: i64) -> ChangeEvent {
        let record: RowImage = [
            ("id".to_string(), json!(id)),
            ("name".to_string(), json!("Ada")),
        ]
        .into_iter()
        .collect();
        ChangeEvent::primary_insert("patients", record)
    }

    #[tokio::test]
    async fn sweep_requeues_stale_rows_and_drains_them() {
        // Zero staleness: anything Processing counts as abandoned.
        let f = fixture(EngineConfig::new().with_stale_after(Duration::ZERO)).await;
        let seq = f.primary.enqueue("17", &patient_event(17)).await.unwrap();
        f.primary.mark_processing(seq).await.unwrap();

        let report = f.reconciler.sweep().await.unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(report.drained.processed, 1);
        assert_eq!(report.still_stuck, 0);
        assert_eq!(f.secondary.row_count("portal_patients"), 1);
    }

    #[tokio::test]
    async fn sweep_counts_rows_that_stay_stuck() {
        let config = EngineConfig::new()
            .with_stale_after(Duration::ZERO)
            .with_retry(RetryConfig::new(5).with_initial_delay(Duration::from_secs(3600)));
        let f = fixture(config).await;
        f.primary.enqueue("17", &patient_event(17)).await.unwrap();
        f.secondary.fail_next(1);

        let report = f.reconciler.sweep().await.unwrap();
        assert_eq!(report.drained.failed, 1);
        assert_eq!(report.still_stuck, 1);
    }

    #[tokio::test]
    async fn sweep_applies_the_retention_windows() {
        let mut config = EngineConfig::new();
        config.ledger_retention = Duration::ZERO;
        config.outbox_retention = Duration::ZERO;
        let f = fixture(config).await;

        f.state
            .reserve_event("evt-old", medbridge_protocol::Direction::Outbound)
            .await
            .unwrap();
        let seq = f.primary.enqueue("17", &patient_event(17)).await.unwrap();
        f.primary.mark_completed(seq).await.unwrap();

        f.reconciler.sweep().await.unwrap();
        assert!(!f
            .state
            .seen("evt-old", medbridge_protocol::Direction::Outbound)
            .await
            .unwrap());
        assert!(f.primary.outbox_row(seq).is_none());
    }
}
