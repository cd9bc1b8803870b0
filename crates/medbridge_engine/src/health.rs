//! Health reporting for external monitoring.
//!
//! The sync logic never reads these values; they exist so an operator can
//! tell a quiet clinic from a stuck engine.

use crate::config::EngineConfig;
use crate::error::SyncResult;
use crate::state::StateStore;
use crate::stats::EngineStats;
use crate::stores::PrimaryStore;
use chrono::{DateTime, Utc};
use medbridge_protocol::{Direction, DirectionHealth, QueueGauges, StatusReport};
use std::sync::Arc;

/// Computes the status payload from durable state and live gauges.
pub struct HealthReporter {
    primary: Arc<dyn PrimaryStore>,
    state: Arc<StateStore>,
    stats: Arc<EngineStats>,
    config: EngineConfig,
}

impl HealthReporter {
    /// Creates a reporter over the given stores.
    pub fn new(
        primary: Arc<dyn PrimaryStore>,
        state: Arc<StateStore>,
        stats: Arc<EngineStats>,
        config: EngineConfig,
    ) -> Self {
        Self {
            primary,
            state,
            stats,
            config,
        }
    }

    /// Builds the full status report. Top-level fields reflect the worst
    /// direction; a direction that has never synced is unhealthy.
    pub async fn status(&self) -> SyncResult<StatusReport> {
        let now = Utc::now();
        let outbound = self.direction_health(Direction::Outbound, now).await?;
        let inbound = self.direction_health(Direction::Inbound, now).await?;

        let queue = QueueGauges {
            pending: self.primary.pending_count().await?,
            dead_lettered: self.state.dead_letter_count().await?,
        };

        let healthy = outbound.healthy && inbound.healthy;
        let last_sync = match (outbound.last_sync, inbound.last_sync) {
            (Some(a), Some(b)) => Some(a.min(b)),
            _ => None,
        };
        let lag_seconds = match (outbound.lag_seconds, inbound.lag_seconds) {
            (Some(a), Some(b)) => Some(a.max(b)),
            _ => None,
        };

        Ok(StatusReport {
            healthy,
            last_sync,
            lag_seconds,
            outbound,
            inbound,
            queue,
            counters: self.stats.snapshot(),
        })
    }

    async fn direction_health(
        &self,
        direction: Direction,
        now: DateTime<Utc>,
    ) -> SyncResult<DirectionHealth> {
        let window = chrono::Duration::milliseconds(self.config.freshness_window.as_millis() as i64);
        let state = self.state.direction_state(direction).await?;
        let healthy = state.last_success.is_some_and(|at| now - at <= window);
        Ok(DirectionHealth {
            healthy,
            last_sync: state.last_success,
            lag_seconds: state.last_success.map(|at| (now - at).num_seconds().max(0)),
            last_error: state.last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::MemoryPrimaryStore;
    use medbridge_protocol::{ChangeEvent, DeadLetterEntry, RowImage};
    use tempfile::tempdir;

    struct Fixture {
        primary: Arc<MemoryPrimaryStore>,
        state: Arc<StateStore>,
        reporter: HealthReporter,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let state = Arc::new(StateStore::open(dir.path().join("state.db")).await.unwrap());
        let primary = Arc::new(MemoryPrimaryStore::new());
        let reporter = HealthReporter::new(
            primary.clone(),
            state.clone(),
            Arc::new(EngineStats::new()),
            EngineConfig::new(),
        );
        Fixture {
            primary,
            state,
            reporter,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn never_synced_reports_unhealthy() {
        let f = fixture().await;
        let status = f.reporter.status().await.unwrap();
        assert!(!status.healthy);
        assert_eq!(status.last_sync, None);
        assert_eq!(status.lag_seconds, None);
        assert!(!status.outbound.healthy);
        assert!(!status.inbound.healthy);
    }

    #[tokio::test]
    async fn fresh_syncs_in_both_directions_report_healthy() {
        let f = fixture().await;
        let earlier = Utc::now() - chrono::Duration::seconds(90);
        f.state
            .record_success(Direction::Outbound, earlier)
            .await
            .unwrap();
        f.state
            .record_success(Direction::Inbound, Utc::now())
            .await
            .unwrap();

        let status = f.reporter.status().await.unwrap();
        assert!(status.healthy);
        // The top level shows the most stale direction.
        assert_eq!(status.last_sync, Some(earlier));
        assert!(status.lag_seconds.unwrap() >= 90);
        assert!(status.inbound.lag_seconds.unwrap() < 90);
    }

    #[tokio::test]
    async fn one_stale_direction_degrades_the_top_level() {
        let f = fixture().await;
        f.state
            .record_success(Direction::Outbound, Utc::now())
            .await
            .unwrap();

        let status = f.reporter.status().await.unwrap();
        assert!(status.outbound.healthy);
        assert!(!status.inbound.healthy);
        assert!(!status.healthy);
        assert_eq!(status.last_sync, None);
    }

    #[tokio::test]
    async fn gauges_and_errors_surface() {
        let f = fixture().await;
        let event = ChangeEvent::primary_insert("patients", RowImage::new());
        f.primary.enqueue("1", &event).await.unwrap();
        f.state
            .record_failure(Direction::Outbound, "portal unreachable", Utc::now())
            .await
            .unwrap();
        f.state
            .record_dead_letter(&DeadLetterEntry {
                direction: Direction::Inbound,
                event_id: "evt-1".into(),
                table: "portal_patients".into(),
                reason: "no mapping".into(),
                at: Utc::now(),
                event: event.clone(),
            })
            .await
            .unwrap();

        let status = f.reporter.status().await.unwrap();
        assert_eq!(status.queue.pending, 1);
        assert_eq!(status.queue.dead_lettered, 1);
        assert_eq!(
            status.outbound.last_error.as_deref(),
            Some("portal unreachable")
        );
    }
}
