//! The engine facade: one handle over capture, both sync directions, the
//! reconciler, and health.

use crate::config::EngineConfig;
use crate::error::SyncResult;
use crate::health::HealthReporter;
use crate::inbound::WebhookProcessor;
use crate::mapping::MappingCatalog;
use crate::outbound::QueueProcessor;
use crate::reconcile::Reconciler;
use crate::state::StateStore;
use crate::stats::EngineStats;
use crate::stores::{PrimaryStore, SecondaryStore};
use crate::translate::Translator;
use medbridge_protocol::{
    BackfillReport, ChangeEvent, DeadLetterEntry, Direction, DrainReport, StatusReport,
    SweepReport, SyncCounters, TriggerReport, WebhookAck, WebhookPayload,
};
use std::sync::Arc;

/// Bidirectional sync engine over a primary and a secondary store.
pub struct SyncEngine {
    primary: Arc<dyn PrimaryStore>,
    state: Arc<StateStore>,
    queue: Arc<QueueProcessor>,
    webhook: WebhookProcessor,
    reconciler: Reconciler,
    health: HealthReporter,
    stats: Arc<EngineStats>,
}

impl SyncEngine {
    /// Wires the engine together from its stores and mapping catalog.
    pub fn new(
        primary: Arc<dyn PrimaryStore>,
        secondary: Arc<dyn SecondaryStore>,
        state: Arc<StateStore>,
        catalog: Arc<MappingCatalog>,
        config: EngineConfig,
    ) -> Self {
        let stats = Arc::new(EngineStats::new());
        let translator = Translator::new(catalog);
        let queue = Arc::new(QueueProcessor::new(
            primary.clone(),
            secondary.clone(),
            state.clone(),
            translator.clone(),
            config.clone(),
            stats.clone(),
        ));
        let webhook = WebhookProcessor::new(
            primary.clone(),
            secondary,
            state.clone(),
            translator,
            config.clone(),
            stats.clone(),
        );
        let reconciler = Reconciler::new(
            primary.clone(),
            state.clone(),
            queue.clone(),
            config.clone(),
            stats.clone(),
        );
        let health = HealthReporter::new(primary.clone(), state.clone(), stats.clone(), config);
        Self {
            primary,
            state,
            queue,
            webhook,
            reconciler,
            health,
            stats,
        }
    }

    /// Records a captured primary-store change in the outbox.
    ///
    /// Callers that can must insert the outbox row in the same transaction
    /// as the business write; this helper is for callers working through the
    /// engine handle.
    pub async fn capture(&self, pk: &str, event: &ChangeEvent) -> SyncResult<i64> {
        self.primary.enqueue(pk, event).await
    }

    /// Handles an inbound webhook delivery.
    pub async fn handle_webhook(&self, payload: WebhookPayload) -> SyncResult<WebhookAck> {
        self.webhook.handle(payload).await
    }

    /// Drains all tables; the queue-notify wake-up path.
    pub async fn notify_queue(&self) -> SyncResult<DrainReport> {
        self.queue.drain(None).await
    }

    /// Drains due outbox rows.
    pub async fn drain(&self, table: Option<&str>) -> SyncResult<DrainReport> {
        self.queue.drain(table).await
    }

    /// Pulls and replays recent secondary-store changes.
    pub async fn backfill(&self) -> SyncResult<BackfillReport> {
        self.webhook.backfill().await
    }

    /// Runs a manual sync for one or both directions.
    pub async fn trigger(&self, direction: Option<Direction>) -> SyncResult<TriggerReport> {
        let mut report = TriggerReport::default();
        if direction.is_none_or(|d| d == Direction::Outbound) {
            report.outbound = Some(self.queue.drain(None).await?);
        }
        if direction.is_none_or(|d| d == Direction::Inbound) {
            report.inbound = Some(self.webhook.backfill().await?);
        }
        Ok(report)
    }

    /// Runs one reconciler sweep.
    pub async fn sweep(&self) -> SyncResult<SweepReport> {
        self.reconciler.sweep().await
    }

    /// Builds the status payload.
    pub async fn status(&self) -> SyncResult<StatusReport> {
        self.health.status().await
    }

    /// Most recent dead letters from both directions, newest first.
    pub async fn dead_letters(&self, limit: u32) -> SyncResult<Vec<DeadLetterEntry>> {
        self.state.dead_letters(limit).await
    }

    /// Cumulative counters since process start.
    pub fn counters(&self) -> SyncCounters {
        self.stats.snapshot()
    }

    /// Flushes and closes the durable state store.
    pub async fn close(&self) {
        self.state.close().await;
    }
}
