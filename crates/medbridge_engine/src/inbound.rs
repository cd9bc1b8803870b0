//! Inbound webhook processor: applies secondary-store changes to the
//! primary store.
//!
//! Handling is safe against redelivery. The ledger record is inserted after
//! the apply commits, so a crash between the two can only cause a replay of
//! an idempotent statement, never a lost write. Failures return a retryable
//! error so the caller redelivers; a per-event tally bounds how long that
//! loop can run before the event is dead-lettered.

use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::mapping::KeyStrategy;
use crate::state::StateStore;
use crate::stats::EngineStats;
use crate::stores::{PrimaryStore, SecondaryStore};
use crate::translate::Translator;
use chrono::Utc;
use medbridge_protocol::{
    BackfillReport, ChangeEvent, DeadLetterEntry, Direction, Statement, WebhookAck, WebhookPayload,
    WebhookStatus,
};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Applies inbound change notifications to the primary store.
pub struct WebhookProcessor {
    primary: Arc<dyn PrimaryStore>,
    secondary: Arc<dyn SecondaryStore>,
    state: Arc<StateStore>,
    translator: Translator,
    config: EngineConfig,
    stats: Arc<EngineStats>,
}

impl WebhookProcessor {
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
        }
    }

    /// Handles one webhook delivery.
    ///
    /// Returns `Ok` when the delivery is settled (applied, duplicate, echo,
    /// or dead-lettered) and `Err` when the caller should redeliver.
    pub async fn handle(&self, payload: WebhookPayload) -> SyncResult<WebhookAck> {
        self.process(payload.into_event()).await
    }

    /// Runs one event through the inbound pipeline.
    pub(crate) async fn process(&self, event: ChangeEvent) -> SyncResult<WebhookAck> {
        if self.state.seen(&event.event_id, Direction::Inbound).await? {
            self.stats.record_duplicate();
            return Ok(WebhookAck::duplicate());
        }

        // A change this engine pushed outbound comes back through the
        // secondary store's capture with the same event id. Recording it as
        // applied settles any further redeliveries as duplicates.
        if self.state.seen(&event.event_id, Direction::Outbound).await? {
            debug!(event_id = %event.event_id, "suppressing echo");
            self.state
                .reserve_event(&event.event_id, Direction::Inbound)
                .await?;
            self.stats.record_echo_suppressed();
            return Ok(WebhookAck::echo());
        }

        match self.apply(&event).await {
            Ok(()) => Ok(WebhookAck::applied()),
            Err(cause) => self.settle_failure(&event, cause).await,
        }
    }

    /// Translates and applies, then records the ledger entry and state.
    async fn apply(&self, event: &ChangeEvent) -> SyncResult<()> {
        let statement = self
            .translator
            .to_target(event, Direction::Inbound, self.state.as_ref())
            .await?;
        let outcome = timeout(self.config.apply_timeout, self.primary.apply(&statement))
            .await
            .map_err(|_| SyncError::Timeout)??;

        if self.translator.key_strategy(event, Direction::Inbound)? == KeyStrategy::CrossReference {
            // The statement is primary-side, so its table and key name the
            // cross-reference entry directly.
            match &statement {
                Statement::Delete { table, key, .. } => {
                    self.state.remove_key_mapping(table, key).await?;
                }
                Statement::Upsert { table, key, .. } => {
                    if let Some(primary_key) = outcome.key().or(key.as_ref()) {
                        let secondary_key =
                            self.translator.source_key(event, Direction::Inbound)?;
                        self.state
                            .put_key_mapping(table, primary_key, &secondary_key)
                            .await?;
                    }
                }
            }
        }

        self.state
            .reserve_event(&event.event_id, Direction::Inbound)
            .await?;
        self.state.clear_inbound_failure(&event.event_id).await?;
        self.state
            .record_success(Direction::Inbound, Utc::now())
            .await?;
        self.stats.record_inbound_applied();
        Ok(())
    }

    /// Counts the failure against the event's redelivery budget, or sets the
    /// event aside when the budget is spent or retrying cannot help.
    async fn settle_failure(
        &self,
        event: &ChangeEvent,
        cause: SyncError,
    ) -> SyncResult<WebhookAck> {
        let message = cause.to_string();
        self.state
            .record_failure(Direction::Inbound, &message, Utc::now())
            .await?;

        if cause.is_retryable() {
            let attempts = self
                .state
                .record_inbound_failure(&event.event_id, &message)
                .await?;
            if attempts < self.config.retry.max_attempts {
                warn!(
                    event_id = %event.event_id,
                    table = %event.table,
                    attempts,
                    error = %message,
                    "inbound event failed, awaiting redelivery"
                );
                return Err(cause);
            }
        }

        error!(
            event_id = %event.event_id,
            table = %event.table,
            error = %message,
            "inbound event dead-lettered"
        );
        self.state
            .record_dead_letter(&DeadLetterEntry {
                direction: Direction::Inbound,
                event_id: event.event_id.clone(),
                table: event.table.clone(),
                reason: message,
                at: Utc::now(),
                event: event.clone(),
            })
            .await?;
        self.state.clear_inbound_failure(&event.event_id).await?;
        // Terminal: redeliveries of this event settle as duplicates.
        self.state
            .reserve_event(&event.event_id, Direction::Inbound)
            .await?;
        self.stats.record_dead_lettered();
        Ok(WebhookAck::dead_lettered())
    }

    /// Pulls recent secondary-store changes and replays them through the
    /// inbound pipeline. Fallback for lost webhook deliveries.
    ///
    /// The cursor only advances across the leading run of settled events, so
    /// an event that still needs redelivery is fetched again next pass.
    pub async fn backfill(&self) -> SyncResult<BackfillReport> {
        let cursor = self.state.backfill_cursor().await?;
        let events = self
            .secondary
            .changes_since(cursor.as_deref(), self.config.backfill_batch_size)
            .await?;

        let mut report = BackfillReport {
            fetched: events.len() as u64,
            ..BackfillReport::default()
        };
        let mut advance_to: Option<String> = None;
        let mut clean = true;

        for event in events {
            let committed_at = event.timestamp;
            match self.process(event).await {
                Ok(ack) => {
                    match ack.status {
                        WebhookStatus::Applied => report.applied += 1,
                        WebhookStatus::Duplicate | WebhookStatus::Echo => report.skipped += 1,
                        WebhookStatus::DeadLettered => report.failed += 1,
                    }
                    if clean {
                        advance_to = Some(committed_at.to_rfc3339());
                    }
                }
                Err(e) => {
                    warn!(error = %e, "backfill event failed, will refetch");
                    report.failed += 1;
                    clean = false;
                }
            }
        }

        if let Some(position) = advance_to {
            self.state.set_backfill_cursor(&position).await?;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::mapping::{Coercion, KeyMapping, MappingCatalog, TableMapping};
    use crate::stores::{MemoryPrimaryStore, MemorySecondaryStore};
    use crate::translate::KeyResolver;
    use medbridge_protocol::{ChangeOp, ChangeOrigin, RowImage};
    use serde_json::{json, Value};
    use tempfile::tempdir;

    struct Fixture {
        primary: Arc<MemoryPrimaryStore>,
        secondary: Arc<MemorySecondaryStore>,
        state: Arc<StateStore>,
        processor: WebhookProcessor,
        _dir: tempfile::TempDir,
    }

    async fn fixture(retry: RetryConfig) -> Fixture {
        let dir = tempdir().unwrap();
        let state = Arc::new(StateStore::open(dir.path().join("state.db")).await.unwrap());
        let primary = Arc::new(MemoryPrimaryStore::new());
        let secondary = Arc::new(MemorySecondaryStore::new());
        let catalog = Arc::new(
            MappingCatalog::new(vec![
                TableMapping::new(
                    "patients",
                    "portal_patients",
                    KeyMapping::cross_reference("id", "patient_id"),
                )
                .with_column("name", "full_name", Coercion::Identity),
                TableMapping::new(
                    "appointments",
                    "portal_appointments",
                    KeyMapping::cross_reference("id", "appointment_id"),
                )
                .with_reference("patient_id", "patient_id", "patients"),
            ])
            .unwrap(),
        );
        let processor = WebhookProcessor::new(
            primary.clone(),
            secondary.clone(),
            state.clone(),
            Translator::new(catalog),
            EngineConfig::new().with_retry(retry),
            Arc::new(EngineStats::new()),
        );
        Fixture {
            primary,
            secondary,
            state,
            processor,
            _dir: dir,
        }
    }

    fn row(pairs: &[(&str, Value)]) -> RowImage {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn patient_payload(event_id: &str, portal_key: &str, name: &str) -> WebhookPayload {
        WebhookPayload {
            table: "portal_patients".to_string(),
            op: ChangeOp::Insert,
            record: row(&[
                ("patient_id", json!(portal_key)),
                ("full_name", json!(name)),
            ]),
            old_record: None,
            timestamp: Utc::now(),
            event_id: event_id.to_string(),
        }
    }

    #[tokio::test]
    async fn webhook_applies_and_maps_the_key() {
        let f = fixture(RetryConfig::default()).await;

        let ack = f
            .processor
            .handle(patient_payload("evt-1", "p-1", "Ada"))
            .await
            .unwrap();
        assert_eq!(ack, WebhookAck::applied());

        // Primary generated key 1 for the new row.
        let row = f.primary.row("patients", &json!(1)).unwrap();
        assert_eq!(row.get("name"), Some(&json!("Ada")));
        assert_eq!(
            f.state.primary_key("patients", &json!("p-1")).await.unwrap(),
            Some(json!(1))
        );
        assert!(f.state.seen("evt-1", Direction::Inbound).await.unwrap());
    }

    #[tokio::test]
    async fn second_delivery_is_a_duplicate() {
        let f = fixture(RetryConfig::default()).await;

        f.processor
            .handle(patient_payload("evt-1", "p-1", "Ada"))
            .await
            .unwrap();
        let ack = f
            .processor
            .handle(patient_payload("evt-1", "p-1", "Ada"))
            .await
            .unwrap();

        assert_eq!(ack, WebhookAck::duplicate());
        assert_eq!(f.primary.apply_calls(), 1);
        assert_eq!(f.primary.row_count("patients"), 1);
    }

    #[tokio::test]
    async fn own_outbound_write_echoed_back_is_not_applied() {
        let f = fixture(RetryConfig::default()).await;
        f.state
            .reserve_event("evt-1", Direction::Outbound)
            .await
            .unwrap();

        let ack = f
            .processor
            .handle(patient_payload("evt-1", "p-1", "Ada"))
            .await
            .unwrap();

        assert_eq!(ack, WebhookAck::echo());
        assert_eq!(f.primary.apply_calls(), 0);
        // The echo is settled; a redelivery is just a duplicate.
        assert!(f.state.seen("evt-1", Direction::Inbound).await.unwrap());
    }

    #[tokio::test]
    async fn unresolved_parent_retries_then_succeeds() {
        let f = fixture(RetryConfig::default()).await;
        let payload = WebhookPayload {
            table: "portal_appointments".to_string(),
            op: ChangeOp::Insert,
            record: row(&[
                ("appointment_id", json!("a-1")),
                ("patient_id", json!("p-9")),
            ]),
            old_record: None,
            timestamp: Utc::now(),
            event_id: "evt-appt".to_string(),
        };

        let err = f.processor.handle(payload.clone()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(f.primary.row_count("appointments"), 0);

        // The parent syncs, then the redelivery goes through.
        f.state
            .put_key_mapping("patients", &json!(4), &json!("p-9"))
            .await
            .unwrap();
        let ack = f.processor.handle(payload).await.unwrap();
        assert_eq!(ack, WebhookAck::applied());
        let row = f.primary.row("appointments", &json!(1)).unwrap();
        assert_eq!(row.get("patient_id"), Some(&json!(4)));
    }

    #[tokio::test]
    async fn permanent_mapping_failure_dead_letters_immediately() {
        let f = fixture(RetryConfig::default()).await;
        let payload = WebhookPayload {
            table: "portal_unknown".to_string(),
            op: ChangeOp::Insert,
            record: RowImage::new(),
            old_record: None,
            timestamp: Utc::now(),
            event_id: "evt-bad".to_string(),
        };

        let ack = f.processor.handle(payload.clone()).await.unwrap();
        assert_eq!(ack, WebhookAck::dead_lettered());

        let letters = f.state.dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].direction, Direction::Inbound);
        assert_eq!(letters[0].event_id, "evt-bad");

        // Terminal: the redelivery does not dead-letter twice.
        let ack = f.processor.handle(payload).await.unwrap();
        assert_eq!(ack, WebhookAck::duplicate());
        assert_eq!(f.state.dead_letters(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn redelivery_budget_exhaustion_dead_letters() {
        let f = fixture(RetryConfig::new(2)).await;
        let payload = patient_payload("evt-1", "p-1", "Ada");

        f.primary.fail_with(SyncError::store_retryable("locked"));
        let err = f.processor.handle(payload.clone()).await.unwrap_err();
        assert!(err.is_retryable());

        f.primary.fail_with(SyncError::store_retryable("locked"));
        let ack = f.processor.handle(payload).await.unwrap();
        assert_eq!(ack, WebhookAck::dead_lettered());
        assert_eq!(f.state.dead_letters(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn backfill_replays_missed_changes_and_advances_the_cursor() {
        let f = fixture(RetryConfig::default()).await;
        let base = Utc::now();
        for (i, name) in ["Ada", "Eve"].iter().enumerate() {
            let event = ChangeEvent::new(
                ChangeOrigin::Secondary,
                "portal_patients",
                ChangeOp::Insert,
                row(&[
                    ("patient_id", json!(format!("p-{i}"))),
                    ("full_name", json!(name)),
                ]),
            )
            .with_event_id(format!("evt-{i}"))
            .with_timestamp(base + chrono::Duration::seconds(i as i64));
            f.secondary.push_change(event);
        }

        let report = f.processor.backfill().await.unwrap();
        assert_eq!(report.fetched, 2);
        assert_eq!(report.applied, 2);
        assert_eq!(f.primary.row_count("patients"), 2);

        // The cursor moved past both events; nothing is refetched.
        let report = f.processor.backfill().await.unwrap();
        assert_eq!(report.fetched, 0);
    }

    #[tokio::test]
    async fn backfill_holds_the_cursor_at_the_first_failure() {
        let f = fixture(RetryConfig::default()).await;
        let base = Utc::now();
        for i in 0..2 {
            let event = ChangeEvent::new(
                ChangeOrigin::Secondary,
                "portal_patients",
                ChangeOp::Insert,
                row(&[
                    ("patient_id", json!(format!("p-{i}"))),
                    ("full_name", json!("x")),
                ]),
            )
            .with_event_id(format!("evt-{i}"))
            .with_timestamp(base + chrono::Duration::seconds(i as i64));
            f.secondary.push_change(event);
        }
        f.primary.fail_with(SyncError::store_retryable("locked"));

        let report = f.processor.backfill().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.applied, 1);
        assert!(f.state.backfill_cursor().await.unwrap().is_none());

        // Next pass refetches both; the first is retried, the second skips
        // as a duplicate.
        let report = f.processor.backfill().await.unwrap();
        assert_eq!(report.fetched, 2);
        assert_eq!(report.applied, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(f.primary.row_count("patients"), 2);
    }
}
