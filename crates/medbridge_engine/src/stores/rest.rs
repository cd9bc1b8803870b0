//! REST client for the secondary store's row API.
//!
//! Talks PostgREST conventions: one resource per table, `on_conflict` upserts
//! with `Prefer: resolution=merge-duplicates`, `eq.` filters, and a changes
//! feed table populated by the portal's own capture triggers.

use super::{check_identifier, parse_any_timestamp, ApplyOutcome, SecondaryStore};
use crate::error::{SyncError, SyncResult};
use crate::translate::key_display;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use medbridge_protocol::{ChangeEvent, ChangeOp, ChangeOrigin, RowImage, Statement, WriteGuard};
use reqwest::{header, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CHANGES_TABLE: &str = "sync_changes";

/// One row from the portal's changes feed.
#[derive(Debug, Deserialize)]
struct ChangeFeedRow {
    event_id: String,
    table_name: String,
    op: ChangeOp,
    record: RowImage,
    #[serde(default)]
    old_record: Option<RowImage>,
    committed_at: DateTime<Utc>,
}

impl ChangeFeedRow {
    fn into_event(self) -> ChangeEvent {
        ChangeEvent {
            event_id: self.event_id,
            origin: ChangeOrigin::Secondary,
            table: self.table_name,
            op: self.op,
            record: self.record,
            old_record: self.old_record,
            timestamp: self.committed_at,
        }
    }
}

/// Secondary store over HTTP.
pub struct RestSecondaryStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    changes_table: String,
}

impl RestSecondaryStore {
    /// Creates a client for the portal API.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> SyncResult<Self> {
        Self::with_timeout(base_url, api_key, DEFAULT_TIMEOUT)
    }

    /// Creates a client with an explicit request timeout.
    pub fn with_timeout(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            changes_table: DEFAULT_CHANGES_TABLE.to_string(),
        })
    }

    /// Overrides the changes feed table name.
    pub fn with_changes_table(mut self, table: impl Into<String>) -> Self {
        self.changes_table = table.into();
        self
    }

    fn url(&self, table: &str) -> String {
        format!("{}/{}", self.base_url, table)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("apikey", &self.api_key)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
    }

    /// Reads the stored guard column for a row, when the row exists.
    async fn stored_guard(
        &self,
        table: &str,
        key_column: &str,
        key: &Value,
        guard_column: &str,
    ) -> SyncResult<Option<DateTime<Utc>>> {
        let response = self
            .request(self.client.get(self.url(table)))
            .query(&[
                (key_column, format!("eq.{}", key_display(key))),
                ("select", guard_column.to_string()),
            ])
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        let rows: Vec<RowImage> = response.json().await.map_err(transport_error)?;

        Ok(rows
            .first()
            .and_then(|row| row.get(guard_column))
            .and_then(|value| value.as_str())
            .and_then(parse_any_timestamp))
    }

    async fn upsert(
        &self,
        table: &str,
        key_column: &str,
        key: &Option<Value>,
        values: &RowImage,
        guard: &Option<WriteGuard>,
    ) -> SyncResult<ApplyOutcome> {
        check_identifier(table)?;
        check_identifier(key_column)?;
        for column in values.keys() {
            check_identifier(column)?;
        }

        // The API has no conditional upsert, so the guard is enforced with a
        // read before the write. Writes race within the read window; the
        // window only matters for rows edited on both sides within it.
        if let (Some(key), Some(guard)) = (key, guard) {
            check_identifier(&guard.column)?;
            if let Some(stored) = self
                .stored_guard(table, key_column, key, &guard.column)
                .await?
            {
                if stored > guard.timestamp {
                    debug!(table, "skipping stale write");
                    return Ok(ApplyOutcome::Superseded);
                }
            }
        }

        let mut body = values.clone();
        let mut request = self
            .request(self.client.post(self.url(table)))
            .header(
                "Prefer",
                "resolution=merge-duplicates,return=representation",
            );
        if let Some(key) = key {
            body.insert(key_column.to_string(), key.clone());
            request = request.query(&[("on_conflict", key_column)]);
        }

        let response = request
            .json(&vec![body])
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        let rows: Vec<RowImage> = response.json().await.map_err(transport_error)?;
        let returned_key = rows.first().and_then(|row| row.get(key_column)).cloned();

        Ok(ApplyOutcome::Applied {
            key: returned_key.or_else(|| key.clone()),
        })
    }

    async fn delete(&self, table: &str, key_column: &str, key: &Value) -> SyncResult<ApplyOutcome> {
        check_identifier(table)?;
        check_identifier(key_column)?;

        let response = self
            .request(self.client.delete(self.url(table)))
            .query(&[(key_column, format!("eq.{}", key_display(key)))])
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await?;

        Ok(ApplyOutcome::Applied {
            key: Some(key.clone()),
        })
    }
}

#[async_trait]
impl SecondaryStore for RestSecondaryStore {
    async fn apply(&self, statement: &Statement) -> SyncResult<ApplyOutcome> {
        match statement {
            Statement::Upsert {
                table,
                key_column,
                key,
                values,
                guard,
            } => self.upsert(table, key_column, key, values, guard).await,
            Statement::Delete {
                table,
                key_column,
                key,
            } => self.delete(table, key_column, key).await,
        }
    }

    async fn changes_since(
        &self,
        cursor: Option<&str>,
        limit: u32,
    ) -> SyncResult<Vec<ChangeEvent>> {
        let mut query = vec![
            ("order".to_string(), "committed_at.asc".to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("committed_at".to_string(), format!("gt.{cursor}")));
        }

        let response = self
            .request(self.client.get(self.url(&self.changes_table)))
            .query(&query)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        let rows: Vec<ChangeFeedRow> = response.json().await.map_err(transport_error)?;

        Ok(rows.into_iter().map(ChangeFeedRow::into_event).collect())
    }
}

fn transport_error(e: reqwest::Error) -> SyncError {
    if e.is_decode() {
        SyncError::store_fatal(format!("portal api response: {e}"))
    } else {
        SyncError::store_retryable(format!("portal api: {e}"))
    }
}

async fn check_status(response: reqwest::Response) -> SyncResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retryable = status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT;
    let mut body = response.text().await.unwrap_or_default();
    body.truncate(200);
    let message = format!("portal api {status}: {body}");
    Err(if retryable {
        SyncError::store_retryable(message)
    } else {
        SyncError::store_fatal(message)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn base_url_is_trimmed() {
        let store = RestSecondaryStore::new("https://portal.example/rest/v1/", "key").unwrap();
        assert_eq!(
            store.url("portal_patients"),
            "https://portal.example/rest/v1/portal_patients"
        );
    }

    #[test]
    fn feed_rows_become_secondary_events() {
        let row: ChangeFeedRow = serde_json::from_value(json!({
            "event_id": "evt-3",
            "table_name": "portal_patients",
            "op": "update",
            "record": {"patient_id": "p-1", "full_name": "Ada"},
            "committed_at": "2024-03-01T10:00:00Z"
        }))
        .unwrap();

        let event = row.into_event();
        assert_eq!(event.origin, ChangeOrigin::Secondary);
        assert_eq!(event.op, ChangeOp::Update);
        assert_eq!(event.table, "portal_patients");
        assert_eq!(event.value("full_name"), Some(&json!("Ada")));
    }

    #[test]
    fn transport_errors_default_to_retryable() {
        // A connect-style failure surfaces as a retryable store error.
        let err = SyncError::store_retryable("portal api: connection refused");
        assert!(err.is_retryable());
        let err = SyncError::store_fatal("portal api 400: bad filter");
        assert!(!err.is_retryable());
    }
}
