//! Request handlers for the sync endpoints.

use crate::app::AppState;
use crate::auth::SIGNATURE_HEADER;
use crate::error::{ServerError, ServerResult};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use medbridge_protocol::{
    DeadLetterEntry, DrainReport, StatusReport, TriggerReport, TriggerRequest, WebhookAck,
    WebhookPayload,
};
use serde::Deserialize;

const DEFAULT_DEAD_LETTER_LIMIT: u32 = 50;

/// Query parameters for `GET /api/sync/dead-letters`.
#[derive(Debug, Default, Deserialize)]
pub struct DeadLetterQuery {
    /// Maximum number of entries returned.
    pub limit: Option<u32>,
}

/// `POST /api/sync/webhook`: applies one secondary-store change.
///
/// The signature is checked over the raw body before anything is parsed.
/// Retryable failures return 503 so the portal redelivers; settled outcomes
/// (applied, duplicate, echo, dead-lettered) ack with 200.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ServerResult<Json<WebhookAck>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    state.verifier.verify(&body, signature)?;

    let payload: WebhookPayload = serde_json::from_slice(&body)
        .map_err(|e| ServerError::InvalidRequest(format!("malformed webhook payload: {e}")))?;
    let ack = state.engine.handle_webhook(payload).await?;
    Ok(Json(ack))
}

/// `POST /api/sync/queue-notify`: drains the outbox immediately.
pub async fn queue_notify(State(state): State<AppState>) -> ServerResult<Json<DrainReport>> {
    let report = state.engine.notify_queue().await?;
    Ok(Json(report))
}

/// `POST /api/sync/trigger`: runs a manual sync pass.
///
/// An empty body runs both directions.
pub async fn trigger(
    State(state): State<AppState>,
    request: Option<Json<TriggerRequest>>,
) -> ServerResult<Json<TriggerReport>> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let report = state.engine.trigger(request.direction).await?;
    Ok(Json(report))
}

/// `GET /api/sync/status`: engine health, queue gauges, and counters.
pub async fn status(State(state): State<AppState>) -> ServerResult<Json<StatusReport>> {
    let report = state.engine.status().await?;
    Ok(Json(report))
}

/// `GET /api/sync/dead-letters`: lists dead-lettered changes, newest first.
pub async fn dead_letters(
    State(state): State<AppState>,
    Query(query): Query<DeadLetterQuery>,
) -> ServerResult<Json<Vec<DeadLetterEntry>>> {
    let limit = query.limit.unwrap_or(DEFAULT_DEAD_LETTER_LIMIT);
    let entries = state.engine.dead_letters(limit).await?;
    Ok(Json(entries))
}
