//! HTTP application wiring.

use crate::api;
use crate::auth::WebhookVerifier;
use axum::routing::{get, post};
use axum::Router;
use medbridge_engine::SyncEngine;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    /// The sync engine.
    pub engine: Arc<SyncEngine>,
    /// Webhook signature verifier.
    pub verifier: WebhookVerifier,
}

/// Builds the service router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/sync/webhook", post(api::webhook))
        .route("/api/sync/queue-notify", post(api::queue_notify))
        .route("/api/sync/trigger", post(api::trigger))
        .route("/api/sync/status", get(api::status))
        .route("/api/sync/dead-letters", get(api::dead_letters))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
