//! # MedBridge Sync Service
//!
//! HTTP surface over the sync engine.
//!
//! This crate provides:
//! - The axum router (`build_router`) with webhook, queue-notify, trigger,
//!   status, and dead-letter endpoints
//! - Webhook signature verification (HMAC-SHA256 over the raw body)
//! - A background scheduler running reconciler sweeps
//! - TOML-backed service configuration and the `medbridge` binary
//!
//! # Endpoints
//!
//! | Endpoint | Method | Purpose |
//! |---|---|---|
//! | `/api/sync/webhook` | POST | Inbound change notification from the portal |
//! | `/api/sync/queue-notify` | POST | Immediate outbox drain |
//! | `/api/sync/trigger` | POST | Manual sync, optionally one direction |
//! | `/api/sync/status` | GET | Health, queue gauges, counters |
//! | `/api/sync/dead-letters` | GET | Changes set aside for operators |

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod api;
mod app;
mod auth;
mod config;
mod error;
mod scheduler;

pub use api::DeadLetterQuery;
pub use app::{build_router, AppState};
pub use auth::{WebhookVerifier, SIGNATURE_HEADER};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use scheduler::spawn_sweeper;
