//! Background sweep scheduling.

use medbridge_engine::SyncEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Runs reconciler sweeps on a fixed interval until shutdown is signalled.
pub fn spawn_sweeper(
    engine: Arc<SyncEngine>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The interval's first tick fires immediately; swallow it so the
        // first sweep lands one full interval after startup.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match engine.sweep().await {
                        Ok(report) => debug!(
                            requeued = report.requeued,
                            still_stuck = report.still_stuck,
                            "scheduled sweep finished"
                        ),
                        Err(e) => warn!(error = %e, "scheduled sweep failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}
