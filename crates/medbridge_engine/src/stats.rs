//! Cumulative engine counters.

use medbridge_protocol::SyncCounters;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-lifetime counters, shared across the processors.
#[derive(Debug, Default)]
pub struct EngineStats {
    outbound_applied: AtomicU64,
    inbound_applied: AtomicU64,
    duplicates: AtomicU64,
    echoes_suppressed: AtomicU64,
    dead_lettered: AtomicU64,
    sweeps: AtomicU64,
}

impl EngineStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a change applied to the secondary store.
    pub fn record_outbound_applied(&self) {
        self.outbound_applied.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a change applied to the primary store.
    pub fn record_inbound_applied(&self) {
        self.inbound_applied.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a duplicate delivery rejected by the ledger.
    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a suppressed echo.
    pub fn record_echo_suppressed(&self) {
        self.echoes_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a dead-lettered change.
    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a completed reconciler sweep.
    pub fn record_sweep(&self) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a point-in-time snapshot for the status endpoint.
    pub fn snapshot(&self) -> SyncCounters {
        SyncCounters {
            outbound_applied: self.outbound_applied.load(Ordering::Relaxed),
            inbound_applied: self.inbound_applied.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            echoes_suppressed: self.echoes_suppressed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let stats = EngineStats::new();
        stats.record_outbound_applied();
        stats.record_outbound_applied();
        stats.record_duplicate();
        stats.record_sweep();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.outbound_applied, 2);
        assert_eq!(snapshot.duplicates, 1);
        assert_eq!(snapshot.sweeps, 1);
        assert_eq!(snapshot.inbound_applied, 0);
    }
}
