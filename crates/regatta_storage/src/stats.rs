//! Cheap hot-path counters exposed as snapshot structs.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default, Debug, Clone, Copy)]
pub struct FsmStatsSnapshot {
    pub entries_applied: u64,
    pub batches_committed: u64,
    pub txns_executed: u64,
    pub snapshots_saved: u64,
    pub snapshots_recovered: u64,
}

/// Per-process state machine counters, shared by all shards.
#[derive(Default)]
pub struct FsmStats {
    entries_applied: AtomicU64,
    batches_committed: AtomicU64,
    txns_executed: AtomicU64,
    snapshots_saved: AtomicU64,
    snapshots_recovered: AtomicU64,
}

impl FsmStats {
    pub fn record_batch(&self, entries: u64) {
        self.entries_applied.fetch_add(entries, Ordering::Relaxed);
        self.batches_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_txn(&self) {
        self.txns_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot_saved(&self) {
        self.snapshots_saved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot_recovered(&self) {
        self.snapshots_recovered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FsmStatsSnapshot {
        FsmStatsSnapshot {
            entries_applied: self.entries_applied.load(Ordering::Relaxed),
            batches_committed: self.batches_committed.load(Ordering::Relaxed),
            txns_executed: self.txns_executed.load(Ordering::Relaxed),
            snapshots_saved: self.snapshots_saved.load(Ordering::Relaxed),
            snapshots_recovered: self.snapshots_recovered.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default, Debug, Clone, Copy)]
pub struct LogCacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub resets: u64,
}

/// Log-cache effectiveness counters.
#[derive(Default)]
pub struct LogCacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    resets: AtomicU64,
}

impl LogCacheStats {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reset(&self) {
        self.resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LogCacheStatsSnapshot {
        LogCacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
        }
    }
}
