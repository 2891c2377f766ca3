//! Configuration for the storage engine and its shards.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use regatta_raft::{ReplicaConfig, ReplicaId, ShardId};

/// Raft tuning shared by every table shard plus LSM sizing.
#[derive(Clone, Debug)]
pub struct TableConfig {
    pub election_rtt: u64,
    pub heartbeat_rtt: u64,
    /// Entries between library-driven snapshots.
    pub snapshot_entries: u64,
    /// Entries kept below a snapshot before log compaction.
    pub compaction_overhead: u64,
    /// Soft cap on the in-memory log, in bytes. Snapshot stream chunks
    /// and restore batches are bounded by half of this.
    pub max_in_mem_log_size: u64,
    /// Byte budget of the process-wide LSM block cache shared by all
    /// shards.
    pub block_cache_size: u64,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            election_rtt: 20,
            heartbeat_rtt: 1,
            snapshot_entries: 10_000,
            compaction_overhead: 5_000,
            max_in_mem_log_size: 8 * 1024 * 1024,
            block_cache_size: 64 * 1024 * 1024,
        }
    }
}

/// Raft tuning for the meta shard.
#[derive(Clone, Debug)]
pub struct MetaConfig {
    pub election_rtt: u64,
    pub heartbeat_rtt: u64,
    pub snapshot_entries: u64,
    pub compaction_overhead: u64,
    pub max_in_mem_log_size: u64,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            election_rtt: 20,
            heartbeat_rtt: 1,
            snapshot_entries: 10_000,
            compaction_overhead: 5_000,
            max_in_mem_log_size: 8 * 1024 * 1024,
        }
    }
}

/// Process-level storage engine configuration.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Replica id of this node; must be non-zero.
    pub node_id: ReplicaId,
    /// Root directory for per-shard LSM state.
    pub data_dir: PathBuf,
    /// Seed membership used when starting shards this host has no
    /// persisted state for.
    pub initial_members: BTreeMap<ReplicaId, String>,
    /// Entry-count capacity of the per-shard log cache; zero disables
    /// caching and serves log queries directly from the log.
    pub log_cache_size: usize,
    pub table: TableConfig,
    pub meta: MetaConfig,
}

impl EngineConfig {
    pub fn new(node_id: ReplicaId, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_id,
            data_dir: data_dir.into(),
            initial_members: BTreeMap::new(),
            log_cache_size: 1024,
            table: TableConfig::default(),
            meta: MetaConfig::default(),
        }
    }

    pub(crate) fn table_replica_config(&self, shard_id: ShardId) -> ReplicaConfig {
        ReplicaConfig {
            shard_id,
            replica_id: self.node_id,
            election_rtt: self.table.election_rtt,
            heartbeat_rtt: self.table.heartbeat_rtt,
            snapshot_entries: self.table.snapshot_entries,
            compaction_overhead: self.table.compaction_overhead,
            max_in_mem_log_size: self.table.max_in_mem_log_size,
        }
    }

    pub(crate) fn meta_replica_config(&self, shard_id: ShardId) -> ReplicaConfig {
        ReplicaConfig {
            shard_id,
            replica_id: self.node_id,
            election_rtt: self.meta.election_rtt,
            heartbeat_rtt: self.meta.heartbeat_rtt,
            snapshot_entries: self.meta.snapshot_entries,
            compaction_overhead: self.meta.compaction_overhead,
            max_in_mem_log_size: self.meta.max_in_mem_log_size,
        }
    }
}

/// Intervals and grace periods for the manager's background loops.
#[derive(Clone, Copy, Debug)]
pub struct LoopConfig {
    pub reconcile_interval: Duration,
    pub cleanup_interval: Duration,
    /// Markers younger than this are left alone by the cleanup loop.
    pub cleanup_grace_period: Duration,
    /// Deadline for the Raft library's data removal during a cleanup
    /// pass.
    pub cleanup_timeout: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(30),
            cleanup_grace_period: Duration::from_secs(300),
            cleanup_timeout: Duration::from_secs(300),
        }
    }
}
