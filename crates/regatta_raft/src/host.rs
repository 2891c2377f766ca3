//! Host-side contract: replica lifecycle, proposals, reads and log access.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::sm::{EntryResult, StateMachine};
use crate::types::{Entry, ReplicaConfig, ReplicaId, ShardId, ShardInfo};

/// Errors surfaced by the Raft library.
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    #[error("shard {0} not found on this host")]
    ShardNotFound(ShardId),
    #[error("shard {0} not ready")]
    ShardNotReady(ShardId),
    #[error("request timed out")]
    Timeout,
    #[error("host is shutting down")]
    Closed,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Builds one state machine per started replica.
pub trait StateMachineFactory: Send + Sync {
    fn create(&self, shard_id: ShardId, replica_id: ReplicaId) -> Box<dyn StateMachine>;
}

impl<F> StateMachineFactory for F
where
    F: Fn(ShardId, ReplicaId) -> Box<dyn StateMachine> + Send + Sync,
{
    fn create(&self, shard_id: ShardId, replica_id: ReplicaId) -> Box<dyn StateMachine> {
        self(shard_id, replica_id)
    }
}

/// Read-only view of a shard's committed log.
pub trait LogReader: Send + Sync {
    /// Inclusive `(first, last)` index range currently readable from the log.
    fn get_range(&self) -> (u64, u64);

    /// Entries in `[first, last)`, trimmed to roughly `max_bytes`
    /// (a hint; the result may exceed it to respect entry boundaries).
    fn entries(&self, first: u64, last: u64, max_bytes: u64) -> Result<Vec<Entry>, RaftError>;
}

/// Access to per-shard committed-log readers.
pub trait LogQuerier: Send + Sync {
    fn get_log_reader(&self, shard_id: ShardId) -> Result<Box<dyn LogReader>, RaftError>;
}

/// The Raft library's host handle: one process-wide object managing all
/// local replicas.
#[async_trait]
pub trait RaftHost: Send + Sync {
    /// Start a replica of `shard`. `members` seeds the group membership
    /// for brand-new shards; hosts that already know the replica (from a
    /// persisted membership) are started with an empty map.
    fn start_replica(
        &self,
        members: BTreeMap<ReplicaId, String>,
        join: bool,
        factory: Arc<dyn StateMachineFactory>,
        config: ReplicaConfig,
    ) -> Result<(), RaftError>;

    /// Stop the local replica of `shard`. Its on-disk state stays behind.
    fn stop_replica(&self, shard_id: ShardId) -> Result<(), RaftError>;

    /// Propose a command and wait until it is committed and applied.
    async fn propose(
        &self,
        shard_id: ShardId,
        command: Vec<u8>,
        timeout: Duration,
    ) -> Result<EntryResult, RaftError>;

    /// Linearizable read: issues a read-index barrier, then queries the
    /// local state machine.
    async fn read(
        &self,
        shard_id: ShardId,
        query: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, RaftError>;

    /// Local read bypassing consensus. Only suitable for replica-local
    /// metadata that does not need linearizability.
    fn stale_read(&self, shard_id: ShardId, query: Vec<u8>) -> Result<Vec<u8>, RaftError>;

    /// `(leader_id, term)` of `shard`, if a leader is currently known.
    fn leader(&self, shard_id: ShardId) -> Option<(ReplicaId, u64)>;

    /// Local view of `shard`, if this host runs a replica of it.
    fn shard_info(&self, shard_id: ShardId) -> Option<ShardInfo>;

    /// Shard ids of every replica this host currently runs.
    fn shard_ids(&self) -> Vec<ShardId>;

    /// Whether this host holds persisted state for `(shard, replica)`
    /// from an earlier run.
    fn has_replica(&self, shard_id: ShardId, replica_id: ReplicaId) -> bool;

    /// Remove the library's own data (log, snapshots) for a stopped
    /// replica.
    async fn remove_data(&self, shard_id: ShardId, replica_id: ReplicaId)
        -> Result<(), RaftError>;
}
