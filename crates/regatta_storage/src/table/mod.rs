//! Table model: meta records, leases, cleanup markers and the request
//! path of an active table.

mod manager;

pub use manager::Manager;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use regatta_raft::{RaftHost, ReplicaId, ShardId};
use serde::{Deserialize, Serialize};

use crate::command::{
    Command, CommandResult, KeyValue, QueryRequest, QueryResponse, RangeQuery, RangeResponse, Txn,
};
use crate::errors::StorageError;

/// Well-known shard id of the control-plane group.
pub const META_SHARD_ID: ShardId = 1_000;
/// Table shard ids are allocated strictly above this value; anything at
/// or below it is reserved.
pub const TABLE_IDS_RANGE_START: u64 = 10_000;

pub(crate) const TABLE_KEY_PREFIX: &str = "/tables/";
pub(crate) const SEQUENCE_KEY: &str = "/tables/sys/idseq";

pub(crate) fn stored_table_name(name: &str) -> String {
    format!("{TABLE_KEY_PREFIX}{name}")
}

pub(crate) fn lease_key(name: &str) -> String {
    format!("{TABLE_KEY_PREFIX}{name}/lease")
}

pub(crate) fn cleanup_key(replica_id: ReplicaId, shard_id: ShardId) -> String {
    format!("/cleanup/{replica_id}/{shard_id}")
}

pub(crate) fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .min(u128::from(u64::MAX)) as u64
}

/// Meta record of one table.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub shard_id: ShardId,
    /// Shard currently being rebuilt for this table; zero when none.
    #[serde(default)]
    pub recover_id: ShardId,
}

impl Table {
    pub fn as_active(&self, host: Arc<dyn RaftHost>) -> ActiveTable {
        ActiveTable {
            table: self.clone(),
            host,
        }
    }
}

/// Per-table lease: `id` holds the replica id of the holder.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub id: ReplicaId,
    /// Expiry as unix milliseconds.
    pub until: u64,
}

impl Lease {
    pub fn expired(&self, now_ms: u64) -> bool {
        self.until < now_ms
    }
}

/// Marker scheduling delayed removal of a stopped shard's data.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cleanup {
    /// Creation time as unix milliseconds.
    pub created: u64,
    pub shard_id: ShardId,
    pub data_path: String,
}

/// A table bound to the local Raft host, ready to serve requests.
#[derive(Clone)]
pub struct ActiveTable {
    pub table: Table,
    host: Arc<dyn RaftHost>,
}

impl std::fmt::Debug for ActiveTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveTable")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl ActiveTable {
    pub fn shard_id(&self) -> ShardId {
        self.table.shard_id
    }

    pub async fn range(
        &self,
        query: RangeQuery,
        linearizable: bool,
        timeout: Duration,
    ) -> Result<RangeResponse, StorageError> {
        let request = QueryRequest::Range(query).encode();
        let raw = if linearizable {
            self.host
                .read(self.table.shard_id, request, timeout)
                .await?
        } else {
            self.host.stale_read(self.table.shard_id, request)?
        };
        match QueryResponse::decode(&raw)? {
            QueryResponse::Range(range) => Ok(range),
            other => Err(StorageError::Other(anyhow!(
                "unexpected query response: {other:?}"
            ))),
        }
    }

    pub async fn put(&self, kv: KeyValue, timeout: Duration) -> Result<(), StorageError> {
        let cmd = Command::put(self.table.name.as_bytes().to_vec(), kv);
        self.host
            .propose(self.table.shard_id, cmd.encode(), timeout)
            .await?;
        Ok(())
    }

    pub async fn delete(
        &self,
        key: Vec<u8>,
        range_end: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<(), StorageError> {
        let cmd = Command::delete(self.table.name.as_bytes().to_vec(), key, range_end);
        self.host
            .propose(self.table.shard_id, cmd.encode(), timeout)
            .await?;
        Ok(())
    }

    pub async fn txn(&self, txn: Txn, timeout: Duration) -> Result<CommandResult, StorageError> {
        let cmd = Command::txn(self.table.name.as_bytes().to_vec(), txn);
        let result = self
            .host
            .propose(self.table.shard_id, cmd.encode(), timeout)
            .await?;
        Ok(CommandResult::decode(&result.data)?)
    }
}
