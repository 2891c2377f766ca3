//! Engine facade: routes per-table requests to the owning shard,
//! injects the default deadline, stamps response headers with the
//! shard's Raft view and fans lifecycle events out to the log reader.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use regatta_raft::{
    Entry, EntryInfo, LogQuerier, LogRange, NodeInfo, RaftHost, ShardId, SystemEvents,
};

use crate::command::{CommandResult, KeyValue, RangeQuery, RangeResponse, ResponseOp, Txn};
use crate::config::{EngineConfig, LoopConfig};
use crate::errors::StorageError;
use crate::logreader::{CachedLogReader, LogQuery, SimpleLogReader};
use crate::table::Manager;

const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Raft view stamped onto every response.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResponseHeader {
    pub replica_id: u64,
    pub shard_id: ShardId,
    pub raft_term: u64,
    pub raft_leader_id: u64,
}

#[derive(Clone, Debug, Default)]
pub struct RangeRequest {
    pub table: Vec<u8>,
    pub key: Vec<u8>,
    pub range_end: Option<Vec<u8>>,
    pub limit: u64,
    pub keys_only: bool,
    pub count_only: bool,
    /// When false the read bypasses the read-index barrier and may be
    /// stale.
    pub linearizable: bool,
}

#[derive(Clone, Debug)]
pub struct RangeReply {
    pub header: ResponseHeader,
    pub response: RangeResponse,
}

#[derive(Clone, Debug)]
pub struct PutRequest {
    pub table: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct PutReply {
    pub header: ResponseHeader,
}

#[derive(Clone, Debug)]
pub struct DeleteRequest {
    pub table: Vec<u8>,
    pub key: Vec<u8>,
    pub range_end: Option<Vec<u8>>,
}

#[derive(Clone, Debug)]
pub struct DeleteReply {
    pub header: ResponseHeader,
}

#[derive(Clone, Debug)]
pub struct TxnRequest {
    pub table: Vec<u8>,
    pub txn: Txn,
}

#[derive(Clone, Debug)]
pub struct TxnReply {
    pub header: ResponseHeader,
    pub succeeded: bool,
    pub responses: Vec<ResponseOp>,
}

/// Storage engine of one node.
pub struct Engine {
    cfg: EngineConfig,
    host: Arc<dyn RaftHost>,
    manager: Manager,
    log_reader: Arc<dyn LogQuery>,
}

impl Engine {
    pub fn new(
        host: Arc<dyn RaftHost>,
        querier: Arc<dyn LogQuerier>,
        cfg: EngineConfig,
    ) -> Self {
        Self::with_loops(host, querier, cfg, LoopConfig::default())
    }

    pub fn with_loops(
        host: Arc<dyn RaftHost>,
        querier: Arc<dyn LogQuerier>,
        cfg: EngineConfig,
        loops: LoopConfig,
    ) -> Self {
        let manager = Manager::with_loops(host.clone(), cfg.clone(), loops);
        let log_reader: Arc<dyn LogQuery> = if cfg.log_cache_size > 0 {
            Arc::new(CachedLogReader::new(querier, cfg.log_cache_size))
        } else {
            Arc::new(SimpleLogReader::new(querier))
        };
        Self {
            cfg,
            host,
            manager,
            log_reader,
        }
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    pub fn start(&self) -> Result<(), StorageError> {
        self.manager.start()
    }

    pub fn close(&self) {
        self.manager.close();
    }

    pub async fn range(
        &self,
        req: RangeRequest,
        timeout: Option<Duration>,
    ) -> Result<RangeReply, StorageError> {
        let table = self.resolve(&req.table).await?;
        let query = RangeQuery {
            key: req.key,
            range_end: req.range_end,
            limit: req.limit,
            keys_only: req.keys_only,
            count_only: req.count_only,
        };
        let response = table
            .range(query, req.linearizable, with_default(timeout))
            .await?;
        Ok(RangeReply {
            header: self.header(table.shard_id()),
            response,
        })
    }

    pub async fn put(
        &self,
        req: PutRequest,
        timeout: Option<Duration>,
    ) -> Result<PutReply, StorageError> {
        let table = self.resolve(&req.table).await?;
        table
            .put(KeyValue::new(req.key, req.value), with_default(timeout))
            .await?;
        Ok(PutReply {
            header: self.header(table.shard_id()),
        })
    }

    pub async fn delete(
        &self,
        req: DeleteRequest,
        timeout: Option<Duration>,
    ) -> Result<DeleteReply, StorageError> {
        let table = self.resolve(&req.table).await?;
        table
            .delete(req.key, req.range_end, with_default(timeout))
            .await?;
        Ok(DeleteReply {
            header: self.header(table.shard_id()),
        })
    }

    pub async fn txn(
        &self,
        req: TxnRequest,
        timeout: Option<Duration>,
    ) -> Result<TxnReply, StorageError> {
        let table = self.resolve(&req.table).await?;
        let CommandResult {
            succeeded,
            responses,
        } = table.txn(req.txn, with_default(timeout)).await?;
        Ok(TxnReply {
            header: self.header(table.shard_id()),
            succeeded,
            responses,
        })
    }

    /// Serve a slice of a shard's committed log to a downstream
    /// consumer.
    pub fn query_log(
        &self,
        shard_id: ShardId,
        range: LogRange,
        max_bytes: u64,
    ) -> Result<Vec<Entry>, StorageError> {
        self.log_reader.query(shard_id, range, max_bytes)
    }

    async fn resolve(&self, table: &[u8]) -> Result<crate::table::ActiveTable, StorageError> {
        let name = std::str::from_utf8(table)
            .map_err(|err| StorageError::Other(anyhow!("table name not utf-8: {err}")))?;
        self.manager.get_table(name).await
    }

    fn header(&self, shard_id: ShardId) -> ResponseHeader {
        let info = self.host.shard_info(shard_id).unwrap_or_default();
        ResponseHeader {
            replica_id: self.cfg.node_id,
            shard_id,
            raft_term: info.term,
            raft_leader_id: info.leader_id,
        }
    }
}

impl SystemEvents for Engine {
    fn node_ready(&self, info: NodeInfo) {
        if info.replica_id == self.cfg.node_id {
            self.log_reader.node_ready(info);
        }
    }

    fn node_deleted(&self, info: NodeInfo) {
        if info.replica_id == self.cfg.node_id {
            self.log_reader.node_deleted(info);
        }
    }

    fn log_compacted(&self, info: EntryInfo) {
        if info.replica_id == self.cfg.node_id {
            self.log_reader.log_compacted(info);
        }
    }
}

fn with_default(timeout: Option<Duration>) -> Duration {
    timeout.unwrap_or(DEFAULT_QUERY_TIMEOUT)
}
