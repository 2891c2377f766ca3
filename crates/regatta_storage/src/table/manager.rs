//! Table lifecycle management on top of the meta shard.
//!
//! The manager owns the control-plane view: it creates and deletes
//! table records under CAS, keeps a process-local name cache, and runs
//! two background loops. Reconcile diffs the desired tables in meta
//! against the shards this host actually runs and starts/stops
//! replicas; cleanup removes the on-disk data of stopped shards after a
//! grace period, re-checking meta first so a concurrent re-create never
//! loses data.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Context};
use regatta_raft::{RaftError, RaftHost, ShardId};
use tokio::sync::watch;

use crate::command::{Command, KeyValue, QueryRequest, QueryResponse};
use crate::config::{EngineConfig, LoopConfig};
use crate::errors::StorageError;
use crate::fsm::{read_snapshot_frame, Fsm};
use crate::kv::{MetaFsm, MetaStore, Pair, RaftMetaStore};
use crate::stats::FsmStats;

use super::{
    cleanup_key, lease_key, now_unix_ms, stored_table_name, ActiveTable, Cleanup, Lease, Table,
    META_SHARD_ID, SEQUENCE_KEY, TABLE_IDS_RANGE_START, TABLE_KEY_PREFIX,
};

const LEADER_POLL_INTERVAL: Duration = Duration::from_millis(500);
const RESTORE_PROPOSE_TIMEOUT: Duration = Duration::from_secs(30);
const RESTORE_BACKOFF_BASE: Duration = Duration::from_millis(250);
const RESTORE_BACKOFF_MAX: Duration = Duration::from_secs(15);
const RESTORE_BACKOFF_MAX_SHIFT: u32 = 6;

struct Inner {
    host: Arc<dyn RaftHost>,
    store: Arc<dyn MetaStore>,
    cfg: EngineConfig,
    loops: LoopConfig,
    cache: RwLock<HashMap<String, Table>>,
    admin_lock: tokio::sync::Mutex<()>,
    block_cache: Arc<fjall::BlockCache>,
    fsm_stats: Arc<FsmStats>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

/// Table manager bound to one Raft host.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

impl Manager {
    pub fn new(host: Arc<dyn RaftHost>, cfg: EngineConfig) -> Self {
        Self::with_loops(host, cfg, LoopConfig::default())
    }

    pub fn with_loops(host: Arc<dyn RaftHost>, cfg: EngineConfig, loops: LoopConfig) -> Self {
        let store = Arc::new(RaftMetaStore::new(host.clone(), META_SHARD_ID));
        let block_cache = Arc::new(fjall::BlockCache::with_capacity_bytes(
            cfg.table.block_cache_size,
        ));
        let (ready_tx, ready_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                host,
                store,
                cfg,
                loops,
                cache: RwLock::new(HashMap::new()),
                admin_lock: tokio::sync::Mutex::new(()),
                block_cache,
                fsm_stats: Arc::new(FsmStats::default()),
                ready_tx,
                ready_rx,
                closed_tx,
                closed_rx,
            }),
        }
    }

    pub fn meta_store(&self) -> Arc<dyn MetaStore> {
        self.inner.store.clone()
    }

    pub fn fsm_stats(&self) -> Arc<FsmStats> {
        self.inner.fsm_stats.clone()
    }

    /// Start the meta shard replica and, once a meta leader is known,
    /// the reconcile and cleanup loops.
    pub fn start(&self) -> Result<(), StorageError> {
        let inner = &self.inner;
        let members = if inner.host.has_replica(META_SHARD_ID, inner.cfg.node_id) {
            BTreeMap::new()
        } else {
            inner.cfg.initial_members.clone()
        };
        inner.host.start_replica(
            members,
            false,
            MetaFsm::factory(),
            inner.cfg.meta_replica_config(META_SHARD_ID),
        )?;

        let inner = self.inner.clone();
        let manager = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(LEADER_POLL_INTERVAL);
            let mut closed = inner.closed_rx.clone();
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = closed.changed() => return,
                }
                if *closed.borrow() {
                    return;
                }
                if inner.host.leader(META_SHARD_ID).is_some() {
                    let reconciler = manager.clone();
                    tokio::spawn(async move { reconciler.reconcile_loop().await });
                    let cleaner = manager.clone();
                    tokio::spawn(async move { cleaner.cleanup_loop().await });
                    let _ = inner.ready_tx.send(true);
                    return;
                }
            }
        });
        Ok(())
    }

    /// Block until the background loops are running, or the manager is
    /// closed first.
    pub async fn wait_until_ready(&self) -> Result<(), StorageError> {
        let mut ready = self.inner.ready_rx.clone();
        let mut closed = self.inner.closed_rx.clone();
        loop {
            if *ready.borrow() {
                return Ok(());
            }
            if *closed.borrow() {
                return Err(StorageError::ManagerClosed);
            }
            tokio::select! {
                changed = ready.changed() => {
                    if changed.is_err() {
                        return Err(StorageError::ManagerClosed);
                    }
                }
                changed = closed.changed() => {
                    if changed.is_err() {
                        return Err(StorageError::ManagerClosed);
                    }
                }
            }
        }
    }

    pub fn close(&self) {
        let _ = self.inner.closed_tx.send(true);
    }

    /// Create a table: allocate a shard id from the meta sequence,
    /// write the meta record at version zero and start the shard
    /// locally.
    pub async fn create_table(&self, name: &str) -> Result<Table, StorageError> {
        let _guard = self.inner.admin_lock.lock().await;
        let table = self.create_table_meta(name).await?;
        self.start_table(&table.name, table.shard_id)?;
        self.cache_table(&table);
        Ok(table)
    }

    async fn create_table_meta(&self, name: &str) -> Result<Table, StorageError> {
        let inner = &self.inner;
        if inner.store.exists(&stored_table_name(name)).await? {
            return Err(StorageError::TableExists);
        }
        let shard_id = self.next_shard_id().await?;
        let table = Table {
            name: name.to_string(),
            shard_id,
            recover_id: 0,
        };
        match self.set_table(&table, 0).await {
            // Lost the CAS: someone else created the table concurrently.
            Err(StorageError::VersionMismatch) => Err(StorageError::TableExists),
            Err(err) => Err(err),
            Ok(()) => Ok(table),
        }
    }

    /// Remove the table's meta record. Shard shutdown and data removal
    /// happen later through reconciliation and cleanup on every
    /// replica.
    pub async fn delete_table(&self, name: &str) -> Result<(), StorageError> {
        let _guard = self.inner.admin_lock.lock().await;
        let key = stored_table_name(name);
        let pair = match self.inner.store.get(&key).await {
            Err(StorageError::KeyNotFound) => return Err(StorageError::TableNotFound),
            other => other?,
        };
        self.inner.store.delete(&key, pair.ver).await
    }

    pub async fn get_table(&self, name: &str) -> Result<ActiveTable, StorageError> {
        if let Ok(cache) = self.inner.cache.read() {
            if let Some(table) = cache.get(name) {
                return Ok(table.as_active(self.inner.host.clone()));
            }
        }
        let (table, _) = self.get_table_meta(name).await?;
        Ok(table.as_active(self.inner.host.clone()))
    }

    pub async fn get_table_by_id(&self, shard_id: ShardId) -> Result<ActiveTable, StorageError> {
        let tables = self.get_tables().await?;
        tables
            .into_iter()
            .find(|table| table.shard_id == shard_id)
            .map(|table| table.as_active(self.inner.host.clone()))
            .ok_or(StorageError::TableNotFound)
    }

    pub async fn get_tables(&self) -> Result<Vec<Table>, StorageError> {
        Ok(self.get_tables_meta().await?.into_values().collect())
    }

    /// Acquire the table lease for `duration`. Succeeds iff the lease is
    /// unclaimed, already held by this replica, or expired.
    pub async fn lease_table(&self, name: &str, duration: Duration) -> Result<(), StorageError> {
        let inner = &self.inner;
        let key = lease_key(name);
        let (current, ver) = match inner.store.get(&key).await {
            Ok(pair) => {
                let lease: Lease = serde_json::from_str(&pair.value)
                    .map_err(|err| anyhow!("corrupt lease record: {err}"))?;
                (Some(lease), pair.ver)
            }
            Err(StorageError::KeyNotFound) => (None, 0),
            Err(err) => return Err(err),
        };

        let now = now_unix_ms();
        let acquirable = match &current {
            None => true,
            Some(lease) => lease.id == inner.cfg.node_id || lease.expired(now),
        };
        if !acquirable {
            return Err(StorageError::LeaseNotAcquired);
        }

        let lease = Lease {
            id: inner.cfg.node_id,
            until: now + duration.as_millis().min(u128::from(u64::MAX)) as u64,
        };
        let value = serde_json::to_string(&lease).map_err(|err| anyhow!(err))?;
        match inner.store.set(&key, &value, ver).await {
            // Lost the CAS to a concurrent claimant.
            Err(StorageError::VersionMismatch) => Err(StorageError::LeaseNotAcquired),
            Err(err) => Err(err),
            Ok(_) => Ok(()),
        }
    }

    /// Give the lease back. Returns whether this replica actually held
    /// it.
    pub async fn return_table(&self, name: &str) -> Result<bool, StorageError> {
        let inner = &self.inner;
        let key = lease_key(name);
        let pair = match inner.store.get(&key).await {
            Err(StorageError::KeyNotFound) => return Ok(false),
            other => other?,
        };
        let lease: Lease = serde_json::from_str(&pair.value)
            .map_err(|err| anyhow!("corrupt lease record: {err}"))?;
        if lease.id != inner.cfg.node_id {
            return Ok(false);
        }
        inner.store.delete(&key, pair.ver).await?;
        Ok(true)
    }

    /// Rebuild a table from a snapshot stream under a fresh shard id and
    /// promote it once the stream is fully replicated.
    pub async fn restore(&self, name: &str, source: &mut dyn Read) -> Result<(), StorageError> {
        let (mut table, version) = match self.get_table_meta(name).await {
            Ok(found) => found,
            Err(StorageError::TableNotFound) => (Table::default(), 0),
            Err(err) => return Err(err),
        };
        let recover_id = self.next_shard_id().await?;
        table.name = name.to_string();
        table.recover_id = recover_id;

        self.start_table(name, recover_id)?;
        self.set_table(&table, version).await?;
        self.wait_for_leader(recover_id).await?;
        self.stream_into_shard(name, recover_id, source).await?;

        let (mut table, version) = self.get_table_meta(name).await?;
        table.shard_id = recover_id;
        table.recover_id = 0;
        self.set_table(&table, version).await?;
        self.cache_table(&table);
        Ok(())
    }

    /// One reconcile pass: make the local shard set match the tables in
    /// meta.
    pub async fn reconcile(&self) -> Result<(), StorageError> {
        let tables = self.get_tables_meta().await?;
        for table in tables.values() {
            self.cache_table(table);
        }

        let local: HashSet<ShardId> = self.inner.host.shard_ids().into_iter().collect();
        let (to_start, to_stop) = diff_tables(&tables, &local);

        for (shard_id, table) in to_start {
            self.start_table(&table.name, shard_id)?;
            self.cache_table(&table);
        }
        for shard_id in to_stop {
            self.stop_table(shard_id).await?;
            self.clear_table(shard_id);
        }
        Ok(())
    }

    /// One cleanup pass: drop the data of shards whose markers outlived
    /// the grace period, unless meta re-acquired the shard meanwhile.
    pub async fn cleanup(&self) -> Result<(), StorageError> {
        let inner = &self.inner;
        let markers = inner
            .store
            .get_all(&cleanup_key_pattern(inner.cfg.node_id))
            .await?;
        let now = now_unix_ms();
        for pair in markers {
            let marker: Cleanup = serde_json::from_str(&pair.value)
                .map_err(|err| anyhow!("corrupt cleanup marker: {err}"))?;
            let grace_ms = inner.loops.cleanup_grace_period.as_millis() as u64;
            if marker.created + grace_ms > now {
                continue;
            }

            match self.get_table_by_id(marker.shard_id).await {
                Ok(_) => {
                    // The shard is wanted again; drop only the marker.
                    tracing::warn!(
                        shard_id = marker.shard_id,
                        replica_id = inner.cfg.node_id,
                        "cluster data cleanup skipped, table should not be deleted"
                    );
                    inner.store.delete(&pair.key, pair.ver).await?;
                    continue;
                }
                Err(StorageError::TableNotFound) => {}
                Err(err) => return Err(err),
            }

            match tokio::time::timeout(
                inner.loops.cleanup_timeout,
                inner.host.remove_data(marker.shard_id, inner.cfg.node_id),
            )
            .await
            {
                Ok(removed) => removed?,
                Err(_) => {
                    return Err(StorageError::Unavailable(format!(
                        "data removal for shard {} timed out",
                        marker.shard_id
                    )))
                }
            }
            match std::fs::remove_dir_all(&marker.data_path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(StorageError::Other(
                        anyhow::Error::new(err).context("remove shard data"),
                    ))
                }
            }
            inner.store.delete(&pair.key, pair.ver).await?;
            tracing::info!(
                shard_id = marker.shard_id,
                replica_id = inner.cfg.node_id,
                "cluster data cleaned"
            );
        }
        Ok(())
    }

    async fn reconcile_loop(&self) {
        let mut tick = tokio::time::interval(self.inner.loops.reconcile_interval);
        let mut closed = self.inner.closed_rx.clone();
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = closed.changed() => return,
            }
            if *closed.borrow() {
                return;
            }
            if let Err(err) = self.reconcile().await {
                tracing::warn!(error = %err, "reconcile failed");
            }
        }
    }

    async fn cleanup_loop(&self) {
        let mut tick = tokio::time::interval(self.inner.loops.cleanup_interval);
        let mut closed = self.inner.closed_rx.clone();
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = closed.changed() => return,
            }
            if *closed.borrow() {
                return;
            }
            if let Err(err) = self.cleanup().await {
                tracing::warn!(error = %err, "cleanup failed");
            }
        }
    }

    fn start_table(&self, name: &str, shard_id: ShardId) -> Result<(), StorageError> {
        let inner = &self.inner;
        let members = if inner.host.has_replica(shard_id, inner.cfg.node_id) {
            BTreeMap::new()
        } else {
            inner.cfg.initial_members.clone()
        };
        let factory = Fsm::factory(
            name.to_string(),
            inner.cfg.data_dir.clone(),
            inner.block_cache.clone(),
            (inner.cfg.table.max_in_mem_log_size / 2) as usize,
            inner.fsm_stats.clone(),
        );
        inner.host.start_replica(
            members,
            false,
            factory,
            inner.cfg.table_replica_config(shard_id),
        )?;
        Ok(())
    }

    async fn stop_table(&self, shard_id: ShardId) -> Result<(), StorageError> {
        let inner = &self.inner;
        let raw = inner
            .host
            .stale_read(shard_id, QueryRequest::Path.encode())?;
        let path = match QueryResponse::decode(&raw)? {
            QueryResponse::Path(path) => path,
            other => {
                return Err(StorageError::Other(anyhow!(
                    "unexpected path response: {other:?}"
                )))
            }
        };

        let marker = Cleanup {
            created: now_unix_ms(),
            shard_id,
            data_path: path,
        };
        let key = cleanup_key(inner.cfg.node_id, shard_id);
        let ver = match inner.store.get(&key).await {
            Ok(pair) => pair.ver,
            Err(StorageError::KeyNotFound) => 0,
            Err(err) => return Err(err),
        };
        let value = serde_json::to_string(&marker).map_err(|err| anyhow!(err))?;
        inner.store.set(&key, &value, ver).await?;
        inner.host.stop_replica(shard_id)?;
        Ok(())
    }

    async fn next_shard_id(&self) -> Result<ShardId, StorageError> {
        let inner = &self.inner;
        loop {
            let seq = match inner.store.get(SEQUENCE_KEY).await {
                Ok(pair) => pair,
                Err(StorageError::KeyNotFound) => Pair {
                    key: SEQUENCE_KEY.to_string(),
                    value: TABLE_IDS_RANGE_START.to_string(),
                    ver: 0,
                },
                Err(err) => return Err(err),
            };
            let current: u64 = seq
                .value
                .parse()
                .map_err(|err| anyhow!("corrupt shard id sequence: {err}"))?;
            let next = current.max(TABLE_IDS_RANGE_START) + 1;
            match inner.store.set(&seq.key, &next.to_string(), seq.ver).await {
                Ok(_) => return Ok(next),
                // Lost the counter CAS to a concurrent allocation.
                Err(StorageError::VersionMismatch) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    async fn get_table_meta(&self, name: &str) -> Result<(Table, u64), StorageError> {
        let pair = match self.inner.store.get(&stored_table_name(name)).await {
            Err(StorageError::KeyNotFound) => return Err(StorageError::TableNotFound),
            other => other?,
        };
        let table: Table = serde_json::from_str(&pair.value)
            .map_err(|err| anyhow!("corrupt table record: {err}"))?;
        Ok((table, pair.ver))
    }

    async fn get_tables_meta(&self) -> Result<HashMap<String, Table>, StorageError> {
        let pairs = self
            .inner
            .store
            .get_all(&format!("{TABLE_KEY_PREFIX}*"))
            .await?;
        let mut tables = HashMap::with_capacity(pairs.len());
        for pair in pairs {
            let table: Table = serde_json::from_str(&pair.value)
                .map_err(|err| anyhow!("corrupt table record: {err}"))?;
            tables.insert(table.name.clone(), table);
        }
        Ok(tables)
    }

    async fn set_table(&self, table: &Table, ver: u64) -> Result<(), StorageError> {
        let value = serde_json::to_string(table).map_err(|err| anyhow!(err))?;
        self.inner
            .store
            .set(&stored_table_name(&table.name), &value, ver)
            .await?;
        Ok(())
    }

    async fn wait_for_leader(&self, shard_id: ShardId) -> Result<(), StorageError> {
        let deadline = tokio::time::Instant::now() + self.inner.loops.reconcile_interval * 2;
        let mut tick = tokio::time::interval(LEADER_POLL_INTERVAL);
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(StorageError::Unavailable(format!(
                    "no leader for shard {shard_id}"
                )));
            }
            tick.tick().await;
            if self.inner.host.leader(shard_id).is_some() {
                return Ok(());
            }
        }
    }

    /// Replay a snapshot stream into `shard_id` as ordinary proposals,
    /// batching key/value pairs up to half the in-memory log budget.
    async fn stream_into_shard(
        &self,
        name: &str,
        shard_id: ShardId,
        source: &mut dyn Read,
    ) -> Result<(), StorageError> {
        let inner = &self.inner;
        let flush_bytes = (inner.cfg.table.max_in_mem_log_size / 2).max(1) as usize;

        // The stream opens with the sender's applied index; a restored
        // table builds a fresh log, so only the frames matter here.
        let mut index_buf = [0u8; 8];
        source
            .read_exact(&mut index_buf)
            .context("read snapshot stream header")?;

        let mut batch: Vec<KeyValue> = Vec::new();
        let mut batch_bytes = 0usize;
        let mut leader_index: Option<u64> = None;
        loop {
            let frame = read_snapshot_frame(source)?;
            let done = frame.is_none();
            if let Some(payload) = frame {
                let cmd = Command::decode(&payload)?;
                batch_bytes += payload.len();
                leader_index = cmd.leader_index;
                if let Some(kv) = cmd.kv {
                    batch.push(kv);
                }
                batch.extend(cmd.batch);
                if batch_bytes < flush_bytes {
                    continue;
                }
            }

            if !batch.is_empty() {
                let mut cmd =
                    Command::put_batch(name.as_bytes().to_vec(), std::mem::take(&mut batch));
                cmd.leader_index = leader_index.take();
                self.propose_with_backoff(shard_id, cmd.encode()).await?;
                batch_bytes = 0;
            }
            if done {
                return Ok(());
            }
        }
    }

    async fn propose_with_backoff(
        &self,
        shard_id: ShardId,
        payload: Vec<u8>,
    ) -> Result<(), StorageError> {
        let mut failures = 0u32;
        loop {
            match self
                .inner
                .host
                .propose(shard_id, payload.clone(), RESTORE_PROPOSE_TIMEOUT)
                .await
            {
                Ok(_) => return Ok(()),
                Err(RaftError::ShardNotFound(_)) => {
                    tracing::warn!(
                        shard_id,
                        "shard not found, recovery probably started on a different node"
                    );
                    return Err(StorageError::ShardNotReady);
                }
                Err(err) => {
                    tracing::warn!(error = %err, shard_id, "error proposing restore batch");
                    let shift = failures.min(RESTORE_BACKOFF_MAX_SHIFT);
                    let delay = (RESTORE_BACKOFF_BASE * (1u32 << shift)).min(RESTORE_BACKOFF_MAX);
                    failures = failures.saturating_add(1);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn cache_table(&self, table: &Table) {
        if let Ok(mut cache) = self.inner.cache.write() {
            cache.insert(table.name.clone(), table.clone());
        }
    }

    fn clear_table(&self, shard_id: ShardId) {
        if let Ok(mut cache) = self.inner.cache.write() {
            cache.retain(|_, table| table.shard_id != shard_id && table.recover_id != shard_id);
        }
    }
}

fn cleanup_key_pattern(replica_id: u64) -> String {
    format!("/cleanup/{replica_id}/*")
}

/// Diff desired tables against the local shard inventory. Only ids
/// above the reserved range participate; both the active and the
/// recovering shard of a table count as desired.
fn diff_tables(
    tables: &HashMap<String, Table>,
    local: &HashSet<ShardId>,
) -> (Vec<(ShardId, Table)>, Vec<ShardId>) {
    let mut desired: HashMap<ShardId, &Table> = HashMap::new();
    for table in tables.values() {
        if table.shard_id != 0 {
            desired.insert(table.shard_id, table);
        }
        if table.recover_id != 0 {
            desired.insert(table.recover_id, table);
        }
    }

    let mut to_start = Vec::new();
    for (&shard_id, &table) in &desired {
        if shard_id > TABLE_IDS_RANGE_START && !local.contains(&shard_id) {
            to_start.push((shard_id, table.clone()));
        }
    }

    let mut to_stop = Vec::new();
    for &shard_id in local {
        if shard_id > TABLE_IDS_RANGE_START && !desired.contains_key(&shard_id) {
            to_stop.push(shard_id);
        }
    }
    (to_start, to_stop)
}
