//! Shared test harness: an in-process, single-replica Raft host.
//!
//! `LocalRaftHost` stands in for the external consensus library. It
//! drives each shard's state machine synchronously from an in-memory
//! log: proposals append an entry and apply it immediately, reads go
//! straight to the state machine, and the committed log is exposed
//! through the log-querier interface with manual compaction for tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use regatta_raft::{
    Entry, EntryResult, LogQuerier, LogReader, RaftError, RaftHost, ReplicaConfig, ReplicaId,
    ShardId, ShardInfo, SnapshotContext, StateMachine, StateMachineFactory,
};

/// Install a process-wide test subscriber once; `RUST_LOG` filters as
/// usual.
pub fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

struct ShardState {
    sm: Box<dyn StateMachine>,
    log: Vec<Entry>,
    first_index: u64,
    next_index: u64,
    term: u64,
}

pub struct LocalRaftHost {
    replica_id: ReplicaId,
    shards: Mutex<HashMap<ShardId, Arc<Mutex<ShardState>>>>,
}

impl LocalRaftHost {
    pub fn new(replica_id: ReplicaId) -> Arc<Self> {
        Arc::new(Self {
            replica_id,
            shards: Mutex::new(HashMap::new()),
        })
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    fn shard(&self, shard_id: ShardId) -> Result<Arc<Mutex<ShardState>>, RaftError> {
        self.shards
            .lock()
            .map_err(|_| RaftError::Other(anyhow!("host lock poisoned")))?
            .get(&shard_id)
            .cloned()
            .ok_or(RaftError::ShardNotFound(shard_id))
    }

    /// Install a shard whose state machine ignores commands, with a
    /// pre-seeded log. Used by log reader tests.
    pub fn install_log(&self, shard_id: ShardId, entries: Vec<Entry>) {
        let first_index = entries.first().map_or(1, |entry| entry.index);
        let next_index = entries.last().map_or(first_index, |entry| entry.index + 1);
        let state = ShardState {
            sm: Box::new(NoopStateMachine),
            log: entries,
            first_index,
            next_index,
            term: 1,
        };
        self.shards
            .lock()
            .unwrap()
            .insert(shard_id, Arc::new(Mutex::new(state)));
    }

    /// Drop log entries below `new_first_index`, as log compaction
    /// would.
    pub fn compact_log(&self, shard_id: ShardId, new_first_index: u64) {
        if let Ok(shard) = self.shard(shard_id) {
            let mut state = shard.lock().unwrap();
            state.log.retain(|entry| entry.index >= new_first_index);
            state.first_index = new_first_index;
        }
    }

    /// Stream the shard's state machine into an in-memory snapshot.
    pub fn snapshot_shard(&self, shard_id: ShardId) -> anyhow::Result<Vec<u8>> {
        let shard = self.shard(shard_id).map_err(|err| anyhow!(err))?;
        let state = shard.lock().map_err(|_| anyhow!("shard lock poisoned"))?;
        let ctx: SnapshotContext = state.sm.prepare_snapshot()?;
        let mut out = Vec::new();
        let cancel = AtomicBool::new(false);
        state.sm.save_snapshot(ctx, &mut out, &cancel)?;
        Ok(out)
    }
}

#[async_trait]
impl RaftHost for LocalRaftHost {
    fn start_replica(
        &self,
        _members: BTreeMap<ReplicaId, String>,
        _join: bool,
        factory: Arc<dyn StateMachineFactory>,
        config: ReplicaConfig,
    ) -> Result<(), RaftError> {
        let mut shards = self
            .shards
            .lock()
            .map_err(|_| RaftError::Other(anyhow!("host lock poisoned")))?;
        if shards.contains_key(&config.shard_id) {
            return Ok(());
        }
        let mut sm = factory.create(config.shard_id, config.replica_id);
        let applied = sm.open().context("open state machine")?;
        shards.insert(
            config.shard_id,
            Arc::new(Mutex::new(ShardState {
                sm,
                log: Vec::new(),
                first_index: applied + 1,
                next_index: applied + 1,
                term: 1,
            })),
        );
        Ok(())
    }

    fn stop_replica(&self, shard_id: ShardId) -> Result<(), RaftError> {
        let removed = self
            .shards
            .lock()
            .map_err(|_| RaftError::Other(anyhow!("host lock poisoned")))?
            .remove(&shard_id);
        match removed {
            None => Err(RaftError::ShardNotFound(shard_id)),
            Some(shard) => {
                let mut state = shard
                    .lock()
                    .map_err(|_| RaftError::Other(anyhow!("shard lock poisoned")))?;
                state.sm.close().map_err(RaftError::Other)?;
                Ok(())
            }
        }
    }

    async fn propose(
        &self,
        shard_id: ShardId,
        command: Vec<u8>,
        _timeout: Duration,
    ) -> Result<EntryResult, RaftError> {
        let shard = self.shard(shard_id)?;
        let mut state = shard
            .lock()
            .map_err(|_| RaftError::Other(anyhow!("shard lock poisoned")))?;
        let entry = Entry {
            index: state.next_index,
            term: state.term,
            command,
        };
        let mut results = state
            .sm
            .update(std::slice::from_ref(&entry))
            .map_err(RaftError::Other)?;
        state.next_index = entry.index + 1;
        state.log.push(entry);
        Ok(results.pop().unwrap_or_default())
    }

    async fn read(
        &self,
        shard_id: ShardId,
        query: Vec<u8>,
        _timeout: Duration,
    ) -> Result<Vec<u8>, RaftError> {
        // A single in-process replica is trivially linearizable.
        self.stale_read(shard_id, query)
    }

    fn stale_read(&self, shard_id: ShardId, query: Vec<u8>) -> Result<Vec<u8>, RaftError> {
        let shard = self.shard(shard_id)?;
        let state = shard
            .lock()
            .map_err(|_| RaftError::Other(anyhow!("shard lock poisoned")))?;
        state.sm.lookup(&query).map_err(RaftError::Other)
    }

    fn leader(&self, shard_id: ShardId) -> Option<(ReplicaId, u64)> {
        let shard = self.shard(shard_id).ok()?;
        let state = shard.lock().ok()?;
        Some((self.replica_id, state.term))
    }

    fn shard_info(&self, shard_id: ShardId) -> Option<ShardInfo> {
        let shard = self.shard(shard_id).ok()?;
        let state = shard.lock().ok()?;
        Some(ShardInfo {
            shard_id,
            replica_id: self.replica_id,
            term: state.term,
            leader_id: self.replica_id,
        })
    }

    fn shard_ids(&self) -> Vec<ShardId> {
        self.shards
            .lock()
            .map(|shards| shards.keys().copied().collect())
            .unwrap_or_default()
    }

    fn has_replica(&self, _shard_id: ShardId, _replica_id: ReplicaId) -> bool {
        false
    }

    async fn remove_data(
        &self,
        _shard_id: ShardId,
        _replica_id: ReplicaId,
    ) -> Result<(), RaftError> {
        Ok(())
    }
}

impl LogQuerier for LocalRaftHost {
    fn get_log_reader(&self, shard_id: ShardId) -> Result<Box<dyn LogReader>, RaftError> {
        let shard = self.shard(shard_id)?;
        let state = shard
            .lock()
            .map_err(|_| RaftError::Other(anyhow!("shard lock poisoned")))?;
        Ok(Box::new(LocalLogReader {
            first_index: state.first_index,
            last_index: state.next_index.saturating_sub(1),
            entries: state
                .log
                .iter()
                .filter(|entry| entry.index >= state.first_index)
                .cloned()
                .collect(),
        }))
    }
}

struct LocalLogReader {
    first_index: u64,
    last_index: u64,
    entries: Vec<Entry>,
}

impl LogReader for LocalLogReader {
    fn get_range(&self) -> (u64, u64) {
        (self.first_index, self.last_index)
    }

    fn entries(&self, first: u64, last: u64, max_bytes: u64) -> Result<Vec<Entry>, RaftError> {
        let mut out = Vec::new();
        let mut size = 0u64;
        for entry in &self.entries {
            if entry.index < first || entry.index >= last {
                continue;
            }
            size += entry.size_upper_limit() as u64;
            out.push(entry.clone());
            // The byte budget is a hint: the entry crossing it is still
            // included.
            if max_bytes > 0 && size >= max_bytes {
                break;
            }
        }
        Ok(out)
    }
}

/// State machine that accepts and ignores everything; backs log-only
/// shards in reader tests.
struct NoopStateMachine;

impl StateMachine for NoopStateMachine {
    fn open(&mut self) -> anyhow::Result<u64> {
        Ok(0)
    }

    fn update(&mut self, entries: &[Entry]) -> anyhow::Result<Vec<EntryResult>> {
        Ok(entries.iter().map(|_| EntryResult::default()).collect())
    }

    fn lookup(&self, _query: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn prepare_snapshot(&self) -> anyhow::Result<SnapshotContext> {
        Ok(Box::new(()))
    }

    fn save_snapshot(
        &self,
        _ctx: SnapshotContext,
        _sink: &mut dyn std::io::Write,
        _cancel: &AtomicBool,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn recover_from_snapshot(
        &mut self,
        _source: &mut dyn std::io::Read,
        _cancel: &AtomicBool,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn get_hash(&self) -> anyhow::Result<u64> {
        Ok(0)
    }
}

/// Build a log entry with a fixed-size payload, for reader tests.
pub fn log_entry(index: u64) -> Entry {
    Entry {
        index,
        term: 1,
        command: vec![0u8; 16],
    }
}

pub fn log_entries(range: std::ops::Range<u64>) -> Vec<Entry> {
    range.map(log_entry).collect()
}
