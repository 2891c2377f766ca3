//! Per-shard replicated state machine over the LSM engine.
//!
//! Each table shard owns one keyspace directory under the node's data
//! dir. Committed log entries are decoded and applied in a single
//! durable engine batch per `update` call; the highest applied index is
//! persisted atomically with the batch under `sys.local_index`, which
//! makes the on-disk state a pure function of the applied log prefix.

mod batch;
mod txn;

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, ensure, Context};
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode, Snapshot};
use regatta_raft::{
    Entry, EntryResult, ReplicaId, ShardId, SnapshotContext, StateMachine, StateMachineFactory,
};

use crate::command::{
    Command, CommandType, KeyValue, QueryRequest, QueryResponse, RESULT_SUCCESS,
};
use crate::errors::StorageError;
use crate::keys::{self, SYS_LOCAL_INDEX, USER_KEY_MIN, USER_KEY_UPPER_BOUND};
use crate::stats::FsmStats;

use batch::{read_range, read_sys_u64_snapshot, UpdateContext};

/// Name of the single data partition inside a shard's keyspace.
const DATA_PARTITION: &str = "data";

struct Store {
    keyspace: Keyspace,
    data: PartitionHandle,
}

/// State machine of one table shard.
pub struct Fsm {
    table: String,
    shard_id: ShardId,
    replica_id: ReplicaId,
    dir: PathBuf,
    cache: Arc<fjall::BlockCache>,
    /// Upper bound on one streamed snapshot frame, in bytes.
    snapshot_chunk_bytes: usize,
    stats: Arc<FsmStats>,
    store: Option<Store>,
    /// Highest index durably applied, mirrored from `sys.local_index`.
    applied_index: u64,
}

impl Fsm {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        table: &str,
        data_dir: &Path,
        shard_id: ShardId,
        replica_id: ReplicaId,
        cache: Arc<fjall::BlockCache>,
        snapshot_chunk_bytes: usize,
        stats: Arc<FsmStats>,
    ) -> Self {
        Self {
            table: table.to_string(),
            shard_id,
            replica_id,
            dir: data_dir.join(format!("{table}-{shard_id}")),
            cache,
            snapshot_chunk_bytes: snapshot_chunk_bytes.max(4096),
            stats,
            store: None,
            applied_index: 0,
        }
    }

    /// Factory handed to the Raft library when starting a shard.
    pub fn factory(
        table: String,
        data_dir: PathBuf,
        cache: Arc<fjall::BlockCache>,
        snapshot_chunk_bytes: usize,
        stats: Arc<FsmStats>,
    ) -> Arc<dyn StateMachineFactory> {
        Arc::new(move |shard_id: ShardId, replica_id: ReplicaId| {
            Box::new(Fsm::new(
                &table,
                &data_dir,
                shard_id,
                replica_id,
                cache.clone(),
                snapshot_chunk_bytes,
                stats.clone(),
            )) as Box<dyn StateMachine>
        })
    }

    /// On-disk location of this shard's keyspace.
    pub fn data_path(&self) -> &Path {
        &self.dir
    }

    fn store(&self) -> anyhow::Result<&Store> {
        self.store.as_ref().context("state machine not open")
    }

    fn content_hash(&self, snapshot: &Snapshot) -> anyhow::Result<u64> {
        let mut hasher = crc32fast::Hasher::new();
        for item in snapshot.range(USER_KEY_MIN.to_vec()..USER_KEY_UPPER_BOUND.to_vec()) {
            let (key, value) = item?;
            hasher.update(&(key.len() as u64).to_be_bytes());
            hasher.update(&key);
            hasher.update(&(value.len() as u64).to_be_bytes());
            hasher.update(&value);
        }
        Ok(u64::from(hasher.finalize()))
    }
}

impl StateMachine for Fsm {
    fn open(&mut self) -> anyhow::Result<u64> {
        ensure!(self.shard_id > 0, "invalid shard id 0");
        ensure!(self.replica_id > 0, "invalid replica id 0");

        let keyspace = fjall::Config::new(&self.dir)
            .block_cache(self.cache.clone())
            .open()
            .with_context(|| format!("open keyspace at {}", self.dir.display()))?;
        let data = keyspace.open_partition(DATA_PARTITION, PartitionCreateOptions::default())?;
        let index = read_sys_u64_snapshot(&data.snapshot(), &SYS_LOCAL_INDEX)?;
        self.store = Some(Store { keyspace, data });
        self.applied_index = index;
        Ok(index)
    }

    fn update(&mut self, entries: &[Entry]) -> anyhow::Result<Vec<EntryResult>> {
        ensure!(!entries.is_empty(), "empty update batch");
        let store = self.store()?;
        let applied = self.applied_index;

        let mut ctx = UpdateContext::new(&store.keyspace, &store.data);
        let mut results = Vec::with_capacity(entries.len());
        let mut leader_index = None;
        for entry in entries {
            // Entries at or below the applied index have already taken
            // effect; applying them again must not disturb user state.
            if entry.index <= applied {
                results.push(EntryResult {
                    value: RESULT_SUCCESS,
                    data: Vec::new(),
                });
                continue;
            }
            let cmd = Command::decode(&entry.command)
                .with_context(|| format!("decode command at index {}", entry.index))?;
            // Only the final command of the batch may advance the
            // persisted leader index.
            leader_index = cmd.leader_index;
            if cmd.command_type == CommandType::Txn {
                self.stats.record_txn();
            }
            results.push(ctx.apply(&cmd)?);
        }

        let last_index = entries[entries.len() - 1].index;
        if last_index > applied {
            ctx.commit(leader_index, last_index)?;
            self.applied_index = last_index;
            self.stats.record_batch(entries.len() as u64);
        }
        Ok(results)
    }

    fn lookup(&self, query: &[u8]) -> anyhow::Result<Vec<u8>> {
        let store = self.store()?;
        let request = QueryRequest::decode(query)?;
        let snapshot = store.data.snapshot();
        let response = match request {
            QueryRequest::Range(range) => {
                QueryResponse::Range(read_range(&snapshot, None, &range)?)
            }
            QueryRequest::Hash => QueryResponse::Hash(self.content_hash(&snapshot)?),
            QueryRequest::Path => QueryResponse::Path(self.dir.display().to_string()),
            QueryRequest::LocalIndex => {
                QueryResponse::LocalIndex(read_sys_u64_snapshot(&snapshot, &SYS_LOCAL_INDEX)?)
            }
        };
        Ok(response.encode())
    }

    fn prepare_snapshot(&self) -> anyhow::Result<SnapshotContext> {
        let store = self.store()?;
        let snapshot = store.data.snapshot();
        let index = read_sys_u64_snapshot(&snapshot, &SYS_LOCAL_INDEX)?;
        Ok(Box::new(SnapshotView { snapshot, index }))
    }

    fn save_snapshot(
        &self,
        ctx: SnapshotContext,
        sink: &mut dyn Write,
        cancel: &AtomicBool,
    ) -> anyhow::Result<()> {
        let view = ctx
            .downcast::<SnapshotView>()
            .map_err(|_| anyhow!("unexpected snapshot context"))?;

        sink.write_all(&view.index.to_le_bytes())?;

        let mut pending: Vec<KeyValue> = Vec::new();
        let mut pending_bytes = 0usize;
        for item in view
            .snapshot
            .range(USER_KEY_MIN.to_vec()..USER_KEY_UPPER_BOUND.to_vec())
        {
            if cancel.load(Ordering::Relaxed) {
                bail!(StorageError::Stopped);
            }
            let (key, value) = item?;
            let user = keys::decode_user_key(&key)?.to_vec();
            pending_bytes += 8 + user.len() + value.len();
            pending.push(KeyValue {
                key: user,
                value: value.to_vec(),
            });
            if pending_bytes >= self.snapshot_chunk_bytes {
                write_frame(
                    sink,
                    &Command::put_batch(self.table.as_bytes().to_vec(), std::mem::take(&mut pending)),
                )?;
                pending_bytes = 0;
            }
        }
        if !pending.is_empty() {
            write_frame(
                sink,
                &Command::put_batch(self.table.as_bytes().to_vec(), pending),
            )?;
        }
        sink.flush()?;
        self.stats.record_snapshot_saved();
        Ok(())
    }

    fn recover_from_snapshot(
        &mut self,
        source: &mut dyn Read,
        cancel: &AtomicBool,
    ) -> anyhow::Result<()> {
        // Reset the data partition before replaying the stream.
        let Store { keyspace, data } = self.store.take().context("state machine not open")?;
        keyspace.delete_partition(data)?;
        let data = keyspace.open_partition(DATA_PARTITION, PartitionCreateOptions::default())?;
        self.store = Some(Store { keyspace, data });
        self.applied_index = 0;

        let mut index_buf = [0u8; 8];
        source.read_exact(&mut index_buf).context("read snapshot index")?;
        let source_index = u64::from_le_bytes(index_buf);

        let mut next_index = 1u64;
        loop {
            if cancel.load(Ordering::Relaxed) {
                bail!(StorageError::Stopped);
            }
            let command = match read_frame(source)? {
                None => break,
                Some(command) => command,
            };
            let entry = Entry {
                index: next_index,
                term: 0,
                command,
            };
            self.update(std::slice::from_ref(&entry))?;
            next_index += 1;
        }

        // The restored state corresponds to the sender's applied index,
        // not the synthetic replay indices.
        let store = self.store()?;
        let mut batch = store.keyspace.batch();
        batch.insert(
            &store.data,
            SYS_LOCAL_INDEX.to_vec(),
            source_index.to_le_bytes().to_vec(),
        );
        batch.commit()?;
        store.keyspace.persist(PersistMode::SyncAll)?;
        self.applied_index = source_index;
        self.stats.record_snapshot_recovered();
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        if let Some(store) = self.store.take() {
            store.keyspace.persist(PersistMode::SyncAll)?;
        }
        Ok(())
    }

    fn get_hash(&self) -> anyhow::Result<u64> {
        let store = self.store()?;
        self.content_hash(&store.data.snapshot())
    }
}

struct SnapshotView {
    snapshot: Snapshot,
    index: u64,
}

/// Frame layout shared by snapshot streams and restores:
/// `[len: u32 BE][crc32: u32 BE][payload]`.
fn write_frame(sink: &mut dyn Write, command: &Command) -> anyhow::Result<()> {
    let payload = command.encode();
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&payload);
    let checksum = hasher.finalize();
    sink.write_all(&(payload.len() as u32).to_be_bytes())?;
    sink.write_all(&checksum.to_be_bytes())?;
    sink.write_all(&payload)?;
    Ok(())
}

/// Counterpart of [`write_frame`]; `None` on a clean end of stream.
pub(crate) fn read_frame(source: &mut dyn Read) -> anyhow::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match source.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut crc_buf = [0u8; 4];
    source.read_exact(&mut crc_buf)?;
    let expected = u32::from_be_bytes(crc_buf);
    let mut payload = vec![0u8; len];
    source.read_exact(&mut payload)?;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&payload);
    ensure!(hasher.finalize() == expected, "snapshot frame checksum mismatch");
    Ok(Some(payload))
}

pub(crate) use read_frame as read_snapshot_frame;
