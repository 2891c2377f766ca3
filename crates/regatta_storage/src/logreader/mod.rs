//! Tail-of-log reader serving downstream log consumers.
//!
//! Two interchangeable implementations: [`SimpleLogReader`] reads every
//! query straight from the Raft library's log, [`CachedLogReader`] keeps
//! a per-shard cache of recent entries and fills the gaps from the log.
//! Cache coherence is driven by the library's lifecycle events: a shard
//! gets an empty cache when it becomes ready, loses it when the replica
//! is deleted, and is reset when the log is compacted (the compacted
//! prefix is unrecoverable from the log).

mod cache;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::anyhow;
use regatta_raft::{Entry, EntryInfo, LogQuerier, LogRange, NodeInfo, ShardId, SystemEvents};

use crate::errors::StorageError;
use crate::stats::LogCacheStats;

use cache::EntryCache;

/// Query interface over a shard's committed log tail.
///
/// `max_bytes` is an upper bound accounted with
/// `Entry::size_upper_limit`: results are cut before the entry that
/// crosses the budget, so a zero budget yields an empty slice and
/// callers may always receive fewer entries than requested.
pub trait LogQuery: SystemEvents {
    fn query(
        &self,
        shard_id: ShardId,
        range: LogRange,
        max_bytes: u64,
    ) -> Result<Vec<Entry>, StorageError>;
}

/// Cache-less reader.
pub struct SimpleLogReader {
    querier: Arc<dyn LogQuerier>,
}

impl SimpleLogReader {
    pub fn new(querier: Arc<dyn LogQuerier>) -> Self {
        Self { querier }
    }
}

impl SystemEvents for SimpleLogReader {}

impl LogQuery for SimpleLogReader {
    fn query(
        &self,
        shard_id: ShardId,
        range: LogRange,
        max_bytes: u64,
    ) -> Result<Vec<Entry>, StorageError> {
        if range.first_index == range.last_index {
            return Ok(Vec::new());
        }
        let read = read_log(self.querier.as_ref(), shard_id, range, max_bytes)?;
        Ok(fix_size(read, max_bytes))
    }
}

/// Reader with a per-shard entry cache. Queries against the same shard
/// serialize on that shard's mutex; distinct shards are independent.
pub struct CachedLogReader {
    querier: Arc<dyn LogQuerier>,
    shard_cache_size: usize,
    shards: RwLock<HashMap<ShardId, Arc<Mutex<EntryCache>>>>,
    stats: Arc<LogCacheStats>,
}

impl CachedLogReader {
    pub fn new(querier: Arc<dyn LogQuerier>, shard_cache_size: usize) -> Self {
        Self {
            querier,
            shard_cache_size: shard_cache_size.max(1),
            shards: RwLock::new(HashMap::new()),
            stats: Arc::new(LogCacheStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<LogCacheStats> {
        self.stats.clone()
    }

    fn shard(&self, shard_id: ShardId) -> Result<Arc<Mutex<EntryCache>>, StorageError> {
        let shards = self
            .shards
            .read()
            .map_err(|_| anyhow!("shard cache lock poisoned"))?;
        shards
            .get(&shard_id)
            .cloned()
            .ok_or(StorageError::ShardNotReady)
    }
}

impl SystemEvents for CachedLogReader {
    fn node_ready(&self, info: NodeInfo) {
        if let Ok(mut shards) = self.shards.write() {
            shards
                .entry(info.shard_id)
                .or_insert_with(|| Arc::new(Mutex::new(EntryCache::new(self.shard_cache_size))));
        }
    }

    fn node_deleted(&self, info: NodeInfo) {
        if let Ok(mut shards) = self.shards.write() {
            shards.remove(&info.shard_id);
        }
    }

    fn log_compacted(&self, info: EntryInfo) {
        if let Ok(mut shards) = self.shards.write() {
            shards.insert(
                info.shard_id,
                Arc::new(Mutex::new(EntryCache::new(self.shard_cache_size))),
            );
            self.stats.record_reset();
        }
    }
}

impl LogQuery for CachedLogReader {
    fn query(
        &self,
        shard_id: ShardId,
        range: LogRange,
        max_bytes: u64,
    ) -> Result<Vec<Entry>, StorageError> {
        if range.first_index == range.last_index {
            return Ok(Vec::new());
        }

        let shard = self.shard(shard_id)?;
        let mut cache = shard
            .lock()
            .map_err(|_| anyhow!("shard cache lock poisoned"))?;

        let (cached, prepend, append) = cache.get(range);

        if !prepend.is_empty() {
            self.stats.record_miss();
            let read = read_log(self.querier.as_ref(), shard_id, prepend, max_bytes)?;
            if read.is_empty() {
                return Ok(fix_size(cached, max_bytes));
            }
            // Only a read that lines up exactly below the cached slice
            // can be stitched onto it.
            if !cached.is_empty() && read[read.len() - 1].index == cached[0].index - 1 {
                let mut entries = read;
                entries.extend(cached);
                return Ok(fix_size(entries, max_bytes));
            }
            if cache.len() == 0 {
                cache.put(&read);
            }
            return Ok(fix_size(read, max_bytes));
        }

        if !append.is_empty() {
            self.stats.record_miss();
            let read = read_log(self.querier.as_ref(), shard_id, append, max_bytes)?;
            if read.is_empty() {
                return Ok(fix_size(cached, max_bytes));
            }
            if !cached.is_empty() {
                cache.put(&read);
                let mut entries = cached;
                entries.extend(read);
                return Ok(fix_size(entries, max_bytes));
            }
            if read[0].index == cache.largest_index() + 1 {
                cache.put(&read);
            }
            return Ok(fix_size(read, max_bytes));
        }

        self.stats.record_hit();
        Ok(fix_size(cached, max_bytes))
    }
}

fn read_log(
    querier: &dyn LogQuerier,
    shard_id: ShardId,
    range: LogRange,
    max_bytes: u64,
) -> Result<Vec<Entry>, StorageError> {
    let reader = querier.get_log_reader(shard_id)?;
    let (r_first, r_last) = reader.get_range();

    // Caller is exactly caught up with this replica.
    if r_last + 1 == range.first_index {
        return Ok(Vec::new());
    }
    // Caller is ahead of this replica.
    if r_last < range.first_index {
        return Err(StorageError::LogBehind);
    }
    // The requested prefix lives in a snapshot, not in the log.
    if range.first_index < r_first {
        return Err(StorageError::LogAhead);
    }

    Ok(reader.entries(range.first_index, range.last_index, max_bytes)?)
}

/// Trim `entries` so the accumulated `size_upper_limit` stays below
/// `max_bytes`, cutting before the first entry that crosses the budget.
fn fix_size(entries: Vec<Entry>, max_bytes: u64) -> Vec<Entry> {
    let mut size = 0u64;
    for (i, entry) in entries.iter().enumerate() {
        size += entry.size_upper_limit() as u64;
        if size >= max_bytes {
            return entries[..i].to_vec();
        }
    }
    entries
}
