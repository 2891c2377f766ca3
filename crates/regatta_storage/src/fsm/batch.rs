//! Write batching for the state machine.
//!
//! A batch starts as a plain op list. The first transaction in a batch
//! (or a commit containing range deletes) upgrades it to an indexed
//! overlay: an ordered map over encoded keys, merged with the pre-batch
//! engine snapshot for reads, so transactions observe their own writes.
//! Range deletes expand against snapshot-plus-overlay state in encoded
//! key order, which keeps replicas byte-identical.

use std::collections::BTreeMap;

use anyhow::{ensure, Context};
use fjall::{Keyspace, PartitionHandle, PersistMode, Snapshot};
use regatta_raft::EntryResult;

use crate::command::{
    Command, CommandType, KeyValue, RangeQuery, RangeResponse, RESULT_FAILURE, RESULT_SUCCESS,
};
use crate::keys::{
    self, encode_user_key, SYS_LEADER_INDEX, SYS_LOCAL_INDEX, USER_KEY_UPPER_BOUND,
};

use super::txn::execute_txn;

fn success() -> EntryResult {
    EntryResult {
        value: RESULT_SUCCESS,
        data: Vec::new(),
    }
}

/// One buffered write against encoded keys.
#[derive(Clone, Debug)]
pub(crate) enum BatchOp {
    Set { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    DeleteRange { start: Vec<u8>, end: Vec<u8> },
}

/// Indexed (readable) form of a batch: encoded key -> value, `None`
/// marking a deletion.
#[derive(Default)]
pub(crate) struct Overlay {
    entries: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl Overlay {
    pub(crate) fn apply(&mut self, op: BatchOp, snapshot: &Snapshot) -> anyhow::Result<()> {
        match op {
            BatchOp::Set { key, value } => {
                self.entries.insert(key, Some(value));
            }
            BatchOp::Delete { key } => {
                self.entries.insert(key, None);
            }
            BatchOp::DeleteRange { start, end } => {
                if start >= end {
                    // Empty half-open range.
                    return Ok(());
                }
                let buffered: Vec<Vec<u8>> = self
                    .entries
                    .range(start.clone()..end.clone())
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in buffered {
                    self.entries.insert(key, None);
                }
                for item in snapshot.range(start..end) {
                    let (key, _) = item?;
                    self.entries.insert(key.to_vec(), None);
                }
            }
        }
        Ok(())
    }

    /// Read through the overlay, falling back to the snapshot.
    pub(crate) fn get(&self, snapshot: &Snapshot, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        if let Some(value) = self.entries.get(key) {
            return Ok(value.clone());
        }
        Ok(snapshot.get(key)?.map(|value| value.to_vec()))
    }
}

/// Ordered scan of `[start, end)` over the snapshot merged with an
/// optional overlay; overlay entries win and deletions are skipped.
/// `visit` returns `false` to stop early.
pub(crate) fn merged_range<F>(
    snapshot: &Snapshot,
    overlay: Option<&Overlay>,
    start: &[u8],
    end: &[u8],
    mut visit: F,
) -> anyhow::Result<()>
where
    F: FnMut(&[u8], &[u8]) -> bool,
{
    if start >= end {
        return Ok(());
    }

    let mut snap_iter = snapshot.range(start.to_vec()..end.to_vec());
    let mut snap_next = snap_iter.next().transpose()?;

    let Some(overlay) = overlay else {
        while let Some((key, value)) = snap_next {
            if !visit(&key, &value) {
                return Ok(());
            }
            snap_next = snap_iter.next().transpose()?;
        }
        return Ok(());
    };

    let mut over_iter = overlay.entries.range(start.to_vec()..end.to_vec());
    let mut over_next = over_iter.next();

    loop {
        match (&snap_next, over_next) {
            (None, None) => return Ok(()),
            (Some(_), None) => {
                if let Some((key, value)) = snap_next.take() {
                    if !visit(&key, &value) {
                        return Ok(());
                    }
                }
                snap_next = snap_iter.next().transpose()?;
            }
            (None, Some((key, value))) => {
                if let Some(value) = value {
                    if !visit(key, value) {
                        return Ok(());
                    }
                }
                over_next = over_iter.next();
            }
            (Some((snap_key, _)), Some((over_key, over_value))) => {
                if snap_key.as_ref() < over_key.as_slice() {
                    if let Some((key, value)) = snap_next.take() {
                        if !visit(&key, &value) {
                            return Ok(());
                        }
                    }
                    snap_next = snap_iter.next().transpose()?;
                } else {
                    if snap_key.as_ref() == over_key.as_slice() {
                        // Overlay shadows the snapshot entry.
                        snap_next = snap_iter.next().transpose()?;
                    }
                    if let Some(value) = over_value {
                        if !visit(over_key, value) {
                            return Ok(());
                        }
                    }
                    over_next = over_iter.next();
                }
            }
        }
    }
}

/// Serve a range query against the snapshot (and overlay, inside a
/// transaction).
pub(crate) fn read_range(
    snapshot: &Snapshot,
    overlay: Option<&Overlay>,
    query: &RangeQuery,
) -> anyhow::Result<RangeResponse> {
    let start = keys::user_key(&query.key);

    let Some(range_end) = &query.range_end else {
        // Point lookup.
        let value = match overlay {
            Some(overlay) => overlay.get(snapshot, &start)?,
            None => snapshot.get(&start)?.map(|value| value.to_vec()),
        };
        let mut resp = RangeResponse::default();
        if let Some(value) = value {
            resp.count = 1;
            if !query.count_only {
                resp.kvs.push(KeyValue {
                    key: query.key.clone(),
                    value: if query.keys_only { Vec::new() } else { value },
                });
            }
        }
        return Ok(resp);
    };

    let end = if keys::is_wildcard(range_end) {
        USER_KEY_UPPER_BOUND.to_vec()
    } else {
        keys::user_key(range_end)
    };

    let mut resp = RangeResponse::default();
    let limit = query.limit;
    merged_range(snapshot, overlay, &start, &end, |key, value| {
        if query.count_only {
            resp.count += 1;
            return limit == 0 || resp.count < limit;
        }
        if limit > 0 && resp.kvs.len() as u64 == limit {
            resp.more = true;
            return false;
        }
        let user = match keys::decode_user_key(key) {
            Ok(user) => user.to_vec(),
            // Never expose keys from outside the user namespace.
            Err(_) => return true,
        };
        resp.kvs.push(KeyValue {
            key: user,
            value: if query.keys_only {
                Vec::new()
            } else {
                value.to_vec()
            },
        });
        true
    })?;
    if !query.count_only {
        resp.count = resp.kvs.len() as u64;
    }
    Ok(resp)
}

enum Pending {
    Plain(Vec<BatchOp>),
    Indexed(Overlay),
}

/// Applies the commands of one `update` call and commits them as a
/// single durable engine batch.
pub(crate) struct UpdateContext<'a> {
    keyspace: &'a Keyspace,
    partition: &'a PartitionHandle,
    snapshot: Snapshot,
    pending: Pending,
    key_buf: Vec<u8>,
}

impl<'a> UpdateContext<'a> {
    pub(crate) fn new(keyspace: &'a Keyspace, partition: &'a PartitionHandle) -> Self {
        Self {
            keyspace,
            partition,
            snapshot: partition.snapshot(),
            pending: Pending::Plain(Vec::new()),
            key_buf: Vec::new(),
        }
    }

    pub(crate) fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub(crate) fn apply(&mut self, cmd: &Command) -> anyhow::Result<EntryResult> {
        match cmd.command_type {
            CommandType::Put => {
                let kv = cmd.kv.as_ref().context("put command without kv")?;
                encode_user_key(&mut self.key_buf, &kv.key);
                let op = BatchOp::Set {
                    key: self.key_buf.clone(),
                    value: kv.value.clone(),
                };
                self.push(op)?;
                Ok(success())
            }
            CommandType::Delete => {
                let kv = cmd.kv.as_ref().context("delete command without kv")?;
                encode_user_key(&mut self.key_buf, &kv.key);
                let op = match &cmd.range_end {
                    None => BatchOp::Delete {
                        key: self.key_buf.clone(),
                    },
                    Some(end) => {
                        let upper = if keys::is_wildcard(end) {
                            USER_KEY_UPPER_BOUND.to_vec()
                        } else {
                            keys::user_key(end)
                        };
                        BatchOp::DeleteRange {
                            start: self.key_buf.clone(),
                            end: upper,
                        }
                    }
                };
                self.push(op)?;
                Ok(success())
            }
            CommandType::PutBatch => {
                for kv in &cmd.batch {
                    encode_user_key(&mut self.key_buf, &kv.key);
                    let op = BatchOp::Set {
                        key: self.key_buf.clone(),
                        value: kv.value.clone(),
                    };
                    self.push(op)?;
                }
                Ok(success())
            }
            CommandType::DeleteBatch => {
                for kv in &cmd.batch {
                    encode_user_key(&mut self.key_buf, &kv.key);
                    let op = BatchOp::Delete {
                        key: self.key_buf.clone(),
                    };
                    self.push(op)?;
                }
                Ok(success())
            }
            CommandType::Txn => {
                let txn = cmd.txn.as_ref().context("txn command without body")?;
                let result = execute_txn(self, txn)?;
                Ok(EntryResult {
                    value: if result.succeeded {
                        RESULT_SUCCESS
                    } else {
                        RESULT_FAILURE
                    },
                    data: result.encode(),
                })
            }
            CommandType::Dummy => Ok(success()),
        }
    }

    pub(crate) fn push(&mut self, op: BatchOp) -> anyhow::Result<()> {
        match &mut self.pending {
            Pending::Plain(ops) => ops.push(op),
            Pending::Indexed(overlay) => overlay.apply(op, &self.snapshot)?,
        }
        Ok(())
    }

    /// Upgrade the plain op list into the indexed overlay so reads can
    /// observe buffered writes. Idempotent.
    pub(crate) fn ensure_indexed(&mut self) -> anyhow::Result<()> {
        if let Pending::Plain(ops) = &mut self.pending {
            let ops = std::mem::take(ops);
            let mut overlay = Overlay::default();
            for op in ops {
                overlay.apply(op, &self.snapshot)?;
            }
            self.pending = Pending::Indexed(overlay);
        }
        Ok(())
    }

    pub(crate) fn overlay(&self) -> Option<&Overlay> {
        match &self.pending {
            Pending::Plain(_) => None,
            Pending::Indexed(overlay) => Some(overlay),
        }
    }

    pub(crate) fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        match &self.pending {
            Pending::Indexed(overlay) => overlay.get(&self.snapshot, key),
            Pending::Plain(_) => Ok(self.snapshot.get(key)?.map(|value| value.to_vec())),
        }
    }

    /// `sys.local_index` as of the start of this batch.
    pub(crate) fn pre_local_index(&self) -> anyhow::Result<u64> {
        read_sys_u64_snapshot(&self.snapshot, &SYS_LOCAL_INDEX)
    }

    /// `sys.leader_index` as of the start of this batch.
    pub(crate) fn pre_leader_index(&self) -> anyhow::Result<u64> {
        read_sys_u64_snapshot(&self.snapshot, &SYS_LEADER_INDEX)
    }

    /// Write the batch plus the system index keys and make it durable.
    pub(crate) fn commit(mut self, leader_index: Option<u64>, index: u64) -> anyhow::Result<()> {
        self.ensure_indexed()?;
        let overlay = match self.pending {
            Pending::Indexed(overlay) => overlay,
            Pending::Plain(_) => unreachable!("batch indexed above"),
        };

        let mut batch = self.keyspace.batch();
        for (key, value) in overlay.entries {
            match value {
                Some(value) => batch.insert(self.partition, key, value),
                None => batch.remove(self.partition, key),
            }
        }
        if let Some(leader_index) = leader_index {
            batch.insert(
                self.partition,
                SYS_LEADER_INDEX.to_vec(),
                leader_index.to_le_bytes().to_vec(),
            );
        }
        batch.insert(
            self.partition,
            SYS_LOCAL_INDEX.to_vec(),
            index.to_le_bytes().to_vec(),
        );
        batch.commit().context("commit batch")?;
        self.keyspace
            .persist(PersistMode::SyncAll)
            .context("persist batch")?;
        Ok(())
    }
}

pub(crate) fn read_sys_u64_snapshot(snapshot: &Snapshot, key: &[u8]) -> anyhow::Result<u64> {
    match snapshot.get(key)? {
        None => Ok(0),
        Some(raw) => {
            ensure!(raw.len() == 8, "malformed system index value");
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&raw);
            Ok(u64::from_le_bytes(buf))
        }
    }
}
