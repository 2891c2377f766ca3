//! Control-plane key-value store backed by the meta shard.
//!
//! The meta shard runs [`MetaFsm`], a linearizable string-pair state
//! machine with per-key compare-and-set versions. [`RaftMetaStore`]
//! is the client side: it proposes mutations through the Raft host and
//! serves reads through the read-index barrier, so every node observes
//! the same control-plane state.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use regatta_raft::{
    Entry, EntryResult, RaftHost, ShardId, SnapshotContext, StateMachine, StateMachineFactory,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::command::{RESULT_FAILURE, RESULT_SUCCESS};
use crate::errors::StorageError;

/// One stored pair plus its CAS version.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pair {
    pub key: String,
    pub value: String,
    pub ver: u64,
}

/// Versioned control-plane store.
///
/// `set` and `delete` take the version the caller last observed; a zero
/// version means "create only". Patterns passed to `get_all` support a
/// single trailing `*` matching one path segment.
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
    async fn get(&self, key: &str) -> Result<Pair, StorageError>;
    async fn get_all(&self, pattern: &str) -> Result<Vec<Pair>, StorageError>;
    async fn set(&self, key: &str, value: &str, ver: u64) -> Result<Pair, StorageError>;
    async fn delete(&self, key: &str, ver: u64) -> Result<(), StorageError>;
}

#[derive(Debug, Serialize, Deserialize)]
enum MetaCommand {
    Set { key: String, value: String, ver: u64 },
    Delete { key: String, ver: u64 },
}

#[derive(Debug, Serialize, Deserialize)]
enum MetaOutcome {
    Pair(Pair),
    NotFound,
    VersionMismatch,
}

#[derive(Debug, Serialize, Deserialize)]
enum MetaQuery {
    Exists(String),
    Get(String),
    GetAll(String),
}

#[derive(Debug, Serialize, Deserialize)]
enum MetaQueryResult {
    Exists(bool),
    Pair(Option<Pair>),
    Pairs(Vec<Pair>),
}

/// Whether `key` matches a store pattern: either an exact key or a
/// prefix with a trailing `*` spanning one path segment.
fn matches_pattern(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key
            .strip_prefix(prefix)
            .is_some_and(|rest| !rest.contains('/')),
        None => key == pattern,
    }
}

/// In-memory linearizable KV state machine for the meta shard. State is
/// rebuilt from the Raft log and snapshots; there is no local store.
#[derive(Default)]
pub struct MetaFsm {
    state: BTreeMap<String, Pair>,
    index: u64,
}

impl MetaFsm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory() -> Arc<dyn StateMachineFactory> {
        Arc::new(|_shard: ShardId, _replica: u64| Box::new(MetaFsm::new()) as Box<dyn StateMachine>)
    }

    fn apply(&mut self, cmd: MetaCommand) -> MetaOutcome {
        match cmd {
            MetaCommand::Set { key, value, ver } => {
                let next = match self.state.get(&key) {
                    None if ver == 0 => Pair {
                        key: key.clone(),
                        value,
                        ver: 1,
                    },
                    None => return MetaOutcome::VersionMismatch,
                    Some(current) if current.ver == ver => Pair {
                        key: key.clone(),
                        value,
                        ver: current.ver + 1,
                    },
                    Some(_) => return MetaOutcome::VersionMismatch,
                };
                self.state.insert(key, next.clone());
                MetaOutcome::Pair(next)
            }
            MetaCommand::Delete { key, ver } => match self.state.get(&key) {
                None => MetaOutcome::NotFound,
                Some(current) if current.ver == ver => {
                    let removed = self.state.remove(&key).unwrap_or_default();
                    MetaOutcome::Pair(removed)
                }
                Some(_) => MetaOutcome::VersionMismatch,
            },
        }
    }
}

impl StateMachine for MetaFsm {
    fn open(&mut self) -> anyhow::Result<u64> {
        Ok(self.index)
    }

    fn update(&mut self, entries: &[Entry]) -> anyhow::Result<Vec<EntryResult>> {
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            let cmd: MetaCommand =
                serde_json::from_slice(&entry.command).context("decode meta command")?;
            let outcome = self.apply(cmd);
            let value = match outcome {
                MetaOutcome::Pair(_) => RESULT_SUCCESS,
                MetaOutcome::NotFound | MetaOutcome::VersionMismatch => RESULT_FAILURE,
            };
            results.push(EntryResult {
                value,
                data: serde_json::to_vec(&outcome)?,
            });
            self.index = entry.index;
        }
        Ok(results)
    }

    fn lookup(&self, query: &[u8]) -> anyhow::Result<Vec<u8>> {
        let query: MetaQuery = serde_json::from_slice(query).context("decode meta query")?;
        let result = match query {
            MetaQuery::Exists(key) => MetaQueryResult::Exists(self.state.contains_key(&key)),
            MetaQuery::Get(key) => MetaQueryResult::Pair(self.state.get(&key).cloned()),
            MetaQuery::GetAll(pattern) => MetaQueryResult::Pairs(
                self.state
                    .values()
                    .filter(|pair| matches_pattern(&pattern, &pair.key))
                    .cloned()
                    .collect(),
            ),
        };
        Ok(serde_json::to_vec(&result)?)
    }

    fn prepare_snapshot(&self) -> anyhow::Result<SnapshotContext> {
        Ok(Box::new(MetaSnapshot {
            state: self.state.clone(),
            index: self.index,
        }))
    }

    fn save_snapshot(
        &self,
        ctx: SnapshotContext,
        sink: &mut dyn Write,
        _cancel: &AtomicBool,
    ) -> anyhow::Result<()> {
        let view = ctx
            .downcast::<MetaSnapshot>()
            .map_err(|_| anyhow!("unexpected snapshot context"))?;
        sink.write_all(&view.index.to_le_bytes())?;
        let payload = serde_json::to_vec(&view.state)?;
        sink.write_all(&(payload.len() as u32).to_be_bytes())?;
        sink.write_all(&payload)?;
        sink.flush()?;
        Ok(())
    }

    fn recover_from_snapshot(
        &mut self,
        source: &mut dyn Read,
        _cancel: &AtomicBool,
    ) -> anyhow::Result<()> {
        let mut index_buf = [0u8; 8];
        source.read_exact(&mut index_buf)?;
        let mut len_buf = [0u8; 4];
        source.read_exact(&mut len_buf)?;
        let mut payload = vec![0u8; u32::from_be_bytes(len_buf) as usize];
        source.read_exact(&mut payload)?;
        self.state = serde_json::from_slice(&payload)?;
        self.index = u64::from_le_bytes(index_buf);
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn get_hash(&self) -> anyhow::Result<u64> {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&serde_json::to_vec(&self.state)?);
        Ok(u64::from(hasher.finalize()))
    }
}

struct MetaSnapshot {
    state: BTreeMap<String, Pair>,
    index: u64,
}

/// Meta store client speaking to the meta shard through the Raft host.
pub struct RaftMetaStore {
    host: Arc<dyn RaftHost>,
    shard_id: ShardId,
    timeout: Duration,
}

impl RaftMetaStore {
    pub fn new(host: Arc<dyn RaftHost>, shard_id: ShardId) -> Self {
        Self {
            host,
            shard_id,
            timeout: Duration::from_secs(10),
        }
    }

    async fn propose(&self, cmd: MetaCommand) -> Result<MetaOutcome, StorageError> {
        let payload = serde_json::to_vec(&cmd).map_err(|err| anyhow!(err))?;
        let result = self.host.propose(self.shard_id, payload, self.timeout).await?;
        let outcome =
            serde_json::from_slice(&result.data).map_err(|err| anyhow!("meta outcome: {err}"))?;
        Ok(outcome)
    }

    async fn query(&self, query: MetaQuery) -> Result<MetaQueryResult, StorageError> {
        let payload = serde_json::to_vec(&query).map_err(|err| anyhow!(err))?;
        let raw = self.host.read(self.shard_id, payload, self.timeout).await?;
        let result =
            serde_json::from_slice(&raw).map_err(|err| anyhow!("meta query result: {err}"))?;
        Ok(result)
    }
}

#[async_trait]
impl MetaStore for RaftMetaStore {
    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self.query(MetaQuery::Exists(key.to_string())).await? {
            MetaQueryResult::Exists(exists) => Ok(exists),
            other => Err(unexpected(&other)),
        }
    }

    async fn get(&self, key: &str) -> Result<Pair, StorageError> {
        match self.query(MetaQuery::Get(key.to_string())).await? {
            MetaQueryResult::Pair(Some(pair)) => Ok(pair),
            MetaQueryResult::Pair(None) => Err(StorageError::KeyNotFound),
            other => Err(unexpected(&other)),
        }
    }

    async fn get_all(&self, pattern: &str) -> Result<Vec<Pair>, StorageError> {
        match self.query(MetaQuery::GetAll(pattern.to_string())).await? {
            MetaQueryResult::Pairs(pairs) => Ok(pairs),
            other => Err(unexpected(&other)),
        }
    }

    async fn set(&self, key: &str, value: &str, ver: u64) -> Result<Pair, StorageError> {
        let cmd = MetaCommand::Set {
            key: key.to_string(),
            value: value.to_string(),
            ver,
        };
        match self.propose(cmd).await? {
            MetaOutcome::Pair(pair) => Ok(pair),
            MetaOutcome::NotFound => Err(StorageError::KeyNotFound),
            MetaOutcome::VersionMismatch => Err(StorageError::VersionMismatch),
        }
    }

    async fn delete(&self, key: &str, ver: u64) -> Result<(), StorageError> {
        let cmd = MetaCommand::Delete {
            key: key.to_string(),
            ver,
        };
        match self.propose(cmd).await? {
            MetaOutcome::Pair(_) => Ok(()),
            MetaOutcome::NotFound => Err(StorageError::KeyNotFound),
            MetaOutcome::VersionMismatch => Err(StorageError::VersionMismatch),
        }
    }
}

fn unexpected(result: &MetaQueryResult) -> StorageError {
    StorageError::Other(anyhow!("unexpected meta query result: {result:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, cmd: &MetaCommand) -> Entry {
        Entry {
            index,
            term: 1,
            command: serde_json::to_vec(cmd).unwrap(),
        }
    }

    #[test]
    fn cas_create_then_update() {
        let mut fsm = MetaFsm::new();
        let results = fsm
            .update(&[entry(
                1,
                &MetaCommand::Set {
                    key: "/tables/foo".into(),
                    value: "a".into(),
                    ver: 0,
                },
            )])
            .unwrap();
        assert_eq!(results[0].value, RESULT_SUCCESS);

        // Re-creating at version 0 collides.
        let results = fsm
            .update(&[entry(
                2,
                &MetaCommand::Set {
                    key: "/tables/foo".into(),
                    value: "b".into(),
                    ver: 0,
                },
            )])
            .unwrap();
        assert_eq!(results[0].value, RESULT_FAILURE);

        // Updating at the stored version succeeds and bumps it.
        let results = fsm
            .update(&[entry(
                3,
                &MetaCommand::Set {
                    key: "/tables/foo".into(),
                    value: "b".into(),
                    ver: 1,
                },
            )])
            .unwrap();
        assert_eq!(results[0].value, RESULT_SUCCESS);
        let outcome: MetaOutcome = serde_json::from_slice(&results[0].data).unwrap();
        match outcome {
            MetaOutcome::Pair(pair) => assert_eq!(pair.ver, 2),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn pattern_matches_single_segment() {
        assert!(matches_pattern("/tables/*", "/tables/foo"));
        assert!(!matches_pattern("/tables/*", "/tables/foo/lease"));
        assert!(!matches_pattern("/tables/*", "/tables/sys/idseq"));
        assert!(matches_pattern("/cleanup/1/*", "/cleanup/1/10001"));
        assert!(!matches_pattern("/cleanup/1/*", "/cleanup/2/10001"));
        assert!(matches_pattern("/tables/foo", "/tables/foo"));
    }

    #[test]
    fn snapshot_round_trip() {
        let mut fsm = MetaFsm::new();
        fsm.update(&[
            entry(
                1,
                &MetaCommand::Set {
                    key: "/tables/a".into(),
                    value: "1".into(),
                    ver: 0,
                },
            ),
            entry(
                2,
                &MetaCommand::Set {
                    key: "/tables/b".into(),
                    value: "2".into(),
                    ver: 0,
                },
            ),
        ])
        .unwrap();

        let ctx = fsm.prepare_snapshot().unwrap();
        let mut buf = Vec::new();
        let cancel = AtomicBool::new(false);
        fsm.save_snapshot(ctx, &mut buf, &cancel).unwrap();

        let mut restored = MetaFsm::new();
        restored
            .recover_from_snapshot(&mut buf.as_slice(), &cancel)
            .unwrap();
        assert_eq!(restored.index, 2);
        assert_eq!(restored.get_hash().unwrap(), fsm.get_hash().unwrap());
    }
}
