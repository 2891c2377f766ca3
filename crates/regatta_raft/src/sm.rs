//! The replicated state machine contract.

use std::any::Any;
use std::io::{Read, Write};
use std::sync::atomic::AtomicBool;

use crate::types::Entry;

/// Result of applying a single log entry.
///
/// `value` is a small status word (commands use `1` for success); richer
/// results (transaction outcomes) are carried as encoded bytes in `data`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntryResult {
    pub value: u64,
    pub data: Vec<u8>,
}

/// Opaque handle capturing an immutable point-in-time view of a state
/// machine, produced by [`StateMachine::prepare_snapshot`] and consumed
/// by [`StateMachine::save_snapshot`].
pub type SnapshotContext = Box<dyn Any + Send>;

/// A deterministic state machine fed by one shard's applied log.
///
/// The library calls `update` from a single thread per shard and never
/// concurrently with `open`, `recover_from_snapshot` or `close`.
/// `lookup`, `prepare_snapshot` and `save_snapshot` may run concurrently
/// with `update`; implementations must serve them from stable snapshots.
///
/// Requests and responses of `lookup` are opaque bytes so the library
/// can stay agnostic of the state machine's query language.
pub trait StateMachine: Send + Sync {
    /// Open or create the backing store and return the index of the last
    /// entry this state machine has durably applied (0 for a fresh store).
    fn open(&mut self) -> anyhow::Result<u64>;

    /// Apply a contiguous, strictly increasing run of committed entries
    /// in one atomic step and return one result per entry. On error no
    /// entry of the run may have been made durable.
    fn update(&mut self, entries: &[Entry]) -> anyhow::Result<Vec<EntryResult>>;

    /// Serve a read-only query against committed state. Must never
    /// observe a partially applied `update` batch.
    fn lookup(&self, query: &[u8]) -> anyhow::Result<Vec<u8>>;

    /// Capture an immutable view of the current state for streaming.
    fn prepare_snapshot(&self) -> anyhow::Result<SnapshotContext>;

    /// Stream the prepared view into `sink`. Implementations check
    /// `cancel` between chunks and abort promptly with a distinguished
    /// "stopped" error when it is raised.
    fn save_snapshot(
        &self,
        ctx: SnapshotContext,
        sink: &mut dyn Write,
        cancel: &AtomicBool,
    ) -> anyhow::Result<()>;

    /// Reset the store and rebuild it from a snapshot stream produced by
    /// `save_snapshot` on a peer. Honours `cancel` like `save_snapshot`.
    fn recover_from_snapshot(
        &mut self,
        source: &mut dyn Read,
        cancel: &AtomicBool,
    ) -> anyhow::Result<()>;

    /// Release the backing store.
    fn close(&mut self) -> anyhow::Result<()>;

    /// Deterministic content hash over applied state, equal on any two
    /// replicas that applied the same log prefix.
    fn get_hash(&self) -> anyhow::Result<u64>;
}
