//! Raft library integration surface.
//!
//! Regatta consumes a Raft implementation as a library; this crate pins
//! down the contract the storage layer relies on. The API surface is
//! intentionally small: the storage layer supplies a [`StateMachine`]
//! per shard replica and drives proposals and reads through a
//! [`RaftHost`], while the library reports lifecycle changes through
//! [`SystemEvents`] and exposes its committed log via [`LogQuerier`].

mod events;
mod host;
mod sm;
mod types;

pub use events::SystemEvents;
pub use host::{LogQuerier, LogReader, RaftError, RaftHost, StateMachineFactory};
pub use sm::{EntryResult, SnapshotContext, StateMachine};
pub use types::{Entry, EntryInfo, LogRange, NodeInfo, ReplicaConfig, ReplicaId, ShardId, ShardInfo};
