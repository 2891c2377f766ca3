//! Lifecycle event capabilities reported by the Raft library.

use crate::types::{EntryInfo, NodeInfo};

/// Subset of the library's system events the storage layer cares about.
///
/// Every method defaults to a no-op so consumers implement only the
/// events they consume; the library invokes these from its own threads
/// and expects them to return quickly.
pub trait SystemEvents: Send + Sync {
    /// A replica finished startup and is serving its shard.
    fn node_ready(&self, _info: NodeInfo) {}

    /// A replica was removed from this host.
    fn node_deleted(&self, _info: NodeInfo) {}

    /// The log prefix up to `info.index` was compacted away and is no
    /// longer readable from the log.
    fn log_compacted(&self, _info: EntryInfo) {}
}
