//! Error taxonomy surfaced by the storage layer.

use regatta_raft::RaftError;

/// Errors returned across the storage public surface.
///
/// The first group are control-plane preconditions surfaced directly to
/// callers; the log/snapshot group instructs downstream consumers to
/// snapshot or wait; `Unavailable` wraps transient infrastructure
/// failures (deadlines, leadership churn); everything else lands in
/// `Other`.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("table already exists")]
    TableExists,
    #[error("table not found")]
    TableNotFound,
    #[error("lease not acquired")]
    LeaseNotAcquired,

    #[error("local log is behind the requested range")]
    LogBehind,
    #[error("requested log prefix has been compacted")]
    LogAhead,
    #[error("shard not ready")]
    ShardNotReady,

    #[error("manager closed")]
    ManagerClosed,
    #[error("operation stopped")]
    Stopped,

    #[error("key not found")]
    KeyNotFound,
    #[error("version mismatch")]
    VersionMismatch,

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<RaftError> for StorageError {
    fn from(err: RaftError) -> Self {
        match err {
            RaftError::ShardNotFound(_) | RaftError::ShardNotReady(_) => {
                StorageError::ShardNotReady
            }
            RaftError::Timeout => StorageError::Unavailable("request timed out".to_string()),
            RaftError::Closed => StorageError::Unavailable("raft host closed".to_string()),
            RaftError::Other(err) => StorageError::Other(err),
        }
    }
}

/// Whether an error chain bottoms out in the distinguished "stopped"
/// cancellation error of snapshot save/recover.
pub fn is_stopped(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<StorageError>()
            .is_some_and(|e| matches!(e, StorageError::Stopped))
    })
}
