//! Error taxonomy for the GC worker and orchestrator (spec §4.10/§4.11).

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] pack_store::Error),

    #[error("GC root commit {0} is dangling (already garbage collected)")]
    RootIsDangling(String),

    #[error("GC root commit {0} was not found in the store")]
    RootNotFound(String),

    #[error("GC worker for generation {0} is already running")]
    AlreadyRunning(u64),

    #[error("no GC result file found at {0:?}")]
    MissingResult(PathBuf),

    #[error("GC result file at {0:?} is corrupted: {1}")]
    CorruptedResult(PathBuf, String),

    #[error("GC worker for generation {0} failed: {1}")]
    WorkerFailed(u64, String),

    #[error(
        "chunk-num reconciliation failed: orchestrator expected {expected} live suffix chunks, found {actual}"
    )]
    ChunkReconciliation { expected: u32, actual: u32 },

    #[error("GC was cancelled")]
    Cancelled,

    #[error("background task panicked or was dropped: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;
