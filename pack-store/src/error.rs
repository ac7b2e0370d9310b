//! Closed error taxonomy for the store (spec §4.12 / §7).
//!
//! IO-level failures (`Double_close`, `Read_out_of_bounds`, ...) are
//! produced by `pack-io` and wrapped here rather than re-declared, so there
//! is exactly one definition of each.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // -- IO, forwarded from pack-io -----------------------------------
    #[error(transparent)]
    Io(#[from] pack_io::Error),

    // -- Control ---------------------------------------------------------
    #[error("corrupted control file at {0:?}")]
    CorruptedControlFile(PathBuf),
    #[error("control file at {0:?} was written by a newer, unknown major pack version")]
    V3StoreFromTheFuture(PathBuf),
    #[error("unknown major pack version {0}")]
    UnknownMajorPackVersion(u8),
    #[error("invalid on-disk layout at {0:?}: {1}")]
    InvalidLayout(PathBuf, String),
    #[error("store at {0:?} requires a migration before it can be opened")]
    MigrationNeeded(PathBuf),

    // -- Strategy ----------------------------------------------------
    #[error("garbage collection requires the minimal indexing strategy")]
    OnlyMinimalIndexingStrategyAllowed,
    #[error("garbage collection is disallowed: {0}")]
    GcDisallowed(String),
    #[error("garbage collection is forbidden while a batch is in progress")]
    GcForbiddenDuringBatch,
    #[error("suffix split is forbidden while a batch is in progress")]
    SplitForbiddenDuringBatch,

    // -- Pack --------------------------------------------------------
    #[error("read of offset {offset} falls in a region already garbage collected")]
    InvalidReadOfGcedObject { offset: u64 },
    #[error("read into the prefix at unmapped offset {offset}")]
    InvalidPrefixRead { offset: u64 },
    #[error("mapping lookup for offset {offset} failed: {reason}")]
    InvalidMappingRead { offset: u64, reason: String },
    #[error("dangling key: {0}")]
    DanglingKey(String),
    #[error("commit key is dangling (not yet resolved to an offset)")]
    CommitKeyIsDangling,
    #[error("commit parent key is indexed, expected direct")]
    CommitParentKeyIsIndexed,

    // -- Lifecycle -----------------------------------------------------
    #[error("operation refused: a prior append-only buffer still has pending data to flush")]
    PendingFlush,
    #[error("read-only file manager does not allow this operation")]
    RoNotAllowed,
    #[error("store is closed")]
    Closed,
    #[error("store is in an inconsistent state: {0}")]
    InconsistentStore(String),

    // -- Fatal invariant violation --------------------------------------
    #[error("corrupted store: {0}")]
    CorruptedStore(String),

    #[error("entry decode error: {0}")]
    Decode(#[from] pack_format::DecodeError),
}

pub type Result<T> = std::result::Result<T, Error>;
