//! Content-addressed, append-only pack store with concurrent mark-and-copy
//! garbage collection.
//!
//! A store directory holds a control file (current layout and GC status),
//! a dict (interned strings), a chunked suffix (the live, still-growing
//! tail of the pack), and, once at least one GC cycle has run, a prefix
//! and a mapping that redirect pre-GC offsets into it. The [`FileManager`]
//! owns all of these; [`PackStore`] is the entry point most callers want.
//!
//! Garbage collection itself runs out of process (see the `pack-gc`
//! crate); this crate only owns the single-writer side of the protocol:
//! producing a GC root, and, once a GC worker reports success, swapping
//! the new prefix and mapping in via [`FileManager::swap`].

pub mod append_only;
pub mod control;
pub mod dict;
pub mod dispatcher;
pub mod error;
pub mod file_manager;
pub mod index;
pub mod lru;
pub mod mapping;
pub mod pack_store;
pub mod prefix;
pub mod suffix;
mod util;

pub use error::{Error, Result};
pub use file_manager::{FileManager, FileManagerConfig};
pub use index::IndexingStrategy;
pub use pack_store::{IntegrityReport, PackStore};
