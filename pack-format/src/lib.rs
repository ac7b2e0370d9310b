//! Shared data model for the packstore workspace: hashes, pack keys, entry
//! kinds, and the entry-prefix/varint wire format (spec §3 and §6).
//!
//! This crate is intentionally small and dependency-light so every other
//! crate in the workspace (`pack-io`, `pack-store`, `pack-gc`) can agree on
//! exactly one definition of "what a pack entry looks like on disk".

pub mod entry;
pub mod hash;
pub mod key;
pub mod kind;
pub mod varint;

pub use entry::{encode_entry, DecodeError, EntryPrefix, ENTRY_PREFIX_MAX_LEN};
pub use hash::{PackHash, HASH_SIZE};
pub use key::{PackKey, PackKeyState};
pub use kind::Kind;
