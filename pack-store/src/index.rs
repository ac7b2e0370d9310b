//! On-disk hash index (spec §4.6): maps a content hash to where its entry
//! lives in the pack, for the first lookup of a key before its
//! [`pack_format::PackKey`] has been promoted to `Direct`.
//!
//! Two strategies govern what gets indexed. `Always` indexes every entry;
//! `Minimal` indexes only commits, since every other kind is reachable from
//! an already-resolved parent. Garbage collection only preserves hashes it
//! walks from the GC root commit and re-adds to the index, so a store under
//! `Always` would accumulate index entries pointing at ranges no longer in
//! any prefix: GC is therefore only allowed under `Minimal` (spec §6).

use std::collections::HashMap;

use pack_format::{Kind, PackHash, HASH_SIZE};

use crate::append_only::{AppendOnly, AutoFlushProcedure};
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexingStrategy {
    Minimal,
    Always,
}

impl IndexingStrategy {
    pub fn should_index(self, kind: Kind) -> bool {
        match self {
            IndexingStrategy::Always => true,
            IndexingStrategy::Minimal => kind.is_commit(),
        }
    }

    pub fn is_gc_compatible(self) -> bool {
        matches!(self, IndexingStrategy::Minimal)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub offset: u64,
    pub length: u32,
    pub kind: Kind,
}

const RECORD_SIZE: usize = HASH_SIZE + 8 + 4 + 1;

pub trait Index: Send {
    fn find(&self, hash: &PackHash) -> Option<IndexEntry>;
    fn add(&mut self, hash: PackHash, entry: IndexEntry) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    fn reload(&mut self) -> Result<()>;
    fn mem(&self, hash: &PackHash) -> bool {
        self.find(hash).is_some()
    }
}

/// Flat append-only index: an in-memory `HashMap` backed by a simple
/// on-disk log of `(hash, offset, length, kind)` records. The whole log is
/// replayed on open; later records for the same hash win, so re-indexing
/// after a GC cycle (offsets move) is a plain append.
pub struct FlatIndex {
    ao: AppendOnly,
    map: HashMap<PackHash, IndexEntry>,
    loaded_up_to: u64,
}

impl FlatIndex {
    pub fn create_rw(
        path: impl Into<std::path::PathBuf>,
        auto_flush_threshold: usize,
        auto_flush_procedure: AutoFlushProcedure,
    ) -> Result<Self> {
        let ao = AppendOnly::create_rw(path, auto_flush_threshold, auto_flush_procedure)?;
        Ok(Self {
            ao,
            map: HashMap::new(),
            loaded_up_to: 0,
        })
    }

    pub fn open_rw(
        path: impl Into<std::path::PathBuf>,
        persisted_len: u64,
        auto_flush_threshold: usize,
        auto_flush_procedure: AutoFlushProcedure,
    ) -> Result<Self> {
        let ao = AppendOnly::open_rw(path, persisted_len, auto_flush_threshold, auto_flush_procedure)?;
        let mut idx = Self {
            ao,
            map: HashMap::new(),
            loaded_up_to: 0,
        };
        idx.load_up_to(persisted_len)?;
        Ok(idx)
    }

    pub fn open_ro(path: impl Into<std::path::PathBuf>) -> Result<Self> {
        let ao = AppendOnly::open_ro(path)?;
        let end = ao.end_poff();
        let mut idx = Self {
            ao,
            map: HashMap::new(),
            loaded_up_to: 0,
        };
        idx.load_up_to(end)?;
        Ok(idx)
    }

    fn load_up_to(&mut self, end: u64) -> Result<()> {
        while self.loaded_up_to < end {
            let mut rec = [0u8; RECORD_SIZE];
            self.ao.read_at(&mut rec, self.loaded_up_to)?;
            let hash = PackHash::new(rec[0..HASH_SIZE].try_into().unwrap());
            let offset = u64::from_le_bytes(rec[HASH_SIZE..HASH_SIZE + 8].try_into().unwrap());
            let length = u32::from_le_bytes(rec[HASH_SIZE + 8..HASH_SIZE + 12].try_into().unwrap());
            let kind = Kind::from_u8(rec[HASH_SIZE + 12])
                .ok_or_else(|| Error::CorruptedStore("unknown kind byte in index record".into()))?;
            self.map.insert(hash, IndexEntry { offset, length, kind });
            self.loaded_up_to += RECORD_SIZE as u64;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn close(&mut self) -> Result<()> {
        self.ao.close()
    }
}

impl Index for FlatIndex {
    fn find(&self, hash: &PackHash) -> Option<IndexEntry> {
        self.map.get(hash).copied()
    }

    fn add(&mut self, hash: PackHash, entry: IndexEntry) -> Result<()> {
        let mut rec = Vec::with_capacity(RECORD_SIZE);
        rec.extend_from_slice(hash.as_bytes());
        rec.extend_from_slice(&entry.offset.to_le_bytes());
        rec.extend_from_slice(&entry.length.to_le_bytes());
        rec.push(entry.kind.to_u8());
        self.ao.append_exn(&rec)?;
        self.loaded_up_to += RECORD_SIZE as u64;
        self.map.insert(hash, entry);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.ao.flush()
    }

    fn reload(&mut self) -> Result<()> {
        let end = self.ao.end_poff();
        self.load_up_to(end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_find_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut idx = FlatIndex::create_rw(dir.path().join("index"), 4096, AutoFlushProcedure::Internal).unwrap();
        let hash = PackHash::of_data(b"payload");
        idx.add(
            hash,
            IndexEntry {
                offset: 10,
                length: 20,
                kind: Kind::Contents,
            },
        )
        .unwrap();
        let found = idx.find(&hash).unwrap();
        assert_eq!(found.offset, 10);
        assert_eq!(found.length, 20);
    }

    #[test]
    fn minimal_strategy_only_indexes_commits() {
        assert!(IndexingStrategy::Minimal.should_index(Kind::CommitV2));
        assert!(!IndexingStrategy::Minimal.should_index(Kind::Contents));
        assert!(IndexingStrategy::Always.should_index(Kind::Contents));
        assert!(IndexingStrategy::Minimal.is_gc_compatible());
        assert!(!IndexingStrategy::Always.is_gc_compatible());
    }

    #[test]
    fn reopen_after_flush_replays_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index");
        let mut idx = FlatIndex::create_rw(&path, 4096, AutoFlushProcedure::Internal).unwrap();
        let hash = PackHash::of_data(b"a");
        idx.add(
            hash,
            IndexEntry {
                offset: 1,
                length: 2,
                kind: Kind::CommitV2,
            },
        )
        .unwrap();
        idx.flush().unwrap();
        drop(idx);

        let reopened = FlatIndex::open_ro(&path).unwrap();
        assert_eq!(reopened.find(&hash).unwrap().offset, 1);
    }
}
