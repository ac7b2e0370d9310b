//! Pack Store (spec §4.9): the public surface layered over the File
//! Manager. Resolves [`pack_format::PackKey`]s to their entries, decides
//! when to consult the on-disk index versus a key's own promoted offset,
//! and maintains the weighted LRU read cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use pack_format::{EntryPrefix, Kind, PackHash, PackKey, PackKeyState};

use crate::error::{Error, Result};
use crate::file_manager::FileManager;
use crate::index::IndexEntry;
use crate::lru::{Weighted, WeightedLruCache};

pub struct CachedEntry {
    pub kind: Kind,
    pub payload: Arc<[u8]>,
}

impl Weighted for CachedEntry {
    fn weight(&self) -> usize {
        self.payload.len()
    }
}

const DEFAULT_CACHE_CAPACITY_BYTES: usize = 64 * 1024 * 1024;

pub struct PackStore {
    fm: Arc<FileManager>,
    lru: Mutex<WeightedLruCache<u64, CachedEntry>>,
    /// Hashes written but not yet promoted into the index (e.g. a batch
    /// still open), kept so `mem`/`find` can see them before a flush.
    staging: Mutex<HashMap<PackHash, (u64, u32, Kind)>>,
}

impl PackStore {
    pub fn new(fm: Arc<FileManager>) -> Self {
        Self::with_cache_capacity(fm, DEFAULT_CACHE_CAPACITY_BYTES)
    }

    pub fn with_cache_capacity(fm: Arc<FileManager>, cache_capacity_bytes: usize) -> Self {
        Self {
            fm,
            lru: Mutex::new(WeightedLruCache::new(cache_capacity_bytes)),
            staging: Mutex::new(HashMap::new()),
        }
    }

    fn resolve_offset(&self, key: &PackKey) -> Result<Option<(u64, u32, Kind)>> {
        if let Some((offset, length)) = key.offset_length() {
            // direct key: kind unknown until we read the prefix once, but
            // callers that only need offset/length can stop here.
            let mut hdr = vec![0u8; pack_format::ENTRY_PREFIX_MAX_LEN.min(length as usize)];
            self.fm.read_at(&mut hdr, offset)?;
            let prefix = EntryPrefix::decode(&hdr)?;
            return Ok(Some((offset, length, prefix.kind)));
        }
        if let Some((offset, length, kind)) = self.staging.lock().unwrap().get(&key.hash()).copied() {
            key.promote(offset, length as u32);
            return Ok(Some((offset, length as u32, kind)));
        }
        if let Some(IndexEntry { offset, length, kind }) = self.fm.index_find(&key.hash()) {
            key.promote(offset, length);
            return Ok(Some((offset, length, kind)));
        }
        Ok(None)
    }

    /// A hash is a member only if it resolves to a real entry: a
    /// `Dangling_parent_commit` stub (a placeholder for a parent commit
    /// GC already reclaimed) resolves but is never real content, so it is
    /// reported absent (spec §4.9).
    pub fn mem(&self, key: &PackKey) -> Result<bool> {
        match self.resolve_offset(key)? {
            Some((_, _, kind)) => Ok(kind != Kind::DanglingParentCommit),
            None => Ok(false),
        }
    }

    /// Look up the on-disk index directly, bypassing a key's own promoted
    /// offset. Used by integrity checks and GC marking, which need to know
    /// whether a hash is *indexed*, not merely resolvable.
    pub fn index(&self, hash: &PackHash) -> Option<IndexEntry> {
        self.fm.index_find(hash)
    }

    pub fn find(&self, key: &PackKey) -> Result<Option<(Kind, Arc<[u8]>)>> {
        let Some((offset, length, kind)) = self.resolve_offset(key)? else {
            return Ok(None);
        };
        if let Some(cached) = self.lru.lock().unwrap().get_mut(offset) {
            return Ok(Some((cached.kind, cached.payload.clone())));
        }

        let mut buf = vec![0u8; length as usize];
        self.fm.read_at(&mut buf, offset)?;
        let prefix = EntryPrefix::decode(&buf)?;
        if prefix.hash != key.hash() {
            return Err(Error::CorruptedStore(format!(
                "entry at offset {offset} has hash {} but was looked up as {}",
                prefix.hash,
                key.hash()
            )));
        }
        let payload: Arc<[u8]> = Arc::from(&buf[prefix.payload_offset..]);
        self.lru.lock().unwrap().insert(
            offset,
            CachedEntry {
                kind,
                payload: payload.clone(),
            },
        );
        Ok(Some((kind, payload)))
    }

    /// Append a new entry. Returns a freshly minted `Direct` key — unless
    /// `hash` is already indexed, in which case the existing entry is
    /// reused and nothing is appended (spec §4.9 `ensure_unique`). Indexes
    /// the hash immediately only when the configured strategy calls for
    /// it; otherwise the hash stays resolvable only via `staging` until a
    /// reload makes a future index lookup unnecessary (the key itself
    /// already carries its offset).
    pub fn add(&self, hash: PackHash, kind: Kind, payload: &[u8]) -> Result<PackKey> {
        let use_index = self.fm.indexing_strategy().should_index(kind);
        if use_index && self.mem(&PackKey::indexed(hash))? {
            return Ok(PackKey::indexed(hash));
        }

        let mut buf = Vec::with_capacity(payload.len() + 64);
        pack_format::encode_entry(hash, kind, payload, &mut buf);
        let offset = self.fm.append_entry(&buf)?;
        let length = buf.len() as u32;

        if use_index {
            self.fm.index_add(hash, IndexEntry { offset, length, kind })?;
        } else {
            self.staging.lock().unwrap().insert(hash, (offset, length, kind));
        }

        Ok(PackKey::direct(hash, offset, length))
    }

    pub fn batch<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        self.fm.begin_batch()?;
        let result = f();
        self.fm.end_batch()?;
        self.staging.lock().unwrap().clear();
        result
    }

    /// Walk every entry from the live start of the suffix to its end,
    /// verifying that each decodes to a well-formed prefix and that its
    /// stored hash matches its payload.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let mut report = IntegrityReport::default();
        let mut offset = self.live_start()?;
        let end = self.fm.end_poff();

        while offset < end {
            let mut hdr = vec![0u8; pack_format::ENTRY_PREFIX_MAX_LEN.min((end - offset) as usize)];
            self.fm.read_at(&mut hdr, offset)?;
            let prefix = match EntryPrefix::decode(&hdr) {
                Ok(p) => p,
                Err(e) => {
                    report.errors.push(format!("offset {offset}: {e}"));
                    break;
                }
            };
            let Some(total_length) = prefix.total_length else {
                report
                    .errors
                    .push(format!("offset {offset}: dangling parent commit found on disk"));
                break;
            };

            let mut full = vec![0u8; total_length as usize];
            self.fm.read_at(&mut full, offset)?;
            let payload = &full[prefix.payload_offset..];
            if prefix.kind == Kind::Contents && PackHash::of_data(payload) != prefix.hash {
                report
                    .errors
                    .push(format!("offset {offset}: payload hash does not match stored hash"));
            }
            report.entries_checked += 1;
            offset += total_length;
        }
        Ok(report)
    }

    fn live_start(&self) -> Result<u64> {
        Ok(self.fm.live_start())
    }

    /// Drop cached entries until the cache's total weight is at or below
    /// `target_weight`. The weighted LRU only exposes whole-cache
    /// eviction via `insert`, so an over-target cache is simply cleared
    /// rather than trimmed entry by entry.
    pub fn purge_lru(&self, target_weight: usize) {
        let mut lru = self.lru.lock().unwrap();
        if lru.total_weight() > target_weight {
            lru.clear();
        }
    }
}

#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub entries_checked: u64,
    pub errors: Vec<String>,
}

impl IntegrityReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_manager::{FileManager, FileManagerConfig};

    #[test]
    fn add_then_find_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let fm = FileManager::create_rw(dir.path(), FileManagerConfig::default()).unwrap();
        let store = PackStore::new(fm);

        let hash = PackHash::of_data(b"contents");
        let key = store.add(hash, Kind::Contents, b"contents").unwrap();

        assert!(store.mem(&key).unwrap());
        let (kind, payload) = store.find(&key).unwrap().unwrap();
        assert_eq!(kind, Kind::Contents);
        assert_eq!(&*payload, b"contents");
    }

    #[test]
    fn add_twice_is_idempotent_for_indexed_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let fm = FileManager::create_rw(dir.path(), FileManagerConfig::default()).unwrap();
        let store = PackStore::new(fm.clone());

        let hash = PackHash::of_data(b"commit-payload");
        let first = store.add(hash, Kind::CommitV2, b"commit-payload").unwrap();
        let end_poff_after_first = fm.end_poff();

        let second = store.add(hash, Kind::CommitV2, b"commit-payload").unwrap();
        assert_eq!(fm.end_poff(), end_poff_after_first, "second add must not append");
        assert_eq!(first.hash(), second.hash());
    }

    #[test]
    fn mem_rejects_dangling_parent_commit() {
        let dir = tempfile::tempdir().unwrap();
        let fm = FileManager::create_rw(dir.path(), FileManagerConfig::default()).unwrap();
        let store = PackStore::new(fm);

        let hash = PackHash::of_data(b"orphaned-parent");
        let key = store.add(hash, Kind::DanglingParentCommit, b"").unwrap();
        assert!(!store.mem(&key).unwrap());
    }

    #[test]
    fn integrity_check_accepts_freshly_written_store() {
        let dir = tempfile::tempdir().unwrap();
        let fm = FileManager::create_rw(dir.path(), FileManagerConfig::default()).unwrap();
        let store = PackStore::new(fm);

        let hash = PackHash::of_data(b"a");
        store.add(hash, Kind::Contents, b"a").unwrap();
        let hash2 = PackHash::of_data(b"bb");
        store.add(hash2, Kind::Contents, b"bb").unwrap();

        let report = store.integrity_check().unwrap();
        assert!(report.is_ok(), "{:?}", report.errors);
        assert_eq!(report.entries_checked, 2);
    }

    #[test]
    fn batch_flushes_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let fm = FileManager::create_rw(dir.path(), FileManagerConfig::default()).unwrap();
        let store = PackStore::new(fm.clone());

        let hash = PackHash::of_data(b"batched");
        store
            .batch(|| {
                store.add(hash, Kind::Contents, b"batched")?;
                Ok(())
            })
            .unwrap();

        assert!(!fm.batch_in_progress());
    }
}
