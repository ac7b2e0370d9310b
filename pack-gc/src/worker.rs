//! The GC worker's four phases (spec §4.10): Mark, Sort & coalesce, Copy,
//! Report. Runs out of process from the writer, against a read-only view
//! of the store it was handed a root commit offset into.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pack_format::{EntryPrefix, Kind, PackHash};
use pack_store::mapping::{Mapping, MappingEntry};
use pack_store::prefix::Prefix;
use pack_store::{FileManager, PackStore};

use crate::error::Result;

/// The pack layer has no notion of a tree or commit graph; the caller
/// supplies how to find the objects one entry's payload references.
pub trait ObjectGraph: Send + Sync {
    fn direct_children(&self, kind: Kind, payload: &[u8]) -> Vec<u64>;
}

#[derive(Debug, Clone, Default)]
pub struct GcStats {
    pub objects_marked: u64,
    pub objects_copied: u64,
    pub bytes_copied: u64,
    /// Offset immediately past the root commit's entry, i.e.
    /// `root_offset + root_length`. The new suffix's logical stream picks
    /// up from here once the worker's prefix takes over everything before
    /// it (spec §4.10).
    pub root_end_offset: u64,
}

#[derive(Debug)]
struct LiveObject {
    offset: u64,
    length: u32,
}

pub struct GcWorker {
    fm: Arc<FileManager>,
    store: Arc<PackStore>,
    graph: Arc<dyn ObjectGraph>,
}

impl GcWorker {
    pub fn new(fm: Arc<FileManager>, store: Arc<PackStore>, graph: Arc<dyn ObjectGraph>) -> Self {
        Self { fm, store, graph }
    }

    /// Walk every object reachable from `root_offset`, returning them
    /// sorted by offset, plus the root entry's own length. Visits each
    /// offset once regardless of in-degree.
    fn mark(&self, root_offset: u64) -> Result<(Vec<LiveObject>, u64)> {
        let mut visited = HashSet::new();
        let mut stack = vec![root_offset];
        let mut live = Vec::new();
        let mut root_length = 0u64;

        while let Some(offset) = stack.pop() {
            if !visited.insert(offset) {
                continue;
            }
            let mut hdr = vec![0u8; pack_format::ENTRY_PREFIX_MAX_LEN];
            self.fm.read_at(&mut hdr, offset)?;
            let prefix = EntryPrefix::decode(&hdr).map_err(pack_store::Error::from)?;
            let kind = prefix.kind.upgrade_dangling();
            // Dangling_parent_commit has no length header; its span is
            // unknown here and it is never itself copied, only referenced.
            let Some(total_length) = prefix.total_length else {
                continue;
            };

            if offset == root_offset {
                root_length = total_length;
            }

            live.push(LiveObject {
                offset,
                length: total_length as u32,
            });

            if kind.references_other_objects() {
                let mut full = vec![0u8; total_length as usize];
                self.fm.read_at(&mut full, offset)?;
                let payload = &full[prefix.payload_offset..];
                for child in self.graph.direct_children(kind, payload) {
                    stack.push(child);
                }
            }
        }

        live.sort_by_key(|o| o.offset);
        Ok((live, root_length))
    }

    /// Merge adjacent/overlapping live ranges into contiguous segments, so
    /// the copy phase reads/writes each stretch of bytes once.
    fn sort_and_coalesce(live: &[LiveObject]) -> Vec<(u64, u64)> {
        let mut segments: Vec<(u64, u64)> = Vec::new();
        for obj in live {
            let start = obj.offset;
            let end = obj.offset + obj.length as u64;
            match segments.last_mut() {
                Some((_, seg_end)) if start <= *seg_end => {
                    *seg_end = (*seg_end).max(end);
                }
                _ => segments.push((start, end)),
            }
        }
        segments
    }

    /// Stream the coalesced segments into a fresh prefix file, producing a
    /// mapping entry for every live object.
    fn copy(&self, live: &[LiveObject], prefix_path: &Path) -> Result<(Prefix, Mapping, GcStats)> {
        let segments = Self::sort_and_coalesce(live);
        let mut prefix = Prefix::create_rw(prefix_path)?;
        let mut mapping_entries = Vec::with_capacity(live.len());
        let mut stats = GcStats::default();

        let mut obj_iter = live.iter().peekable();
        for (seg_start, seg_end) in &segments {
            let seg_len = (seg_end - seg_start) as usize;
            let mut buf = vec![0u8; seg_len];
            self.fm.read_at(&mut buf, *seg_start)?;
            let dst_segment_start = prefix.len();
            prefix.append_exn(&buf)?;
            stats.bytes_copied += seg_len as u64;

            while let Some(obj) = obj_iter.peek() {
                if obj.offset >= *seg_end {
                    break;
                }
                let obj = obj_iter.next().unwrap();
                let dst_offset = dst_segment_start + (obj.offset - seg_start);
                mapping_entries.push(MappingEntry {
                    src_offset: obj.offset,
                    length: obj.length,
                    dst_offset,
                });
                stats.objects_copied += 1;
            }
        }
        stats.objects_marked = live.len() as u64;

        prefix.fsync()?;
        Ok((prefix, Mapping::new(mapping_entries), stats))
    }

    /// Run all three worker phases (mark, sort & coalesce, copy); writing
    /// the result descriptor (phase 4, "Report") is the orchestrator's job
    /// once this returns, so that a worker crash mid-copy never leaves a
    /// result file claiming success.
    pub fn run(&self, root_hash: PackHash, root_offset: u64, out_prefix_path: &Path) -> Result<(Prefix, Mapping, GcStats)> {
        log::info!("gc worker: marking from root {root_hash}");
        let (live, root_length) = self.mark(root_offset)?;
        log::info!("gc worker: {} objects marked, copying", live.len());
        let (prefix, mapping, mut stats) = self.copy(&live, out_prefix_path)?;
        stats.root_end_offset = root_offset + root_length;
        log::info!(
            "gc worker: copied {} objects, {} bytes",
            stats.objects_copied,
            stats.bytes_copied
        );
        let _ = self.store; // kept for API symmetry / future cache invalidation hooks
        Ok((prefix, mapping, stats))
    }
}

pub fn result_file_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("gc_result.{generation}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pack_store::file_manager::FileManagerConfig;

    struct NoRefs;
    impl ObjectGraph for NoRefs {
        fn direct_children(&self, _kind: Kind, _payload: &[u8]) -> Vec<u64> {
            Vec::new()
        }
    }

    #[test]
    fn mark_and_copy_single_object() {
        let dir = tempfile::tempdir().unwrap();
        let fm = FileManager::create_rw(dir.path(), FileManagerConfig::default()).unwrap();
        let store = Arc::new(PackStore::new(fm.clone()));

        let hash = PackHash::of_data(b"root-commit");
        let key = store.add(hash, Kind::CommitV2, b"root-commit").unwrap();
        store.batch(|| Ok(())).unwrap();

        let worker = GcWorker::new(fm.clone(), store, Arc::new(NoRefs));
        let (offset, _) = key.offset_length().unwrap();
        let out_path = dir.path().join("new-prefix");
        let (prefix, mapping, stats) = worker.run(hash, offset, &out_path).unwrap();

        assert_eq!(stats.objects_copied, 1);
        assert_eq!(mapping.len(), 1);
        assert!(prefix.len() > 0);
        assert_eq!(stats.root_end_offset, offset + prefix.len());
    }
}
