//! File Manager (spec §4.7): the component that owns every on-disk file of
//! a store instance (control, dict, suffix, prefix, mapping, index) and
//! coordinates opening, flushing, reloading and swapping them.
//!
//! Flushing happens in three stages, each one a prerequisite for the next:
//! dict, then suffix (whose entries may reference dict indices), then the
//! hash index (whose entries reference suffix/prefix offsets). The control
//! file is rewritten last of all, since it is what makes a flush durable
//! and visible to other readers.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use pack_format::PackHash;

use crate::append_only::{AutoFlushProcedure, FlushDependencies, FlushTarget, LateBound};
use crate::control::{ControlFile, Payload, Status};
use crate::dict::Dict;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::index::{FlatIndex, Index, IndexEntry, IndexingStrategy};
use crate::mapping::Mapping;
use crate::prefix::Prefix;
use crate::suffix::Suffix;

const DICT_FILE: &str = "dict";
const INDEX_FILE: &str = "index";
const CONTROL_FILE: &str = "control";

/// Each GC generation keeps its own `prefix.<g>`/`mapping.<g>` pair rather
/// than a single fixed name, so a reader can still open the prior
/// generation while a new one is being built; `cleanup` is what reclaims
/// the ones that are no longer current.
fn prefix_file_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("prefix.{generation}"))
}

fn mapping_file_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("mapping.{generation}"))
}

const DICT_AUTO_FLUSH_THRESHOLD: usize = 4 * 1024;
const SUFFIX_AUTO_FLUSH_THRESHOLD: usize = 4 * 1024 * 1024;
const INDEX_AUTO_FLUSH_THRESHOLD: usize = 64 * 1024;

pub struct FileManagerConfig {
    pub use_fsync: bool,
    pub indexing_strategy: IndexingStrategy,
}

impl Default for FileManagerConfig {
    fn default() -> Self {
        Self {
            use_fsync: true,
            indexing_strategy: IndexingStrategy::Minimal,
        }
    }
}

pub struct FileManager {
    dir: PathBuf,
    config: FileManagerConfig,
    readonly: bool,
    control: Mutex<ControlFile>,
    dict: Mutex<Dict>,
    suffix: Mutex<Suffix>,
    index: Mutex<FlatIndex>,
    dispatcher: Mutex<Dispatcher>,
    late: Arc<LateBound<dyn FlushDependencies>>,
    batch_in_progress: AtomicBool,
}

impl FlushDependencies for FileManager {
    fn flush_dict(&self) -> Result<()> {
        self.dict.lock().unwrap().flush()
    }

    fn flush_suffix_and_its_deps(&self) -> Result<()> {
        self.flush_dict()?;
        self.suffix.lock().unwrap().flush()
    }
}

impl FileManager {
    fn bind_self(this: Arc<Self>) -> Arc<Self> {
        let weak: Weak<dyn FlushDependencies> = Arc::downgrade(&this) as Weak<dyn FlushDependencies>;
        this.late.set(weak);
        this
    }

    pub fn create_rw(dir: impl Into<PathBuf>, config: FileManagerConfig) -> Result<Arc<Self>> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| {
            pack_io::Error::IoMisc {
                path: dir.clone(),
                source,
            }
        })?;
        let late: Arc<LateBound<dyn FlushDependencies>> = Arc::new(LateBound::new());

        let dict = Dict::create_rw(
            dir.join(DICT_FILE),
            DICT_AUTO_FLUSH_THRESHOLD,
            AutoFlushProcedure::External {
                target: FlushTarget::Dict,
                owner: late.clone(),
            },
        )?;
        let suffix = Suffix::create_rw(&dir, 0, SUFFIX_AUTO_FLUSH_THRESHOLD, late.clone())?;
        let index = FlatIndex::create_rw(
            dir.join(INDEX_FILE),
            INDEX_AUTO_FLUSH_THRESHOLD,
            AutoFlushProcedure::Internal,
        )?;
        let control = ControlFile::create_rw(dir.join(CONTROL_FILE), false, Payload::fresh(), config.use_fsync)?;

        let fm = Arc::new(Self {
            dir,
            readonly: false,
            control: Mutex::new(control),
            dict: Mutex::new(dict),
            suffix: Mutex::new(suffix),
            index: Mutex::new(index),
            dispatcher: Mutex::new(Dispatcher::new(None, None)),
            late,
            batch_in_progress: AtomicBool::new(false),
            config,
        });
        Ok(Self::bind_self(fm))
    }

    pub fn open_rw(dir: impl Into<PathBuf>, config: FileManagerConfig) -> Result<Arc<Self>> {
        let dir = dir.into();
        let late: Arc<LateBound<dyn FlushDependencies>> = Arc::new(LateBound::new());

        let control = ControlFile::open(pack_io::Mode::ReadWrite, dir.join(CONTROL_FILE), config.use_fsync)?;
        let payload = control.payload().clone();

        let dict = Dict::open_rw(
            dir.join(DICT_FILE),
            payload.dict_end_poff,
            DICT_AUTO_FLUSH_THRESHOLD,
            AutoFlushProcedure::External {
                target: FlushTarget::Dict,
                owner: late.clone(),
            },
        )?;
        let (chunk_start_idx, chunk_num, dead_bytes, base_offset) = Self::suffix_layout(&payload);
        let suffix = Suffix::open_rw(
            &dir,
            chunk_start_idx,
            chunk_num,
            dead_bytes,
            base_offset,
            SUFFIX_AUTO_FLUSH_THRESHOLD,
            late.clone(),
        )?;
        let index = FlatIndex::open_rw(
            dir.join(INDEX_FILE),
            Self::index_persisted_len(&dir)?,
            INDEX_AUTO_FLUSH_THRESHOLD,
            AutoFlushProcedure::Internal,
        )?;

        let (prefix, mapping) = Self::open_gc_artifacts(&dir, &payload)?;
        let dispatcher = Dispatcher::new(prefix, mapping);

        let fm = Arc::new(Self {
            dir,
            readonly: false,
            control: Mutex::new(control),
            dict: Mutex::new(dict),
            suffix: Mutex::new(suffix),
            index: Mutex::new(index),
            dispatcher: Mutex::new(dispatcher),
            late,
            batch_in_progress: AtomicBool::new(false),
            config,
        });
        Ok(Self::bind_self(fm))
    }

    pub fn open_ro(dir: impl Into<PathBuf>, config: FileManagerConfig) -> Result<Arc<Self>> {
        let dir = dir.into();
        let late: Arc<LateBound<dyn FlushDependencies>> = Arc::new(LateBound::new());

        let control = ControlFile::open(pack_io::Mode::ReadOnly, dir.join(CONTROL_FILE), config.use_fsync)?;
        let payload = control.payload().clone();

        let dict = Dict::open_ro(dir.join(DICT_FILE))?;
        let (chunk_start_idx, chunk_num, dead_bytes, base_offset) = Self::suffix_layout(&payload);
        let suffix = Suffix::open_ro(&dir, chunk_start_idx, chunk_num, dead_bytes, base_offset)?;
        let index = FlatIndex::open_ro(dir.join(INDEX_FILE))?;

        let (prefix, mapping) = Self::open_gc_artifacts(&dir, &payload)?;
        let dispatcher = Dispatcher::new(prefix, mapping);

        let fm = Arc::new(Self {
            dir,
            readonly: true,
            control: Mutex::new(control),
            dict: Mutex::new(dict),
            suffix: Mutex::new(suffix),
            index: Mutex::new(index),
            dispatcher: Mutex::new(dispatcher),
            late,
            batch_in_progress: AtomicBool::new(false),
            config,
        });
        Ok(Self::bind_self(fm))
    }

    /// `(chunk_start_idx, chunk_num, dead_bytes, suffix_start_offset)`. The
    /// last field anchors `chunk_starts[0]` on reopen: without it a store
    /// reopened after a GC cycle would report `logical_start()` relative to
    /// 0 instead of where the live suffix actually begins.
    fn suffix_layout(payload: &Payload) -> (u32, u32, u64, u64) {
        let (dead_bytes, suffix_start_offset) = match payload.status {
            Status::Gced {
                suffix_dead_bytes,
                suffix_start_offset,
                ..
            } => (suffix_dead_bytes as u64, suffix_start_offset),
            _ => (0, 0),
        };
        (payload.chunk_start_idx, payload.chunk_num.max(1), dead_bytes, suffix_start_offset)
    }

    fn index_persisted_len(dir: &Path) -> Result<u64> {
        let path = dir.join(INDEX_FILE);
        if !path.exists() {
            return Ok(0);
        }
        pack_io::File::open(pack_io::Mode::ReadOnly, pack_io::OpenMode::Existing, path)?.len()
            .map_err(Into::into)
    }

    fn open_gc_artifacts(dir: &Path, payload: &Payload) -> Result<(Option<Prefix>, Option<Mapping>)> {
        let generation = match payload.status {
            Status::Gced { generation, .. } => generation,
            _ => return Ok((None, None)),
        };
        let mapping_path = mapping_file_path(dir, generation);
        let prefix = Prefix::open_ro_if_exists(prefix_file_path(dir, generation))?;
        let mapping = match std::fs::read(&mapping_path) {
            Ok(bytes) => Some(Mapping::decode(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => {
                return Err(Error::Io(pack_io::Error::IoMisc {
                    path: mapping_path,
                    source,
                }))
            }
        };
        Ok((prefix, mapping))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn indexing_strategy(&self) -> IndexingStrategy {
        self.config.indexing_strategy
    }

    fn require_rw(&self) -> Result<()> {
        if self.readonly {
            return Err(Error::RoNotAllowed);
        }
        Ok(())
    }

    pub fn begin_batch(&self) -> Result<()> {
        self.require_rw()?;
        self.batch_in_progress.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn end_batch(&self) -> Result<()> {
        self.batch_in_progress.store(false, Ordering::SeqCst);
        self.flush_all()
    }

    pub fn batch_in_progress(&self) -> bool {
        self.batch_in_progress.load(Ordering::SeqCst)
    }

    pub fn append_entry(&self, bytes: &[u8]) -> Result<u64> {
        self.require_rw()?;
        let mut suffix = self.suffix.lock().unwrap();
        let offset = suffix.end_poff();
        suffix.append_exn(bytes)?;
        Ok(offset)
    }

    pub fn intern(&self, s: &str) -> Result<u32> {
        self.require_rw()?;
        self.dict.lock().unwrap().index(s)
    }

    pub fn dict_lookup(&self, i: u32) -> Option<String> {
        self.dict.lock().unwrap().find(i).map(str::to_owned)
    }

    pub fn index_find(&self, hash: &PackHash) -> Option<IndexEntry> {
        self.index.lock().unwrap().find(hash)
    }

    pub fn index_add(&self, hash: PackHash, entry: IndexEntry) -> Result<()> {
        self.require_rw()?;
        self.index.lock().unwrap().add(hash, entry)
    }

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let suffix = self.suffix.lock().unwrap();
        let dispatcher = self.dispatcher.lock().unwrap();
        dispatcher.read_exn(&suffix, buf, offset)
    }

    pub fn end_poff(&self) -> u64 {
        self.suffix.lock().unwrap().end_poff()
    }

    /// The oldest offset still readable through the suffix directly,
    /// i.e. the boundary `integrity_check` should start scanning from.
    pub fn live_start(&self) -> u64 {
        self.suffix.lock().unwrap().logical_start()
    }

    /// The suffix's current starting chunk index, i.e. the number of
    /// chunks a GC cycle has already reclaimed. Used by a GC orchestrator
    /// to confirm no concurrent cycle moved this boundary out from under it
    /// before the orchestrator applies its own swap.
    pub fn suffix_chunk_start_idx(&self) -> u32 {
        self.suffix.lock().unwrap().chunk_start_idx()
    }

    /// Three-stage flush: dict, then suffix, then index, control last.
    pub fn flush_all(&self) -> Result<()> {
        self.require_rw()?;
        self.flush_dict()?;
        self.flush_suffix_and_its_deps()?;
        self.index.lock().unwrap().flush()?;
        self.persist_control()
    }

    fn persist_control(&self) -> Result<()> {
        let dict_end_poff = self.dict.lock().unwrap().end_poff();
        let suffix_end_poff = self.suffix.lock().unwrap().end_poff();
        let mut control = self.control.lock().unwrap();
        let mut payload = control.payload().clone();
        payload.dict_end_poff = dict_end_poff;
        payload.suffix_end_poff = suffix_end_poff;
        control.set_payload(payload)
    }

    pub fn fsync_all(&self) -> Result<()> {
        self.require_rw()?;
        self.dict.lock().unwrap().fsync()?;
        self.suffix.lock().unwrap().fsync()
    }

    /// Reload the five pieces of on-disk state a concurrent writer may have
    /// advanced since this instance last looked: (1) reread the control
    /// file; (2) if its generation advanced, swap in the new prefix and
    /// mapping; (3) replay new dict entries; (4) pick up any suffix chunks
    /// `add_chunk` created, and apply `split`'s dead-bytes/start-index
    /// change; (5) replay new index records. Returns whether anything
    /// changed.
    pub fn reload(&self) -> Result<bool> {
        let changed = {
            let mut control = self.control.lock().unwrap();
            control.reload()?
        };
        if !changed {
            return Ok(false);
        }
        let payload = self.control.lock().unwrap().payload().clone();

        let previous_generation = {
            let dispatcher = self.dispatcher.lock().unwrap();
            dispatcher.has_prefix()
        };
        let now_gced = matches!(payload.status, Status::Gced { .. });
        if now_gced && !previous_generation {
            if let (Some(prefix), Some(mapping)) = Self::open_gc_artifacts(&self.dir, &payload)? {
                log::info!("reload: adopting GC artifacts for {:?}", payload.status);
                self.dispatcher.lock().unwrap().swap(prefix, mapping);
            }
        }

        self.dict.lock().unwrap().reload(payload.dict_end_poff)?;

        {
            let mut suffix = self.suffix.lock().unwrap();
            let (chunk_start_idx, chunk_num, dead_bytes, _) = Self::suffix_layout(&payload);
            while suffix.chunk_num() < chunk_num {
                suffix.add_chunk()?;
            }
            if suffix.chunk_start_idx() != chunk_start_idx {
                suffix.split(chunk_start_idx, dead_bytes)?;
            }
        }

        self.index.lock().unwrap().reload()?;
        Ok(true)
    }

    /// After a GC worker reports success: install the new prefix+mapping,
    /// drop suffix chunks the new prefix now covers, and make the new
    /// control status durable.
    pub fn swap(&self, prefix: Prefix, mapping: Mapping, new_status: Status, keep_suffix_from_chunk: u32, dead_bytes: u32) -> Result<()> {
        self.require_rw()?;
        if self.batch_in_progress() {
            return Err(Error::GcForbiddenDuringBatch);
        }
        let generation = match new_status {
            Status::Gced { generation, .. } => generation,
            _ => return Err(Error::InconsistentStore("swap requires a Gced status".into())),
        };
        log::info!(
            "swap: new prefix of {} bytes, {} mapping entries, keeping suffix from chunk {keep_suffix_from_chunk}",
            prefix.len(),
            mapping.len(),
        );
        prefix.fsync()?;
        let mapping_path = mapping_file_path(&self.dir, generation);
        std::fs::write(&mapping_path, mapping.encode())
            .map_err(|source| pack_io::Error::IoMisc { path: mapping_path, source })?;
        self.dispatcher.lock().unwrap().swap(prefix, mapping);
        self.suffix
            .lock()
            .unwrap()
            .split(keep_suffix_from_chunk, dead_bytes as u64)?;

        let mut control = self.control.lock().unwrap();
        let mut payload = control.payload().clone();
        payload.status = new_status;
        payload.chunk_start_idx = keep_suffix_from_chunk;
        control.set_payload(payload)
    }

    /// Open the split point a GC cycle needs (spec §4.7): start a fresh,
    /// empty, appendable suffix chunk so every chunk that exists right now
    /// can be handed wholesale to a new prefix while writers keep appending
    /// to the new chunk uninterrupted. Returns the new chunk's index, which
    /// the eventual `swap` must keep from.
    pub fn split(&self) -> Result<u32> {
        self.require_rw()?;
        if self.batch_in_progress() {
            return Err(Error::SplitForbiddenDuringBatch);
        }
        let mut suffix = self.suffix.lock().unwrap();
        suffix.add_chunk()?;
        let new_chunk_idx = suffix.chunk_start_idx() + suffix.chunk_num() - 1;
        let mut control = self.control.lock().unwrap();
        let mut payload = control.payload().clone();
        payload.chunk_num += 1;
        control.set_payload(payload)?;
        Ok(new_chunk_idx)
    }

    /// Unlink on-disk GC artifacts that no longer matter (spec §4.7/§4.11):
    /// `prefix.<g>`/`mapping.<g>` for every generation other than the
    /// current one, `suffix.<i>` chunks the live window has already dropped,
    /// and stragglers left by an interrupted or superseded cycle
    /// (`gc_result.<g>`, `reachable.<g>`, `sorted.<g>`).
    pub fn cleanup(&self) -> Result<()> {
        self.require_rw()?;
        let current_generation = match self.control.lock().unwrap().payload().status {
            Status::Gced { generation, .. } => Some(generation),
            _ => None,
        };
        let chunk_start_idx = self.suffix.lock().unwrap().chunk_start_idx();

        let entries = std::fs::read_dir(&self.dir).map_err(|source| pack_io::Error::IoMisc {
            path: self.dir.clone(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| pack_io::Error::IoMisc {
                path: self.dir.clone(),
                source,
            })?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let stale = if let Some(gen_str) = name.strip_prefix("prefix.").or_else(|| name.strip_prefix("mapping.")) {
                gen_str.parse::<u64>().map(|g| Some(g) != current_generation).unwrap_or(true)
            } else if let Some(idx_str) = name.strip_prefix("suffix.") {
                idx_str.parse::<u32>().map(|idx| idx < chunk_start_idx).unwrap_or(false)
            } else {
                name.starts_with("gc_result.") || name.starts_with("reachable.") || name.starts_with("sorted.")
            };
            if stale {
                std::fs::remove_file(entry.path()).ok();
            }
        }
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        if !self.readonly {
            self.flush_all()?;
        }
        self.dict.lock().unwrap().close()?;
        self.suffix.lock().unwrap().close()?;
        self.index.lock().unwrap().close()?;
        self.control.lock().unwrap().close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_write_flush_reopen_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let fm = FileManager::create_rw(dir.path(), FileManagerConfig::default()).unwrap();
        let offset = fm.append_entry(b"entry-bytes").unwrap();
        fm.flush_all().unwrap();
        fm.close().unwrap();

        let reopened = FileManager::open_ro(dir.path(), FileManagerConfig::default()).unwrap();
        let mut buf = [0u8; 11];
        reopened.read_at(&mut buf, offset).unwrap();
        assert_eq!(&buf, b"entry-bytes");
    }

    #[test]
    fn dict_entries_survive_flush_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let fm = FileManager::create_rw(dir.path(), FileManagerConfig::default()).unwrap();
        let i = fm.intern("step").unwrap();
        fm.flush_all().unwrap();
        fm.close().unwrap();

        let reopened = FileManager::open_ro(dir.path(), FileManagerConfig::default()).unwrap();
        assert_eq!(reopened.dict_lookup(i).as_deref(), Some("step"));
    }

    #[test]
    fn split_forbidden_during_batch() {
        let dir = tempfile::tempdir().unwrap();
        let fm = FileManager::create_rw(dir.path(), FileManagerConfig::default()).unwrap();
        fm.begin_batch().unwrap();
        assert!(matches!(fm.split().unwrap_err(), Error::SplitForbiddenDuringBatch));
    }
}
