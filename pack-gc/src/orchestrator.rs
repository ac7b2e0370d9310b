//! GC orchestrator (spec §4.11): runs the out-of-process worker as a
//! background task, waits for its result descriptor, and performs the
//! atomic swap into the File Manager. `finalise` is idempotent: calling it
//! twice for a generation that already swapped is a no-op returning the
//! same stats.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use pack_format::PackHash;
use pack_store::control::Status;
use pack_store::prefix::Prefix;
use pack_store::{FileManager, PackStore};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::worker::{result_file_path, GcStats, GcWorker, ObjectGraph};

#[derive(Debug, Clone)]
enum GcOutcome {
    Success {
        prefix_path: PathBuf,
        mapping_bytes: Vec<u8>,
        stats: GcStats,
    },
    Failure(String),
}

struct RunningGc {
    generation: u64,
    handle: JoinHandle<()>,
}

pub struct GcOrchestrator {
    fm: Arc<FileManager>,
    dir: PathBuf,
    running: Mutex<Option<RunningGc>>,
    /// Generations whose `finalise` has already swapped, so a repeat call
    /// is a safe no-op instead of re-applying the swap.
    finalised: Mutex<HashMap<u64, GcStats>>,
    /// Suffix chunk index the split point opened at `start` for each
    /// in-flight generation; `finalise` keeps this chunk and newer ones.
    split_points: Mutex<HashMap<u64, u32>>,
}

impl GcOrchestrator {
    pub fn new(fm: Arc<FileManager>, dir: impl Into<PathBuf>) -> Self {
        Self {
            fm,
            dir: dir.into(),
            running: Mutex::new(None),
            finalised: Mutex::new(HashMap::new()),
            split_points: Mutex::new(HashMap::new()),
        }
    }

    /// Launch the worker for `generation` against `root_hash`/`root_offset`
    /// as a background task. The result (prefix path + mapping bytes, or a
    /// failure message) is written to `gc_result.<generation>` once it
    /// completes; `finalise` picks it up later.
    pub fn start(
        &self,
        store: Arc<PackStore>,
        graph: Arc<dyn ObjectGraph>,
        root_hash: PackHash,
        root_offset: u64,
        generation: u64,
    ) -> Result<()> {
        let mut running = self.running.lock().unwrap();
        if let Some(existing) = running.as_ref() {
            if !existing.handle.is_finished() {
                return Err(Error::AlreadyRunning(existing.generation));
            }
        }

        // Open the split point (spec §4.7): a fresh, empty, appendable
        // suffix chunk so every chunk that exists right now can be handed
        // wholesale to the new prefix while writers keep appending to the
        // new chunk uninterrupted.
        let keep_from_idx = self.fm.split()?;
        self.split_points.lock().unwrap().insert(generation, keep_from_idx);

        let fm = self.fm.clone();
        let dir = self.dir.clone();
        let result_path = result_file_path(&dir, generation);
        let prefix_path = dir.join(format!("prefix.{generation}"));

        let handle = tokio::task::spawn_blocking(move || {
            let worker = GcWorker::new(fm, store, graph);
            let outcome = match worker.run(root_hash, root_offset, &prefix_path) {
                Ok((_prefix, mapping, stats)) => GcOutcome::Success {
                    prefix_path: prefix_path.clone(),
                    mapping_bytes: mapping.encode(),
                    stats,
                },
                Err(e) => GcOutcome::Failure(e.to_string()),
            };
            if let Err(e) = write_result(&result_path, &outcome) {
                log::error!("gc worker: failed to write result descriptor: {e}");
            }
        });

        *running = Some(RunningGc { generation, handle });
        Ok(())
    }

    /// Wait for `generation`'s result descriptor and, on success, perform
    /// the atomic swap into the File Manager. Returns the same stats on a
    /// repeat call without re-swapping.
    pub async fn finalise(&self, generation: u64, expected_chunk_start_idx: u32) -> Result<GcStats> {
        if let Some(stats) = self.finalised.lock().unwrap().get(&generation) {
            return Ok(stats.clone());
        }

        {
            let handle = {
                let mut running = self.running.lock().unwrap();
                match running.take() {
                    Some(r) if r.generation == generation => Some(r.handle),
                    Some(other) => {
                        *running = Some(other);
                        None
                    }
                    None => None,
                }
            };
            if let Some(handle) = handle {
                handle.await?;
            }
        }

        let result_path = result_file_path(&self.dir, generation);
        let outcome = match read_result(&result_path) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.fm.cleanup()?;
                return Err(e);
            }
        };

        let stats = match outcome {
            GcOutcome::Failure(message) => {
                self.fm.cleanup()?;
                return Err(Error::WorkerFailed(generation, message));
            }
            GcOutcome::Success {
                prefix_path,
                mapping_bytes,
                stats,
            } => {
                let actual_chunk_start_idx = self.fm.suffix_chunk_start_idx();
                if actual_chunk_start_idx != expected_chunk_start_idx {
                    return Err(Error::ChunkReconciliation {
                        expected: expected_chunk_start_idx,
                        actual: actual_chunk_start_idx,
                    });
                }
                // The split point opened at `start` is what `swap` keeps;
                // fall back to the pre-split convention of a single chunk
                // if this orchestrator instance never saw that `start`
                // call (e.g. resuming a generation from a fresh process).
                let keep_from_idx = self
                    .split_points
                    .lock()
                    .unwrap()
                    .remove(&generation)
                    .unwrap_or(expected_chunk_start_idx + 1);

                let prefix = Prefix::open_ro(&prefix_path)?;
                let mapping = pack_store::mapping::Mapping::decode(&mapping_bytes)?;
                let dead_bytes = 0;
                let new_status = Status::Gced {
                    suffix_start_offset: stats.root_end_offset,
                    generation,
                    latest_gc_target_offset: prefix.len(),
                    suffix_dead_bytes: dead_bytes,
                };
                self.fm.swap(prefix, mapping, new_status, keep_from_idx, dead_bytes)?;
                stats
            }
        };

        self.finalised.lock().unwrap().insert(generation, stats.clone());
        Ok(stats)
    }

    /// Abort a still-running generation and discard any result it later
    /// writes. A no-op if it already finished.
    pub fn cancel(&self, generation: u64) -> Result<()> {
        let mut running = self.running.lock().unwrap();
        if let Some(r) = running.take() {
            if r.generation == generation {
                r.handle.abort();
            } else {
                *running = Some(r);
            }
        }
        self.split_points.lock().unwrap().remove(&generation);
        let _ = std::fs::remove_file(result_file_path(&self.dir, generation));
        self.fm.cleanup()?;
        Ok(())
    }
}

const RESULT_TAG_SUCCESS: u8 = 1;
const RESULT_TAG_FAILURE: u8 = 2;

fn write_result(path: &std::path::Path, outcome: &GcOutcome) -> std::io::Result<()> {
    let mut buf = Vec::new();
    match outcome {
        GcOutcome::Success {
            prefix_path,
            mapping_bytes,
            stats,
        } => {
            buf.push(RESULT_TAG_SUCCESS);
            let path_bytes = prefix_path.to_string_lossy().into_owned().into_bytes();
            buf.extend_from_slice(&(path_bytes.len() as u32).to_le_bytes());
            buf.extend_from_slice(&path_bytes);
            buf.extend_from_slice(&(mapping_bytes.len() as u32).to_le_bytes());
            buf.extend_from_slice(mapping_bytes);
            buf.extend_from_slice(&stats.objects_marked.to_le_bytes());
            buf.extend_from_slice(&stats.objects_copied.to_le_bytes());
            buf.extend_from_slice(&stats.bytes_copied.to_le_bytes());
            buf.extend_from_slice(&stats.root_end_offset.to_le_bytes());
        }
        GcOutcome::Failure(message) => {
            buf.push(RESULT_TAG_FAILURE);
            let msg_bytes = message.as_bytes();
            buf.extend_from_slice(&(msg_bytes.len() as u32).to_le_bytes());
            buf.extend_from_slice(msg_bytes);
        }
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &buf)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pack_format::Kind;
    use pack_store::file_manager::FileManagerConfig;
    use pack_store::FileManager;

    struct NoRefs;
    impl ObjectGraph for NoRefs {
        fn direct_children(&self, _kind: Kind, _payload: &[u8]) -> Vec<u64> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn start_then_finalise_swaps_in_new_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let fm = FileManager::create_rw(dir.path(), FileManagerConfig::default()).unwrap();
        let store = Arc::new(PackStore::new(fm.clone()));

        let hash = PackHash::of_data(b"root-commit");
        let key = store.add(hash, Kind::CommitV2, b"root-commit").unwrap();
        store.batch(|| Ok(())).unwrap();
        let (offset, _) = key.offset_length().unwrap();

        let expected_chunk_start_idx = fm.suffix_chunk_start_idx();
        let orchestrator = GcOrchestrator::new(fm.clone(), dir.path());
        orchestrator
            .start(store.clone(), Arc::new(NoRefs), hash, offset, 1)
            .unwrap();

        let stats = orchestrator.finalise(1, expected_chunk_start_idx).await.unwrap();
        assert_eq!(stats.objects_copied, 1);

        // idempotent: a second finalise for the same generation returns the
        // same stats without re-running the swap.
        let again = orchestrator.finalise(1, expected_chunk_start_idx).await.unwrap();
        assert_eq!(again.objects_copied, stats.objects_copied);
    }

    #[test]
    fn cancel_before_start_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let fm = FileManager::create_rw(dir.path(), FileManagerConfig::default()).unwrap();
        let orchestrator = GcOrchestrator::new(fm, dir.path());
        assert!(orchestrator.cancel(7).is_ok());
    }
}

fn read_result(path: &std::path::Path) -> Result<GcOutcome> {
    let buf = std::fs::read(path).map_err(|_| Error::MissingResult(path.to_owned()))?;
    let corrupt = |why: &str| Error::CorruptedResult(path.to_owned(), why.to_owned());
    let tag = *buf.first().ok_or_else(|| corrupt("empty result file"))?;
    let mut off = 1;
    let read_u32 = |buf: &[u8], off: usize| -> Result<u32> {
        buf.get(off..off + 4)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_le_bytes)
            .ok_or_else(|| corrupt("truncated length field"))
    };
    match tag {
        RESULT_TAG_SUCCESS => {
            let path_len = read_u32(&buf, off)? as usize;
            off += 4;
            let prefix_path = String::from_utf8(buf[off..off + path_len].to_vec())
                .map_err(|_| corrupt("prefix path is not utf-8"))?;
            off += path_len;
            let mapping_len = read_u32(&buf, off)? as usize;
            off += 4;
            let mapping_bytes = buf[off..off + mapping_len].to_vec();
            off += mapping_len;
            let objects_marked = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
            off += 8;
            let objects_copied = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
            off += 8;
            let bytes_copied = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
            off += 8;
            let root_end_offset = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
            Ok(GcOutcome::Success {
                prefix_path: PathBuf::from(prefix_path),
                mapping_bytes,
                stats: GcStats {
                    objects_marked,
                    objects_copied,
                    bytes_copied,
                    root_end_offset,
                },
            })
        }
        RESULT_TAG_FAILURE => {
            let len = read_u32(&buf, off)? as usize;
            off += 4;
            let message = String::from_utf8(buf[off..off + len].to_vec())
                .map_err(|_| corrupt("failure message is not utf-8"))?;
            Ok(GcOutcome::Failure(message))
        }
        other => Err(corrupt(&format!("unknown result tag {other}"))),
    }
}
