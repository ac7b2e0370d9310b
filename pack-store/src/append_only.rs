//! Buffered append-only sink over `pack-io`, with an auto-flush threshold
//! (spec §4.3). Used directly by the dict, and by each suffix chunk.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use crate::error::{Error, Result};

/// Callbacks an append-only file's auto-flush can trigger on its owner, so
/// the File Manager can flush earlier stages first (dict before suffix,
/// spec §4.7 flush ordering). Implemented by `FileManager`.
pub trait FlushDependencies: Send + Sync {
    fn flush_dict(&self) -> Result<()>;
    fn flush_suffix_and_its_deps(&self) -> Result<()>;
}

/// A `Weak` reference that starts empty and is filled in after construction.
///
/// The File Manager is cyclic with its children (an append-only file's
/// auto-flush calls back into the FM, which owns the append-only file).
/// Children are built before the owning `Arc<FileManager>` exists, so their
/// back-reference starts empty; [`LateBound::get`] tolerates that by
/// returning `None`, which auto-flush treats as a safe no-op (spec §4.7,
/// §9 "Global state" / "Cyclic coupling").
pub struct LateBound<T: ?Sized> {
    inner: Mutex<Option<Weak<T>>>,
}

impl<T: ?Sized> LateBound<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub fn set(&self, weak: Weak<T>) {
        *self.inner.lock().unwrap() = Some(weak);
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.inner.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }
}

impl<T: ?Sized> Default for LateBound<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Which of the FM's flush stages an auto-flush should trigger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushTarget {
    Dict,
    Suffix,
}

/// What an append-only file does once its buffer reaches the auto-flush
/// threshold.
pub enum AutoFlushProcedure {
    /// Flush only this file.
    Internal,
    /// Ask the owning File Manager to flush this file's dependencies first.
    External {
        target: FlushTarget,
        owner: Arc<LateBound<dyn FlushDependencies>>,
    },
}

pub struct AppendOnly {
    file: pack_io::File,
    buffer: Vec<u8>,
    persisted_len: u64,
    auto_flush_threshold: usize,
    auto_flush_procedure: AutoFlushProcedure,
}

impl AppendOnly {
    pub fn create_rw<P: Into<PathBuf>>(
        path: P,
        auto_flush_threshold: usize,
        auto_flush_procedure: AutoFlushProcedure,
    ) -> Result<Self> {
        let file = pack_io::File::open(pack_io::Mode::ReadWrite, pack_io::OpenMode::CreateNew, path)?;
        Ok(Self {
            file,
            buffer: Vec::new(),
            persisted_len: 0,
            auto_flush_threshold,
            auto_flush_procedure,
        })
    }

    pub fn open_rw<P: Into<PathBuf>>(
        path: P,
        persisted_len: u64,
        auto_flush_threshold: usize,
        auto_flush_procedure: AutoFlushProcedure,
    ) -> Result<Self> {
        let file = pack_io::File::open(pack_io::Mode::ReadWrite, pack_io::OpenMode::Existing, path)?;
        Ok(Self {
            file,
            buffer: Vec::new(),
            persisted_len,
            auto_flush_threshold,
            auto_flush_procedure,
        })
    }

    pub fn open_ro<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let file = pack_io::File::open(pack_io::Mode::ReadOnly, pack_io::OpenMode::Existing, path)?;
        let persisted_len = file.len()?;
        Ok(Self {
            file,
            buffer: Vec::new(),
            persisted_len,
            auto_flush_threshold: usize::MAX,
            auto_flush_procedure: AutoFlushProcedure::Internal,
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Append bytes, triggering the configured auto-flush procedure once
    /// the buffer reaches the threshold.
    pub fn append_exn(&mut self, bytes: &[u8]) -> Result<()> {
        if self.file.mode() == pack_io::Mode::ReadOnly {
            return Err(Error::RoNotAllowed);
        }
        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() >= self.auto_flush_threshold {
            self.trigger_auto_flush()?;
        }
        Ok(())
    }

    fn trigger_auto_flush(&mut self) -> Result<()> {
        match &self.auto_flush_procedure {
            AutoFlushProcedure::Internal => self.flush(),
            AutoFlushProcedure::External { target, owner } => {
                let target = *target;
                let owner = owner.clone();
                match owner.get() {
                    // tolerate callbacks firing before the FM has bound itself
                    None => Ok(()),
                    Some(fm) => match target {
                        FlushTarget::Dict => fm.flush_dict(),
                        FlushTarget::Suffix => fm.flush_suffix_and_its_deps(),
                    },
                }
            }
        }
    }

    /// Write the buffer to disk. A no-op if the buffer is already empty.
    pub fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        if self.file.mode() == pack_io::Mode::ReadOnly {
            return Err(Error::RoNotAllowed);
        }
        self.file.pwrite_all(&self.buffer, self.persisted_len)?;
        self.persisted_len += self.buffer.len() as u64;
        self.buffer.clear();
        Ok(())
    }

    pub fn fsync(&self) -> Result<()> {
        self.file.fsync().map_err(Into::into)
    }

    /// Current logical end offset: persisted bytes plus whatever is still
    /// buffered. Always `>=` the control file's persisted `end_poff`
    /// (spec §4.3 invariant).
    pub fn end_poff(&self) -> u64 {
        self.persisted_len + self.buffer.len() as u64
    }

    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Used by RO instances after a `reload`: the persisted length grew
    /// underneath them.
    pub fn refresh_end_poff(&mut self, persisted_len: u64) {
        self.persisted_len = persisted_len;
    }

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        if offset >= self.persisted_len {
            let start = (offset - self.persisted_len) as usize;
            let end = start
                .checked_add(buf.len())
                .ok_or_else(|| Error::InconsistentStore("offset overflow".into()))?;
            if end > self.buffer.len() {
                return Err(Error::Io(pack_io::Error::ReadOutOfBounds {
                    path: self.file.path().to_owned(),
                    offset,
                    len: buf.len(),
                }));
            }
            buf.copy_from_slice(&self.buffer[start..end]);
            Ok(())
        } else {
            self.file.pread_exact(buf, offset).map_err(Into::into)
        }
    }

    /// Fails with [`Error::PendingFlush`] if there is unflushed data, so a
    /// batch that didn't flush cannot silently close over data loss.
    pub fn close(&mut self) -> Result<()> {
        if self.has_pending() {
            return Err(Error::PendingFlush);
        }
        self.file.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_flush_persists_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ao");
        let mut ao = AppendOnly::create_rw(&path, 1024, AutoFlushProcedure::Internal).unwrap();
        ao.append_exn(b"hello").unwrap();
        assert_eq!(ao.end_poff(), 5);
        assert!(ao.has_pending());
        ao.flush().unwrap();
        assert!(!ao.has_pending());
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn auto_flush_threshold_triggers_internal_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ao");
        let mut ao = AppendOnly::create_rw(&path, 4, AutoFlushProcedure::Internal).unwrap();
        ao.append_exn(b"abcd").unwrap();
        assert!(!ao.has_pending());
        assert_eq!(std::fs::read(&path).unwrap(), b"abcd");
    }

    #[test]
    fn close_with_pending_data_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ao");
        let mut ao = AppendOnly::create_rw(&path, 1024, AutoFlushProcedure::Internal).unwrap();
        ao.append_exn(b"x").unwrap();
        assert!(matches!(ao.close().unwrap_err(), Error::PendingFlush));
    }

    struct NoopDeps;
    impl FlushDependencies for NoopDeps {
        fn flush_dict(&self) -> Result<()> {
            Ok(())
        }
        fn flush_suffix_and_its_deps(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn early_callback_before_bind_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ao");
        let late = Arc::new(LateBound::<dyn FlushDependencies>::new());
        let mut ao = AppendOnly::create_rw(
            &path,
            2,
            AutoFlushProcedure::External {
                target: FlushTarget::Dict,
                owner: late.clone(),
            },
        )
        .unwrap();
        // no FM bound yet: this must not panic or error
        ao.append_exn(b"ab").unwrap();
        assert!(ao.has_pending());

        let deps: Arc<dyn FlushDependencies> = Arc::new(NoopDeps);
        late.set(Arc::downgrade(&deps));
        ao.append_exn(b"cd").unwrap();
    }
}
