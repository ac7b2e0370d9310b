//! Chunked suffix (spec §4.4): the live, still-growing tail of the pack,
//! split across numbered chunk files so that `split` (run after a GC cycle
//! moves older data into a fresh prefix) can drop whole files instead of
//! rewriting one monolithic one.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::append_only::{AppendOnly, AutoFlushProcedure, FlushDependencies, FlushTarget, LateBound};
use crate::error::{Error, Result};

fn chunk_path(dir: &Path, idx: u32) -> PathBuf {
    dir.join(format!("suffix.{idx}"))
}

pub struct Suffix {
    dir: PathBuf,
    chunks: Vec<AppendOnly>,
    /// Absolute logical offset at which `chunks[i]` begins.
    chunk_starts: Vec<u64>,
    chunk_start_idx: u32,
    /// Garbage bytes at the head of `chunks[0]` left over from before the
    /// last GC cycle finished reclaiming them; not part of the logical
    /// stream.
    dead_bytes: u64,
    auto_flush_threshold: usize,
    owner: Arc<LateBound<dyn FlushDependencies>>,
    readonly: bool,
}

impl Suffix {
    pub fn create_rw(
        dir: impl Into<PathBuf>,
        chunk_start_idx: u32,
        auto_flush_threshold: usize,
        owner: Arc<LateBound<dyn FlushDependencies>>,
    ) -> Result<Self> {
        let dir = dir.into();
        let first = AppendOnly::create_rw(
            chunk_path(&dir, chunk_start_idx),
            auto_flush_threshold,
            AutoFlushProcedure::External {
                target: FlushTarget::Suffix,
                owner: owner.clone(),
            },
        )?;
        Ok(Self {
            dir,
            chunks: vec![first],
            chunk_starts: vec![0],
            chunk_start_idx,
            dead_bytes: 0,
            auto_flush_threshold,
            owner,
            readonly: false,
        })
    }

    /// Reopen an existing suffix spanning `chunk_num` chunk files starting
    /// at `chunk_start_idx`, with `dead_bytes` of pre-GC garbage at the
    /// head of the oldest chunk. `base_offset` is the absolute logical
    /// offset `chunks[0]` begins at (0 for a store that has never been
    /// GCed, otherwise the prior cycle's `suffix_start_offset`) — without
    /// it, `logical_start` would be computed relative to 0 instead of
    /// where the live suffix actually starts.
    pub fn open_rw(
        dir: impl Into<PathBuf>,
        chunk_start_idx: u32,
        chunk_num: u32,
        dead_bytes: u64,
        base_offset: u64,
        auto_flush_threshold: usize,
        owner: Arc<LateBound<dyn FlushDependencies>>,
    ) -> Result<Self> {
        let dir = dir.into();
        let mut chunks = Vec::new();
        let mut chunk_starts = Vec::new();
        let mut running = base_offset;
        for i in 0..chunk_num {
            let idx = chunk_start_idx + i;
            let path = chunk_path(&dir, idx);
            let persisted_len = pack_io::File::open(pack_io::Mode::ReadOnly, pack_io::OpenMode::Existing, &path)?
                .len()?;
            let ao = AppendOnly::open_rw(
                &path,
                persisted_len,
                auto_flush_threshold,
                AutoFlushProcedure::External {
                    target: FlushTarget::Suffix,
                    owner: owner.clone(),
                },
            )?;
            chunk_starts.push(running);
            running += persisted_len;
            chunks.push(ao);
        }
        Ok(Self {
            dir,
            chunks,
            chunk_starts,
            chunk_start_idx,
            dead_bytes,
            auto_flush_threshold,
            owner,
            readonly: false,
        })
    }

    pub fn open_ro(
        dir: impl Into<PathBuf>,
        chunk_start_idx: u32,
        chunk_num: u32,
        dead_bytes: u64,
        base_offset: u64,
    ) -> Result<Self> {
        let dir = dir.into();
        let mut chunks = Vec::new();
        let mut chunk_starts = Vec::new();
        let mut running = base_offset;
        for i in 0..chunk_num {
            let idx = chunk_start_idx + i;
            let ao = AppendOnly::open_ro(chunk_path(&dir, idx))?;
            chunk_starts.push(running);
            running += ao.end_poff();
            chunks.push(ao);
        }
        Ok(Self {
            dir,
            chunks,
            chunk_starts,
            chunk_start_idx,
            dead_bytes,
            auto_flush_threshold: usize::MAX,
            owner: Arc::new(LateBound::new()),
            readonly: true,
        })
    }

    pub fn chunk_start_idx(&self) -> u32 {
        self.chunk_start_idx
    }

    pub fn chunk_num(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn dead_bytes(&self) -> u64 {
        self.dead_bytes
    }

    /// First offset that is actually part of the logical stream; anything
    /// before it in `chunks[0]` is dead (spec §4.4 `suffix_dead_bytes`).
    pub fn logical_start(&self) -> u64 {
        self.chunk_starts[0] + self.dead_bytes
    }

    pub fn end_poff(&self) -> u64 {
        let last = self.chunks.len() - 1;
        self.chunk_starts[last] + self.chunks[last].end_poff()
    }

    pub fn append_exn(&mut self, bytes: &[u8]) -> Result<()> {
        if self.readonly {
            return Err(Error::RoNotAllowed);
        }
        self.chunks.last_mut().unwrap().append_exn(bytes)
    }

    pub fn flush(&mut self) -> Result<()> {
        for c in &mut self.chunks {
            c.flush()?;
        }
        Ok(())
    }

    pub fn fsync(&self) -> Result<()> {
        for c in &self.chunks {
            c.fsync()?;
        }
        Ok(())
    }

    /// Finalize the current last chunk and start a fresh one, continuing
    /// the logical stream without interruption.
    pub fn add_chunk(&mut self) -> Result<()> {
        if self.readonly {
            return Err(Error::RoNotAllowed);
        }
        self.chunks.last_mut().unwrap().flush()?;
        self.chunks.last_mut().unwrap().fsync()?;
        let new_idx = self.chunk_start_idx + self.chunks.len() as u32;
        let start = self.end_poff();
        let ao = AppendOnly::create_rw(
            chunk_path(&self.dir, new_idx),
            self.auto_flush_threshold,
            AutoFlushProcedure::External {
                target: FlushTarget::Suffix,
                owner: self.owner.clone(),
            },
        )?;
        self.chunks.push(ao);
        self.chunk_starts.push(start);
        Ok(())
    }

    /// Drop every chunk strictly older than `keep_from_idx` (called once a
    /// GC cycle's new prefix covers them) and mark `new_dead_bytes` of
    /// garbage at the head of the oldest surviving chunk.
    pub fn split(&mut self, keep_from_idx: u32, new_dead_bytes: u64) -> Result<()> {
        let drop_count = (keep_from_idx.saturating_sub(self.chunk_start_idx)) as usize;
        if drop_count == 0 {
            self.dead_bytes = new_dead_bytes;
            return Ok(());
        }
        if drop_count >= self.chunks.len() {
            return Err(Error::InconsistentStore(
                "split would drop every live suffix chunk".into(),
            ));
        }
        for i in 0..drop_count {
            let idx = self.chunk_start_idx + i as u32;
            std::fs::remove_file(chunk_path(&self.dir, idx)).ok();
        }
        self.chunks.drain(0..drop_count);
        self.chunk_starts.drain(0..drop_count);
        self.chunk_start_idx = keep_from_idx;
        self.dead_bytes = new_dead_bytes;
        Ok(())
    }

    fn locate(&self, offset: u64) -> Result<usize> {
        match self.chunk_starts.binary_search(&offset) {
            Ok(i) => Ok(i),
            Err(0) => Err(Error::InvalidReadOfGcedObject { offset }),
            Err(i) => Ok(i - 1),
        }
    }

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        if offset < self.logical_start() {
            return Err(Error::InvalidReadOfGcedObject { offset });
        }
        let i = self.locate(offset)?;
        let local_offset = offset - self.chunk_starts[i];
        self.chunks[i].read_at(buf, local_offset)
    }

    pub fn close(&mut self) -> Result<()> {
        for c in &mut self.chunks {
            c.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_spans_multiple_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let owner = Arc::new(LateBound::new());
        let mut suffix = Suffix::create_rw(dir.path(), 1, 4096, owner).unwrap();
        suffix.append_exn(b"hello").unwrap();
        suffix.add_chunk().unwrap();
        suffix.append_exn(b"world").unwrap();
        suffix.flush().unwrap();
        assert_eq!(suffix.chunk_num(), 2);
        assert_eq!(suffix.end_poff(), 10);

        let mut buf = [0u8; 5];
        suffix.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"hello");
        suffix.read_at(&mut buf, 5).unwrap();
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn split_drops_old_chunks_and_shifts_dead_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let owner = Arc::new(LateBound::new());
        let mut suffix = Suffix::create_rw(dir.path(), 1, 4096, owner).unwrap();
        suffix.append_exn(b"hello").unwrap();
        suffix.add_chunk().unwrap();
        suffix.append_exn(b"world").unwrap();
        suffix.flush().unwrap();

        suffix.split(2, 2).unwrap();
        assert_eq!(suffix.chunk_start_idx(), 2);
        assert_eq!(suffix.chunk_num(), 1);
        assert_eq!(suffix.logical_start(), 7);
        assert!(!dir.path().join("suffix.1").exists());

        let mut buf = [0u8; 3];
        suffix.read_at(&mut buf, 7).unwrap();
        assert_eq!(&buf, b"rld");
        assert!(matches!(
            suffix.read_at(&mut buf, 5).unwrap_err(),
            Error::InvalidReadOfGcedObject { .. }
        ));
    }

    #[test]
    fn open_rw_anchors_chunk_starts_at_base_offset() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("suffix.2"), b"post-gc").unwrap();
        let owner = Arc::new(LateBound::new());

        let suffix = Suffix::open_rw(dir.path(), 2, 1, 0, 1_000, 4096, owner).unwrap();
        assert_eq!(suffix.logical_start(), 1_000);
        assert_eq!(suffix.end_poff(), 1_000 + "post-gc".len() as u64);

        let mut buf = [0u8; 7];
        suffix.read_at(&mut buf, 1_000).unwrap();
        assert_eq!(&buf, b"post-gc");
    }
}
