//! Read-only prefix reader (spec §3/§4): the pack segment that a GC cycle
//! writes once and never appends to again. Reads go through the
//! [`crate::mapping::Mapping`] to translate a pre-GC offset into the
//! prefix's own local offset space.

use std::path::PathBuf;

use crate::error::Result;

pub struct Prefix {
    file: pack_io::File,
    len: u64,
}

impl Prefix {
    pub fn create_rw(path: impl Into<PathBuf>) -> Result<Self> {
        let file = pack_io::File::open(pack_io::Mode::ReadWrite, pack_io::OpenMode::CreateNew, path)?;
        Ok(Self { file, len: 0 })
    }

    pub fn open_ro(path: impl Into<PathBuf>) -> Result<Self> {
        let file = pack_io::File::open(pack_io::Mode::ReadOnly, pack_io::OpenMode::Existing, path)?;
        let len = file.len()?;
        Ok(Self { file, len })
    }

    pub fn open_ro_if_exists(path: impl Into<PathBuf>) -> Result<Option<Self>> {
        let path = path.into();
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(Self::open_ro(path)?))
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Only used while a GC worker is actively building a fresh prefix.
    pub fn append_exn(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.pwrite_all(bytes, self.len)?;
        self.len += bytes.len() as u64;
        Ok(())
    }

    pub fn fsync(&self) -> Result<()> {
        self.file.fsync().map_err(Into::into)
    }

    pub fn read_at(&self, buf: &mut [u8], local_offset: u64) -> Result<()> {
        self.file.pread_exact(buf, local_offset).map_err(Into::into)
    }

    pub fn close(self) -> Result<()> {
        let Self { mut file, .. } = self;
        file.close().map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut prefix = Prefix::create_rw(dir.path().join("prefix")).unwrap();
        prefix.append_exn(b"object-bytes").unwrap();
        prefix.fsync().unwrap();
        assert_eq!(prefix.len(), 12);

        let mut buf = [0u8; 6];
        prefix.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"object");
    }

    #[test]
    fn open_ro_if_exists_is_none_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Prefix::open_ro_if_exists(dir.path().join("nope")).unwrap().is_none());
    }
}
