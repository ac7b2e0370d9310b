//! Typed wrapper over positional file I/O.
//!
//! Everything above this crate talks to files only through [`File`]: open,
//! close, `pread`/`pwrite`, `fsync`, `unlink`, `mkdir`, and [`classify_path`].
//! All operations are synchronous and fallible with the fixed error taxonomy
//! below; nothing here performs retries or buffering, that's the job of
//! `pack-store`'s append-only file.

use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use nix::unistd;

/// Closed error taxonomy for everything that touches the filesystem.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("double close on {0:?}")]
    DoubleClose(PathBuf),
    #[error("file already exists: {0:?}")]
    FileExists(PathBuf),
    #[error("no such file or directory: {0:?}")]
    NoSuchFileOrDirectory(PathBuf),
    #[error("not a file: {0:?}")]
    NotAFile(PathBuf),
    #[error("not a directory: {0:?}")]
    NotADirectory(PathBuf),
    #[error("read out of bounds at offset {offset} (wanted {len} bytes) in {path:?}")]
    ReadOutOfBounds {
        path: PathBuf,
        offset: u64,
        len: usize,
    },
    #[error("read-only file manager does not allow mutation of {0:?}")]
    RoNotAllowed(PathBuf),
    #[error("I/O error on {path:?}: {source}")]
    IoMisc {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Whether a [`File`] was opened for reading only, or for reading and
/// writing. A single writer process may hold files in [`Mode::ReadWrite`];
/// readers only ever use [`Mode::ReadOnly`] (see spec §5, SWMR).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    ReadOnly,
    ReadWrite,
}

/// How an open should behave with respect to pre-existing files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Open, creating the file if it is missing.
    Create,
    /// Create the file; fail if it already exists.
    CreateNew,
    /// The file must already exist.
    Existing,
}

/// Result of classifying a path on disk, used by the File Manager to decide
/// between `create_rw`, `open_rw` and the legacy-migration path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    File,
    Directory,
    Other,
    NoEnt,
}

pub fn classify_path<P: AsRef<Path>>(path: P) -> PathKind {
    match std::fs::symlink_metadata(path.as_ref()) {
        Ok(meta) => {
            if meta.is_file() {
                PathKind::File
            } else if meta.is_dir() {
                PathKind::Directory
            } else {
                PathKind::Other
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => PathKind::NoEnt,
        Err(_) => PathKind::Other,
    }
}

pub fn mkdir<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    std::fs::create_dir_all(path).map_err(|source| Error::IoMisc {
        path: path.to_owned(),
        source,
    })
}

pub fn unlink<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(Error::NoSuchFileOrDirectory(path.to_owned()))
        }
        Err(source) => Err(Error::IoMisc {
            path: path.to_owned(),
            source,
        }),
    }
}

/// A single open file, supporting positional (`pread`/`pwrite`) access.
///
/// This is deliberately thin: no internal buffering, no auto-flush. Those
/// concerns belong to the append-only file in `pack-store`, which is built
/// on top of `File`.
pub struct File {
    path: PathBuf,
    file: Option<std::fs::File>,
    mode: Mode,
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("open", &self.file.is_some())
            .finish()
    }
}

impl File {
    pub fn open<P: Into<PathBuf>>(mode: Mode, open_mode: OpenMode, path: P) -> Result<Self> {
        let path = path.into();

        if mode == Mode::ReadOnly && open_mode != OpenMode::Existing {
            return Err(Error::RoNotAllowed(path));
        }

        let mut options = std::fs::OpenOptions::new();
        match mode {
            Mode::ReadOnly => {
                options.read(true);
            }
            Mode::ReadWrite => {
                options.read(true).write(true);
            }
        }
        match open_mode {
            OpenMode::Existing => {}
            OpenMode::Create => {
                options.create(true);
            }
            OpenMode::CreateNew => {
                options.create_new(true);
            }
        }

        let file = options
            .open(&path)
            .map_err(|source| Self::classify_open_err(&path, source, open_mode))?;
        log::trace!("opened {path:?} mode={mode:?} open_mode={open_mode:?}");

        Ok(Self {
            path,
            file: Some(file),
            mode,
        })
    }

    fn classify_open_err(path: &Path, source: std::io::Error, open_mode: OpenMode) -> Error {
        match source.kind() {
            std::io::ErrorKind::NotFound => Error::NoSuchFileOrDirectory(path.to_owned()),
            std::io::ErrorKind::AlreadyExists if open_mode == OpenMode::CreateNew => {
                Error::FileExists(path.to_owned())
            }
            _ => Error::IoMisc {
                path: path.to_owned(),
                source,
            },
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    fn inner(&self) -> &std::fs::File {
        self.file.as_ref().expect("use of File after close")
    }

    fn fd(&self) -> RawFd {
        self.inner().as_raw_fd()
    }

    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        nix::sys::uio::pread(self.fd(), buf, offset as i64).map_err(|errno| Error::IoMisc {
            path: self.path.clone(),
            source: std::io::Error::from(errno),
        })
    }

    /// Read exactly `buf.len()` bytes starting at `offset`. A short read
    /// (end of file reached before the buffer is full) is reported as
    /// [`Error::ReadOutOfBounds`], matching spec §4.1.
    pub fn pread_exact(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let mut total = 0usize;
        while total < buf.len() {
            let n = self.pread(&mut buf[total..], offset + total as u64)?;
            if n == 0 {
                return Err(Error::ReadOutOfBounds {
                    path: self.path.clone(),
                    offset,
                    len: buf.len(),
                });
            }
            total += n;
        }
        Ok(())
    }

    pub fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        if self.mode == Mode::ReadOnly {
            return Err(Error::RoNotAllowed(self.path.clone()));
        }
        nix::sys::uio::pwrite(self.fd(), buf, offset as i64).map_err(|errno| Error::IoMisc {
            path: self.path.clone(),
            source: std::io::Error::from(errno),
        })
    }

    pub fn pwrite_all(&self, mut buf: &[u8], mut offset: u64) -> Result<()> {
        while !buf.is_empty() {
            let n = self.pwrite(buf, offset)?;
            buf = &buf[n..];
            offset += n as u64;
        }
        Ok(())
    }

    pub fn fsync(&self) -> Result<()> {
        unistd::fsync(self.fd()).map_err(|errno| Error::IoMisc {
            path: self.path.clone(),
            source: std::io::Error::from(errno),
        })
    }

    pub fn len(&self) -> Result<u64> {
        self.inner()
            .metadata()
            .map(|meta| meta.len())
            .map_err(|source| Error::IoMisc {
                path: self.path.clone(),
                source,
            })
    }

    pub fn set_len(&self, len: u64) -> Result<()> {
        if self.mode == Mode::ReadOnly {
            return Err(Error::RoNotAllowed(self.path.clone()));
        }
        self.inner().set_len(len).map_err(|source| Error::IoMisc {
            path: self.path.clone(),
            source,
        })
    }

    /// Closes the file. A second call returns [`Error::DoubleClose`] rather
    /// than silently succeeding, so callers that rely on "each batch flushes
    /// and closes exactly once" notice a logic error immediately.
    pub fn close(&mut self) -> Result<()> {
        match self.file.take() {
            Some(file) => {
                drop(file);
                Ok(())
            }
            None => Err(Error::DoubleClose(self.path.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_missing_path() {
        assert_eq!(classify_path("/no/such/path/hopefully"), PathKind::NoEnt);
    }

    #[test]
    fn open_missing_existing_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope");
        let err = File::open(Mode::ReadWrite, OpenMode::Existing, &path).unwrap_err();
        assert!(matches!(err, Error::NoSuchFileOrDirectory(_)));
    }

    #[test]
    fn create_new_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        File::open(Mode::ReadWrite, OpenMode::CreateNew, &path).unwrap();
        let err = File::open(Mode::ReadWrite, OpenMode::CreateNew, &path).unwrap_err();
        assert!(matches!(err, Error::FileExists(_)));
    }

    #[test]
    fn pwrite_pread_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let file = File::open(Mode::ReadWrite, OpenMode::Create, &path).unwrap();
        file.pwrite_all(b"hello world", 0).unwrap();
        let mut buf = [0u8; 5];
        file.pread_exact(&mut buf, 6).unwrap();
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn pread_exact_out_of_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let file = File::open(Mode::ReadWrite, OpenMode::Create, &path).unwrap();
        file.pwrite_all(b"abc", 0).unwrap();
        let mut buf = [0u8; 8];
        let err = file.pread_exact(&mut buf, 0).unwrap_err();
        assert!(matches!(err, Error::ReadOutOfBounds { .. }));
    }

    #[test]
    fn readonly_write_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        File::open(Mode::ReadWrite, OpenMode::Create, &path)
            .unwrap()
            .pwrite_all(b"x", 0)
            .unwrap();
        let ro = File::open(Mode::ReadOnly, OpenMode::Existing, &path).unwrap();
        let err = ro.pwrite(b"y", 0).unwrap_err();
        assert!(matches!(err, Error::RoNotAllowed(_)));
    }

    #[test]
    fn double_close_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let mut file = File::open(Mode::ReadWrite, OpenMode::Create, &path).unwrap();
        file.close().unwrap();
        assert!(matches!(file.close().unwrap_err(), Error::DoubleClose(_)));
    }
}
