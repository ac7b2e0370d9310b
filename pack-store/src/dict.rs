//! Interned-string table (spec §4.5): a small append-only log of strings,
//! addressed by index, used to de-duplicate repeated metadata (e.g. step
//! names in inode paths) across pack entries.

use std::collections::HashMap;

use crate::append_only::{AppendOnly, AutoFlushProcedure};
use crate::error::{Error, Result};

pub struct Dict {
    ao: AppendOnly,
    entries: Vec<String>,
    index_of: HashMap<String, u32>,
    loaded_up_to: u64,
}

impl Dict {
    pub fn create_rw(
        path: impl Into<std::path::PathBuf>,
        auto_flush_threshold: usize,
        auto_flush_procedure: AutoFlushProcedure,
    ) -> Result<Self> {
        let ao = AppendOnly::create_rw(path, auto_flush_threshold, auto_flush_procedure)?;
        Ok(Self {
            ao,
            entries: Vec::new(),
            index_of: HashMap::new(),
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
        let mut dict = Self {
            ao,
            entries: Vec::new(),
            index_of: HashMap::new(),
            loaded_up_to: 0,
        };
        dict.load_up_to(persisted_len)?;
        Ok(dict)
    }

    pub fn open_ro(path: impl Into<std::path::PathBuf>) -> Result<Self> {
        let ao = AppendOnly::open_ro(path)?;
        let end = ao.end_poff();
        let mut dict = Self {
            ao,
            entries: Vec::new(),
            index_of: HashMap::new(),
            loaded_up_to: 0,
        };
        dict.load_up_to(end)?;
        Ok(dict)
    }

    fn load_up_to(&mut self, end: u64) -> Result<()> {
        while self.loaded_up_to < end {
            let mut len_buf = [0u8; 4];
            self.ao.read_at(&mut len_buf, self.loaded_up_to)?;
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut str_buf = vec![0u8; len];
            self.ao.read_at(&mut str_buf, self.loaded_up_to + 4)?;
            let s = String::from_utf8(str_buf)
                .map_err(|_| Error::CorruptedStore("dict entry is not valid utf-8".into()))?;
            let i = self.entries.len() as u32;
            self.index_of.insert(s.clone(), i);
            self.entries.push(s);
            self.loaded_up_to += 4 + len as u64;
        }
        Ok(())
    }

    /// Called by the File Manager after a reload picks up a new persisted
    /// length from the control file.
    pub fn reload(&mut self, persisted_len: u64) -> Result<()> {
        self.ao.refresh_end_poff(persisted_len);
        self.load_up_to(persisted_len)
    }

    pub fn find(&self, i: u32) -> Option<&str> {
        self.entries.get(i as usize).map(String::as_str)
    }

    /// Returns the existing index for `s`, or appends it and returns the
    /// newly assigned one.
    pub fn index(&mut self, s: &str) -> Result<u32> {
        if let Some(&i) = self.index_of.get(s) {
            return Ok(i);
        }
        let i = self.entries.len() as u32;
        let mut buf = Vec::with_capacity(4 + s.len());
        buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
        buf.extend_from_slice(s.as_bytes());
        self.ao.append_exn(&buf)?;
        self.entries.push(s.to_owned());
        self.index_of.insert(s.to_owned(), i);
        self.loaded_up_to += buf.len() as u64;
        Ok(i)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.ao.flush()
    }

    pub fn fsync(&self) -> Result<()> {
        self.ao.fsync()
    }

    pub fn end_poff(&self) -> u64 {
        self.ao.end_poff()
    }

    pub fn close(&mut self) -> Result<()> {
        self.ao.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_then_find_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let mut dict = Dict::create_rw(dir.path().join("dict"), 4096, AutoFlushProcedure::Internal).unwrap();
        let i = dict.index("step-a").unwrap();
        let j = dict.index("step-b").unwrap();
        let i2 = dict.index("step-a").unwrap();
        assert_eq!(i, i2);
        assert_ne!(i, j);
        assert_eq!(dict.find(i), Some("step-a"));
        assert_eq!(dict.find(j), Some("step-b"));
    }

    #[test]
    fn reopen_after_flush_preserves_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dict");
        let mut dict = Dict::create_rw(&path, 4096, AutoFlushProcedure::Internal).unwrap();
        let i = dict.index("alpha").unwrap();
        dict.flush().unwrap();
        let end = dict.end_poff();
        drop(dict);

        let reopened = Dict::open_ro(&path).unwrap();
        assert_eq!(reopened.find(i), Some("alpha"));
        assert_eq!(reopened.end_poff(), end);
    }
}
