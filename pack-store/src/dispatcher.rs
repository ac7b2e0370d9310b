//! Dispatcher (spec §4.8): resolves a `(offset, length)` read to either the
//! live suffix or, for data a GC cycle has moved, the prefix via the
//! mapping. The boundary between the two is exactly
//! [`Suffix::logical_start`]: below it, an object either lives in the
//! current prefix (translated through the mapping) or has been collected;
//! at or above it, the object is still in the suffix.

use crate::error::{Error, Result};
use crate::mapping::Mapping;
use crate::prefix::Prefix;
use crate::suffix::Suffix;

pub struct Dispatcher {
    prefix: Option<Prefix>,
    mapping: Option<Mapping>,
}

impl Dispatcher {
    pub fn new(prefix: Option<Prefix>, mapping: Option<Mapping>) -> Self {
        Self { prefix, mapping }
    }

    pub fn has_prefix(&self) -> bool {
        self.prefix.is_some()
    }

    pub fn swap(&mut self, prefix: Prefix, mapping: Mapping) -> (Option<Prefix>, Option<Mapping>) {
        let old = (self.prefix.take(), self.mapping.take());
        self.prefix = Some(prefix);
        self.mapping = Some(mapping);
        old
    }

    /// Read `buf.len()` bytes logically located at `offset` in the pack,
    /// routing through the suffix or the prefix+mapping as appropriate.
    pub fn read_exn(&self, suffix: &Suffix, buf: &mut [u8], offset: u64) -> Result<()> {
        if offset >= suffix.logical_start() {
            return suffix.read_at(buf, offset);
        }

        let mapping = self
            .mapping
            .as_ref()
            .ok_or(Error::InvalidPrefixRead { offset })?;
        let prefix = self
            .prefix
            .as_ref()
            .ok_or(Error::InvalidPrefixRead { offset })?;

        let dst_offset = mapping
            .translate(offset, buf.len() as u32)
            .map_err(|_| Error::InvalidReadOfGcedObject { offset })?;
        prefix.read_at(buf, dst_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::append_only::LateBound;
    use crate::mapping::MappingEntry;
    use std::sync::Arc;

    #[test]
    fn reads_above_boundary_go_to_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let owner = Arc::new(LateBound::new());
        let mut suffix = Suffix::create_rw(dir.path(), 1, 4096, owner).unwrap();
        suffix.append_exn(b"live-data").unwrap();
        suffix.flush().unwrap();

        let dispatcher = Dispatcher::new(None, None);
        let mut buf = [0u8; 4];
        dispatcher.read_exn(&suffix, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"live");
    }

    #[test]
    fn reads_below_boundary_without_prefix_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let owner = Arc::new(LateBound::new());
        let mut suffix = Suffix::create_rw(dir.path(), 1, 4096, owner).unwrap();
        suffix.append_exn(b"hello world").unwrap();
        suffix.flush().unwrap();
        suffix.split(2, 0).unwrap(); // old data now notionally belongs to a prefix

        let dispatcher = Dispatcher::new(None, None);
        let mut buf = [0u8; 4];
        assert!(matches!(
            dispatcher.read_exn(&suffix, &mut buf, 0).unwrap_err(),
            Error::InvalidPrefixRead { .. }
        ));
    }

    #[test]
    fn reads_below_boundary_with_mapping_go_to_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let mut prefix = Prefix::create_rw(dir.path().join("prefix")).unwrap();
        prefix.append_exn(b"archived").unwrap();

        let mapping = Mapping::new(vec![MappingEntry {
            src_offset: 0,
            length: 8,
            dst_offset: 0,
        }]);

        let owner = Arc::new(LateBound::new());
        let mut suffix = Suffix::create_rw(dir.path(), 2, 4096, owner).unwrap();
        suffix.append_exn(b"new-data").unwrap();
        suffix.flush().unwrap();
        // pretend the suffix's logical start was pushed past the archived region
        suffix.split(2, 8).unwrap();

        let dispatcher = Dispatcher::new(Some(prefix), Some(mapping));
        let mut buf = [0u8; 8];
        dispatcher.read_exn(&suffix, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"archived");
    }
}
