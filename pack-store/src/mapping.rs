//! Sorted `(src_offset, length) -> dst_offset` redirection table produced by
//! a GC cycle (spec §3/§4): every live object the GC copied into the new
//! prefix gets an entry here so the Dispatcher can translate a pre-GC
//! offset into its post-GC location.

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MappingEntry {
    pub src_offset: u64,
    pub length: u32,
    pub dst_offset: u64,
}

const ENTRY_SIZE: usize = 8 + 4 + 8;

pub struct Mapping {
    entries: Vec<MappingEntry>,
}

impl Mapping {
    pub fn new(mut entries: Vec<MappingEntry>) -> Self {
        entries.sort_by_key(|e| e.src_offset);
        Self { entries }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * ENTRY_SIZE);
        for e in &self.entries {
            out.extend_from_slice(&e.src_offset.to_le_bytes());
            out.extend_from_slice(&e.length.to_le_bytes());
            out.extend_from_slice(&e.dst_offset.to_le_bytes());
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() % ENTRY_SIZE != 0 {
            return Err(Error::InvalidMappingRead {
                offset: 0,
                reason: format!("mapping file length {} is not a multiple of {}", buf.len(), ENTRY_SIZE),
            });
        }
        let mut entries = Vec::with_capacity(buf.len() / ENTRY_SIZE);
        for chunk in buf.chunks_exact(ENTRY_SIZE) {
            let src_offset = u64::from_le_bytes(chunk[0..8].try_into().unwrap());
            let length = u32::from_le_bytes(chunk[8..12].try_into().unwrap());
            let dst_offset = u64::from_le_bytes(chunk[12..20].try_into().unwrap());
            entries.push(MappingEntry {
                src_offset,
                length,
                dst_offset,
            });
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the entry whose `[src_offset, src_offset + length)` range
    /// contains `offset`, and translate to the prefix-local destination
    /// offset.
    pub fn translate(&self, offset: u64, len: u32) -> Result<u64> {
        let i = match self.entries.binary_search_by_key(&offset, |e| e.src_offset) {
            Ok(i) => i,
            Err(0) => {
                return Err(Error::InvalidMappingRead {
                    offset,
                    reason: "no mapping entry covers this offset".into(),
                })
            }
            Err(i) => i - 1,
        };
        let entry = &self.entries[i];
        let end = entry.src_offset + entry.length as u64;
        if offset < entry.src_offset || offset + len as u64 > end {
            return Err(Error::InvalidMappingRead {
                offset,
                reason: "read range is not fully covered by a single mapping entry".into(),
            });
        }
        Ok(entry.dst_offset + (offset - entry.src_offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Mapping {
        Mapping::new(vec![
            MappingEntry {
                src_offset: 100,
                length: 10,
                dst_offset: 0,
            },
            MappingEntry {
                src_offset: 200,
                length: 20,
                dst_offset: 10,
            },
        ])
    }

    #[test]
    fn translate_hits_and_misses() {
        let m = sample();
        assert_eq!(m.translate(100, 10).unwrap(), 0);
        assert_eq!(m.translate(205, 5).unwrap(), 15);
        assert!(m.translate(150, 1).is_err());
        assert!(m.translate(205, 100).is_err());
    }

    #[test]
    fn encode_decode_roundtrip() {
        let m = sample();
        let bytes = m.encode();
        let decoded = Mapping::decode(&bytes).unwrap();
        assert_eq!(decoded.len(), m.len());
        assert_eq!(decoded.translate(200, 20).unwrap(), 10);
    }

    #[test]
    fn decode_rejects_truncated_buffer() {
        assert!(Mapping::decode(&[0u8; 5]).is_err());
    }
}
