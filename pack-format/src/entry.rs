//! On-disk pack entry encoding and the entry-prefix fast path.
//!
//! ```text
//! hash:H | kind:1 | [length_header:varint] | payload:bytes
//! ```

use crate::hash::{PackHash, HASH_SIZE};
use crate::kind::Kind;
use crate::varint;

/// Bytes needed to be certain a prefix decode will succeed: the hash, the
/// kind byte, and the longest possible varint length header.
pub const ENTRY_PREFIX_MAX_LEN: usize = HASH_SIZE + 1 + varint::MAX_BYTES;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("entry prefix truncated")]
    Truncated,
    #[error("unknown pack entry kind byte {0}")]
    UnknownKind(u8),
}

/// The `(hash, kind, total_entry_length?)` extracted from an entry's
/// leading bytes, without touching its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPrefix {
    pub hash: PackHash,
    pub kind: Kind,
    /// Total on-disk length of the entry (`H + 1 + sizeof(len_hdr) +
    /// payload_len`), when `kind` carries a length header.
    pub total_length: Option<u64>,
    /// Byte offset, relative to the start of the entry, where the payload
    /// begins.
    pub payload_offset: usize,
}

impl EntryPrefix {
    /// Decode the prefix of one entry from `buf`, which must start at the
    /// entry's first byte and contain at least `ENTRY_PREFIX_MAX_LEN` bytes
    /// (or run to the physical end of file, whichever is shorter).
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < HASH_SIZE + 1 {
            return Err(DecodeError::Truncated);
        }
        let hash = PackHash::new(buf[0..HASH_SIZE].try_into().unwrap());
        let kind_byte = buf[HASH_SIZE];
        let kind = Kind::from_u8(kind_byte).ok_or(DecodeError::UnknownKind(kind_byte))?;

        if !kind.has_length_header() {
            return Ok(Self {
                hash,
                kind,
                total_length: None,
                payload_offset: HASH_SIZE + 1,
            });
        }

        let (value, hdr_len) =
            varint::decode(&buf[HASH_SIZE + 1..]).ok_or(DecodeError::Truncated)?;
        // `value` is defined to already include the header's own length
        // (spec §6), so the total entry length is simply H + 1 + value.
        let total_length = HASH_SIZE as u64 + 1 + value;
        Ok(Self {
            hash,
            kind,
            total_length: Some(total_length),
            payload_offset: HASH_SIZE + 1 + hdr_len,
        })
    }
}

/// Encode a complete entry: `hash | kind | [len_hdr] | payload` into `out`.
/// `payload` must already be the final, length-delimited serialisation of
/// the value; this function only prepends the shared header.
pub fn encode_entry(hash: PackHash, kind: Kind, payload: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(hash.as_bytes());
    out.push(kind.to_u8());
    if kind.has_length_header() {
        // value = payload_len + hdr_len; hdr_len isn't known until encoded,
        // so probe with a throwaway encode first (varints are at most 10
        // bytes, this never iterates more than twice in practice).
        let mut probe = payload.len() as u64 + 1;
        loop {
            let hdr_len = varint::encoded_len(probe) as u64;
            let value = payload.len() as u64 + hdr_len;
            if varint::encoded_len(value) as u64 == hdr_len {
                varint::encode(value, out);
                break;
            }
            probe = value;
        }
    }
    out.extend_from_slice(payload);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_contents() {
        let hash = PackHash::of_data(b"data");
        let payload = b"some payload bytes";
        let mut buf = Vec::new();
        encode_entry(hash, Kind::Contents, payload, &mut buf);

        let prefix = EntryPrefix::decode(&buf).unwrap();
        assert_eq!(prefix.hash, hash);
        assert_eq!(prefix.kind, Kind::Contents);
        assert_eq!(prefix.total_length, Some(buf.len() as u64));
        assert_eq!(&buf[prefix.payload_offset..], payload);
    }

    #[test]
    fn dangling_parent_commit_has_no_length() {
        let hash = PackHash::of_data(b"c");
        let mut buf = Vec::new();
        buf.extend_from_slice(hash.as_bytes());
        buf.push(Kind::DanglingParentCommit.to_u8());
        let prefix = EntryPrefix::decode(&buf).unwrap();
        assert_eq!(prefix.total_length, None);
    }

    #[test]
    fn truncated_prefix_is_rejected() {
        let mut buf = vec![0u8; HASH_SIZE];
        // missing kind byte
        assert_eq!(EntryPrefix::decode(&buf), Err(DecodeError::Truncated));
        buf.push(Kind::Contents.to_u8());
        buf.push(0x80); // incomplete varint
        assert_eq!(EntryPrefix::decode(&buf), Err(DecodeError::Truncated));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut buf = vec![0u8; HASH_SIZE];
        buf.push(200);
        assert_eq!(EntryPrefix::decode(&buf), Err(DecodeError::UnknownKind(200)));
    }

    #[test]
    fn large_payload_length_header_roundtrips() {
        let hash = PackHash::of_data(b"big");
        let payload = vec![7u8; 300_000];
        let mut buf = Vec::new();
        encode_entry(hash, Kind::CommitV2, &payload, &mut buf);
        let prefix = EntryPrefix::decode(&buf).unwrap();
        assert_eq!(prefix.total_length, Some(buf.len() as u64));
    }
}
