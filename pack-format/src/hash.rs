//! Fixed-width content digests.

/// Digest width in bytes (`H` in the spec). 32 bytes = SHA-256.
pub const HASH_SIZE: usize = 32;

/// A fixed-width cryptographic digest. Equality is byte equality.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackHash([u8; HASH_SIZE]);

impl PackHash {
    pub fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn of_data(data: &[u8]) -> Self {
        Self(openssl::sha::sha256(data))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let bytes: [u8; HASH_SIZE] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    /// A short projection used as the key for in-memory hash tables
    /// (staging, LRU): the first 8 bytes of the digest, big-endian.
    pub fn short(self) -> u64 {
        u64::from_be_bytes(self.0[0..8].try_into().unwrap())
    }
}

impl std::fmt::Debug for PackHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PackHash({})", self.to_hex())
    }
}

impl std::fmt::Display for PackHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let hash = PackHash::of_data(b"hello");
        let hex = hash.to_hex();
        assert_eq!(PackHash::from_hex(&hex), Some(hash));
    }

    #[test]
    fn distinct_data_distinct_hash() {
        assert_ne!(PackHash::of_data(b"a"), PackHash::of_data(b"b"));
    }
}
