//! Pack keys: the two-form (`Indexed` / `Direct`) addressing scheme.

use std::cell::Cell;

use crate::hash::PackHash;

/// The resolved state of a [`PackKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackKeyState {
    /// Offset/length unknown; must be resolved via the index.
    Indexed,
    /// All information known for a single random-access read.
    Direct { offset: u64, length: u32 },
}

/// A tagged, content-addressed key.
///
/// Keys are promotable in place from `Indexed` to `Direct` upon first
/// successful lookup: the hash never changes, only the resolved location is
/// filled in (spec §3, "Promotion of keys" / §9 "interior-mutable cell").
/// `Clone` produces an independent cell seeded with the current state, so
/// promoting one clone does not promote another live in a different
/// thread/store.
pub struct PackKey {
    hash: PackHash,
    state: Cell<PackKeyState>,
}

impl PackKey {
    pub fn indexed(hash: PackHash) -> Self {
        Self {
            hash,
            state: Cell::new(PackKeyState::Indexed),
        }
    }

    pub fn direct(hash: PackHash, offset: u64, length: u32) -> Self {
        Self {
            hash,
            state: Cell::new(PackKeyState::Direct { offset, length }),
        }
    }

    pub fn hash(&self) -> PackHash {
        self.hash
    }

    pub fn state(&self) -> PackKeyState {
        self.state.get()
    }

    pub fn is_direct(&self) -> bool {
        matches!(self.state(), PackKeyState::Direct { .. })
    }

    pub fn offset_length(&self) -> Option<(u64, u32)> {
        match self.state() {
            PackKeyState::Direct { offset, length } => Some((offset, length)),
            PackKeyState::Indexed => None,
        }
    }

    /// Monotonically refine an `Indexed` key to `Direct` in place. The hash
    /// invariant (spec §3 invariant 1/6: "the hash never changes") is
    /// preserved because `hash` has no setter.
    pub fn promote(&self, offset: u64, length: u32) {
        self.state.set(PackKeyState::Direct { offset, length });
    }
}

impl Clone for PackKey {
    fn clone(&self) -> Self {
        Self {
            hash: self.hash,
            state: Cell::new(self.state.get()),
        }
    }
}

impl std::fmt::Debug for PackKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackKey")
            .field("hash", &self.hash)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for PackKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}
impl Eq for PackKey {}

impl std::hash::Hash for PackKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promote_is_monotonic_and_keeps_hash() {
        let h = PackHash::of_data(b"x");
        let key = PackKey::indexed(h);
        assert!(!key.is_direct());
        key.promote(42, 10);
        assert!(key.is_direct());
        assert_eq!(key.hash(), h);
        assert_eq!(key.offset_length(), Some((42, 10)));
    }

    #[test]
    fn clone_does_not_share_promotion() {
        let key = PackKey::indexed(PackHash::of_data(b"x"));
        let clone = key.clone();
        key.promote(1, 1);
        assert!(key.is_direct());
        assert!(!clone.is_direct());
    }
}
