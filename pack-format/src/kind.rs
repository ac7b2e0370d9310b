//! The closed set of pack entry kinds (spec §3, "Pack entry").

/// Selects whether an entry carries a varint length header and whether its
/// payload references other objects by offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    Contents = 0,
    InodeV1Stable = 1,
    InodeV1Unstable = 2,
    InodeV2Root = 3,
    InodeV2NonRoot = 4,
    CommitV1 = 5,
    CommitV2 = 6,
    /// Placeholder for a commit parent that has itself been garbage
    /// collected. Only ever encountered while deserialising a surviving
    /// commit; never appears as a freshly written entry's kind.
    DanglingParentCommit = 7,
}

impl Kind {
    pub fn from_u8(byte: u8) -> Option<Kind> {
        Some(match byte {
            0 => Kind::Contents,
            1 => Kind::InodeV1Stable,
            2 => Kind::InodeV1Unstable,
            3 => Kind::InodeV2Root,
            4 => Kind::InodeV2NonRoot,
            5 => Kind::CommitV1,
            6 => Kind::CommitV2,
            7 => Kind::DanglingParentCommit,
            _ => return None,
        })
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Whether an entry of this kind carries a varint length header.
    /// `Dangling_parent_commit` is the sole exception: its length is
    /// unknowable until it is upgraded to `Commit_v2`.
    pub fn has_length_header(self) -> bool {
        !matches!(self, Kind::DanglingParentCommit)
    }

    /// Whether the payload of this kind references other pack entries by
    /// offset (inodes reference children, commits reference a root inode
    /// and parent commits).
    pub fn references_other_objects(self) -> bool {
        matches!(
            self,
            Kind::InodeV1Stable
                | Kind::InodeV1Unstable
                | Kind::InodeV2Root
                | Kind::InodeV2NonRoot
                | Kind::CommitV1
                | Kind::CommitV2
        )
    }

    pub fn is_commit(self) -> bool {
        matches!(self, Kind::CommitV1 | Kind::CommitV2)
    }

    /// A surviving commit may reference a `Dangling_parent_commit`
    /// placeholder; it is always treated as a (lengthless) `Commit_v2` for
    /// the purpose of computing an entry's length (spec §4.9).
    pub fn upgrade_dangling(self) -> Kind {
        match self {
            Kind::DanglingParentCommit => Kind::CommitV2,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_variants() {
        for byte in 0u8..=7 {
            let kind = Kind::from_u8(byte).unwrap();
            assert_eq!(kind.to_u8(), byte);
        }
        assert!(Kind::from_u8(8).is_none());
    }

    #[test]
    fn only_dangling_lacks_length_header() {
        assert!(!Kind::DanglingParentCommit.has_length_header());
        for byte in 0u8..=6 {
            assert!(Kind::from_u8(byte).unwrap().has_length_header());
        }
    }

    #[test]
    fn dangling_upgrades_to_commit_v2() {
        assert_eq!(Kind::DanglingParentCommit.upgrade_dangling(), Kind::CommitV2);
        assert_eq!(Kind::Contents.upgrade_dangling(), Kind::Contents);
    }
}
