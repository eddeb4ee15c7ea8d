//! Object kinds and cache policies.

use serde::{Deserialize, Serialize};

/// Size of one entry in an [`ObjectKind::EntryTable`] block.
pub const ENTRY_SIZE: usize = 512;

/// Kind of object stored in a block tree.
///
/// The kind decides whether the object's level-0 blocks count as metadata
/// and how a leaf block's fill count is computed when it is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ObjectKind {
    /// Plain file contents.
    #[default]
    Data = 0,
    /// Directory entries.
    Directory = 1,
    /// Fixed-size entry table (object metadata records).
    EntryTable = 2,
    /// Opaque filesystem metadata.
    Metadata = 3,
    /// Space allocation maps.
    SpaceMap = 4,
}

impl ObjectKind {
    /// Returns true if level-0 blocks of this kind are metadata.
    pub fn is_metadata(&self) -> bool {
        !matches!(self, ObjectKind::Data)
    }

    /// Returns the entry size when leaf fill counts are per-entry.
    pub fn entry_size(&self) -> Option<usize> {
        match self {
            ObjectKind::EntryTable => Some(ENTRY_SIZE),
            _ => None,
        }
    }

    /// Converts from the on-disk representation.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ObjectKind::Data),
            1 => Some(ObjectKind::Directory),
            2 => Some(ObjectKind::EntryTable),
            3 => Some(ObjectKind::Metadata),
            4 => Some(ObjectKind::SpaceMap),
            _ => None,
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ObjectKind::Data => "DATA",
            ObjectKind::Directory => "DIRECTORY",
            ObjectKind::EntryTable => "ENTRY_TABLE",
            ObjectKind::Metadata => "METADATA",
            ObjectKind::SpaceMap => "SPACE_MAP",
        };
        write!(f, "{}", name)
    }
}

/// Which blocks may stay resident in the cache tier once unreferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CachePolicy {
    /// Cache every block.
    #[default]
    All,
    /// Cache indirect blocks and metadata objects only.
    Metadata,
    /// Evict every block as soon as its last hold is released.
    None,
}

impl CachePolicy {
    /// Returns true if a block with the given metadata classification may
    /// be kept in the cache tier.
    pub fn allows(&self, metadata: bool) -> bool {
        match self {
            CachePolicy::All => true,
            CachePolicy::Metadata => metadata,
            CachePolicy::None => false,
        }
    }
}
