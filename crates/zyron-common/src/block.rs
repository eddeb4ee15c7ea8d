//! Block addressing for the Zyron buffer cache.
//!
//! A block is named by `(owner, object, level, blkid)`. Level 0 holds user
//! data; higher levels hold indirect blocks, which are arrays of
//! [`BlockPtr`] entries pointing at the level below.

use serde::{Deserialize, Serialize};

/// Smallest block size supported by the cache.
pub const MIN_BLOCK_SIZE: usize = 512;

/// Largest block size supported by the cache.
pub const MAX_BLOCK_SIZE: usize = 128 * 1024;

/// log2 of [`MIN_BLOCK_SIZE`].
pub const MIN_BLOCK_SHIFT: u32 = 9;

/// Size of the bonus area carried inside the object metadata.
pub const BONUS_SIZE: usize = 320;

/// Serialized size of a block pointer.
pub const BLKPTR_SIZE: usize = 32;

/// log2 of [`BLKPTR_SIZE`].
pub const BLKPTR_SHIFT: u32 = 5;

/// Block id of the bonus buffer of an object.
pub const BONUS_BLKID: u64 = u64::MAX;

/// Block id of the spill block of an object.
pub const SPILL_BLKID: u64 = u64::MAX - 1;

/// Identifies an object inside an owner (dataset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    /// Owning dataset.
    pub owner: u64,
    /// Object number within the owner.
    pub object: u64,
}

impl ObjectId {
    /// Creates a new ObjectId.
    pub fn new(owner: u64, object: u64) -> Self {
        Self { owner, object }
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.object)
    }
}

/// Logical address of a cached block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferKey {
    pub owner: u64,
    pub object: u64,
    pub level: u8,
    pub blkid: u64,
}

impl BufferKey {
    /// Creates a new BufferKey.
    pub fn new(object: ObjectId, level: u8, blkid: u64) -> Self {
        Self {
            owner: object.owner,
            object: object.object,
            level,
            blkid,
        }
    }

    /// Returns the object this block belongs to.
    #[inline]
    pub fn object_id(&self) -> ObjectId {
        ObjectId::new(self.owner, self.object)
    }

    #[inline]
    pub fn is_bonus(&self) -> bool {
        self.blkid == BONUS_BLKID
    }

    #[inline]
    pub fn is_spill(&self) -> bool {
        self.blkid == SPILL_BLKID
    }
}

impl std::fmt::Display for BufferKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.blkid {
            BONUS_BLKID => write!(f, "{}/{}/bonus", self.owner, self.object),
            SPILL_BLKID => write!(f, "{}/{}/spill", self.owner, self.object),
            blkid => write!(f, "{}/{}/{}/{}", self.owner, self.object, self.level, blkid),
        }
    }
}

/// On-media pointer to a written block.
///
/// A pointer with `birth == 0` is a hole: the block was never written (or
/// was freed) and reads as zeros.
///
/// Layout (32 bytes):
/// - addr: 8 bytes
/// - birth: 8 bytes
/// - fill: 8 bytes
/// - size: 4 bytes
/// - level: 1 byte
/// - reserved: 3 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BlockPtr {
    /// Physical address assigned by the block store.
    pub addr: u64,
    /// Transaction group in which the block was written.
    pub birth: u64,
    /// Number of non-empty leaf entries beneath this pointer.
    pub fill: u64,
    /// Logical size in bytes.
    pub size: u32,
    /// Tree level of the block pointed to.
    pub level: u8,
}

impl BlockPtr {
    /// The hole pointer.
    pub const HOLE: BlockPtr = BlockPtr {
        addr: 0,
        birth: 0,
        fill: 0,
        size: 0,
        level: 0,
    };

    #[inline]
    pub fn is_hole(&self) -> bool {
        self.birth == 0
    }

    /// Returns true if both pointers name the same physical block.
    #[inline]
    pub fn same_block(&self, other: &BlockPtr) -> bool {
        self.addr == other.addr && self.birth == other.birth
    }

    /// Serializes the pointer to bytes.
    pub fn to_bytes(&self) -> [u8; BLKPTR_SIZE] {
        let mut buf = [0u8; BLKPTR_SIZE];
        buf[0..8].copy_from_slice(&self.addr.to_le_bytes());
        buf[8..16].copy_from_slice(&self.birth.to_le_bytes());
        buf[16..24].copy_from_slice(&self.fill.to_le_bytes());
        buf[24..28].copy_from_slice(&self.size.to_le_bytes());
        buf[28] = self.level;
        // bytes 29-31 are reserved (already zeroed)
        buf
    }

    /// Deserializes a pointer from the first [`BLKPTR_SIZE`] bytes of `buf`.
    pub fn from_bytes(buf: &[u8]) -> Self {
        let word = |at: usize| {
            u64::from_le_bytes([
                buf[at],
                buf[at + 1],
                buf[at + 2],
                buf[at + 3],
                buf[at + 4],
                buf[at + 5],
                buf[at + 6],
                buf[at + 7],
            ])
        };
        Self {
            addr: word(0),
            birth: word(8),
            fill: word(16),
            size: u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]),
            level: buf[28],
        }
    }

    /// Reads the pointer stored at byte offset `offset` of an indirect block.
    #[inline]
    pub fn read_at(data: &[u8], offset: usize) -> Self {
        Self::from_bytes(&data[offset..offset + BLKPTR_SIZE])
    }

    /// Stores the pointer at byte offset `offset` of an indirect block.
    #[inline]
    pub fn write_at(&self, data: &mut [u8], offset: usize) {
        data[offset..offset + BLKPTR_SIZE].copy_from_slice(&self.to_bytes());
    }
}

impl std::fmt::Display for BlockPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_hole() {
            write!(f, "<hole>")
        } else {
            write!(
                f,
                "L{} addr={} size={} birth={} fill={}",
                self.level, self.addr, self.size, self.birth, self.fill
            )
        }
    }
}

/// Rounds `size` up to the next multiple of [`MIN_BLOCK_SIZE`].
#[inline]
pub fn round_up_block(size: usize) -> usize {
    (size + MIN_BLOCK_SIZE - 1) & !(MIN_BLOCK_SIZE - 1)
}
