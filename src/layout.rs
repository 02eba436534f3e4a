//! On-media record layouts and block classification.
//!
//! Every persistent record is a bit-exact little-endian byte layout with
//! no implicit padding, declared as a packed [`Pod`] structure and moved
//! to and from flash with `bytemuck`. Records never carry
//! language-natural padding; the compile-time size pins at the bottom of
//! this module keep the layouts honest.
//!
//! A block's identity lives in the spare area of its first sector: the
//! type tag byte tells free, inode and file blocks apart. Spare bytes are
//! outside the ECC-protected payload, so the tag is decoded by Hamming
//! distance rather than equality and survives a single flipped bit.

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert;

use crate::errors::FsError;
use crate::nand::MAX_FILENAME_LEN;

/// Erase-state byte; a spare full of these has never been written.
pub(crate) const ERASED_BYTE: u8 = 0xFF;

/// `nbytes` value of a sector whose spare has never been programmed.
pub(crate) const ERASED_NBYTES: u16 = 0xFFFF;

/// Monotonic allocation sequence number, stamped into every chain link.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct Timestamp(pub u32);

impl Timestamp {
    /// Erased-state value; a link carrying it has not been committed.
    pub const INVALID: Self = Self(u32::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// Erase counter of a block, the wear-leveling currency.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct BlockAge(pub u32);

impl BlockAge {
    pub const INVALID: Self = Self(u32::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// Index of an erase block in the array.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct BlockIndex(pub u16);

impl BlockIndex {
    /// Erased-state value, also used as the explicit "no successor" link.
    pub const INVALID: Self = Self(u16::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// Identifier of a file, unique and strictly increasing for the lifetime
/// of a formatted medium.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct FileId(pub u32);

impl FileId {
    /// Erased-state value; an inode slot carrying it is free.
    pub const INVALID: Self = Self(u32::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// Persistent block role, stored as the type tag byte in the spare of a
/// block's first sector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BlockType {
    Unallocated,
    Inode,
    File,
}

impl BlockType {
    /// Free blocks simply keep the erased tag.
    const UNALLOCATED_TAG: u8 = ERASED_BYTE;
    const INODE_TAG: u8 = 0x01;
    const FILE_TAG: u8 = 0x02;

    /// Encodes the on-media tag byte.
    pub(crate) fn tag(self) -> u8 {
        match self {
            BlockType::Unallocated => Self::UNALLOCATED_TAG,
            BlockType::Inode => Self::INODE_TAG,
            BlockType::File => Self::FILE_TAG,
        }
    }

    /// Decodes a tag byte, tolerating a single flipped bit.
    ///
    /// The spare area is not ECC-protected, so the nearest valid tag wins
    /// as long as it is unambiguous within one bit of Hamming distance.
    /// Anything farther, or equidistant from two tags, is corrupt.
    pub(crate) fn decode(tag: u8) -> Option<Self> {
        const CANDIDATES: [(u8, BlockType); 3] = [
            (BlockType::UNALLOCATED_TAG, BlockType::Unallocated),
            (BlockType::INODE_TAG, BlockType::Inode),
            (BlockType::FILE_TAG, BlockType::File),
        ];

        let mut best: Option<BlockType> = None;
        let mut best_distance = u32::MAX;
        for (encoded, decoded) in CANDIDATES {
            let distance = hamming(tag, encoded);
            if distance < best_distance {
                best = Some(decoded);
                best_distance = distance;
            } else if distance == best_distance {
                best = None;
            }
        }

        if best_distance <= 1 {
            best
        } else {
            None
        }
    }
}

/// Number of differing bits between two bytes.
fn hamming(a: u8, b: u8) -> u32 {
    (a ^ b).count_ones()
}

/// First bytes of the init sector of a file block.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
pub(crate) struct FileInitHeader {
    pub age: BlockAge,
    pub file_id: FileId,
}

/// First bytes of the tail sector of a file block; the forward chain
/// link plus the block's final payload count.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
pub(crate) struct FileTailHeader {
    pub next_block: BlockIndex,
    pub next_age: BlockAge,
    pub timestamp: Timestamp,
    pub bytes_in_block: u16,
}

/// Leading fields shared by file and inode tail sectors. Mount scans
/// every block through this prefix to find the newest allocation.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
pub(crate) struct TailPrefix {
    pub next_block: BlockIndex,
    pub next_age: BlockAge,
    pub timestamp: Timestamp,
}

/// Spare-area record of a written data sector.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
pub(crate) struct SectorSpare {
    pub type_id: u8,
    pub reserved: u8,
    pub nbytes: u16,
}

impl SectorSpare {
    /// A spare whose `nbytes` is still all-ones belongs to a sector that
    /// has never been committed.
    pub(crate) fn is_erased(&self) -> bool {
        let nbytes = self.nbytes;
        nbytes == ERASED_NBYTES
    }
}

/// First bytes of the init sector of an inode block.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
pub(crate) struct InodeInitHeader {
    pub age: BlockAge,
    pub timestamp: Timestamp,
    pub previous_block: BlockIndex,
}

/// Spare-area record of an inode block's init sector; `inode_index` is
/// the block's absolute position in the inode chain.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
pub(crate) struct InodeInitSpare {
    pub type_id: u8,
    pub reserved: u8,
    pub inode_index: u16,
}

/// Allocation half of an inode entry: one sector recording a file's
/// identity, first block and name.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
pub(crate) struct InodeAllocEntry {
    pub file_id: FileId,
    pub first_block: BlockIndex,
    pub first_block_age: BlockAge,
    pub timestamp: Timestamp,
    pub filename: [u8; MAX_FILENAME_LEN],
}

/// Invalidation half of an inode entry; an erased timestamp means the
/// file is live.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
pub(crate) struct InodeInvalidateEntry {
    pub timestamp: Timestamp,
    pub last_block: BlockIndex,
}

/// Record written into the stat sector of a block after format or
/// reclaim. It preserves the erase counter across the erase and, for
/// blocks reclaimed out of a file chain, the old forward link so an
/// interrupted chain invalidation can resume.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
pub(crate) struct BlockStat {
    pub age: BlockAge,
    pub next_block: BlockIndex,
    pub next_age: BlockAge,
    pub timestamp: Timestamp,
    pub key: [u8; 8],
}

impl BlockStat {
    /// Magic key telling an initialized stat sector from leftover factory
    /// contents at format time.
    pub(crate) const KEY: [u8; 8] = *b"FLogFS03";

    pub(crate) fn is_valid(&self) -> bool {
        self.key == Self::KEY
    }
}

/// A NUL-terminated filename as stored in an inode allocation entry.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Filename([u8; MAX_FILENAME_LEN]);

impl Filename {
    /// Builds a filename from a string.
    ///
    /// # Errors
    ///
    /// [`FsError::NameTooLong`] if the name does not leave room for the
    /// terminating NUL, or contains an interior NUL.
    pub fn new(name: &str) -> Result<Self, FsError> {
        let bytes = name.as_bytes();
        if bytes.len() >= MAX_FILENAME_LEN || bytes.contains(&0) {
            return Err(FsError::NameTooLong);
        }

        let mut raw = [0u8; MAX_FILENAME_LEN];
        raw[..bytes.len()].copy_from_slice(bytes);
        Ok(Self(raw))
    }

    pub(crate) fn from_raw(raw: [u8; MAX_FILENAME_LEN]) -> Self {
        Self(raw)
    }

    pub(crate) fn raw(&self) -> [u8; MAX_FILENAME_LEN] {
        self.0
    }

    /// The name as a string slice, up to the terminating NUL. Non-UTF-8
    /// names read back empty.
    pub fn as_str(&self) -> &str {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(self.0.len());
        core::str::from_utf8(&self.0[..len]).unwrap_or("")
    }
}

impl core::fmt::Debug for Filename {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::fmt::Display for Filename {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload byte offsets inside the special sectors.
pub(crate) const FILE_INIT_HEADER_LEN: u16 = core::mem::size_of::<FileInitHeader>() as u16;
pub(crate) const FILE_TAIL_HEADER_LEN: u16 = core::mem::size_of::<FileTailHeader>() as u16;

const_assert!(core::mem::size_of::<FileInitHeader>() == 8);
const_assert!(core::mem::size_of::<FileTailHeader>() == 12);
const_assert!(core::mem::size_of::<TailPrefix>() == 10);
const_assert!(core::mem::size_of::<SectorSpare>() == 4);
const_assert!(core::mem::size_of::<InodeInitHeader>() == 10);
const_assert!(core::mem::size_of::<InodeInitSpare>() == 4);
const_assert!(core::mem::size_of::<InodeAllocEntry>() == 46);
const_assert!(core::mem::size_of::<InodeInvalidateEntry>() == 6);
const_assert!(core::mem::size_of::<BlockStat>() == 22);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_roundtrip() {
        for ty in [BlockType::Unallocated, BlockType::Inode, BlockType::File] {
            assert_eq!(BlockType::decode(ty.tag()), Some(ty));
        }
    }

    #[test]
    fn tag_single_bit_flip() {
        // 0xFF with any one bit cleared still reads back as unallocated.
        for bit in 0..8 {
            let flipped = 0xFFu8 ^ (1 << bit);
            assert_eq!(BlockType::decode(flipped), Some(BlockType::Unallocated));
        }
        // 0x03 is one bit from both INODE and FILE: ambiguous, corrupt.
        assert_eq!(BlockType::decode(0x03), None);
        // 0x00 sits at distance 1 from INODE (0x01)
        // and 1 from 0x02: ambiguous as well.
        assert_eq!(BlockType::decode(0x00), None);
        // Far-away garbage is corrupt.
        assert_eq!(BlockType::decode(0x5A), None);
    }

    #[test]
    fn filename_length_limits() {
        let max_ok = "a".repeat(MAX_FILENAME_LEN - 1);
        assert!(Filename::new(&max_ok).is_ok());

        let too_long = "a".repeat(MAX_FILENAME_LEN);
        assert_eq!(Filename::new(&too_long), Err(FsError::NameTooLong));
    }

    #[test]
    fn filename_string_roundtrip() {
        let name = Filename::new("telemetry.log").unwrap();
        assert_eq!(name.as_str(), "telemetry.log");
        assert_eq!(Filename::from_raw(name.raw()), name);
    }

    #[test]
    fn erased_spare_detection() {
        let erased = SectorSpare {
            type_id: ERASED_BYTE,
            reserved: ERASED_BYTE,
            nbytes: ERASED_NBYTES,
        };
        assert!(erased.is_erased());

        let written = SectorSpare {
            type_id: BlockType::File.tag(),
            reserved: 0,
            nbytes: 128,
        };
        assert!(!written.is_erased());
    }
}
