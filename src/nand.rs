//! Standard interface to raw NAND flash devices.
//!
//! The filesystem core never touches a device register: every media access
//! goes through the [`NandFlash`] trait, which models the usual SLC NAND
//! programming discipline: reads and programs staged through a single
//! device-internal page cache, pages within a block programmed in order,
//! whole-block erase, and a per-sector out-of-band spare area.
//!
//! The driver owns timeouts and ECC; the core only consumes the qualified
//! [`ReadIntegrity`] verdicts. Device locking is realized by ownership: the
//! driver instance is owned by the mounted filesystem handle and is only
//! reachable through its lock.

use crate::errors::{CanFail, FlashError, ReadIntegrity};

/// Number of out-of-band spare bytes attached to each sector.
pub const SPARE_LEN: usize = 16;

/// Compile-time limit on filename length, terminating NUL included.
pub const MAX_FILENAME_LEN: usize = 32;

/// Shape of the NAND array, as reported by the driver.
///
/// All filesystem sector-role arithmetic (init, tail and stat sectors,
/// inode entry window) derives from these four quantities.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    /// Payload bytes per sector.
    pub sector_size: u16,

    /// Sectors sharing one page program.
    pub sectors_per_page: u16,

    /// Pages per erase block.
    pub pages_per_block: u16,

    /// Erase blocks in the array.
    pub blocks: u16,
}

impl Geometry {
    /// Sectors in one erase block.
    pub fn sectors_per_block(&self) -> u16 {
        self.sectors_per_page * self.pages_per_block
    }

    /// Last-but-one sector of a block, carrying the forward chain link.
    pub fn tail_sector(&self) -> u16 {
        self.sectors_per_block() - 2
    }

    /// Last sector of a block, carrying the stat record while the block
    /// is free and nothing while it is in use.
    pub fn stat_sector(&self) -> u16 {
        self.sectors_per_block() - 1
    }

    /// First sector of an inode block that may hold an inode entry (the
    /// first sector past the page holding the block metadata).
    pub fn first_entry_sector(&self) -> u16 {
        self.sectors_per_page
    }

    /// Last sector of an inode block that may start an inode entry pair.
    pub fn last_entry_sector(&self) -> u16 {
        self.sectors_per_block() - 4
    }

    /// Page holding the given sector.
    pub fn page_of(&self, sector: u16) -> u16 {
        sector / self.sectors_per_page
    }

    /// Total number of sectors in the array.
    pub fn total_sectors(&self) -> u32 {
        u32::from(self.blocks) * u32::from(self.sectors_per_block())
    }
}

/// Contract a raw NAND driver must provide to host the filesystem.
///
/// The driver exposes exactly one open page at a time. `open_page` loads a
/// page into the device cache; sector and spare reads and writes address
/// that cached page; `commit` programs the staged writes to the media.
/// Writes to different sectors of one page land atomically on commit,
/// writes to different pages land in issue order.
pub trait NandFlash {
    /// Reports the device geometry.
    fn geometry(&self) -> Geometry;

    /// Brings the device out of reset.
    fn init(&mut self) -> CanFail<FlashError>;

    /// Loads the given page into the device cache.
    fn open_page(&mut self, block: u16, page: u16) -> CanFail<FlashError>;

    /// Discards the device cache without programming.
    fn close_page(&mut self);

    /// Erases a whole block, resetting every sector and spare to the
    /// all-ones erased state.
    ///
    /// # Errors
    ///
    /// [`FlashError::Erase`] is interpreted by the core as "this block is
    /// bad" and quarantines it.
    fn erase_block(&mut self, block: u16) -> CanFail<FlashError>;

    /// Queries the manufacturer bad-block marker of the currently open
    /// page. Ground truth, not a heuristic.
    fn block_is_bad(&mut self) -> Result<bool, FlashError>;

    /// Reads `dst.len()` bytes from the cached page, starting `offset`
    /// bytes into the given sector.
    fn read_sector(
        &mut self,
        dst: &mut [u8],
        sector: u16,
        offset: u16,
    ) -> Result<ReadIntegrity, FlashError>;

    /// Reads the leading `dst.len()` bytes of the given sector's spare
    /// area (at most [`SPARE_LEN`]).
    fn read_spare(&mut self, dst: &mut [u8], sector: u16) -> Result<ReadIntegrity, FlashError>;

    /// Stages `src` into the cached page, starting `offset` bytes into
    /// the given sector. Programming only clears bits; a sector region is
    /// written at most once between erases.
    fn write_sector(&mut self, src: &[u8], sector: u16, offset: u16) -> CanFail<FlashError>;

    /// Stages `src` into the given sector's spare area.
    fn write_spare(&mut self, src: &[u8], sector: u16) -> CanFail<FlashError>;

    /// Programs all staged writes of the cached page to the media.
    /// Endurance-critical: the core invokes this at minimum granularity.
    fn commit(&mut self) -> CanFail<FlashError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_roles() {
        let geo = Geometry {
            sector_size: 512,
            sectors_per_page: 4,
            pages_per_block: 2,
            blocks: 8,
        };
        assert_eq!(geo.sectors_per_block(), 8);
        assert_eq!(geo.tail_sector(), 6);
        assert_eq!(geo.stat_sector(), 7);
        assert_eq!(geo.first_entry_sector(), 4);
        assert_eq!(geo.last_entry_sector(), 4);
        assert_eq!(geo.page_of(5), 1);
        assert_eq!(geo.total_sectors(), 64);
    }
}
