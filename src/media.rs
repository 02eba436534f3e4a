//! Page-cache shim and typed media access.
//!
//! The flash driver exposes a single open page; [`PageCache`] tracks which
//! one and only issues `open_page` on a miss. [`Media`] funnels every
//! sector, spare and record access of the filesystem through that shim,
//! converts driver verdicts into core errors, and quarantines blocks whose
//! contents fail an integrity check for the rest of the session.

use alloc::vec;
use alloc::vec::Vec;
use bytemuck::{AnyBitPattern, NoUninit};
use log::warn;

use crate::errors::{FsError, FsResult, ReadIntegrity};
use crate::layout::{BlockStat, BlockType};
use crate::nand::{Geometry, NandFlash};

/// Mirror of the driver's one-page cache: the currently open page, if any.
pub(crate) struct PageCache {
    block: u16,
    page: u16,
    open: bool,
}

impl PageCache {
    pub(crate) fn new() -> Self {
        Self {
            block: 0,
            page: 0,
            open: false,
        }
    }

    fn hits(&self, block: u16, page: u16) -> bool {
        self.open && self.block == block && self.page == page
    }

    fn invalidate(&mut self) {
        self.open = false;
    }
}

/// All media access of the filesystem core.
pub(crate) struct Media<D: NandFlash> {
    dev: D,
    geo: Geometry,
    cache: PageCache,
    /// Blocks reclassified bad for this session after an integrity
    /// failure or a refused erase.
    quarantined: Vec<bool>,
}

impl<D: NandFlash> Media<D> {
    pub(crate) fn new(dev: D) -> Self {
        let geo = dev.geometry();
        Self {
            dev,
            geo,
            cache: PageCache::new(),
            quarantined: vec![false; usize::from(geo.blocks)],
        }
    }

    pub(crate) fn geo(&self) -> Geometry {
        self.geo
    }

    pub(crate) fn device_mut(&mut self) -> &mut D {
        &mut self.dev
    }

    pub(crate) fn into_device(self) -> D {
        self.dev
    }

    pub(crate) fn quarantine(&mut self, block: u16) {
        warn!(target: "flogfs", "block {block} quarantined for this session");
        self.quarantined[usize::from(block)] = true;
    }

    pub(crate) fn is_quarantined(&self, block: u16) -> bool {
        self.quarantined[usize::from(block)]
    }

    /// Opens the page holding `(block, sector)` if it is not already the
    /// cached one.
    pub(crate) fn open_sector(&mut self, block: u16, sector: u16) -> FsResult<()> {
        let page = self.geo.page_of(sector);
        if self.cache.hits(block, page) {
            return Ok(());
        }

        self.dev.open_page(block, page)?;
        self.cache.block = block;
        self.cache.page = page;
        self.cache.open = true;
        Ok(())
    }

    /// Discards the cached page.
    pub(crate) fn close(&mut self) {
        self.dev.close_page();
        self.cache.invalidate();
    }

    fn check_integrity(&mut self, block: u16, verdict: ReadIntegrity) -> FsResult<()> {
        match verdict {
            ReadIntegrity::Ok | ReadIntegrity::Corrected => Ok(()),
            ReadIntegrity::Detected => {
                self.quarantine(block);
                Err(FsError::Corrupt)
            }
        }
    }

    pub(crate) fn read(
        &mut self,
        block: u16,
        sector: u16,
        offset: u16,
        dst: &mut [u8],
    ) -> FsResult<()> {
        self.open_sector(block, sector)?;
        let verdict = self.dev.read_sector(dst, sector, offset)?;
        self.check_integrity(block, verdict)
    }

    pub(crate) fn read_record<T: AnyBitPattern>(
        &mut self,
        block: u16,
        sector: u16,
        offset: u16,
    ) -> FsResult<T> {
        let mut raw = vec![0u8; core::mem::size_of::<T>()];
        self.read(block, sector, offset, &mut raw)?;
        Ok(bytemuck::pod_read_unaligned(&raw))
    }

    /// Reads the leading bytes of a sector's spare area into a record.
    pub(crate) fn read_spare<T: AnyBitPattern>(&mut self, block: u16, sector: u16) -> FsResult<T> {
        let mut raw = vec![0u8; core::mem::size_of::<T>()];
        self.open_sector(block, sector)?;
        let verdict = self.dev.read_spare(&mut raw, sector)?;
        self.check_integrity(block, verdict)?;
        Ok(bytemuck::pod_read_unaligned(&raw))
    }

    pub(crate) fn write(
        &mut self,
        block: u16,
        sector: u16,
        offset: u16,
        src: &[u8],
    ) -> FsResult<()> {
        self.open_sector(block, sector)?;
        self.dev.write_sector(src, sector, offset)?;
        Ok(())
    }

    pub(crate) fn write_record<T: NoUninit>(
        &mut self,
        block: u16,
        sector: u16,
        offset: u16,
        record: &T,
    ) -> FsResult<()> {
        self.write(block, sector, offset, bytemuck::bytes_of(record))
    }

    pub(crate) fn write_spare<T: NoUninit>(
        &mut self,
        block: u16,
        sector: u16,
        record: &T,
    ) -> FsResult<()> {
        self.open_sector(block, sector)?;
        self.dev.write_spare(bytemuck::bytes_of(record), sector)?;
        Ok(())
    }

    /// Programs the staged writes of the cached page. The cache is
    /// invalidated either way.
    pub(crate) fn commit(&mut self) -> FsResult<()> {
        let result = self.dev.commit();
        self.cache.invalidate();
        result.map_err(FsError::from)
    }

    /// Erases a block. A refused erase quarantines the block.
    pub(crate) fn erase(&mut self, block: u16) -> FsResult<()> {
        self.close();
        if self.dev.erase_block(block).is_err() {
            self.quarantine(block);
            return Err(FsError::Corrupt);
        }
        Ok(())
    }

    /// Queries the manufacturer bad-block marker for a block.
    pub(crate) fn block_is_bad(&mut self, block: u16) -> FsResult<bool> {
        if self.is_quarantined(block) {
            return Ok(true);
        }
        self.open_sector(block, 0)?;
        Ok(self.dev.block_is_bad()?)
    }

    /// Classifies a block from the type tag in its first sector's spare.
    ///
    /// # Errors
    ///
    /// [`FsError::Corrupt`] if the tag decodes to no valid type; the
    /// block is quarantined first.
    pub(crate) fn block_type(&mut self, block: u16) -> FsResult<BlockType> {
        let tag: [u8; 1] = self.read_spare(block, 0)?;
        match BlockType::decode(tag[0]) {
            Some(ty) => Ok(ty),
            None => {
                self.quarantine(block);
                Err(FsError::Corrupt)
            }
        }
    }

    /// Reads a block's stat record. `None` when the sector does not hold
    /// one: erased, leftover factory contents, or an uncorrectable read.
    /// Never quarantines: a missing stat is an expected state (format
    /// and reclaim rewrite it), not an integrity failure.
    pub(crate) fn stat_read(&mut self, block: u16) -> FsResult<Option<BlockStat>> {
        let mut raw = [0u8; core::mem::size_of::<BlockStat>()];
        self.open_sector(block, self.geo.stat_sector())?;
        let verdict = self.dev.read_sector(&mut raw, self.geo.stat_sector(), 0)?;
        if matches!(verdict, ReadIntegrity::Detected) {
            return Ok(None);
        }

        let stat: BlockStat = bytemuck::pod_read_unaligned(&raw);
        Ok(stat.is_valid().then_some(stat))
    }

    /// A block's erase counter as preserved by its stat record; blocks
    /// that lost their stat report age zero.
    pub(crate) fn stat_age(&mut self, block: u16) -> FsResult<u32> {
        Ok(self
            .stat_read(block)?
            .map(|s| {
                let age = s.age;
                age.0
            })
            .unwrap_or(0))
    }
}
