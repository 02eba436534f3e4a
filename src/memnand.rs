//! RAM-backed NAND array.
//!
//! `MemNand` implements the [`NandFlash`] contract over heap buffers with
//! real NAND programming semantics: reads and programs staged through a
//! one-page cache, programs only clear bits, erase works on whole blocks.
//! It backs the test suite and serves hosts that want a volatile medium.
//!
//! Fault injection: blocks can be marked bad at construction, and an
//! operation budget caps how many programs/erases succeed before every
//! further one fails, which is how the tests cut power mid-operation.

use alloc::vec;
use alloc::vec::Vec;

use crate::errors::{CanFail, FlashError, ReadIntegrity};
use crate::nand::{Geometry, NandFlash, SPARE_LEN};

/// A simulated NAND device held in RAM.
pub struct MemNand {
    geo: Geometry,
    data: Vec<u8>,
    spare: Vec<u8>,
    bad: Vec<bool>,
    erase_counts: Vec<u32>,
    /// Currently open `(block, page)`, if any.
    open: Option<(u16, u16)>,
    page_data: Vec<u8>,
    page_spare: Vec<u8>,
    budget: Option<u32>,
}

impl MemNand {
    /// Builds an erased array of the given geometry.
    pub fn new(geo: Geometry) -> Self {
        let sectors = geo.total_sectors() as usize;
        let page_sectors = usize::from(geo.sectors_per_page);
        Self {
            geo,
            data: vec![0xFF; sectors * usize::from(geo.sector_size)],
            spare: vec![0xFF; sectors * SPARE_LEN],
            bad: vec![false; usize::from(geo.blocks)],
            erase_counts: vec![0; usize::from(geo.blocks)],
            open: None,
            page_data: vec![0xFF; page_sectors * usize::from(geo.sector_size)],
            page_spare: vec![0xFF; page_sectors * SPARE_LEN],
            budget: None,
        }
    }

    /// Marks a block bad, as a factory marker would.
    pub fn mark_bad(&mut self, block: u16) {
        self.bad[usize::from(block)] = true;
    }

    /// Allows `ops` more programs/erases, after which every mutation
    /// fails (simulated power loss).
    pub fn set_operation_budget(&mut self, ops: u32) {
        self.budget = Some(ops);
    }

    /// Lifts the operation budget, restoring power.
    pub fn clear_operation_budget(&mut self) {
        self.budget = None;
    }

    /// How many times a block has been erased.
    pub fn erase_count(&self, block: u16) -> u32 {
        self.erase_counts[usize::from(block)]
    }

    /// Raw payload of a sector, for test introspection.
    pub fn sector_bytes(&self, block: u16, sector: u16) -> &[u8] {
        let base = self.sector_base(block, sector) * usize::from(self.geo.sector_size);
        &self.data[base..base + usize::from(self.geo.sector_size)]
    }

    /// Raw spare of a sector, for test introspection.
    pub fn spare_bytes(&self, block: u16, sector: u16) -> &[u8] {
        let base = self.sector_base(block, sector) * SPARE_LEN;
        &self.spare[base..base + SPARE_LEN]
    }

    fn sector_base(&self, block: u16, sector: u16) -> usize {
        usize::from(block) * usize::from(self.geo.sectors_per_block()) + usize::from(sector)
    }

    /// Spends one unit of the operation budget; `false` means the power
    /// is out.
    fn spend(&mut self) -> bool {
        match self.budget {
            None => true,
            Some(0) => false,
            Some(ref mut n) => {
                *n -= 1;
                true
            }
        }
    }

    fn require_open(&self, sector: u16) -> Result<(u16, u16), FlashError> {
        let (block, page) = self.open.ok_or(FlashError::OutOfRange)?;
        if self.geo.page_of(sector) != page {
            return Err(FlashError::OutOfRange);
        }
        Ok((block, page))
    }

    fn sector_in_page(&self, sector: u16) -> usize {
        usize::from(sector % self.geo.sectors_per_page)
    }
}

impl NandFlash for MemNand {
    fn geometry(&self) -> Geometry {
        self.geo
    }

    fn init(&mut self) -> CanFail<FlashError> {
        self.open = None;
        Ok(())
    }

    fn open_page(&mut self, block: u16, page: u16) -> CanFail<FlashError> {
        if block >= self.geo.blocks || page >= self.geo.pages_per_block {
            return Err(FlashError::OutOfRange);
        }

        let sector_size = usize::from(self.geo.sector_size);
        let page_sectors = usize::from(self.geo.sectors_per_page);
        let first = self.sector_base(block, page * self.geo.sectors_per_page);

        self.page_data
            .copy_from_slice(&self.data[first * sector_size..(first + page_sectors) * sector_size]);
        self.page_spare
            .copy_from_slice(&self.spare[first * SPARE_LEN..(first + page_sectors) * SPARE_LEN]);
        self.open = Some((block, page));
        Ok(())
    }

    fn close_page(&mut self) {
        self.open = None;
    }

    fn erase_block(&mut self, block: u16) -> CanFail<FlashError> {
        if block >= self.geo.blocks {
            return Err(FlashError::OutOfRange);
        }
        if self.bad[usize::from(block)] {
            return Err(FlashError::Erase);
        }
        if !self.spend() {
            return Err(FlashError::Erase);
        }

        let sector_size = usize::from(self.geo.sector_size);
        let first = self.sector_base(block, 0);
        let count = usize::from(self.geo.sectors_per_block());
        self.data[first * sector_size..(first + count) * sector_size].fill(0xFF);
        self.spare[first * SPARE_LEN..(first + count) * SPARE_LEN].fill(0xFF);
        self.erase_counts[usize::from(block)] += 1;
        self.open = None;
        Ok(())
    }

    fn block_is_bad(&mut self) -> Result<bool, FlashError> {
        let (block, _) = self.open.ok_or(FlashError::OutOfRange)?;
        Ok(self.bad[usize::from(block)])
    }

    fn read_sector(
        &mut self,
        dst: &mut [u8],
        sector: u16,
        offset: u16,
    ) -> Result<ReadIntegrity, FlashError> {
        self.require_open(sector)?;
        let sector_size = usize::from(self.geo.sector_size);
        let start = self.sector_in_page(sector) * sector_size + usize::from(offset);
        if usize::from(offset) + dst.len() > sector_size {
            return Err(FlashError::OutOfRange);
        }

        dst.copy_from_slice(&self.page_data[start..start + dst.len()]);
        Ok(ReadIntegrity::Ok)
    }

    fn read_spare(&mut self, dst: &mut [u8], sector: u16) -> Result<ReadIntegrity, FlashError> {
        self.require_open(sector)?;
        if dst.len() > SPARE_LEN {
            return Err(FlashError::OutOfRange);
        }

        let start = self.sector_in_page(sector) * SPARE_LEN;
        dst.copy_from_slice(&self.page_spare[start..start + dst.len()]);
        Ok(ReadIntegrity::Ok)
    }

    fn write_sector(&mut self, src: &[u8], sector: u16, offset: u16) -> CanFail<FlashError> {
        self.require_open(sector)?;
        let sector_size = usize::from(self.geo.sector_size);
        if usize::from(offset) + src.len() > sector_size {
            return Err(FlashError::OutOfRange);
        }

        let start = self.sector_in_page(sector) * sector_size + usize::from(offset);
        for (staged, byte) in self.page_data[start..start + src.len()].iter_mut().zip(src) {
            // Programming only clears bits.
            *staged &= byte;
        }
        Ok(())
    }

    fn write_spare(&mut self, src: &[u8], sector: u16) -> CanFail<FlashError> {
        self.require_open(sector)?;
        if src.len() > SPARE_LEN {
            return Err(FlashError::OutOfRange);
        }

        let start = self.sector_in_page(sector) * SPARE_LEN;
        for (staged, byte) in self.page_spare[start..start + src.len()].iter_mut().zip(src) {
            *staged &= byte;
        }
        Ok(())
    }

    fn commit(&mut self) -> CanFail<FlashError> {
        let (block, page) = self.open.ok_or(FlashError::OutOfRange)?;
        if !self.spend() {
            self.open = None;
            return Err(FlashError::Program);
        }

        let sector_size = usize::from(self.geo.sector_size);
        let page_sectors = usize::from(self.geo.sectors_per_page);
        let first = self.sector_base(block, page * self.geo.sectors_per_page);

        self.data[first * sector_size..(first + page_sectors) * sector_size]
            .copy_from_slice(&self.page_data);
        self.spare[first * SPARE_LEN..(first + page_sectors) * SPARE_LEN]
            .copy_from_slice(&self.page_spare);
        self.open = None;
        Ok(())
    }
}
