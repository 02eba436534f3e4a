//! Inode chain walking and entry management.
//!
//! The inode table is a forward-linked chain of inode blocks starting at
//! `inode0`. Each entry occupies two consecutive sectors: the allocation
//! sector (identity, first block, name) and the invalidation sector
//! (deletion stamp). An erased allocation sector ends the table; the
//! iterator stops there so the slot can be claimed for the next file.

use log::debug;

use crate::errors::{FsError, FsResult};
use crate::fs::Core;
use crate::layout::{
    BlockAge, BlockIndex, BlockType, Filename, InodeAllocEntry, InodeInitHeader, InodeInitSpare,
    InodeInvalidateEntry, TailPrefix, Timestamp,
};
use crate::nand::NandFlash;

/// Cursor over the inode chain, positioned at one entry pair.
#[derive(Clone, Copy, Debug)]
pub(crate) struct InodeIter {
    /// Block holding the current entry.
    pub block: u16,

    /// Successor inode block, if the chain continues.
    pub next_block: BlockIndex,

    /// Predecessor inode block, for backward iteration.
    pub previous_block: BlockIndex,

    /// Running entry index from the start of the table.
    pub inode_idx: u16,

    /// Absolute index of `block` within the chain.
    pub inode_block_idx: u16,

    /// Allocation sector of the current entry.
    pub sector: u16,
}

/// Outcome of a filename lookup.
pub(crate) enum Lookup {
    /// A live entry matched; the iterator is positioned on it.
    Found {
        iter: InodeIter,
        entry: InodeAllocEntry,
    },

    /// No live entry matched; the iterator is positioned at the first
    /// free slot, ready for [`Core::inode_prepare_new`].
    Free(InodeIter),
}

impl<D: NandFlash> Core<D> {
    /// Starts an iterator at the first entry of `inode0`.
    pub(crate) fn inode_iter_start(&mut self) -> FsResult<InodeIter> {
        let mut iter = InodeIter {
            block: self.inode0,
            next_block: BlockIndex::INVALID,
            previous_block: BlockIndex::INVALID,
            inode_idx: 0,
            inode_block_idx: 0,
            sector: self.media.geo().first_entry_sector(),
        };
        self.inode_enter_block(&mut iter, self.inode0)?;
        Ok(iter)
    }

    /// Points the iterator at the first entry of the given inode block.
    fn inode_enter_block(&mut self, iter: &mut InodeIter, block: u16) -> FsResult<()> {
        let geo = self.media.geo();

        let tail: TailPrefix = self.media.read_record(block, geo.tail_sector(), 0)?;
        let init: InodeInitHeader = self.media.read_record(block, 0, 0)?;
        let spare: InodeInitSpare = self.media.read_spare(block, 0)?;

        let tail_timestamp = tail.timestamp;
        iter.block = block;
        iter.next_block = if tail_timestamp.is_valid() {
            tail.next_block
        } else {
            BlockIndex::INVALID
        };
        iter.previous_block = init.previous_block;
        iter.inode_block_idx = spare.inode_index;
        iter.sector = geo.first_entry_sector();
        Ok(())
    }

    /// Advances to the next entry, stepping into the successor block when
    /// the current one is exhausted. Without a successor the iterator
    /// stops one past the last usable entry.
    pub(crate) fn inode_advance(&mut self, iter: &mut InodeIter) -> FsResult<()> {
        let geo = self.media.geo();
        iter.sector += 2;
        iter.inode_idx += 1;

        if iter.sector > geo.last_entry_sector() && iter.next_block.is_valid() {
            let next = iter.next_block.0;
            self.inode_enter_block(iter, next)?;
        }
        Ok(())
    }

    /// Steps back one entry, following the init sector's back-link across
    /// block boundaries. Returns `false` at the very first entry.
    pub(crate) fn inode_retreat(&mut self, iter: &mut InodeIter) -> FsResult<bool> {
        let geo = self.media.geo();

        if iter.sector > geo.first_entry_sector() {
            iter.sector -= 2;
            iter.inode_idx -= 1;
            return Ok(true);
        }

        if !iter.previous_block.is_valid() {
            return Ok(false);
        }

        let previous = iter.previous_block.0;
        self.inode_enter_block(iter, previous)?;
        // Last entry-aligned sector of the block (entries stride by 2).
        let first = geo.first_entry_sector();
        iter.sector = first + ((geo.last_entry_sector() - first) / 2) * 2;
        iter.inode_idx -= 1;
        Ok(true)
    }

    /// Reads the allocation sector under the iterator. `None` marks the
    /// end of the table: the iterator ran past the last usable entry of
    /// the last chain block, or the slot was never written.
    pub(crate) fn inode_read_entry(
        &mut self,
        iter: &InodeIter,
    ) -> FsResult<Option<InodeAllocEntry>> {
        if iter.sector > self.media.geo().last_entry_sector() {
            return Ok(None);
        }

        let entry: InodeAllocEntry = self.media.read_record(iter.block, iter.sector, 0)?;
        let file_id = entry.file_id;
        if file_id.is_valid() {
            Ok(Some(entry))
        } else {
            Ok(None)
        }
    }

    /// Reads the invalidation sector companion of the current entry.
    pub(crate) fn inode_read_invalidation(
        &mut self,
        iter: &InodeIter,
    ) -> FsResult<InodeInvalidateEntry> {
        self.media.read_record(iter.block, iter.sector + 1, 0)
    }

    /// Writes and commits the invalidation sector of the current entry.
    pub(crate) fn inode_write_invalidation(
        &mut self,
        iter: &InodeIter,
        record: &InodeInvalidateEntry,
    ) -> FsResult<()> {
        self.media
            .write_record(iter.block, iter.sector + 1, 0, record)?;
        self.media.commit()
    }

    /// Writes and commits the allocation sector of the current entry.
    pub(crate) fn inode_write_entry(
        &mut self,
        iter: &InodeIter,
        entry: &InodeAllocEntry,
    ) -> FsResult<()> {
        self.media.write_record(iter.block, iter.sector, 0, entry)?;
        self.media.commit()
    }

    /// Searches the table for the live entry bearing `name`.
    ///
    /// Deleted entries with the same name are skipped. On a miss the
    /// returned iterator sits at the first free slot.
    pub(crate) fn find_file(&mut self, name: &Filename) -> FsResult<Lookup> {
        let raw = name.raw();
        let mut iter = self.inode_iter_start()?;

        loop {
            let Some(entry) = self.inode_read_entry(&iter)? else {
                return Ok(Lookup::Free(iter));
            };

            if entry.filename == raw {
                let invalidation = self.inode_read_invalidation(&iter)?;
                let timestamp = invalidation.timestamp;
                if !timestamp.is_valid() {
                    return Ok(Lookup::Found { iter, entry });
                }
            }

            self.inode_advance(&mut iter)?;
        }
    }

    /// Makes the entry under the iterator writable, extending the chain
    /// with a freshly allocated inode block when the current block is
    /// out of entry sectors.
    ///
    /// # Errors
    ///
    /// [`FsError::NoSpace`] when no free block is left for the extension.
    pub(crate) fn inode_prepare_new(&mut self, iter: &mut InodeIter) -> FsResult<()> {
        let geo = self.media.geo();
        if iter.sector <= geo.last_entry_sector() {
            return Ok(());
        }

        self.flush_dirty_block()?;
        let allocation = self
            .alloc
            .allocate(&mut self.media, 0)?
            .ok_or(FsError::NoSpace)?;
        let timestamp = Timestamp(self.next_timestamp());

        // Link the full block forward before the successor exists on
        // media; mount repairs this window if power fails in between.
        let link = TailPrefix {
            next_block: BlockIndex(allocation.block),
            next_age: BlockAge(allocation.age + 1),
            timestamp,
        };
        self.media
            .write_record(iter.block, geo.tail_sector(), 0, &link)?;
        self.media.commit()?;

        self.media.erase(allocation.block)?;
        let init = InodeInitHeader {
            age: BlockAge(allocation.age + 1),
            timestamp,
            previous_block: BlockIndex(iter.block),
        };
        let spare = InodeInitSpare {
            type_id: BlockType::Inode.tag(),
            reserved: 0,
            inode_index: iter.inode_block_idx + 1,
        };
        self.media.write_record(allocation.block, 0, 0, &init)?;
        self.media.write_spare(allocation.block, 0, &spare)?;
        self.media.commit()?;

        debug!(target: "flogfs", "inode chain extended to block {}", allocation.block);

        iter.previous_block = BlockIndex(iter.block);
        iter.block = allocation.block;
        iter.next_block = BlockIndex::INVALID;
        iter.inode_block_idx += 1;
        iter.sector = geo.first_entry_sector();
        Ok(())
    }
}
