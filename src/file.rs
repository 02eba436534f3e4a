//! File read and write paths.
//!
//! A file is a forward-linked chain of file blocks. Data fills sectors in
//! order; sector 0 starts past the init header, the tail sector starts
//! past the tail header, and the last sector of the block never carries
//! data. Writes are buffered per open file until a sector boundary and
//! committed whole; each committed sector records its payload count in
//! the spare, which is also how the read path finds the end of data.

use alloc::vec::Vec;

use crate::allocator::DirtyBlock;
use crate::errors::{FsError, FsResult};
use crate::fs::{Core, OpenFile};
use crate::layout::{
    BlockAge, BlockIndex, BlockType, FileId, FileInitHeader, FileTailHeader, InodeAllocEntry,
    SectorSpare, Timestamp, FILE_INIT_HEADER_LEN, FILE_TAIL_HEADER_LEN,
};
use crate::nand::NandFlash;

/// Position and lookahead of an open read file.
#[derive(Clone, Debug)]
pub(crate) struct ReadState {
    pub id: u32,
    pub block: u16,
    pub sector: u16,
    pub offset: u16,
    pub sector_remaining: u16,
    pub read_head: u32,
    /// Sector 0's spare has not been looked at yet: the first advance
    /// must inspect the current sector instead of stepping past it.
    /// Only covers the initial open; cleared once any sector has been
    /// entered and never set again (the EOF-retry behavior lives in
    /// `read_advance`, which leaves the position untouched on a miss).
    fresh: bool,
}

/// Position and sector buffer of an open write file.
#[derive(Clone, Debug)]
pub(crate) struct WriteState {
    pub id: u32,
    pub block: u16,
    /// Age stamped into the init header when the block's first sector
    /// commits.
    pub block_age: u32,
    pub sector: u16,
    pub offset: u16,
    pub sector_remaining: u16,
    pub bytes_in_block: u16,
    pub write_head: u32,
    pub base_threshold: i32,
    pub buffer: Vec<u8>,
}

/// First payload byte of a sector, accounting for the embedded headers.
fn payload_offset<D: NandFlash>(core: &Core<D>, sector: u16) -> u16 {
    if sector == 0 {
        FILE_INIT_HEADER_LEN
    } else if sector == core.media.geo().tail_sector() {
        FILE_TAIL_HEADER_LEN
    } else {
        0
    }
}

impl<D: NandFlash> Core<D> {
    /// Builds the read state for a freshly opened file, positioned at the
    /// first payload byte.
    pub(crate) fn read_open_state(&mut self, entry: &InodeAllocEntry) -> ReadState {
        let file_id = entry.file_id;
        let first_block = entry.first_block;
        ReadState {
            id: file_id.0,
            block: first_block.0,
            sector: 0,
            offset: FILE_INIT_HEADER_LEN,
            sector_remaining: 0,
            read_head: 0,
            fresh: true,
        }
    }

    /// Copies up to `buf.len()` bytes at the read head. Returns the byte
    /// count actually read; 0 means end of committed data.
    pub(crate) fn file_read(&mut self, state: &mut ReadState, buf: &mut [u8]) -> FsResult<usize> {
        let mut done = 0usize;
        while done < buf.len() {
            if state.sector_remaining == 0 {
                if !self.read_advance(state)? {
                    break;
                }
            }

            let take = usize::min(buf.len() - done, usize::from(state.sector_remaining));
            self.media.read(
                state.block,
                state.sector,
                state.offset,
                &mut buf[done..done + take],
            )?;
            state.offset += take as u16;
            state.sector_remaining -= take as u16;
            state.read_head += take as u32;
            done += take;
        }
        Ok(done)
    }

    /// Moves the read head to the next committed payload. Returns `false`
    /// at the end of committed data, leaving the state untouched so a
    /// later read can pick up data appended in the meantime.
    fn read_advance(&mut self, state: &mut ReadState) -> FsResult<bool> {
        let tail = self.media.geo().tail_sector();

        loop {
            let (block, sector) = if state.fresh {
                (state.block, state.sector)
            } else if state.sector == tail {
                // The block is exhausted; follow the chain link.
                let header: FileTailHeader = self.media.read_record(state.block, tail, 0)?;
                let timestamp = header.timestamp;
                let next_block = header.next_block;
                if !timestamp.is_valid() || !next_block.is_valid() {
                    return Ok(false);
                }

                let init: FileInitHeader = self.media.read_record(next_block.0, 0, 0)?;
                let file_id = init.file_id;
                if file_id.0 != state.id {
                    // Successor claimed on media but not initialized yet.
                    return Ok(false);
                }
                (next_block.0, 0)
            } else {
                (state.block, state.sector + 1)
            };

            let spare: SectorSpare = self.media.read_spare(block, sector)?;
            if spare.is_erased() {
                return Ok(false);
            }

            let nbytes = spare.nbytes;
            state.block = block;
            state.sector = sector;
            state.fresh = false;
            state.offset = payload_offset(self, sector);
            state.sector_remaining = nbytes;
            if nbytes > 0 {
                return Ok(true);
            }
            // Zero-payload sector (claimed init); keep walking.
        }
    }

    /// Builds the write state for a fresh first block, positioned at the
    /// start of sector 0's payload.
    pub(crate) fn write_fresh_state(&mut self, id: u32, block: u16, init_age: u32) -> WriteState {
        let sector_size = self.media.geo().sector_size;
        WriteState {
            id,
            block,
            block_age: init_age,
            sector: 0,
            offset: FILE_INIT_HEADER_LEN,
            sector_remaining: sector_size - FILE_INIT_HEADER_LEN,
            bytes_in_block: 0,
            write_head: 0,
            base_threshold: 0,
            buffer: Vec::new(),
        }
    }

    /// Seeks an existing file to its logical end: follows completed tail
    /// links, then scans the last block's spares for the first sector
    /// never committed.
    pub(crate) fn write_seek_end(&mut self, entry: &InodeAllocEntry) -> FsResult<WriteState> {
        let geo = self.media.geo();
        let tail = geo.tail_sector();
        let entry_file_id = entry.file_id;
        let first_block = entry.first_block;
        let first_block_age = entry.first_block_age;

        let mut block = first_block.0;
        let mut block_age = first_block_age.0;
        let mut write_head = 0u32;

        loop {
            let header: FileTailHeader = self.media.read_record(block, tail, 0)?;
            let timestamp = header.timestamp;
            if timestamp.is_valid() {
                let next_block = header.next_block;
                let bytes_in_block = header.bytes_in_block;
                write_head += u32::from(bytes_in_block);

                let init: FileInitHeader = self.media.read_record(next_block.0, 0, 0)?;
                let file_id = init.file_id;
                if file_id != entry_file_id {
                    self.media.quarantine(next_block.0);
                    return Err(FsError::Corrupt);
                }
                let age = init.age;
                block_age = age.0;
                block = next_block.0;
                continue;
            }

            // Last block of the chain: the first erased spare is the next
            // writable sector.
            let mut bytes_in_block = 0u16;
            let mut sector = 0u16;
            loop {
                let spare: SectorSpare = self.media.read_spare(block, sector)?;
                if spare.is_erased() {
                    break;
                }
                let nbytes = spare.nbytes;
                bytes_in_block += nbytes;
                write_head += u32::from(nbytes);
                sector += 1;
                if sector > tail {
                    self.media.quarantine(block);
                    return Err(FsError::Corrupt);
                }
            }

            let offset = payload_offset(self, sector);
            return Ok(WriteState {
                id: entry_file_id.0,
                block,
                block_age,
                sector,
                offset,
                sector_remaining: geo.sector_size - offset,
                bytes_in_block,
                write_head,
                base_threshold: 0,
                buffer: Vec::new(),
            });
        }
    }

    /// Buffers `data` into the file, committing each sector as it fills.
    /// Returns the byte count accepted; short counts mean the media ran
    /// out of free blocks, in which case everything already committed
    /// stays readable.
    pub(crate) fn file_write(
        &mut self,
        fd: u32,
        state: &mut WriteState,
        data: &[u8],
    ) -> FsResult<usize> {
        let mut accepted = 0usize;

        while accepted < data.len() {
            if state.sector_remaining == 0 {
                match self.commit_file_sector(fd, state) {
                    Ok(()) => {}
                    Err(FsError::NoSpace) => return Ok(accepted),
                    Err(other) => return Err(other),
                }
            }

            let take = usize::min(data.len() - accepted, usize::from(state.sector_remaining));
            state.buffer.extend_from_slice(&data[accepted..accepted + take]);
            state.offset += take as u16;
            state.sector_remaining -= take as u16;
            accepted += take;
        }

        // Commit a just-filled sector eagerly so its data is durable when
        // the call returns.
        if state.sector_remaining == 0 {
            match self.commit_file_sector(fd, state) {
                Ok(()) | Err(FsError::NoSpace) => {}
                Err(other) => return Err(other),
            }
        }

        Ok(accepted)
    }

    /// Flushes whatever the sector buffer holds, if anything, and claims
    /// the block's init sector if it is still parked dirty.
    pub(crate) fn commit_partial(&mut self, fd: u32, state: &mut WriteState) -> FsResult<()> {
        let parked = matches!(self.alloc.dirty, Some(d) if d.block == state.block);
        if state.buffer.is_empty() && !parked {
            return Ok(());
        }
        self.commit_file_sector(fd, state)
    }

    /// Commits the buffered payload of the current sector.
    ///
    /// Off the tail sector this programs payload + spare (plus the init
    /// header for sector 0 of a freshly claimed block) and advances. On
    /// the tail sector it first allocates the successor block, stamps the
    /// chain link into the tail header and re-homes the state onto the
    /// successor, which is parked in the dirty slot until its own first
    /// commit.
    pub(crate) fn commit_file_sector(&mut self, fd: u32, state: &mut WriteState) -> FsResult<()> {
        let geo = self.media.geo();
        let tail = geo.tail_sector();
        let payload = state.buffer.len() as u16;

        if state.sector == tail {
            self.flush_dirty_block()?;
            let allocation = self
                .alloc
                .allocate(&mut self.media, state.base_threshold)?
                .ok_or(FsError::NoSpace)?;
            let timestamp = Timestamp(self.next_timestamp());

            let header = FileTailHeader {
                next_block: BlockIndex(allocation.block),
                next_age: BlockAge(allocation.age + 1),
                timestamp,
                bytes_in_block: state.bytes_in_block + payload,
            };
            self.media.write_record(state.block, tail, 0, &header)?;
            if payload > 0 {
                self.media
                    .write(state.block, tail, FILE_TAIL_HEADER_LEN, &state.buffer)?;
            }
            self.media.write_spare(
                state.block,
                tail,
                &SectorSpare {
                    type_id: BlockType::File.tag(),
                    reserved: 0,
                    nbytes: payload,
                },
            )?;
            self.media.commit()?;

            state.write_head += u32::from(payload);
            state.block = allocation.block;
            state.block_age = allocation.age + 1;
            state.sector = 0;
            state.offset = FILE_INIT_HEADER_LEN;
            state.sector_remaining = geo.sector_size - FILE_INIT_HEADER_LEN;
            state.bytes_in_block = 0;
            state.buffer.clear();
            self.alloc.dirty = Some(DirtyBlock {
                block: allocation.block,
                owner: fd,
            });
            return Ok(());
        }

        let parked = matches!(self.alloc.dirty, Some(d) if d.block == state.block);
        if parked {
            // Deferred erase of the freshly allocated block, strictly
            // before its first program.
            self.media.erase(state.block)?;
        }
        if state.sector == 0 {
            let init = FileInitHeader {
                age: BlockAge(state.block_age),
                file_id: FileId(state.id),
            };
            self.media.write_record(state.block, 0, 0, &init)?;
        }
        let start = payload_offset(self, state.sector);
        if payload > 0 {
            self.media.write(state.block, state.sector, start, &state.buffer)?;
        }
        self.media.write_spare(
            state.block,
            state.sector,
            &SectorSpare {
                type_id: BlockType::File.tag(),
                reserved: 0,
                nbytes: payload,
            },
        )?;
        self.media.commit()?;

        if parked {
            self.alloc.dirty = None;
        }

        state.bytes_in_block += payload;
        state.write_head += u32::from(payload);
        state.sector += 1;
        state.offset = payload_offset(self, state.sector);
        state.sector_remaining = geo.sector_size - state.offset;
        state.buffer.clear();
        Ok(())
    }

    /// Forces the parked dirty block, if any, onto media so a new
    /// allocation can proceed. The holder file's pending sector is
    /// committed through its registry slot.
    pub(crate) fn flush_dirty_block(&mut self) -> FsResult<()> {
        let Some(dirty) = self.alloc.dirty else {
            return Ok(());
        };

        let Some(OpenFile::Write(mut state)) = self.open_files.remove(&dirty.owner) else {
            // The slot outlived its owner; that would be a bookkeeping
            // bug, not a media state.
            debug_assert!(false, "dirty block without an open writer");
            self.alloc.dirty = None;
            return Ok(());
        };

        let result = self.commit_partial(dirty.owner, &mut state);
        self.open_files.insert(dirty.owner, OpenFile::Write(state));
        result
    }
}
