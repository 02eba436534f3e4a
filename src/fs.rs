//! Filesystem orchestration: the public handle, format, mount-time
//! recovery and deletion.
//!
//! All state lives in a [`Core`] guarded by one spin mutex; every public
//! operation locks it for its whole duration, so the allocator, the
//! deletion walk and the flash cache are reached exclusively through
//! `&mut` and need no further locking. Open files are opaque descriptors
//! into a registry inside the core; that is what lets the one-slot
//! dirty-block protocol flush the holder file no matter who triggers it.

use hashbrown::HashMap;
use log::{info, warn};
use spin::Mutex;

use crate::allocator::{Allocator, DirtyBlock};
use crate::errors::{FsError, FsResult};
use crate::file::{ReadState, WriteState};
use crate::layout::{
    BlockAge, BlockIndex, BlockStat, BlockType, FileId, FileInitHeader, Filename, InodeAllocEntry,
    InodeInitHeader, InodeInitSpare, InodeInvalidateEntry, SectorSpare, TailPrefix, Timestamp,
};
use crate::media::Media;
use crate::nand::NandFlash;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MountState {
    Unmounted,
    Mounted,
}

/// An open file in the descriptor registry.
pub(crate) enum OpenFile {
    Read(ReadState),
    Write(WriteState),
}

/// The whole in-RAM filesystem state. Only reachable through the lock in
/// [`Flogfs`].
pub(crate) struct Core<D: NandFlash> {
    pub(crate) media: Media<D>,
    state: MountState,
    /// Last used allocation sequence number.
    pub(crate) t: u32,
    pub(crate) max_file_id: u32,
    pub(crate) inode0: u16,
    pub(crate) alloc: Allocator,
    pub(crate) open_files: HashMap<u32, OpenFile>,
    next_fd: u32,
}

/// Handle on an open read file.
#[derive(Debug)]
pub struct ReadFile {
    fd: u32,
}

/// Handle on an open write file.
#[derive(Debug)]
pub struct WriteFile {
    fd: u32,
}

/// Cursor of an [`Flogfs::ls_start`] enumeration.
#[derive(Debug)]
pub struct FileLister {
    iter: crate::inode::InodeIter,
}

/// Newest allocation found on media during the mount pass.
#[derive(Clone, Copy)]
struct LastAlloc {
    timestamp: u32,
    /// The allocated (successor) block the record points at.
    block: u16,
    /// Init age the successor must carry.
    init_age: u32,
    kind: LastAllocKind,
}

#[derive(Clone, Copy)]
enum LastAllocKind {
    File { file_id: u32 },
    Inode { previous: u16, index: u16 },
}

/// Newest deletion found in the inode table during the mount pass.
#[derive(Clone, Copy)]
struct LastDeletion {
    timestamp: u32,
    first_block: u16,
    last_block: u16,
    file_id: u32,
}

impl<D: NandFlash> Core<D> {
    fn ensure_mounted(&self) -> FsResult<()> {
        if self.state == MountState::Mounted {
            Ok(())
        } else {
            Err(FsError::NotMounted)
        }
    }

    /// Hands out the next allocation sequence number, staying clear of
    /// the range a deletion in flight has reserved.
    pub(crate) fn next_timestamp(&mut self) -> u32 {
        if self.t < self.alloc.t_ceiling {
            self.t = self.alloc.t_ceiling;
        }
        self.t += 1;
        self.t
    }

    fn id_open_for_write(&self, id: u32) -> bool {
        self.open_files
            .values()
            .any(|f| matches!(f, OpenFile::Write(st) if st.id == id))
    }

    fn id_open(&self, id: u32) -> bool {
        self.open_files.values().any(|f| match f {
            OpenFile::Read(st) => st.id == id,
            OpenFile::Write(st) => st.id == id,
        })
    }

    /// Erases every good block, preserving ages through the stat
    /// records, and claims the first good block as `inode0`.
    fn format(&mut self) -> FsResult<()> {
        if self.state == MountState::Mounted {
            return Err(FsError::AlreadyMounted);
        }

        let geo = self.media.geo();
        let mut first_good: Option<u16> = None;
        let mut bad = 0u16;

        for block in 0..geo.blocks {
            match self.media.block_is_bad(block) {
                Ok(false) => {}
                _ => {
                    bad += 1;
                    continue;
                }
            }

            let age = self.media.stat_age(block)?;
            if self.media.erase(block).is_err() {
                bad += 1;
                continue;
            }

            let stat = BlockStat {
                age: BlockAge(age),
                next_block: BlockIndex::INVALID,
                next_age: BlockAge::INVALID,
                timestamp: Timestamp(0),
                key: BlockStat::KEY,
            };
            self.media
                .write_record(block, geo.stat_sector(), 0, &stat)?;
            self.media.commit()?;

            if first_good.is_none() {
                first_good = Some(block);
            }
        }

        let inode0 = first_good.ok_or(FsError::NoSpace)?;
        let age = self.media.stat_age(inode0)?;
        let init = InodeInitHeader {
            age: BlockAge(age + 1),
            timestamp: Timestamp(0),
            previous_block: BlockIndex::INVALID,
        };
        let spare = InodeInitSpare {
            type_id: BlockType::Inode.tag(),
            reserved: 0,
            inode_index: 0,
        };
        self.media.write_record(inode0, 0, 0, &init)?;
        self.media.write_spare(inode0, 0, &spare)?;
        self.media.commit()?;

        info!(
            target: "flogfs",
            "formatted {} blocks ({bad} bad), inode0 = {inode0}",
            geo.blocks
        );
        Ok(())
    }

    /// Rebuilds the in-RAM state from one pass over the block array plus
    /// one walk of the inode table, then repairs whichever non-atomic
    /// operation a power loss may have interrupted.
    fn mount(&mut self) -> FsResult<()> {
        if self.state == MountState::Mounted {
            return Ok(());
        }

        let geo = self.media.geo();
        self.alloc.reset();
        self.open_files.clear();

        let mut inode0: Option<(u16, u32)> = None;
        let mut last_alloc: Option<LastAlloc> = None;
        let mut max_t = 0u32;
        let mut max_age = 0u32;
        let mut max_file_id = 0u32;

        for block in 0..geo.blocks {
            match self.media.block_is_bad(block) {
                Ok(false) => {}
                _ => continue,
            }

            let ty = match self.media.block_type(block) {
                Ok(ty) => ty,
                Err(FsError::Corrupt) => continue,
                Err(other) => return Err(other),
            };

            match ty {
                BlockType::Unallocated => {
                    let stat = self.media.stat_read(block)?;
                    let age = stat.map(|s| {
                        let age = s.age;
                        age.0
                    });
                    let stamp = stat.map(|s| {
                        let t = s.timestamp;
                        t.0
                    });
                    self.alloc.mark_free(block, age.unwrap_or(0));
                    if let Some(t) = stamp {
                        if t != u32::MAX {
                            max_t = max_t.max(t);
                        }
                    }
                }
                BlockType::Inode => {
                    let init: InodeInitHeader = self.media.read_record(block, 0, 0)?;
                    let spare: InodeInitSpare = self.media.read_spare(block, 0)?;
                    let init_age = init.age;
                    let init_t = init.timestamp;
                    max_age = max_age.max(init_age.0);
                    if init_t.is_valid() {
                        max_t = max_t.max(init_t.0);
                    }

                    if spare.inode_index == 0 {
                        match inode0 {
                            None => inode0 = Some((block, init_t.0)),
                            Some((other, other_t)) if init_t.0 < other_t => {
                                warn!(
                                    target: "flogfs",
                                    "two inode0 candidates; {other} superseded, left for gc"
                                );
                                inode0 = Some((block, init_t.0));
                            }
                            Some(_) => {
                                warn!(
                                    target: "flogfs",
                                    "two inode0 candidates; {block} superseded, left for gc"
                                );
                            }
                        }
                    }

                    let tail: TailPrefix = self.media.read_record(block, geo.tail_sector(), 0)?;
                    let tail_t = tail.timestamp;
                    if tail_t.is_valid() {
                        max_t = max_t.max(tail_t.0);
                        if last_alloc.map_or(true, |la| tail_t.0 > la.timestamp) {
                            let next_block = tail.next_block;
                            let next_age = tail.next_age;
                            last_alloc = Some(LastAlloc {
                                timestamp: tail_t.0,
                                block: next_block.0,
                                init_age: next_age.0,
                                kind: LastAllocKind::Inode {
                                    previous: block,
                                    index: spare.inode_index,
                                },
                            });
                        }
                    }
                }
                BlockType::File => {
                    let init: FileInitHeader = self.media.read_record(block, 0, 0)?;
                    let init_age = init.age;
                    let file_id = init.file_id;
                    max_age = max_age.max(init_age.0);
                    if file_id.is_valid() {
                        max_file_id = max_file_id.max(file_id.0);
                    }

                    let tail: TailPrefix = self.media.read_record(block, geo.tail_sector(), 0)?;
                    let tail_t = tail.timestamp;
                    if tail_t.is_valid() {
                        max_t = max_t.max(tail_t.0);
                        if last_alloc.map_or(true, |la| tail_t.0 > la.timestamp) {
                            let next_block = tail.next_block;
                            let next_age = tail.next_age;
                            last_alloc = Some(LastAlloc {
                                timestamp: tail_t.0,
                                block: next_block.0,
                                init_age: next_age.0,
                                kind: LastAllocKind::File { file_id: file_id.0 },
                            });
                        }
                    }
                }
            }
        }

        let (inode0_block, _) = inode0.ok_or(FsError::Corrupt)?;
        self.inode0 = inode0_block;

        // Walk the inode table: newest deletion, newest live allocation,
        // and the file-id high-water mark.
        let mut last_deletion: Option<LastDeletion> = None;
        let mut iter = self.inode_iter_start()?;
        while let Some(entry) = self.inode_read_entry(&iter)? {
            let entry_fid = entry.file_id;
            let entry_t = entry.timestamp;
            let first_block = entry.first_block;
            let first_block_age = entry.first_block_age;
            max_file_id = max_file_id.max(entry_fid.0);
            if entry_t.is_valid() {
                max_t = max_t.max(entry_t.0);
            }

            let invalidation = self.inode_read_invalidation(&iter)?;
            let inval_t = invalidation.timestamp;
            if inval_t.is_valid() {
                max_t = max_t.max(inval_t.0);
                if last_deletion.map_or(true, |ld| inval_t.0 > ld.timestamp) {
                    let last_block = invalidation.last_block;
                    last_deletion = Some(LastDeletion {
                        timestamp: inval_t.0,
                        first_block: first_block.0,
                        last_block: last_block.0,
                        file_id: entry_fid.0,
                    });
                }
            } else if last_alloc.map_or(true, |la| entry_t.0 > la.timestamp) {
                last_alloc = Some(LastAlloc {
                    timestamp: entry_t.0,
                    block: first_block.0,
                    init_age: first_block_age.0,
                    kind: LastAllocKind::File { file_id: entry_fid.0 },
                });
            }

            self.inode_advance(&mut iter)?;
        }

        self.t = max_t;
        self.max_file_id = max_file_id;

        if let Some(la) = last_alloc {
            self.recover_allocation(&la)?;
        }
        if let Some(ld) = last_deletion {
            self.recover_deletion(&ld)?;
        }

        self.state = MountState::Mounted;
        info!(
            target: "flogfs",
            "mounted: {} free of {} blocks, t = {}, max file id = {}, max age = {max_age}",
            self.alloc.num_free(),
            geo.blocks,
            self.t,
            self.max_file_id
        );
        Ok(())
    }

    /// Completes the newest allocation if power failed between the
    /// committed chain link and the successor's init sector.
    fn recover_allocation(&mut self, la: &LastAlloc) -> FsResult<()> {
        let block = la.block;
        if block == BlockIndex::INVALID.0 || self.media.is_quarantined(block) {
            return Ok(());
        }

        match la.kind {
            LastAllocKind::File { file_id } => {
                let init: FileInitHeader = self.media.read_record(block, 0, 0)?;
                let stamped = init.file_id;
                if stamped.0 == file_id {
                    return Ok(());
                }

                info!(
                    target: "flogfs",
                    "recovering interrupted file allocation: block {block}, file {file_id}"
                );
                let pool_age = self.media.stat_age(block)?;
                self.media.erase(block)?;
                let header = FileInitHeader {
                    age: BlockAge(la.init_age),
                    file_id: FileId(file_id),
                };
                let spare = SectorSpare {
                    type_id: BlockType::File.tag(),
                    reserved: 0,
                    nbytes: 0,
                };
                self.media.write_record(block, 0, 0, &header)?;
                self.media.write_spare(block, 0, &spare)?;
                self.media.commit()?;

                if self.alloc.is_free(block) {
                    self.alloc.claim(block, pool_age);
                }
            }
            LastAllocKind::Inode { previous, index } => {
                let tag: [u8; 1] = self.media.read_spare(block, 0)?;
                if BlockType::decode(tag[0]) == Some(BlockType::Inode) {
                    return Ok(());
                }

                info!(
                    target: "flogfs",
                    "recovering interrupted inode-chain extension: block {block}"
                );
                let pool_age = self.media.stat_age(block)?;
                self.media.erase(block)?;
                let header = InodeInitHeader {
                    age: BlockAge(la.init_age),
                    timestamp: Timestamp(la.timestamp),
                    previous_block: BlockIndex(previous),
                };
                let spare = InodeInitSpare {
                    type_id: BlockType::Inode.tag(),
                    reserved: 0,
                    inode_index: index + 1,
                };
                self.media.write_record(block, 0, 0, &header)?;
                self.media.write_spare(block, 0, &spare)?;
                self.media.commit()?;

                if self.alloc.is_free(block) {
                    self.alloc.claim(block, pool_age);
                }
            }
        }

        self.t = self.t.max(la.timestamp);
        Ok(())
    }

    /// Re-runs the chain invalidation of the newest deletion if it never
    /// reached the recorded last block.
    fn recover_deletion(&mut self, ld: &LastDeletion) -> FsResult<()> {
        let block = ld.last_block;
        if block == BlockIndex::INVALID.0 || self.media.is_quarantined(block) {
            return Ok(());
        }
        if !matches!(self.media.block_type(block), Ok(BlockType::File)) {
            // Reclaimed (or reused) already; the walk completed far
            // enough that nothing of the file remains.
            return Ok(());
        }

        let init: FileInitHeader = self.media.read_record(block, 0, 0)?;
        let stamped = init.file_id;
        if stamped.0 != ld.file_id {
            return Ok(());
        }
        if self.media.stat_read(block)?.is_some() {
            // The stat rewrite is the last step of a reclaim; the walk
            // completed.
            return Ok(());
        }

        info!(
            target: "flogfs",
            "recovering interrupted deletion of file {}", ld.file_id
        );
        self.invalidate_chain(ld.first_block, ld.file_id)
    }

    /// Reclaims every block of a deleted file chain: erase, rewrite the
    /// stat record (preserving age and the old forward link), return the
    /// block to the free pool.
    fn invalidate_chain(&mut self, first_block: u16, file_id: u32) -> FsResult<()> {
        // Stamps handed out during the walk are fenced off from later
        // allocations through the ceiling, success or not.
        self.alloc.t_ceiling = self.t;
        let result = self.invalidate_chain_walk(first_block, file_id);
        self.alloc.t_ceiling = 0;
        result
    }

    fn invalidate_chain_walk(&mut self, first_block: u16, file_id: u32) -> FsResult<()> {
        let geo = self.media.geo();

        let mut block = first_block;
        let mut reclaimed = 0u16;
        while block != BlockIndex::INVALID.0 {
            if self.media.is_quarantined(block) {
                break;
            }
            let ty = match self.media.block_type(block) {
                Ok(ty) => ty,
                Err(FsError::Corrupt) => break,
                Err(other) => return Err(other),
            };

            match ty {
                BlockType::Unallocated => {
                    // Already reclaimed by an interrupted earlier run;
                    // hop along its preserved link.
                    match self.media.stat_read(block)? {
                        Some(stat) => {
                            let next = stat.next_block;
                            if !next.is_valid() {
                                break;
                            }
                            block = next.0;
                        }
                        None => break,
                    }
                }
                BlockType::File => {
                    let init: FileInitHeader = self.media.read_record(block, 0, 0)?;
                    let stamped = init.file_id;
                    let age = init.age;
                    if stamped.0 != file_id {
                        // A newer allocation owns this block; the chain
                        // ends here.
                        break;
                    }

                    let tail: TailPrefix = self.media.read_record(block, geo.tail_sector(), 0)?;
                    let tail_t = tail.timestamp;
                    let next = if tail_t.is_valid() {
                        tail.next_block
                    } else {
                        BlockIndex::INVALID
                    };
                    let next_age = tail.next_age;

                    self.media.close();
                    if self.media.erase(block).is_err() {
                        // Refused erase: the block is quarantined and its
                        // capacity lost, but the walk goes on.
                        block = next.0;
                        continue;
                    }
                    let stamp = self.next_timestamp();
                    let stat = BlockStat {
                        age,
                        next_block: next,
                        next_age,
                        timestamp: Timestamp(stamp),
                        key: BlockStat::KEY,
                    };
                    self.media
                        .write_record(block, geo.stat_sector(), 0, &stat)?;
                    self.media.commit()?;

                    self.alloc.mark_free(block, age.0);
                    reclaimed += 1;
                    block = next.0;
                }
                BlockType::Inode => break,
            }
        }

        info!(
            target: "flogfs",
            "file {file_id}: reclaimed {reclaimed} blocks, {} free", self.alloc.num_free()
        );
        Ok(())
    }

    /// Finds the last block of a live chain by following completed tails.
    fn chain_last_block(&mut self, first_block: u16) -> FsResult<u16> {
        let tail_sector = self.media.geo().tail_sector();
        let mut block = first_block;
        loop {
            let tail: TailPrefix = self.media.read_record(block, tail_sector, 0)?;
            let tail_t = tail.timestamp;
            let next = tail.next_block;
            if !tail_t.is_valid() || !next.is_valid() {
                return Ok(block);
            }
            block = next.0;
        }
    }

    fn open_write(&mut self, name: &str) -> FsResult<u32> {
        let filename = Filename::new(name)?;
        let fd = self.next_fd;

        let state = match self.find_file(&filename)? {
            crate::inode::Lookup::Found { entry, .. } => {
                let id = entry.file_id;
                if self.id_open_for_write(id.0) {
                    return Err(FsError::Busy);
                }
                self.write_seek_end(&entry)?
            }
            crate::inode::Lookup::Free(mut iter) => {
                self.inode_prepare_new(&mut iter)?;
                self.flush_dirty_block()?;
                let allocation = self
                    .alloc
                    .allocate(&mut self.media, 0)?
                    .ok_or(FsError::NoSpace)?;
                let timestamp = self.next_timestamp();
                let id = self.max_file_id + 1;

                let entry = InodeAllocEntry {
                    file_id: FileId(id),
                    first_block: BlockIndex(allocation.block),
                    first_block_age: BlockAge(allocation.age + 1),
                    timestamp: Timestamp(timestamp),
                    filename: filename.raw(),
                };
                self.inode_write_entry(&iter, &entry)?;
                self.max_file_id = id;
                self.alloc.dirty = Some(DirtyBlock {
                    block: allocation.block,
                    owner: fd,
                });

                self.write_fresh_state(id, allocation.block, allocation.age + 1)
            }
        };

        self.next_fd += 1;
        self.open_files.insert(fd, OpenFile::Write(state));
        Ok(fd)
    }

    fn open_read(&mut self, name: &str) -> FsResult<u32> {
        let filename = Filename::new(name)?;
        let entry = match self.find_file(&filename)? {
            crate::inode::Lookup::Found { entry, .. } => entry,
            crate::inode::Lookup::Free(_) => return Err(FsError::NotFound),
        };

        let state = self.read_open_state(&entry);
        let fd = self.next_fd;
        self.next_fd += 1;
        self.open_files.insert(fd, OpenFile::Read(state));
        Ok(fd)
    }

    fn remove(&mut self, name: &str) -> FsResult<()> {
        let filename = Filename::new(name)?;
        let (iter, entry) = match self.find_file(&filename)? {
            crate::inode::Lookup::Found { iter, entry } => (iter, entry),
            crate::inode::Lookup::Free(_) => return Err(FsError::NotFound),
        };

        let id = entry.file_id;
        let first_block = entry.first_block;
        if self.id_open(id.0) {
            return Err(FsError::Busy);
        }

        let last_block = self.chain_last_block(first_block.0)?;
        let stamp = self.next_timestamp();
        let invalidation = InodeInvalidateEntry {
            timestamp: Timestamp(stamp),
            last_block: BlockIndex(last_block),
        };
        self.inode_write_invalidation(&iter, &invalidation)?;

        self.invalidate_chain(first_block.0, id.0)
    }

    /// Closes a write descriptor, flushing the buffered partial sector
    /// and resolving the dirty slot so no allocated block is stranded.
    fn close_write_state(&mut self, fd: u32, state: &mut WriteState) -> FsResult<()> {
        self.commit_partial(fd, state)?;
        if matches!(self.alloc.dirty, Some(d) if d.block == state.block) {
            // The flush ran onto a fresh successor block; claim its init
            // sector so it is not stranded.
            self.commit_partial(fd, state)?;
        }
        Ok(())
    }

    fn unmount(&mut self) -> FsResult<()> {
        self.ensure_mounted()?;

        let fds: alloc::vec::Vec<u32> = self.open_files.keys().copied().collect();
        let mut first_err = None;
        for fd in fds {
            if let Some(OpenFile::Write(mut state)) = self.open_files.remove(&fd) {
                if let Err(e) = self.close_write_state(fd, &mut state) {
                    first_err.get_or_insert(e);
                }
            }
        }

        self.open_files.clear();
        self.media.close();
        self.state = MountState::Unmounted;
        info!(target: "flogfs", "unmounted");
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

/// An append-only log filesystem over one NAND flash device.
///
/// The handle brackets the whole `mount..unmount` lifetime; dropping it
/// releases the device. All operations are serialized by an internal
/// lock and return only once their media side effects are durable.
pub struct Flogfs<D: NandFlash> {
    core: Mutex<Core<D>>,
}

impl<D: NandFlash> Flogfs<D> {
    /// Takes ownership of a flash device and brings it out of reset. The
    /// filesystem starts unmounted.
    pub fn new(mut dev: D) -> FsResult<Self> {
        dev.init()?;
        let blocks = dev.geometry().blocks;
        Ok(Self {
            core: Mutex::new(Core {
                media: Media::new(dev),
                state: MountState::Unmounted,
                t: 0,
                max_file_id: 0,
                inode0: 0,
                alloc: Allocator::new(blocks),
                open_files: HashMap::new(),
                next_fd: 1,
            }),
        })
    }

    /// Erases the media and writes a fresh, empty filesystem, preserving
    /// block erase counters where the old stat records survive.
    ///
    /// # Errors
    ///
    /// [`FsError::AlreadyMounted`] on a mounted filesystem;
    /// [`FsError::NoSpace`] when not a single good block exists.
    pub fn format(&self) -> FsResult<()> {
        self.core.lock().format()
    }

    /// Reads the whole block array, rebuilds the in-RAM state and repairs
    /// any operation a power loss left half-done. A second call on a
    /// mounted filesystem is a no-op.
    pub fn mount(&self) -> FsResult<()> {
        self.core.lock().mount()
    }

    /// Flushes every open write file and returns to the unmounted state.
    pub fn unmount(&self) -> FsResult<()> {
        self.core.lock().unmount()
    }

    /// Opens a live file for sequential reading from the start.
    pub fn open_read(&self, name: &str) -> FsResult<ReadFile> {
        let mut core = self.core.lock();
        core.ensure_mounted()?;
        Ok(ReadFile {
            fd: core.open_read(name)?,
        })
    }

    /// Reads up to `buf.len()` bytes at the file's read head. `Ok(0)`
    /// means the end of committed data.
    pub fn read(&self, file: &mut ReadFile, buf: &mut [u8]) -> FsResult<usize> {
        let mut core = self.core.lock();
        core.ensure_mounted()?;
        let mut state = match core.open_files.remove(&file.fd) {
            Some(OpenFile::Read(state)) => state,
            Some(other) => {
                core.open_files.insert(file.fd, other);
                return Err(FsError::BadHandle);
            }
            None => return Err(FsError::BadHandle),
        };
        let result = core.file_read(&mut state, buf);
        core.open_files.insert(file.fd, OpenFile::Read(state));
        result
    }

    /// Closes a read file.
    pub fn close_read(&self, file: ReadFile) -> FsResult<()> {
        let mut core = self.core.lock();
        match core.open_files.remove(&file.fd) {
            Some(OpenFile::Read(_)) => Ok(()),
            Some(other) => {
                core.open_files.insert(file.fd, other);
                Err(FsError::BadHandle)
            }
            None => Err(FsError::BadHandle),
        }
    }

    /// Opens a file for appending, creating it if no live file of that
    /// name exists.
    ///
    /// # Errors
    ///
    /// [`FsError::Busy`] if the file is already open for writing;
    /// [`FsError::NoSpace`] when neither an inode slot nor a first block
    /// can be allocated.
    pub fn open_write(&self, name: &str) -> FsResult<WriteFile> {
        let mut core = self.core.lock();
        core.ensure_mounted()?;
        Ok(WriteFile {
            fd: core.open_write(name)?,
        })
    }

    /// Appends `data` to the file. Returns the byte count accepted,
    /// which falls short only when the media runs out of free blocks.
    pub fn write(&self, file: &mut WriteFile, data: &[u8]) -> FsResult<usize> {
        let mut core = self.core.lock();
        core.ensure_mounted()?;
        let mut state = match core.open_files.remove(&file.fd) {
            Some(OpenFile::Write(state)) => state,
            Some(other) => {
                core.open_files.insert(file.fd, other);
                return Err(FsError::BadHandle);
            }
            None => return Err(FsError::BadHandle),
        };
        let result = core.file_write(file.fd, &mut state, data);
        core.open_files.insert(file.fd, OpenFile::Write(state));
        result
    }

    /// Closes a write file, committing its buffered partial sector.
    pub fn close_write(&self, file: WriteFile) -> FsResult<()> {
        let mut core = self.core.lock();
        core.ensure_mounted()?;
        let mut state = match core.open_files.remove(&file.fd) {
            Some(OpenFile::Write(state)) => state,
            Some(other) => {
                core.open_files.insert(file.fd, other);
                return Err(FsError::BadHandle);
            }
            None => return Err(FsError::BadHandle),
        };
        core.close_write_state(file.fd, &mut state)
    }

    /// Whether a live file of that name exists.
    pub fn exists(&self, name: &str) -> FsResult<bool> {
        let mut core = self.core.lock();
        core.ensure_mounted()?;
        let filename = Filename::new(name)?;
        Ok(matches!(
            core.find_file(&filename)?,
            crate::inode::Lookup::Found { .. }
        ))
    }

    /// Deletes a live file and reclaims its blocks.
    ///
    /// # Errors
    ///
    /// [`FsError::NotFound`] if no live file carries the name;
    /// [`FsError::Busy`] while the file is open.
    pub fn remove(&self, name: &str) -> FsResult<()> {
        let mut core = self.core.lock();
        core.ensure_mounted()?;
        core.remove(name)
    }

    /// Starts an enumeration of live files in inode-table order.
    pub fn ls_start(&self) -> FsResult<FileLister> {
        let mut core = self.core.lock();
        core.ensure_mounted()?;
        let iter = core.inode_iter_start()?;
        Ok(FileLister { iter })
    }

    /// Yields the next live filename, or `None` past the last entry.
    pub fn ls_next(&self, lister: &mut FileLister) -> FsResult<Option<Filename>> {
        let mut core = self.core.lock();
        core.ensure_mounted()?;

        loop {
            let Some(entry) = core.inode_read_entry(&lister.iter)? else {
                return Ok(None);
            };
            let invalidation = core.inode_read_invalidation(&lister.iter)?;
            core.inode_advance(&mut lister.iter)?;

            let inval_t = invalidation.timestamp;
            if !inval_t.is_valid() {
                return Ok(Some(Filename::from_raw(entry.filename)));
            }
        }
    }

    /// Ends an enumeration. Provided for symmetry; dropping the lister
    /// works as well.
    pub fn ls_stop(&self, lister: FileLister) {
        let _ = lister;
    }

    /// Free blocks currently available for allocation.
    pub fn available_blocks(&self) -> FsResult<u32> {
        let core = self.core.lock();
        core.ensure_mounted()?;
        Ok(core.alloc.num_free())
    }

    /// Releases the flash device, discarding all in-RAM state.
    pub fn into_device(self) -> D {
        self.core.into_inner().media.into_device()
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> spin::MutexGuard<'_, Core<D>> {
        self.core.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memnand::MemNand;
    use crate::nand::Geometry;

    /// One inode entry per block: chain extensions happen on the second
    /// file already.
    fn tiny_geo(blocks: u16) -> Geometry {
        Geometry {
            sector_size: 512,
            sectors_per_page: 4,
            pages_per_block: 2,
            blocks,
        }
    }

    /// Five inode entries per block.
    fn wide_geo(blocks: u16) -> Geometry {
        Geometry {
            sector_size: 512,
            sectors_per_page: 4,
            pages_per_block: 4,
            blocks,
        }
    }

    fn fresh_fs(geo: Geometry) -> Flogfs<MemNand> {
        let fs = Flogfs::new(MemNand::new(geo)).unwrap();
        fs.format().unwrap();
        fs.mount().unwrap();
        fs
    }

    fn put_file(fs: &Flogfs<MemNand>, name: &str, data: &[u8]) {
        let mut wf = fs.open_write(name).unwrap();
        assert_eq!(fs.write(&mut wf, data).unwrap(), data.len());
        fs.close_write(wf).unwrap();
    }

    fn power_cycle(fs: Flogfs<MemNand>) -> Flogfs<MemNand> {
        let mut dev = fs.into_device();
        dev.clear_operation_budget();
        let fs = Flogfs::new(dev).unwrap();
        fs.mount().unwrap();
        fs
    }

    #[test]
    fn inode_iterator_walks_chain_both_ways() {
        let fs = fresh_fs(tiny_geo(16));
        for name in ["a", "b", "c"] {
            put_file(&fs, name, name.as_bytes());
        }

        let mut core = fs.core();
        let mut iter = core.inode_iter_start().unwrap();
        let mut names = alloc::vec::Vec::new();
        while let Some(entry) = core.inode_read_entry(&iter).unwrap() {
            names.push(Filename::from_raw(entry.filename));
            core.inode_advance(&mut iter).unwrap();
        }
        let names: alloc::vec::Vec<&str> = names.iter().map(|n| n.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        // Three one-entry blocks were chained up.
        assert_eq!(iter.inode_block_idx, 2);

        // Walk back to the very first entry through the back-links.
        assert!(core.inode_retreat(&mut iter).unwrap());
        assert!(core.inode_retreat(&mut iter).unwrap());
        assert!(core.inode_retreat(&mut iter).unwrap());
        assert!(!core.inode_retreat(&mut iter).unwrap());
        let entry = core.inode_read_entry(&iter).unwrap().unwrap();
        assert_eq!(Filename::from_raw(entry.filename).as_str(), "a");
        assert_eq!(iter.inode_idx, 0);
    }

    #[test]
    fn file_ids_strictly_increase() {
        let fs = fresh_fs(tiny_geo(16));
        for name in ["a", "b", "c"] {
            put_file(&fs, name, &[0x11]);
        }
        fs.remove("b").unwrap();
        put_file(&fs, "b", &[0x22]);

        let mut core = fs.core();
        let mut iter = core.inode_iter_start().unwrap();
        let mut ids = alloc::vec::Vec::new();
        while let Some(entry) = core.inode_read_entry(&iter).unwrap() {
            let id = entry.file_id;
            ids.push(id.0);
            core.inode_advance(&mut iter).unwrap();
        }
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(ids, sorted);
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn free_sum_matches_stat_records() {
        let fs = fresh_fs(tiny_geo(16));
        put_file(&fs, "x", &[0x5A; 4000]);
        put_file(&fs, "y", &[0xA5; 100]);
        fs.remove("x").unwrap();

        let mut core = fs.core();
        let blocks = core.media.geo().blocks;
        let mut sum = 0u64;
        for block in 0..blocks {
            if core.alloc.is_free(block) {
                sum += u64::from(core.media.stat_age(block).unwrap());
            }
        }
        assert_eq!(sum, core.alloc.free_sum());
    }

    #[test]
    fn interrupted_inode_extension_is_repaired() {
        let fs = fresh_fs(tiny_geo(16));
        put_file(&fs, "a", b"first");

        // The next create must extend the inode chain. Let the extension
        // link commit, then cut power at the successor erase.
        fs.core().media.device_mut().set_operation_budget(1);
        assert!(fs.open_write("b").is_err());

        let fs = power_cycle(fs);
        assert!(fs.exists("a").unwrap());
        assert!(!fs.exists("b").unwrap());

        // The repaired chain block accepts the retried create.
        put_file(&fs, "b", b"second");
        let fs = power_cycle(fs);
        assert!(fs.exists("b").unwrap());

        let mut rf = fs.open_read("b").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(fs.read(&mut rf, &mut buf).unwrap(), 6);
        assert_eq!(&buf[..6], b"second");
    }

    #[test]
    fn interrupted_deletion_is_repaired() {
        let fs = fresh_fs(tiny_geo(16));
        let baseline = fs.available_blocks().unwrap();

        // Three blocks worth of payload.
        let payload = alloc::vec![0xC3u8; 8000];
        put_file(&fs, "victim", &payload);
        assert_eq!(fs.available_blocks().unwrap(), baseline - 3);

        // Budget: the invalidation entry commits, the first block is
        // reclaimed (erase + stat commit), then power fails.
        fs.core().media.device_mut().set_operation_budget(3);
        let _ = fs.remove("victim");

        let fs = power_cycle(fs);
        assert!(!fs.exists("victim").unwrap());
        assert_eq!(fs.available_blocks().unwrap(), baseline);
    }

    #[test]
    fn wear_leveling_prefers_young_blocks() {
        let fs = fresh_fs(wide_geo(16));

        // Skew the pool: blocks 1-3 look heavily worn, the rest fresh.
        {
            let mut core = fs.core();
            let stat_sector = core.media.geo().stat_sector();
            for block in 1..16u16 {
                let age = if block <= 3 { 60 } else { 0 };
                core.media.erase(block).unwrap();
                let stat = BlockStat {
                    age: BlockAge(age),
                    next_block: BlockIndex::INVALID,
                    next_age: BlockAge::INVALID,
                    timestamp: Timestamp(0),
                    key: BlockStat::KEY,
                };
                core.media.write_record(block, stat_sector, 0, &stat).unwrap();
                core.media.commit().unwrap();
            }
        }
        let fs = power_cycle(fs);

        let payload = alloc::vec![0x3Cu8; 8000];
        for _ in 0..40 {
            put_file(&fs, "churn", &payload);
            fs.remove("churn").unwrap();
        }

        let mut core = fs.core();
        let blocks = core.media.geo().blocks;
        let mut free_ages = alloc::vec::Vec::new();
        for block in 0..blocks {
            if core.alloc.is_free(block) {
                free_ages.push(core.media.stat_age(block).unwrap());
            }
        }
        let spread = free_ages.iter().max().unwrap() - free_ages.iter().min().unwrap();
        assert!(spread <= 60, "age spread grew to {spread}");

        // The fresh blocks carried the churn, the worn ones rested.
        let dev = core.media.device_mut();
        let young_erases: u32 = (4..16u16).map(|b| dev.erase_count(b)).sum();
        let old_erases: u32 = (1..=3u16).map(|b| dev.erase_count(b)).sum();
        assert!(
            young_erases > old_erases * 4,
            "young {young_erases} vs old {old_erases}"
        );
    }
}
