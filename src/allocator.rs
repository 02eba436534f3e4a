//! Free-block accounting, preallocation and wear-leveling.
//!
//! The allocator keeps a bitmap of free blocks, the sum and mean of their
//! erase counters, and a small preallocation list of candidates ordered
//! by age. Allocation walks the bitmap behind a moving head, comparing
//! each candidate's age against the mean: young blocks are handed out,
//! old blocks are parked in the preallocation list and the acceptance
//! threshold decays by one per rejection so allocation terminates on any
//! wear spread.
//!
//! Claimed blocks are returned unerased. The caller parks the block in
//! the one-slot dirty-block field and the erase happens on first real
//! write; [`Allocator::dirty`] therefore holds at most one block whose
//! init sector is not yet on media, which is also the only allocation a
//! crash can leave half-done.

use bitvec::vec::BitVec;

use crate::errors::FsResult;
use crate::media::Media;
use crate::nand::NandFlash;

/// Capacity of the preallocation list.
pub(crate) const PREALLOCATE_SIZE: usize = 10;

/// A claimed free block, with its age as read from the stat record.
/// Consumers stamp `age + 1` into the init sector they write.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Allocation {
    pub block: u16,
    pub age: u32,
}

/// The one outstanding allocated-but-not-yet-initialized block.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DirtyBlock {
    pub block: u16,
    /// Descriptor of the open write file holding the block.
    pub owner: u32,
}

#[derive(Clone, Copy, Debug)]
struct PreallocEntry {
    block: u16,
    age: u32,
}

pub(crate) struct Allocator {
    blocks: u16,
    free: BitVec,
    num_free: u32,
    free_sum: u64,
    mean_free_age: u32,
    prealloc: alloc::vec::Vec<PreallocEntry>,
    allocate_head: u16,
    pub(crate) dirty: Option<DirtyBlock>,
    /// Allocation stamps must stay above this while a deletion is
    /// rewriting timestamps (zero when no deletion is in flight).
    pub(crate) t_ceiling: u32,
}

impl Allocator {
    pub(crate) fn new(blocks: u16) -> Self {
        Self {
            blocks,
            free: BitVec::repeat(false, usize::from(blocks)),
            num_free: 0,
            free_sum: 0,
            mean_free_age: 0,
            prealloc: alloc::vec::Vec::with_capacity(PREALLOCATE_SIZE),
            allocate_head: 0,
            dirty: None,
            t_ceiling: 0,
        }
    }

    /// Drops all accounting, ahead of a mount pass rebuilding it.
    pub(crate) fn reset(&mut self) {
        self.free.fill(false);
        self.num_free = 0;
        self.free_sum = 0;
        self.mean_free_age = 0;
        self.prealloc.clear();
        self.allocate_head = 0;
        self.dirty = None;
        self.t_ceiling = 0;
    }

    pub(crate) fn num_free(&self) -> u32 {
        self.num_free
    }

    pub(crate) fn free_sum(&self) -> u64 {
        self.free_sum
    }

    pub(crate) fn mean_free_age(&self) -> u32 {
        self.mean_free_age
    }

    pub(crate) fn is_free(&self, block: u16) -> bool {
        self.free[usize::from(block)]
    }

    /// Returns a block to the free pool with the age its fresh stat
    /// record carries.
    pub(crate) fn mark_free(&mut self, block: u16, age: u32) {
        debug_assert!(!self.is_free(block));
        self.free.set(usize::from(block), true);
        self.num_free += 1;
        self.free_sum += u64::from(age);
        self.recompute_mean();
    }

    /// Takes a block out of the free pool.
    pub(crate) fn claim(&mut self, block: u16, age: u32) {
        debug_assert!(self.is_free(block));
        self.free.set(usize::from(block), false);
        self.num_free -= 1;
        self.free_sum = self.free_sum.saturating_sub(u64::from(age));
        self.recompute_mean();
    }

    fn recompute_mean(&mut self) {
        self.mean_free_age = if self.num_free == 0 {
            0
        } else {
            (self.free_sum / u64::from(self.num_free)) as u32
        };
    }

    /// A candidate is young enough when the mean free age exceeds its age
    /// by at least `threshold` (signed; negative thresholds admit blocks
    /// older than the mean).
    fn sufficient(&self, age: u32, threshold: i32) -> bool {
        i64::from(self.mean_free_age) - i64::from(age) >= i64::from(threshold)
    }

    /// Inserts a candidate ascending by age, evicting the oldest entry
    /// when the list is full.
    fn prealloc_push(&mut self, block: u16, age: u32) {
        if self.prealloc.iter().any(|e| e.block == block) {
            return;
        }

        let at = self
            .prealloc
            .iter()
            .position(|e| e.age > age)
            .unwrap_or(self.prealloc.len());
        self.prealloc.insert(at, PreallocEntry { block, age });
        if self.prealloc.len() > PREALLOCATE_SIZE {
            self.prealloc.pop();
        }
    }

    /// Takes the youngest preallocated candidate if it meets the
    /// threshold. Entries that stopped being free since they were pushed
    /// are discarded on the way.
    fn prealloc_pop(&mut self, threshold: i32) -> Option<PreallocEntry> {
        while let Some(&entry) = self.prealloc.first() {
            if !self.is_free(entry.block) {
                self.prealloc.remove(0);
                continue;
            }
            if self.sufficient(entry.age, threshold) {
                self.prealloc.remove(0);
                return Some(entry);
            }
            return None;
        }
        None
    }

    /// Claims a free block, preferring blocks younger than the free-pool
    /// mean by at least `base_threshold` erases.
    ///
    /// Examines at most one full cycle of the block array, decrementing
    /// the threshold on every rejected candidate, so some block is
    /// accepted on any age distribution. Returns `None` when the pool is
    /// exhausted. The claimed block is *not* erased.
    pub(crate) fn allocate<D: NandFlash>(
        &mut self,
        media: &mut Media<D>,
        base_threshold: i32,
    ) -> FsResult<Option<Allocation>> {
        if self.num_free == 0 {
            return Ok(None);
        }

        let mut threshold = base_threshold;
        for _ in 0..self.blocks {
            if let Some(entry) = self.prealloc_pop(threshold) {
                self.claim(entry.block, entry.age);
                return Ok(Some(Allocation {
                    block: entry.block,
                    age: entry.age,
                }));
            }

            let block = self.allocate_head;
            self.allocate_head = (self.allocate_head + 1) % self.blocks;

            if self.is_free(block) && !media.is_quarantined(block) {
                let age = media.stat_age(block)?;
                if self.sufficient(age, threshold) {
                    self.claim(block, age);
                    return Ok(Some(Allocation { block, age }));
                }
                self.prealloc_push(block, age);
            }

            threshold -= 1;
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator_with_ages(ages: &[(u16, u32)]) -> Allocator {
        let mut a = Allocator::new(8);
        for &(block, age) in ages {
            a.mark_free(block, age);
        }
        a
    }

    #[test]
    fn free_accounting() {
        let mut a = allocator_with_ages(&[(0, 10), (1, 20), (2, 30)]);
        assert_eq!(a.num_free(), 3);
        assert_eq!(a.free_sum(), 60);
        assert_eq!(a.mean_free_age(), 20);

        a.claim(1, 20);
        assert_eq!(a.num_free(), 2);
        assert_eq!(a.free_sum(), 40);
        assert_eq!(a.mean_free_age(), 20);
        assert!(!a.is_free(1));
    }

    #[test]
    fn prealloc_orders_by_age_and_evicts_oldest() {
        let mut a = Allocator::new(64);
        for block in 0..64u16 {
            a.mark_free(block, 0);
        }
        // Push more candidates than the list holds, youngest last.
        for block in 0..(PREALLOCATE_SIZE as u16 + 4) {
            a.prealloc_push(block, u32::from(100 - block));
        }
        assert_eq!(a.prealloc.len(), PREALLOCATE_SIZE);
        // The retained entries are the youngest, ascending.
        let ages: alloc::vec::Vec<u32> = a.prealloc.iter().map(|e| e.age).collect();
        let mut sorted = ages.clone();
        sorted.sort_unstable();
        assert_eq!(ages, sorted);
        assert_eq!(*ages.last().unwrap(), 96);
    }

    #[test]
    fn prealloc_pop_respects_threshold() {
        let mut a = allocator_with_ages(&[(0, 100), (1, 100), (2, 100), (3, 40)]);
        // mean = 85; the youngest candidate is 40 and clears a threshold
        // of 40 erases below the mean.
        a.prealloc_push(3, 40);
        assert!(a.prealloc_pop(40).is_some());

        let mut a = allocator_with_ages(&[(0, 100), (1, 100), (2, 100), (3, 80)]);
        // mean = 95; 95 - 80 < 50.
        a.prealloc_push(3, 80);
        assert!(a.prealloc_pop(50).is_none());
    }

    #[test]
    fn prealloc_pop_discards_claimed_entries() {
        let mut a = allocator_with_ages(&[(0, 10), (1, 10), (2, 10)]);
        a.prealloc_push(1, 10);
        a.claim(1, 10);
        assert!(a.prealloc_pop(i32::MIN + 1).is_none());
        assert!(a.prealloc.is_empty());
    }
}
