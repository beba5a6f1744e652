//! The process arena: slot slab, heap-block pool, partition free stacks.
//!
//! Everything is allocated once at init: `max_procs` process records,
//! `max_procs` heap blocks of `block_words` 64-bit words, and one partition
//! per worker holding free-index stacks for both pools. Spawn is then a pair
//! of stack pops plus field initialization — no allocator, no syscalls.
//!
//! Initial distribution is contiguous so that local spawns produce adjacent
//! slot indices. Each partition stack has capacity for every index in the
//! system, since stealing can concentrate free indices arbitrarily.
//!
//! Cross-partition stealing locks partition pairs in ascending id order,
//! which makes lock cycles impossible.

use std::cell::UnsafeCell;

use parking_lot::Mutex;

use crate::config::STEAL_BATCH;
use crate::process::Process;

// ---------------------------------------------------------------------------
// Partition
// ---------------------------------------------------------------------------

/// A per-worker slice of the free slot and free block pools.
///
/// The mutexes are held only for a push, a pop, or a batch move; nothing
/// blocks while holding one.
pub struct Partition {
    free_slots: Mutex<Vec<u32>>,
    free_blocks: Mutex<Vec<u32>>,
}

impl Partition {
    fn with_range(range: std::ops::Range<u32>, capacity: usize) -> Partition {
        let mut slots = Vec::with_capacity(capacity);
        let mut blocks = Vec::with_capacity(capacity);
        // Reverse order so pops hand out ascending, adjacent indices.
        for i in range.rev() {
            slots.push(i);
            blocks.push(i);
        }
        Partition {
            free_slots: Mutex::new(slots),
            free_blocks: Mutex::new(blocks),
        }
    }
}

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

/// The pre-allocated process arena.
pub struct Arena {
    slots: Box<[Process]>,
    /// Flat pool of `max_procs * block_words` words; block `i` starts at
    /// word `i * block_words`.
    blocks: Box<[UnsafeCell<u64>]>,
    block_words: usize,
    partitions: Box<[Partition]>,
}

// Safety: block memory is handed out one block per live process and only
// touched by that process's home worker; the partition stacks are mutexed
// and the slot records synchronize themselves.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Carve out `max_procs` slots and blocks, distributed contiguously
    /// across `num_partitions` partitions.
    pub fn new(max_procs: usize, block_words: usize, num_partitions: usize) -> Arena {
        debug_assert!(max_procs > 0 && block_words > 0 && num_partitions > 0);

        let slots: Box<[Process]> = (0..max_procs as u32).map(Process::new).collect();
        let blocks: Box<[UnsafeCell<u64>]> = (0..max_procs * block_words)
            .map(|_| UnsafeCell::new(0))
            .collect();

        let chunk = max_procs.div_ceil(num_partitions);
        let partitions: Box<[Partition]> = (0..num_partitions)
            .map(|p| {
                let start = (p * chunk).min(max_procs) as u32;
                let end = ((p + 1) * chunk).min(max_procs) as u32;
                Partition::with_range(start..end, max_procs)
            })
            .collect();

        Arena {
            slots,
            blocks,
            block_words,
            partitions,
        }
    }

    #[inline]
    pub fn max_procs(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    #[inline]
    pub fn block_words(&self) -> usize {
        self.block_words
    }

    /// Shared reference to a slot record.
    #[inline]
    pub fn slot(&self, idx: u32) -> &Process {
        &self.slots[idx as usize]
    }

    /// Raw pointer to a slot, for run-queue use.
    #[inline]
    pub(crate) fn slot_ptr(&self, idx: u32) -> *mut Process {
        &self.slots[idx as usize] as *const Process as *mut Process
    }

    /// First word of heap block `idx`.
    #[inline]
    pub(crate) fn block_ptr(&self, idx: u32) -> *mut u64 {
        self.blocks[idx as usize * self.block_words].get()
    }

    /// Pop a free slot index from `partition`, or `None` if it is empty.
    pub fn pop_slot(&self, partition: usize) -> Option<u32> {
        self.partitions[partition].free_slots.lock().pop()
    }

    /// Pop a free block index from `partition`, or `None` if it is empty.
    pub fn pop_block(&self, partition: usize) -> Option<u32> {
        self.partitions[partition].free_blocks.lock().pop()
    }

    /// Return a slot index to `partition`.
    pub fn push_slot(&self, partition: usize, idx: u32) {
        self.partitions[partition].free_slots.lock().push(idx);
    }

    /// Return a block index to `partition`.
    pub fn push_block(&self, partition: usize, idx: u32) {
        self.partitions[partition].free_blocks.lock().push(idx);
    }

    /// Move up to `batch` free slots and `batch` free blocks from partition
    /// `from` into partition `into`. Returns how many of each moved.
    ///
    /// Lock pairs are always taken in ascending partition-id order.
    pub fn steal(&self, from: usize, into: usize, batch: usize) -> (usize, usize) {
        if from == into {
            return (0, 0);
        }

        let moved_slots = {
            let (a, b) = (from.min(into), from.max(into));
            let lock_a = self.partitions[a].free_slots.lock();
            let lock_b = self.partitions[b].free_slots.lock();
            let (mut donor, mut local) = if a == from { (lock_a, lock_b) } else { (lock_b, lock_a) };
            let n = batch.min(donor.len());
            let at = donor.len() - n;
            local.extend(donor.drain(at..));
            n
        };

        let moved_blocks = {
            let (a, b) = (from.min(into), from.max(into));
            let lock_a = self.partitions[a].free_blocks.lock();
            let lock_b = self.partitions[b].free_blocks.lock();
            let (mut donor, mut local) = if a == from { (lock_a, lock_b) } else { (lock_b, lock_a) };
            let n = batch.min(donor.len());
            let at = donor.len() - n;
            local.extend(donor.drain(at..));
            n
        };

        (moved_slots, moved_blocks)
    }

    /// One round of stealing into `into`: scan donors in ascending id order
    /// until the local partition has at least one free slot and one free
    /// block, or every donor has been tried.
    pub fn steal_round(&self, into: usize) -> bool {
        let mut got_any = false;
        for from in 0..self.partitions.len() {
            if from == into {
                continue;
            }
            let (s, b) = self.steal(from, into, STEAL_BATCH);
            if s > 0 || b > 0 {
                got_any = true;
                log::trace!("arena: stole {} slots / {} blocks from partition {} into {}", s, b, from, into);
            }
            let p = &self.partitions[into];
            if !p.free_slots.lock().is_empty() && !p.free_blocks.lock().is_empty() {
                break;
            }
        }
        got_any
    }

    /// Total free slots and free blocks across all partitions. Only a
    /// meaningful conservation check at quiescence.
    pub fn free_counts(&self) -> (usize, usize) {
        let mut slots = 0;
        let mut blocks = 0;
        for p in self.partitions.iter() {
            slots += p.free_slots.lock().len();
            blocks += p.free_blocks.lock().len();
        }
        (slots, blocks)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
