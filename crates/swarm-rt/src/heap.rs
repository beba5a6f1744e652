//! Per-process bump heap over a fixed-size arena block.
//!
//! Each live process owns exactly one heap block from the arena pool. The
//! block is a flat array of 64-bit words; allocation is a bump cursor with
//! no free list and no compaction. The cursor is reset when the slot is
//! recycled, so a block never carries state between process incarnations.

use std::ptr;

/// Sentinel for "no block attached".
const UNATTACHED: u32 = u32::MAX;

/// Bump cursor over one arena heap block.
///
/// Touched only by the owning process (or its home worker during recycle),
/// so no internal synchronization is needed.
pub struct ProcHeap {
    /// First word of the block; null while detached.
    base: *mut u64,
    /// Block capacity in words.
    words: usize,
    /// Bump offset in words.
    top: usize,
    /// Arena index of the attached block.
    block: u32,
}

// Safety: a ProcHeap lives inside a process slot and is only touched from
// that slot's home worker thread.
unsafe impl Send for ProcHeap {}

impl ProcHeap {
    /// A heap with no block attached.
    pub fn detached() -> ProcHeap {
        ProcHeap {
            base: ptr::null_mut(),
            words: 0,
            top: 0,
            block: UNATTACHED,
        }
    }

    /// Attach a block and reset the cursor.
    pub fn attach(&mut self, base: *mut u64, words: usize, block: u32) {
        self.base = base;
        self.words = words;
        self.top = 0;
        self.block = block;
    }

    /// Detach the block, returning its arena index so the caller can push it
    /// back to a partition free stack.
    pub fn detach(&mut self) -> Option<u32> {
        if self.block == UNATTACHED {
            return None;
        }
        let block = self.block;
        self.base = ptr::null_mut();
        self.words = 0;
        self.top = 0;
        self.block = UNATTACHED;
        Some(block)
    }

    /// Allocate `n` words. Returns null when the block is exhausted; the
    /// kernel never grows a heap.
    pub fn alloc_words(&mut self, n: usize) -> *mut u64 {
        if self.base.is_null() || n == 0 || self.top + n > self.words {
            return ptr::null_mut();
        }
        let p = unsafe { self.base.add(self.top) };
        self.top += n;
        p
    }

    /// Allocate `bytes` rounded up to whole words. The result is 8-byte
    /// aligned by construction.
    pub fn alloc_bytes(&mut self, bytes: usize) -> *mut u8 {
        let words = bytes.div_ceil(8);
        self.alloc_words(words) as *mut u8
    }

    /// Forget all allocations, keeping the block attached.
    pub fn reset(&mut self) {
        self.top = 0;
    }

    #[inline]
    pub fn used_words(&self) -> usize {
        self.top
    }

    #[inline]
    pub fn free_words(&self) -> usize {
        self.words - self.top
    }

    #[inline]
    pub fn block(&self) -> Option<u32> {
        if self.block == UNATTACHED {
            None
        } else {
            Some(self.block)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_heap_allocs_nothing() {
        let mut h = ProcHeap::detached();
        assert!(h.alloc_words(1).is_null());
        assert_eq!(h.block(), None);
    }

    #[test]
    fn test_bump_alloc_and_exhaustion() {
        let mut backing = vec![0u64; 8];
        let mut h = ProcHeap::detached();
        h.attach(backing.as_mut_ptr(), backing.len(), 5);
        assert_eq!(h.block(), Some(5));

        let a = h.alloc_words(3);
        let b = h.alloc_words(5);
        assert!(!a.is_null());
        assert!(!b.is_null());
        assert_eq!(unsafe { a.add(3) }, b);
        assert_eq!(h.free_words(), 0);

        // Exhausted: next allocation fails, heap state unchanged.
        assert!(h.alloc_words(1).is_null());
        assert_eq!(h.used_words(), 8);
    }

    #[test]
    fn test_alloc_bytes_rounds_to_words() {
        let mut backing = vec![0u64; 4];
        let mut h = ProcHeap::detached();
        h.attach(backing.as_mut_ptr(), backing.len(), 0);

        let p = h.alloc_bytes(9); // rounds to 2 words
        assert!(!p.is_null());
        assert_eq!(h.used_words(), 2);
        assert_eq!(p as usize % 8, 0);
    }

    #[test]
    fn test_reset_and_detach() {
        let mut backing = vec![0u64; 4];
        let mut h = ProcHeap::detached();
        h.attach(backing.as_mut_ptr(), backing.len(), 9);

        assert!(!h.alloc_words(4).is_null());
        h.reset();
        assert_eq!(h.used_words(), 0);
        assert!(!h.alloc_words(4).is_null());

        assert_eq!(h.detach(), Some(9));
        assert_eq!(h.detach(), None);
        assert!(h.alloc_words(1).is_null());
    }
}
