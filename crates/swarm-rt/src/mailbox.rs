//! Lock-free mailbox: multi-producer signal stack, single-consumer FIFO.
//!
//! Senders CAS-push message cells onto `sig_head` (a Treiber-style LIFO) and
//! never touch anything else. The owning process drains the stack by swapping
//! it out, reversing the stolen chain, and appending it to a private FIFO
//! that only the owner mutates. Selective receive scans the private FIFO and
//! unlinks a matching cell without disturbing the relative order of the rest.
//!
//! ## The wait/wake handshake
//!
//! `waiting == 1` is published only after a final drain found the mailbox
//! empty. It is then cleared by exactly one party through an atomic
//! exchange: either a sender (which then owns re-scheduling the process) or
//! the receiver itself, if a final re-inspection turns up a message before it
//! sleeps. No other code path writes the process state based on this flag, so
//! a wake-up can neither be lost nor delivered twice.
//!
//! Message cells are recycled through a per-thread freelist to keep the send
//! path off the global allocator.

use std::cell::{Cell, UnsafeCell};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crate::process::Pid;

// ---------------------------------------------------------------------------
// MsgCell and the per-thread cell freelist
// ---------------------------------------------------------------------------

/// One mailbox entry. `next` is reused across both the sender stack and the
/// private FIFO; a cell is only ever in one of them.
pub struct MsgCell {
    pub tag: u32,
    pub from: Pid,
    pub payload: *mut u8,
    pub(crate) next: *mut MsgCell,
}

/// Cap on the per-thread cell freelist; set from `Config` at init.
pub(crate) static CELL_POOL_CAP: AtomicUsize = AtomicUsize::new(crate::config::MSG_FREELIST_CAP);

thread_local! {
    static CELL_POOL: Cell<*mut MsgCell> = const { Cell::new(ptr::null_mut()) };
    static CELL_POOL_LEN: Cell<usize> = const { Cell::new(0) };
}

/// Obtain a cell from the thread-local freelist, or the allocator.
pub(crate) fn alloc_cell(tag: u32, from: Pid, payload: *mut u8) -> *mut MsgCell {
    let recycled = CELL_POOL.with(|pool| {
        let head = pool.get();
        if head.is_null() {
            ptr::null_mut()
        } else {
            pool.set(unsafe { (*head).next });
            CELL_POOL_LEN.with(|n| n.set(n.get() - 1));
            head
        }
    });

    if recycled.is_null() {
        Box::into_raw(Box::new(MsgCell {
            tag,
            from,
            payload,
            next: ptr::null_mut(),
        }))
    } else {
        unsafe {
            (*recycled).tag = tag;
            (*recycled).from = from;
            (*recycled).payload = payload;
            (*recycled).next = ptr::null_mut();
        }
        recycled
    }
}

/// Return a cell to the thread-local freelist, or the allocator once the
/// freelist is at capacity. The payload is not touched; ownership of it
/// already moved to whoever popped (or dropped) the message.
pub(crate) fn free_cell(cell: *mut MsgCell) {
    let cap = CELL_POOL_CAP.load(Ordering::Relaxed);
    let pooled = CELL_POOL_LEN.with(|n| {
        if n.get() < cap {
            n.set(n.get() + 1);
            true
        } else {
            false
        }
    });
    if pooled {
        CELL_POOL.with(|pool| {
            unsafe { (*cell).next = pool.get() };
            pool.set(cell);
        });
    } else {
        drop(unsafe { Box::from_raw(cell) });
    }
}

// ---------------------------------------------------------------------------
// Mailbox
// ---------------------------------------------------------------------------

struct PrivQueue {
    head: *mut MsgCell,
    tail: *mut MsgCell,
}

/// Inbound-message buffer of one process.
pub struct Mailbox {
    /// Sender-side LIFO stack. Senders only ever CAS this pointer.
    sig_head: AtomicPtr<MsgCell>,
    /// The sleep-commitment flag; see the module docs.
    waiting: AtomicBool,
    /// Total queued messages (signal stack + private FIFO), advisory.
    len: AtomicUsize,
    /// Private FIFO. Owner-only.
    inner: UnsafeCell<PrivQueue>,
}

// Safety: `inner` is mutated only by the owning process on its home worker;
// everything else is atomic.
unsafe impl Send for Mailbox {}
unsafe impl Sync for Mailbox {}

impl Mailbox {
    pub fn new() -> Mailbox {
        Mailbox {
            sig_head: AtomicPtr::new(ptr::null_mut()),
            waiting: AtomicBool::new(false),
            len: AtomicUsize::new(0),
            inner: UnsafeCell::new(PrivQueue {
                head: ptr::null_mut(),
                tail: ptr::null_mut(),
            }),
        }
    }

    /// Sender path: push a cell onto the signal stack. Safe from any thread.
    ///
    /// The caller must follow up with [`take_waiting`](Self::take_waiting)
    /// and re-schedule the process if it returns true.
    ///
    /// SeqCst on success: the sender's push-then-check-waiting and the
    /// receiver's arm-then-drain cross two locations, and the no-lost-wakeup
    /// argument needs a single total order over all four operations.
    pub fn push(&self, cell: *mut MsgCell) {
        let mut head = self.sig_head.load(Ordering::Relaxed);
        loop {
            unsafe { (*cell).next = head };
            match self.sig_head.compare_exchange_weak(
                head,
                cell,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Atomically clear the waiting flag, returning whether it was set.
    ///
    /// The caller that gets `true` owns re-scheduling the process; exactly
    /// one caller can win per sleep cycle.
    #[inline]
    pub fn take_waiting(&self) -> bool {
        self.waiting.swap(false, Ordering::SeqCst)
    }

    /// Receiver path: commit to sleeping. Must only follow a drain that
    /// found no matching message.
    #[inline]
    pub fn arm_waiting(&self) {
        self.waiting.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True while no sender has published a cell since the last drain.
    pub(crate) fn sig_is_empty(&self) -> bool {
        self.sig_head.load(Ordering::Acquire).is_null()
    }

    /// Move everything from the signal stack to the back of the private
    /// FIFO, preserving per-sender send order (the stolen LIFO chain is
    /// reversed before appending).
    ///
    /// # Safety
    ///
    /// Owner-only: must be called from the owning process / its home worker.
    pub unsafe fn drain(&self) {
        let mut chain = self.sig_head.swap(ptr::null_mut(), Ordering::SeqCst);
        if chain.is_null() {
            return;
        }

        // Reverse the LIFO chain into FIFO order.
        let mut head: *mut MsgCell = ptr::null_mut();
        let mut tail: *mut MsgCell = chain;
        while !chain.is_null() {
            let next = (*chain).next;
            (*chain).next = head;
            head = chain;
            chain = next;
        }

        let q = &mut *self.inner.get();
        if q.tail.is_null() {
            q.head = head;
        } else {
            (*q.tail).next = head;
        }
        q.tail = tail;
    }

    /// Pop the first private message, any tag.
    ///
    /// # Safety
    ///
    /// Owner-only.
    pub unsafe fn pop_front(&self) -> Option<*mut MsgCell> {
        let q = &mut *self.inner.get();
        if q.head.is_null() {
            return None;
        }
        let cell = q.head;
        q.head = (*cell).next;
        if q.head.is_null() {
            q.tail = ptr::null_mut();
        }
        (*cell).next = ptr::null_mut();
        self.len.fetch_sub(1, Ordering::Relaxed);
        Some(cell)
    }

    /// Pop the first private message whose tag matches, leaving the relative
    /// order of everything else untouched.
    ///
    /// # Safety
    ///
    /// Owner-only.
    pub unsafe fn pop_tag(&self, tag: u32) -> Option<*mut MsgCell> {
        let q = &mut *self.inner.get();
        let mut prev: *mut MsgCell = ptr::null_mut();
        let mut cur = q.head;
        while !cur.is_null() {
            if (*cur).tag == tag {
                let next = (*cur).next;
                if prev.is_null() {
                    q.head = next;
                } else {
                    (*prev).next = next;
                }
                if q.tail == cur {
                    q.tail = prev;
                }
                (*cur).next = ptr::null_mut();
                self.len.fetch_sub(1, Ordering::Relaxed);
                return Some(cur);
            }
            prev = cur;
            cur = (*cur).next;
        }
        None
    }

    /// Re-insert a cell at the front of the private FIFO. Used when the
    /// receiver found a message during its final drain but lost the
    /// waiting-flag exchange to a sender.
    ///
    /// # Safety
    ///
    /// Owner-only.
    pub unsafe fn push_front(&self, cell: *mut MsgCell) {
        let q = &mut *self.inner.get();
        (*cell).next = q.head;
        q.head = cell;
        if q.tail.is_null() {
            q.tail = cell;
        }
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Free every queued cell and reset the flags. Run during slot recycle
    /// and again during spawn init to catch stragglers from senders that
    /// raced the previous incarnation's exit. Undelivered payloads are
    /// intentionally not freed: the kernel cannot know their layout.
    ///
    /// # Safety
    ///
    /// Owner-only (or: the slot is otherwise unreachable, as during init).
    pub unsafe fn purge(&self) {
        self.drain();
        while let Some(cell) = self.pop_front() {
            free_cell(cell);
        }
        self.waiting.store(false, Ordering::Relaxed);
        self.len.store(0, Ordering::Relaxed);
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("len", &self.len())
            .field("waiting", &self.waiting.load(Ordering::Relaxed))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(tag: u32, payload: usize) -> *mut MsgCell {
        alloc_cell(tag, Pid(1), payload as *mut u8)
    }

    fn drain_all(mb: &Mailbox) -> Vec<(u32, usize)> {
        let mut out = Vec::new();
        unsafe {
            mb.drain();
            while let Some(c) = mb.pop_front() {
                out.push(((*c).tag, (*c).payload as usize));
                free_cell(c);
            }
        }
        out
    }

    #[test]
    fn test_fifo_per_sender() {
        let mb = Mailbox::new();
        mb.push(cell(16, 1));
        mb.push(cell(17, 2));
        mb.push(cell(16, 3));
        assert_eq!(mb.len(), 3);

        let got = drain_all(&mb);
        assert_eq!(got, vec![(16, 1), (17, 2), (16, 3)]);
        assert!(mb.is_empty());
    }

    #[test]
    fn test_drain_appends_after_existing_private_queue() {
        let mb = Mailbox::new();
        mb.push(cell(16, 1));
        unsafe { mb.drain() };
        mb.push(cell(16, 2));
        mb.push(cell(16, 3));

        let got = drain_all(&mb);
        assert_eq!(got, vec![(16, 1), (16, 2), (16, 3)]);
    }

    #[test]
    fn test_selective_pop_preserves_order() {
        let mb = Mailbox::new();
        // Tags: A=16, B=17 — pushed A1, B, A2.
        mb.push(cell(16, 1));
        mb.push(cell(17, 2));
        mb.push(cell(16, 3));
        unsafe { mb.drain() };

        unsafe {
            let b = mb.pop_tag(17).unwrap();
            assert_eq!((*b).payload as usize, 2);
            free_cell(b);

            // The two A messages keep their relative order.
            let a1 = mb.pop_tag(16).unwrap();
            assert_eq!((*a1).payload as usize, 1);
            free_cell(a1);
            let a2 = mb.pop_tag(16).unwrap();
            assert_eq!((*a2).payload as usize, 3);
            free_cell(a2);

            assert!(mb.pop_tag(16).is_none());
        }
    }

    #[test]
    fn test_pop_tag_unlinks_tail_correctly() {
        let mb = Mailbox::new();
        mb.push(cell(16, 1));
        mb.push(cell(17, 2));
        unsafe {
            mb.drain();
            let t = mb.pop_tag(17).unwrap();
            free_cell(t);
            // Tail was removed; appending still works.
        }
        mb.push(cell(18, 3));
        let got = drain_all(&mb);
        assert_eq!(got, vec![(16, 1), (18, 3)]);
    }

    #[test]
    fn test_push_front_after_lost_handshake() {
        let mb = Mailbox::new();
        mb.push(cell(16, 2));
        unsafe {
            mb.drain();
            let first = mb.pop_front().unwrap();
            mb.push_front(first);
        }
        mb.push(cell(16, 3));
        let got = drain_all(&mb);
        assert_eq!(got, vec![(16, 2), (16, 3)]);
    }

    #[test]
    fn test_waiting_flag_single_winner() {
        let mb = Mailbox::new();
        mb.arm_waiting();
        assert!(mb.take_waiting());
        assert!(!mb.take_waiting());
    }

    #[test]
    fn test_purge_leaves_clean_mailbox() {
        let mb = Mailbox::new();
        mb.push(cell(16, 1));
        mb.push(cell(16, 2));
        mb.arm_waiting();
        unsafe { mb.purge() };
        assert!(mb.is_empty());
        assert!(mb.sig_is_empty());
        assert!(!mb.take_waiting());
    }

    #[test]
    fn test_concurrent_push_keeps_every_message() {
        use std::sync::Arc;

        let mb = Arc::new(Mailbox::new());
        let num_threads = 8;
        let per_thread = 1000;

        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                let mb = Arc::clone(&mb);
                std::thread::spawn(move || {
                    for i in 0..per_thread {
                        mb.push(alloc_cell(16, Pid(t as u64), i as *mut u8));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(mb.len(), num_threads * per_thread);

        // Per-sender FIFO: for each sender pid, payloads must ascend.
        let mut last_seen = vec![-1i64; num_threads];
        unsafe {
            mb.drain();
            while let Some(c) = mb.pop_front() {
                let sender = (*c).from.as_u64() as usize;
                let seq = (*c).payload as i64;
                assert!(
                    seq > last_seen[sender],
                    "sender {} delivered {} after {}",
                    sender,
                    seq,
                    last_seen[sender]
                );
                last_seen[sender] = seq;
                free_cell(c);
            }
        }
        for (sender, last) in last_seen.iter().enumerate() {
            assert_eq!(*last, per_thread as i64 - 1, "sender {} lost messages", sender);
        }
    }

    #[test]
    fn test_cell_freelist_recycles() {
        let c1 = cell(16, 1);
        free_cell(c1);
        let c2 = cell(17, 2);
        // Same thread, freelist non-empty: the cell is reused.
        assert_eq!(c1, c2);
        unsafe {
            assert_eq!((*c2).tag, 17);
            assert!((*c2).next.is_null());
        }
        free_cell(c2);
    }
}
