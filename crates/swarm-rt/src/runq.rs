//! Intrusive lock-free MPSC run queue (one per worker per priority).
//!
//! Vyukov-style: a stub node permanently anchors the list, push is an atomic
//! exchange on `tail` followed by a release store into the previous tail's
//! `next`, and pop is single-consumer (the owning worker). Between the
//! exchange and the link store a push is linearized but not yet visible to
//! the consumer; pop spins briefly on that window and otherwise reports the
//! queue empty — the worker's bounded idle sleep guarantees it comes back.
//!
//! Nodes are process slots themselves (`Process::run_next`), so pushing a
//! process allocates nothing. The stub is a dedicated never-scheduled slot
//! record owned by the queue.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::process::Process;

pub struct RunQueue {
    /// Producer side. Any thread may exchange itself in.
    tail: CachePadded<AtomicPtr<Process>>,
    /// Consumer side. Only the owning worker reads or writes this.
    head: UnsafeCell<*mut Process>,
    /// Permanent anchor node. Boxed so its address is stable.
    stub: Box<Process>,
}

// Safety: `head` is only touched by the owning worker (single consumer);
// `tail` and the node links are atomics.
unsafe impl Send for RunQueue {}
unsafe impl Sync for RunQueue {}

impl RunQueue {
    pub fn new() -> RunQueue {
        let stub = Box::new(Process::stub());
        let stub_ptr = &*stub as *const Process as *mut Process;
        RunQueue {
            tail: CachePadded::new(AtomicPtr::new(stub_ptr)),
            head: UnsafeCell::new(stub_ptr),
            stub,
        }
    }

    #[inline]
    fn stub_ptr(&self) -> *mut Process {
        &*self.stub as *const Process as *mut Process
    }

    /// Push a process. Safe from any thread.
    pub fn push(&self, proc: *mut Process) {
        unsafe {
            (*proc).run_next.store(ptr::null_mut(), Ordering::Relaxed);
            let prev = self.tail.swap(proc, Ordering::AcqRel);
            (*prev).run_next.store(proc, Ordering::Release);
        }
    }

    /// Pop the oldest process, or `None` if the queue is (observably) empty.
    ///
    /// # Safety
    ///
    /// Single consumer: must only be called by the owning worker.
    pub unsafe fn pop(&self) -> Option<*mut Process> {
        let stub = self.stub_ptr();
        let head_slot = self.head.get();
        let mut head = *head_slot;
        let mut next = (*head).run_next.load(Ordering::Acquire);

        if head == stub {
            if next.is_null() {
                if self.tail.load(Ordering::Acquire) == stub {
                    return None; // truly empty
                }
                // A push swapped the tail but has not linked yet.
                next = self.spin_for_link(head)?;
            }
            // Skip past the stub.
            *head_slot = next;
            head = next;
            next = (*head).run_next.load(Ordering::Acquire);
        }

        if !next.is_null() {
            *head_slot = next;
            return Some(head);
        }

        let tail = self.tail.load(Ordering::Acquire);
        if head != tail {
            // Push in progress behind head; wait for the link.
            next = self.spin_for_link(head)?;
            *head_slot = next;
            return Some(head);
        }

        // Single element: re-insert the stub so the last node can drain.
        self.push(stub);
        next = (*head).run_next.load(Ordering::Acquire);
        if next.is_null() {
            next = self.spin_for_link(head)?;
        }
        *head_slot = next;
        Some(head)
    }

    /// Bounded spin for a linearized-but-unlinked push. Returns the link, or
    /// `None` if the producer is being slow — the caller treats the queue as
    /// empty for this round and retries after its idle timeout.
    unsafe fn spin_for_link(&self, node: *mut Process) -> Option<*mut Process> {
        let backoff = Backoff::new();
        loop {
            let next = (*node).run_next.load(Ordering::Acquire);
            if !next.is_null() {
                return Some(next);
            }
            if backoff.is_completed() {
                return None;
            }
            backoff.spin();
        }
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
