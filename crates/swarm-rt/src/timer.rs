//! Pending timers: deferred sends and receive-timeout wake-ups.
//!
//! One sorted list for the whole runtime, keyed by absolute monotonic
//! deadline and protected by a single mutex. Any worker drains due entries
//! on every loop iteration; the mutex is held only while the list is
//! manipulated, never during delivery.
//!
//! An entry with a null payload and tag [`TAG_NONE`](crate::link::TAG_NONE)
//! is a pure wake-up (used by receive timeouts); anything else is a deferred
//! tagged send.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::link::TAG_NONE;
use crate::process::ProcessRef;

/// A pending timer.
pub struct Timer {
    pub deadline: Instant,
    pub dest: ProcessRef,
    pub tag: u32,
    pub payload: *mut u8,
    pub reference: u64,
}

// Safety: the payload pointer is an opaque token; the kernel never
// dereferences it, only hands it to the destination process.
unsafe impl Send for Timer {}

impl Timer {
    /// True for wake-up-only entries.
    #[inline]
    pub fn is_pure_wake(&self) -> bool {
        self.tag == TAG_NONE && self.payload.is_null()
    }
}

/// The runtime-wide pending-timer list.
pub struct TimerWheel {
    pending: Mutex<Vec<Timer>>,
    next_ref: AtomicU64,
    spare_cap: usize,
}

impl TimerWheel {
    pub fn new(spare_cap: usize) -> TimerWheel {
        TimerWheel {
            pending: Mutex::new(Vec::new()),
            next_ref: AtomicU64::new(1),
            spare_cap,
        }
    }

    /// Insert a timer due `delay_ms` from now. Returns its reference.
    pub fn insert(&self, delay_ms: u64, dest: ProcessRef, tag: u32, payload: *mut u8) -> u64 {
        self.insert_at(
            Instant::now() + Duration::from_millis(delay_ms),
            dest,
            tag,
            payload,
        )
    }

    /// Insert a timer with an absolute deadline. Equal deadlines keep
    /// insertion order.
    pub fn insert_at(
        &self,
        deadline: Instant,
        dest: ProcessRef,
        tag: u32,
        payload: *mut u8,
    ) -> u64 {
        let reference = self.next_ref.fetch_add(1, Ordering::Relaxed);
        let timer = Timer {
            deadline,
            dest,
            tag,
            payload,
            reference,
        };
        let mut pending = self.pending.lock();
        let pos = pending.partition_point(|t| t.deadline <= deadline);
        pending.insert(pos, timer);
        reference
    }

    /// Remove a pending timer. Returns whether it was still pending; when it
    /// was, ownership of any payload reverts to the caller.
    pub fn cancel(&self, reference: u64) -> bool {
        let mut pending = self.pending.lock();
        match pending.iter().position(|t| t.reference == reference) {
            Some(pos) => {
                pending.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Hand every timer whose deadline has passed to `deliver`, oldest
    /// first. The list mutex is released before the first delivery.
    pub fn fire_due(&self, now: Instant, mut deliver: impl FnMut(Timer)) {
        let due: Vec<Timer> = {
            let mut pending = self.pending.lock();
            let n = pending.partition_point(|t| t.deadline <= now);
            if n == 0 {
                return;
            }
            let due = pending.drain(..n).collect();
            if pending.capacity() > self.spare_cap && pending.len() < self.spare_cap {
                pending.shrink_to(self.spare_cap);
            }
            due
        };
        for timer in due {
            deliver(timer);
        }
    }

    /// Drop every pending timer (shutdown path).
    pub fn clear(&self) {
        self.pending.lock().clear();
    }

    /// Number of pending timers (diagnostics).
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Pid;

    fn dest(slot: u32) -> ProcessRef {
        ProcessRef {
            slot,
            pid: Pid(slot as u64 + 1),
        }
    }

    #[test]
    fn test_fire_in_deadline_order() {
        let wheel = TimerWheel::new(128);
        let base = Instant::now();

        // Inserted out of order.
        wheel.insert_at(base + Duration::from_millis(30), dest(3), 16, std::ptr::null_mut());
        wheel.insert_at(base + Duration::from_millis(10), dest(1), 16, std::ptr::null_mut());
        wheel.insert_at(base + Duration::from_millis(20), dest(2), 16, std::ptr::null_mut());

        let mut fired = Vec::new();
        wheel.fire_due(base + Duration::from_millis(25), |t| fired.push(t.dest.slot));
        assert_eq!(fired, vec![1, 2]);
        assert_eq!(wheel.len(), 1);

        fired.clear();
        wheel.fire_due(base + Duration::from_millis(100), |t| fired.push(t.dest.slot));
        assert_eq!(fired, vec![3]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_nothing_due_is_cheap() {
        let wheel = TimerWheel::new(128);
        wheel.insert(1_000_000, dest(0), 16, std::ptr::null_mut());
        let mut fired = 0;
        wheel.fire_due(Instant::now(), |_| fired += 1);
        assert_eq!(fired, 0);
        assert_eq!(wheel.len(), 1);
    }

    #[test]
    fn test_cancel_pending() {
        let wheel = TimerWheel::new(128);
        let r = wheel.insert(1_000_000, dest(0), 16, std::ptr::null_mut());
        assert!(wheel.cancel(r));
        assert!(wheel.is_empty());

        // Cancelling again (or an unknown ref) reports not-found.
        assert!(!wheel.cancel(r));
        assert!(!wheel.cancel(99999));
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let wheel = TimerWheel::new(128);
        let base = Instant::now();
        let r = wheel.insert_at(base, dest(0), 16, std::ptr::null_mut());
        assert!(wheel.cancel(r));

        let mut fired = 0;
        wheel.fire_due(base + Duration::from_secs(1), |_| fired += 1);
        assert_eq!(fired, 0);
    }

    #[test]
    fn test_equal_deadlines_keep_insertion_order() {
        let wheel = TimerWheel::new(128);
        let at = Instant::now();
        wheel.insert_at(at, dest(1), 16, std::ptr::null_mut());
        wheel.insert_at(at, dest(2), 16, std::ptr::null_mut());
        wheel.insert_at(at, dest(3), 16, std::ptr::null_mut());

        let mut fired = Vec::new();
        wheel.fire_due(at + Duration::from_millis(1), |t| fired.push(t.dest.slot));
        assert_eq!(fired, vec![1, 2, 3]);
    }

    #[test]
    fn test_pure_wake_classification() {
        let wheel = TimerWheel::new(128);
        let at = Instant::now();
        wheel.insert_at(at, dest(1), TAG_NONE, std::ptr::null_mut());
        wheel.insert_at(at, dest(2), 16, std::ptr::null_mut());

        let mut kinds = Vec::new();
        wheel.fire_due(at + Duration::from_millis(1), |t| kinds.push(t.is_pure_wake()));
        assert_eq!(kinds, vec![true, false]);
    }

    #[test]
    fn test_references_are_unique_and_increasing() {
        let wheel = TimerWheel::new(128);
        let r1 = wheel.insert(1000, dest(0), 16, std::ptr::null_mut());
        let r2 = wheel.insert(1000, dest(0), 16, std::ptr::null_mut());
        assert!(r2 > r1);
    }
}
