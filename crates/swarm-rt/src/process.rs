//! Process records: the per-slot state of a SwarmRT process.
//!
//! A process is a slot in the [arena](crate::arena) slab. The slot index is
//! the arena handle; the pid is a monotonically increasing logical identity
//! that is never reused across slot reincarnations. Cross-thread fields are
//! atomics; execution state (coroutine, heap cursor, entry function) is
//! touched only by the process's home worker and lives in `UnsafeCell`s.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::heap::ProcHeap;
use crate::mailbox::Mailbox;
use crate::stack::CoroutineHandle;

// ---------------------------------------------------------------------------
// Pid
// ---------------------------------------------------------------------------

/// Logical identity of a process.
///
/// Pids are assigned sequentially from the scheduler's monotonic counter
/// and are never reused, even when the slot that carried them is recycled.
/// Pid 0 is reserved for "no process" (kernel-originated messages).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(pub u64);

impl Pid {
    /// The reserved "no process" pid.
    pub const NONE: Pid = Pid(0);

    /// Return the raw numeric value.
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pid({})", self.0)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<0.{}>", self.0)
    }
}

// ---------------------------------------------------------------------------
// ProcessRef
// ---------------------------------------------------------------------------

/// A validated handle to a process: slot index plus the pid the caller
/// believes lives there.
///
/// Every kernel operation re-checks the pid against the slot before acting,
/// so a `ProcessRef` held past the process's exit degrades into a no-op
/// (or a status error) instead of reaching a recycled slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessRef {
    /// Arena slot index.
    pub slot: u32,
    /// Pid expected in that slot.
    pub pid: Pid,
}

impl fmt::Debug for ProcessRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProcessRef({}@{})", self.pid, self.slot)
    }
}

// ---------------------------------------------------------------------------
// ProcState
// ---------------------------------------------------------------------------

/// The execution state of a process slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcState {
    /// Slot is on a partition free stack.
    Free = 0,
    /// Initialized and enqueued on (or headed for) a run queue.
    Runnable = 1,
    /// Currently executing on its home worker.
    Running = 2,
    /// Parked in a blocking receive; woken by send, timer, or kill.
    Waiting = 3,
    /// Entry function returned or a kill was observed; awaiting propagation.
    Exiting = 4,
}

impl ProcState {
    #[inline]
    pub fn from_u8(v: u8) -> ProcState {
        match v {
            1 => ProcState::Runnable,
            2 => ProcState::Running,
            3 => ProcState::Waiting,
            4 => ProcState::Exiting,
            _ => ProcState::Free,
        }
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Scheduling priority. Within one worker, a higher level is always drained
/// before a lower one is considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Priority {
    Max = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl Priority {
    /// Convert from a raw u8. 0 = Max, 1 = High, 2 = Normal (default), 3 = Low.
    pub fn from_u8(v: u8) -> Priority {
        match v {
            0 => Priority::Max,
            1 => Priority::High,
            3 => Priority::Low,
            _ => Priority::Normal,
        }
    }

    /// Run-queue index for this level.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

// ---------------------------------------------------------------------------
// Exit reasons and process flags
// ---------------------------------------------------------------------------

/// Exit reason for a normal return from the entry function.
pub const REASON_NORMAL: u64 = 0;

/// Conventional reason used by [`process_kill`](crate::process_kill) callers
/// that have no better reason to give.
pub const REASON_KILL: u64 = u64::MAX;

/// Reason delivered when linking to or monitoring an already-dead process.
pub const REASON_NOPROC: u64 = u64::MAX - 1;

/// Process flag bit: deliver EXIT signals from linked processes as mailbox
/// messages instead of terminating this process.
pub const PROC_FLAG_TRAP_EXIT: u32 = 0x1;

// ---------------------------------------------------------------------------
// Entry ABI
// ---------------------------------------------------------------------------

/// Entry function for a spawned process.
///
/// The signature matches the generated-code ABI: one opaque argument pointer,
/// no return value. The process exits when the function returns, with the
/// reason last stored via [`set_exit_reason`](crate::set_exit_reason)
/// (0 = normal if never stored).
///
/// The ABI is `C-unwind` rather than plain `C`: a killed process has its
/// coroutine stack unwound in place, and that unwind must be able to cross
/// the entry frame.
pub type EntryFn = extern "C-unwind" fn(arg: *mut u8);

// ---------------------------------------------------------------------------
// Per-process statistics
// ---------------------------------------------------------------------------

/// Counters accumulated over a process's lifetime, reset on slot reuse.
#[derive(Debug, Default)]
pub struct ProcStats {
    pub reductions: AtomicU64,
    pub context_switches: AtomicU64,
    pub msgs_sent: AtomicU64,
    pub msgs_received: AtomicU64,
}

impl ProcStats {
    fn reset(&self) {
        self.reductions.store(0, Ordering::Relaxed);
        self.context_switches.store(0, Ordering::Relaxed);
        self.msgs_sent.store(0, Ordering::Relaxed);
        self.msgs_received.store(0, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Exec: home-worker-only execution state
// ---------------------------------------------------------------------------

/// Execution state touched only by the home worker (or by the process itself
/// while running on that worker).
pub(crate) struct Exec {
    /// Entry function and argument; taken by the trampoline on first run.
    pub entry: Option<(EntryFn, *mut u8)>,
    /// The process's coroutine, created lazily on first dispatch. Dropping a
    /// suspended coroutine force-unwinds its stack.
    pub coro: Option<CoroutineHandle>,
    /// Remaining advisory reductions in the current timeslice.
    pub fcalls: i32,
}

impl Exec {
    fn new() -> Exec {
        Exec {
            entry: None,
            coro: None,
            fcalls: 0,
        }
    }

    pub fn clear(&mut self) {
        self.entry = None;
        self.coro = None;
        self.fcalls = 0;
    }
}

// ---------------------------------------------------------------------------
// Process (the slot record)
// ---------------------------------------------------------------------------

/// One process slot in the arena slab.
///
/// `run_next` must stay the first field: the run queues treat a `*mut
/// Process` as an intrusive MPSC node and permanently anchor each queue with
/// a stub slot.
#[repr(C)]
pub struct Process {
    /// Intrusive run-queue link. Written by any pushing thread, read by the
    /// owning worker.
    pub(crate) run_next: AtomicPtr<Process>,

    /// Slot index in the arena (u32::MAX for queue stubs).
    pub(crate) slot: u32,

    /// Pid currently occupying the slot; 0 while the slot is free.
    pub(crate) pid: AtomicU64,

    /// Current [`ProcState`] as a raw u8.
    pub(crate) state: AtomicU8,

    /// Current [`Priority`] as a raw u8.
    pub(crate) priority: AtomicU8,

    /// Process flag bits ([`PROC_FLAG_TRAP_EXIT`] et al.).
    pub(crate) flags: AtomicU32,

    /// Index of the worker whose run queues this process is pinned to.
    pub(crate) home_worker: AtomicU32,

    /// Set by [`process_kill`](crate::process_kill); observed at the next
    /// receive or scheduler turn.
    pub(crate) kill_flag: AtomicBool,

    /// Exit reason; meaningful once the process is exiting or killed.
    pub(crate) exit_reason: AtomicU64,

    /// Pid of the spawning process (0 when spawned from an external thread).
    pub(crate) parent: AtomicU64,

    /// Inbound messages: lock-free sender stack + owner-only private FIFO.
    pub(crate) mailbox: Mailbox,

    /// Bump cursor over the slot's heap block. Home-worker only.
    pub(crate) heap: UnsafeCell<ProcHeap>,

    /// Entry, coroutine, and reduction budget. Home-worker only.
    pub(crate) exec: UnsafeCell<Exec>,

    /// Lifetime counters.
    pub(crate) stats: ProcStats,
}

// Safety: the UnsafeCell fields (heap, exec) are accessed only from the
// process's home worker thread, which is the sole consumer of the slot once
// it is dequeued. All other fields are atomics or internally synchronized.
unsafe impl Send for Process {}
unsafe impl Sync for Process {}

impl Process {
    /// Create an empty slot record.
    pub(crate) fn new(slot: u32) -> Process {
        Process {
            run_next: AtomicPtr::new(std::ptr::null_mut()),
            slot,
            pid: AtomicU64::new(0),
            state: AtomicU8::new(ProcState::Free as u8),
            priority: AtomicU8::new(Priority::Normal as u8),
            flags: AtomicU32::new(0),
            home_worker: AtomicU32::new(0),
            kill_flag: AtomicBool::new(false),
            exit_reason: AtomicU64::new(REASON_NORMAL),
            parent: AtomicU64::new(0),
            mailbox: Mailbox::new(),
            heap: UnsafeCell::new(ProcHeap::detached()),
            exec: UnsafeCell::new(Exec::new()),
            stats: ProcStats::default(),
        }
    }

    /// Create a stub record for anchoring a run queue. Never scheduled.
    pub(crate) fn stub() -> Process {
        Process::new(u32::MAX)
    }

    /// Handle for the pid currently in this slot.
    #[inline]
    pub fn reference(&self) -> ProcessRef {
        ProcessRef {
            slot: self.slot,
            pid: Pid(self.pid.load(Ordering::Acquire)),
        }
    }

    #[inline]
    pub(crate) fn state(&self) -> ProcState {
        ProcState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, s: ProcState) {
        self.state.store(s as u8, Ordering::Release);
    }

    #[inline]
    pub(crate) fn priority(&self) -> Priority {
        Priority::from_u8(self.priority.load(Ordering::Relaxed))
    }

    /// Does `pid` still live in this slot, in a state that can accept
    /// messages or control operations?
    #[inline]
    pub(crate) fn is_alive(&self, pid: Pid) -> bool {
        self.pid.load(Ordering::Acquire) == pid.0
            && !matches!(self.state(), ProcState::Free | ProcState::Exiting)
    }

    #[inline]
    pub(crate) fn traps_exits(&self) -> bool {
        self.flags.load(Ordering::Acquire) & PROC_FLAG_TRAP_EXIT != 0
    }

    /// Set or clear a flag bit; returns the previous value of that bit.
    pub(crate) fn set_flag(&self, bit: u32, value: bool) -> bool {
        let prev = if value {
            self.flags.fetch_or(bit, Ordering::AcqRel)
        } else {
            self.flags.fetch_and(!bit, Ordering::AcqRel)
        };
        prev & bit != 0
    }

    /// Initialize the slot for a fresh spawn. The caller owns the slot
    /// exclusively (it was just popped from a free stack).
    pub(crate) fn init_for_spawn(
        &self,
        pid: Pid,
        priority: Priority,
        home_worker: u32,
        parent: Pid,
        entry: EntryFn,
        arg: *mut u8,
        fcalls: u32,
    ) {
        // A sender racing with the previous incarnation's exit may have left
        // a straggler on the signal stack; reclaim it before going live.
        unsafe { self.mailbox.purge() };
        self.pid.store(pid.0, Ordering::Relaxed);
        self.priority.store(priority as u8, Ordering::Relaxed);
        self.flags.store(0, Ordering::Relaxed);
        self.home_worker.store(home_worker, Ordering::Relaxed);
        self.kill_flag.store(false, Ordering::Relaxed);
        self.exit_reason.store(REASON_NORMAL, Ordering::Relaxed);
        self.parent.store(parent.0, Ordering::Relaxed);
        self.run_next.store(std::ptr::null_mut(), Ordering::Relaxed);
        unsafe {
            let exec = &mut *self.exec.get();
            exec.entry = Some((entry, arg));
            exec.coro = None;
            exec.fcalls = fcalls as i32;
        }
        self.stats.reset();
        self.set_state(ProcState::Runnable);
    }

    /// Scrub the slot after exit propagation, before it returns to a free
    /// stack. Heap detach and coroutine drop are the caller's job.
    pub(crate) fn reset_for_free(&self) {
        unsafe { self.mailbox.purge() };
        self.pid.store(0, Ordering::Relaxed);
        self.flags.store(0, Ordering::Relaxed);
        self.kill_flag.store(false, Ordering::Relaxed);
        self.exit_reason.store(REASON_NORMAL, Ordering::Relaxed);
        self.parent.store(0, Ordering::Relaxed);
        self.run_next.store(std::ptr::null_mut(), Ordering::Relaxed);
        self.set_state(ProcState::Free);
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("slot", &self.slot)
            .field("pid", &self.pid.load(Ordering::Relaxed))
            .field("parent", &self.parent.load(Ordering::Relaxed))
            .field("state", &self.state())
            .field("priority", &self.priority())
            .field("mailbox_len", &self.mailbox.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_from_u8() {
        assert_eq!(Priority::from_u8(0), Priority::Max);
        assert_eq!(Priority::from_u8(1), Priority::High);
        assert_eq!(Priority::from_u8(2), Priority::Normal);
        assert_eq!(Priority::from_u8(3), Priority::Low);
        assert_eq!(Priority::from_u8(255), Priority::Normal); // default
    }

    #[test]
    fn test_state_roundtrip() {
        for s in [
            ProcState::Free,
            ProcState::Runnable,
            ProcState::Running,
            ProcState::Waiting,
            ProcState::Exiting,
        ] {
            assert_eq!(ProcState::from_u8(s as u8), s);
        }
    }

    #[test]
    fn test_slot_init_and_reset() {
        extern "C-unwind" fn noop(_arg: *mut u8) {}

        let proc = Process::new(3);
        assert_eq!(proc.state(), ProcState::Free);

        proc.init_for_spawn(
            Pid(42),
            Priority::High,
            1,
            Pid(7),
            noop,
            std::ptr::null_mut(),
            4000,
        );
        assert_eq!(proc.state(), ProcState::Runnable);
        assert_eq!(proc.reference().pid, Pid(42));
        assert_eq!(proc.priority(), Priority::High);
        assert!(proc.is_alive(Pid(42)));
        assert!(!proc.is_alive(Pid(41)));

        proc.reset_for_free();
        assert_eq!(proc.state(), ProcState::Free);
        assert!(!proc.is_alive(Pid(42)));
        assert_eq!(proc.pid.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_trap_exit_flag() {
        let proc = Process::new(0);
        assert!(!proc.traps_exits());
        let prev = proc.set_flag(PROC_FLAG_TRAP_EXIT, true);
        assert!(!prev);
        assert!(proc.traps_exits());
        let prev = proc.set_flag(PROC_FLAG_TRAP_EXIT, false);
        assert!(prev);
        assert!(!proc.traps_exits());
    }

    #[test]
    fn test_pid_display() {
        assert_eq!(format!("{}", Pid(42)), "<0.42>");
    }
}
