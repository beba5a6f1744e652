//! Stackful coroutines and the thread-local execution context.
//!
//! Each process runs as a corosensei coroutine on a private stack. The first
//! resume enters a trampoline that installs the yielder, runs the entry
//! function, and marks the process exiting when it returns. Cooperative
//! yield suspends back to the worker's scheduler context.
//!
//! ## Thread-local state
//!
//! - `CURRENT_YIELDER`: pointer to the running coroutine's `Yielder`, set
//!   before a resume and re-installed after each suspend (another coroutine
//!   may have overwritten it in between).
//! - `CURRENT_PROC`: the slot currently executing on this thread, for
//!   `self()` / `getpid()` and the receive path.

use std::cell::Cell;
use std::ptr;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

use crate::process::{ProcState, Process};

thread_local! {
    /// Raw pointer to the current coroutine's Yielder, type-erased.
    ///
    /// Safety: valid only while the coroutine that set it is running; the
    /// worker clears it after every resume returns.
    pub(crate) static CURRENT_YIELDER: Cell<Option<*const ()>> = const { Cell::new(None) };

    /// The process currently executing on this thread.
    static CURRENT_PROC: Cell<*mut Process> = const { Cell::new(ptr::null_mut()) };
}

/// Mark `proc` as the process executing on this thread.
pub(crate) fn set_current_process(proc: *mut Process) {
    CURRENT_PROC.with(|c| c.set(proc));
}

/// Clear the per-thread execution context after a resume returns.
pub(crate) fn clear_current_process() {
    CURRENT_PROC.with(|c| c.set(ptr::null_mut()));
    CURRENT_YIELDER.with(|c| c.set(None));
}

/// The process currently executing on this thread, if any.
pub(crate) fn current_process_ptr() -> *mut Process {
    CURRENT_PROC.with(|c| c.get())
}

/// True when called from inside a process coroutine.
pub(crate) fn in_process_context() -> bool {
    CURRENT_YIELDER.with(|c| c.get().is_some())
}

/// Suspend the current coroutine back to the worker's scheduler context.
///
/// After `suspend()` returns (the process was resumed), the yielder is
/// re-installed into the thread-local because another coroutine may have
/// run on this thread in between and overwritten it.
///
/// No-op when called outside a process coroutine.
pub(crate) fn yield_current() {
    CURRENT_YIELDER.with(|c| {
        let Some(ptr) = c.get() else { return };
        // Safety: the pointer was set by the running coroutine body and the
        // Yielder it names is borrowed for the duration of that body.
        let yielder: &Yielder<(), ()> = unsafe { &*(ptr as *const Yielder<(), ()>) };
        yielder.suspend(());
        c.set(Some(ptr));
    });
}

// ---------------------------------------------------------------------------
// CoroutineHandle
// ---------------------------------------------------------------------------

/// A process's coroutine plus its private stack.
///
/// `!Send` in spirit: the scheduler guarantees a coroutine is only resumed
/// (and dropped) on the process's home worker. Dropping a suspended handle
/// force-unwinds the coroutine stack.
pub(crate) struct CoroutineHandle {
    coro: Coroutine<(), (), ()>,
}

impl CoroutineHandle {
    /// Build the coroutine for `proc` with a fresh stack of `stack_size`
    /// bytes. The first resume enters the trampoline.
    pub fn new(proc: *mut Process, stack_size: usize) -> CoroutineHandle {
        let stack = DefaultStack::new(stack_size).expect("failed to allocate process stack");
        let proc_addr = proc as usize;

        let coro = Coroutine::with_stack(stack, move |yielder: &Yielder<(), ()>, _input: ()| {
            CURRENT_YIELDER.with(|c| {
                c.set(Some(yielder as *const Yielder<(), ()> as *const ()));
            });

            // Safety: the slot outlives the coroutine; the scheduler only
            // resumes it while the slot is live.
            let proc = unsafe { &*(proc_addr as *const Process) };
            let (entry, arg) = unsafe { (*proc.exec.get()).entry.take() }
                .expect("process trampoline entered without an entry function");

            entry(arg);

            // Entry returned: the exit reason is whatever the process last
            // stored (0 = normal). The worker runs propagation next.
            proc.set_state(ProcState::Exiting);
        });

        CoroutineHandle { coro }
    }

    /// Resume the coroutine. Returns `true` if it suspended (yield or
    /// blocking receive), `false` if the entry function returned.
    pub fn resume(&mut self) -> bool {
        match self.coro.resume(()) {
            CoroutineResult::Yield(()) => true,
            CoroutineResult::Return(()) => false,
        }
    }

    #[allow(dead_code)]
    pub fn done(&self) -> bool {
        self.coro.done()
    }
}

impl std::fmt::Debug for CoroutineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoroutineHandle")
            .field("done", &self.coro.done())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{Pid, Priority};
    use std::sync::atomic::{AtomicU64, Ordering};

    fn boxed_proc(entry: crate::process::EntryFn) -> Box<Process> {
        let proc = Box::new(Process::new(0));
        proc.init_for_spawn(
            Pid(1),
            Priority::Normal,
            0,
            Pid::NONE,
            entry,
            ptr::null_mut(),
            4000,
        );
        proc
    }

    #[test]
    fn test_trampoline_runs_entry_and_marks_exiting() {
        static RAN: AtomicU64 = AtomicU64::new(0);
        extern "C-unwind" fn entry(_arg: *mut u8) {
            RAN.fetch_add(1, Ordering::SeqCst);
        }

        RAN.store(0, Ordering::SeqCst);
        let proc = boxed_proc(entry);
        let p = &*proc as *const Process as *mut Process;

        let mut handle = CoroutineHandle::new(p, 64 * 1024);
        let suspended = handle.resume();
        assert!(!suspended, "entry without yields should finish in one resume");
        assert!(handle.done());
        assert_eq!(RAN.load(Ordering::SeqCst), 1);
        assert_eq!(proc.state(), ProcState::Exiting);
        clear_current_process();
    }

    #[test]
    fn test_yield_and_resume() {
        static STEPS: AtomicU64 = AtomicU64::new(0);
        extern "C-unwind" fn entry(_arg: *mut u8) {
            STEPS.fetch_add(1, Ordering::SeqCst);
            yield_current();
            STEPS.fetch_add(1, Ordering::SeqCst);
        }

        STEPS.store(0, Ordering::SeqCst);
        let proc = boxed_proc(entry);
        let p = &*proc as *const Process as *mut Process;

        let mut handle = CoroutineHandle::new(p, 64 * 1024);
        assert!(handle.resume());
        assert_eq!(STEPS.load(Ordering::SeqCst), 1);
        assert!(!handle.resume());
        assert_eq!(STEPS.load(Ordering::SeqCst), 2);
        assert_eq!(proc.state(), ProcState::Exiting);
        clear_current_process();
    }

    #[test]
    fn test_drop_suspended_coroutine_unwinds() {
        extern "C-unwind" fn entry(_arg: *mut u8) {
            yield_current();
            // Never reached when the handle is dropped while suspended.
        }

        let proc = boxed_proc(entry);
        let p = &*proc as *const Process as *mut Process;

        let mut handle = CoroutineHandle::new(p, 64 * 1024);
        assert!(handle.resume());
        drop(handle); // must not panic or leak the stack
        clear_current_process();
    }

    #[test]
    fn test_current_process_tracking() {
        assert!(current_process_ptr().is_null());
        let proc = Box::new(Process::new(7));
        let p = &*proc as *const Process as *mut Process;
        set_current_process(p);
        assert_eq!(current_process_ptr(), p);
        clear_current_process();
        assert!(current_process_ptr().is_null());
    }
}
