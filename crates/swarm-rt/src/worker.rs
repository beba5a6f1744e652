//! Worker threads: the per-thread scheduler loop.
//!
//! Each worker owns one arena partition and one run queue per priority
//! level. An iteration fires due timers, pops the highest-priority runnable
//! process, context-switches into it, and disposes of it according to the
//! state it came back with: re-enqueue (yield), leave parked (blocking
//! receive), or run exit propagation and recycle the slot.
//!
//! Workers never pop from each other's run queues — the MPSC pop is single
//! consumer. Balance comes from arena partition stealing at spawn time, so
//! new work lands where free slots are.
//!
//! ## Idle protocol
//!
//! An empty poll publishes `idle = 1`, re-polls once to close the race with
//! a concurrent push, then sleeps on the worker's condvar with a short
//! bounded timeout. Pushers that observe `idle = 1` grab the idle mutex and
//! signal. The bounded timeout doubles as the timer-service heartbeat.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::config::NUM_PRIORITIES;
use crate::process::{ProcState, Process};
use crate::runq::RunQueue;
use crate::scheduler::Scheduler;
use crate::stack::{self, CoroutineHandle};

/// Bounded idle sleep between empty polls.
const IDLE_WAIT: Duration = Duration::from_micros(500);

// ---------------------------------------------------------------------------
// Thread-local worker context
// ---------------------------------------------------------------------------

thread_local! {
    static CURRENT_SCHED: RefCell<Option<Arc<Scheduler>>> = const { RefCell::new(None) };
    static CURRENT_WORKER: Cell<Option<usize>> = const { Cell::new(None) };
}

/// The runtime owning the current thread, if this is a worker thread.
pub(crate) fn current_runtime() -> Option<Arc<Scheduler>> {
    CURRENT_SCHED.with(|c| c.borrow().clone())
}

/// The index of the current worker, if this thread belongs to `sched`.
pub(crate) fn current_worker_on(sched: &Scheduler) -> Option<usize> {
    let same = CURRENT_SCHED.with(|c| {
        c.borrow()
            .as_ref()
            .map(|s| std::ptr::eq(Arc::as_ptr(s), sched as *const Scheduler))
            .unwrap_or(false)
    });
    if same {
        CURRENT_WORKER.with(|c| c.get())
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct Parker {
    idle: AtomicBool,
    lock: Mutex<()>,
    cv: Condvar,
}

/// One scheduler thread: run queues plus the idle parker.
pub struct Worker {
    index: usize,
    queues: [RunQueue; NUM_PRIORITIES],
    parker: Parker,
}

impl Worker {
    pub(crate) fn new(index: usize) -> Worker {
        Worker {
            index,
            queues: [
                RunQueue::new(),
                RunQueue::new(),
                RunQueue::new(),
                RunQueue::new(),
            ],
            parker: Parker {
                idle: AtomicBool::new(false),
                lock: Mutex::new(()),
                cv: Condvar::new(),
            },
        }
    }

    /// Push a process onto this worker's queue for its priority and signal
    /// the worker if it is (or is about to go) idle. Safe from any thread.
    pub(crate) fn enqueue(&self, proc: *mut Process) {
        let priority = unsafe { (*proc).priority() };
        self.queues[priority.index()].push(proc);
        if self.parker.idle.load(Ordering::SeqCst) {
            let _guard = self.parker.lock.lock();
            self.parker.cv.notify_one();
        }
    }

    /// Kick the worker out of its idle sleep (shutdown path).
    pub(crate) fn wake(&self) {
        let _guard = self.parker.lock.lock();
        self.parker.cv.notify_one();
    }

    /// Pop the next process in strict priority order.
    ///
    /// # Safety
    ///
    /// Single consumer: only the owning worker thread may call this.
    unsafe fn pop_next(&self) -> Option<*mut Process> {
        for queue in &self.queues {
            if let Some(p) = queue.pop() {
                return Some(p);
            }
        }
        None
    }

    /// The scheduler loop. Runs until shutdown is signalled.
    pub(crate) fn run_loop(&self, sched: &Arc<Scheduler>) {
        CURRENT_SCHED.with(|c| *c.borrow_mut() = Some(Arc::clone(sched)));
        CURRENT_WORKER.with(|c| c.set(Some(self.index)));
        log::debug!("worker {} up", self.index);

        loop {
            sched.service_timers();

            if sched.is_shutdown() {
                break;
            }

            match unsafe { self.pop_next() } {
                Some(p) => self.run_one(sched, p),
                None => {
                    self.parker.idle.store(true, Ordering::SeqCst);
                    // Close the race with a push that missed the idle flag.
                    if let Some(p) = unsafe { self.pop_next() } {
                        self.parker.idle.store(false, Ordering::SeqCst);
                        self.run_one(sched, p);
                    } else {
                        let mut guard = self.parker.lock.lock();
                        let _ = self.parker.cv.wait_for(&mut guard, IDLE_WAIT);
                        drop(guard);
                        self.parker.idle.store(false, Ordering::SeqCst);
                    }
                }
            }
        }

        CURRENT_WORKER.with(|c| c.set(None));
        CURRENT_SCHED.with(|c| *c.borrow_mut() = None);
        log::debug!("worker {} down", self.index);
    }

    /// Dispatch one process: context-switch in, then dispose by the state it
    /// came back with.
    fn run_one(&self, sched: &Arc<Scheduler>, p: *mut Process) {
        let proc = unsafe { &*p };

        if proc.kill_flag.load(Ordering::Acquire) {
            // Killed while queued: skip the resume. Dropping a suspended
            // coroutine unwinds its stack in place.
            proc.set_state(ProcState::Exiting);
            unsafe { (*proc.exec.get()).coro = None };
        } else {
            proc.set_state(ProcState::Running);
            unsafe {
                (*proc.exec.get()).fcalls = sched.config().context_reductions as i32;
            }
            proc.stats.context_switches.fetch_add(1, Ordering::Relaxed);

            stack::set_current_process(p);
            let suspended = unsafe { self.resume(sched, proc) };
            stack::clear_current_process();

            if !suspended {
                proc.set_state(ProcState::Exiting);
            }
        }

        match proc.state() {
            ProcState::Exiting => sched.finish_exit(self.index, proc),
            // Parked in receive; the wake path re-enqueues.
            ProcState::Waiting => {}
            _ => {
                proc.set_state(ProcState::Runnable);
                self.enqueue(p);
            }
        }
    }

    /// Resume the process's coroutine, creating it (and its stack) on first
    /// dispatch. Returns whether the coroutine suspended.
    ///
    /// # Safety
    ///
    /// Home-worker only; `proc` must be live and dequeued.
    unsafe fn resume(&self, sched: &Arc<Scheduler>, proc: &Process) -> bool {
        let exec = &mut *proc.exec.get();
        if exec.coro.is_none() {
            exec.coro = Some(CoroutineHandle::new(
                proc as *const Process as *mut Process,
                sched.config().process_stack_size,
            ));
        }
        exec.coro
            .as_mut()
            .expect("coroutine just installed")
            .resume()
    }
}
