//! The runtime instance: arena, workers, registry, timers, link table.
//!
//! A `Scheduler` owns every kernel structure and is shared behind an `Arc`
//! by its worker threads. Most embedders use the process-wide instance
//! managed by [`init`](crate::init) / [`shutdown`](crate::shutdown); tests
//! and multi-runtime embedders can own instances directly.
//!
//! ## Spawn flow
//!
//! Spawn pops a slot and a heap block from the spawning worker's partition
//! (round-robin for external threads), falling back to one round of
//! cross-partition stealing. The slot is initialized so the first context
//! restore enters the trampoline, then pushed onto the chosen worker's
//! priority queue. Parent/child affinity plus steal-at-spawn is the whole
//! balancing story — run queues are never stolen from.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::arena::Arena;
use crate::config::Config;
use crate::link::{LinkTable, TAG_NONE};
use crate::mailbox::{alloc_cell, free_cell, CELL_POOL_CAP};
use crate::process::{EntryFn, Pid, Priority, ProcState, Process, ProcessRef};
use crate::registry::{Registry, RegistryError};
use crate::stack;
use crate::timer::TimerWheel;
use crate::worker::{self, Worker};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why the runtime refused to start.
#[derive(Debug)]
pub enum InitError {
    /// A tunable was out of range.
    InvalidConfig(&'static str),
    /// A worker thread could not be created.
    ThreadSpawn(std::io::Error),
}

impl std::fmt::Display for InitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InitError::InvalidConfig(what) => write!(f, "invalid config: {}", what),
            InitError::ThreadSpawn(e) => write!(f, "failed to start worker thread: {}", e),
        }
    }
}

impl std::error::Error for InitError {}

/// Why a spawn failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// No free slot or block, even after one round of partition stealing.
    OutOfResources,
    /// The runtime is shutting down.
    ShuttingDown,
}

/// Why a send failed. On failure the payload still belongs to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The destination is gone (or never existed).
    NoProcess,
}

/// Cleanup hook invoked during exit propagation, after links and monitors
/// and before registry removal. External subsystems (table store, process
/// groups, ports) register one each; hooks do their own locking.
pub type CleanupHook = fn(ProcessRef);

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// One runtime instance.
pub struct Scheduler {
    name: String,
    config: Config,
    pub(crate) arena: Arena,
    workers: Box<[Worker]>,
    pub(crate) timers: TimerWheel,
    pub(crate) registry: Registry,
    pub(crate) links: LinkTable,
    hooks: Mutex<Vec<CleanupHook>>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    next_pid: AtomicU64,
    spawn_rr: AtomicUsize,
    live: AtomicU64,
    spawned_total: AtomicU64,
    exited_total: AtomicU64,
    shutdown: AtomicBool,
}

impl Scheduler {
    /// Build a runtime (arena, queues, tables) without starting threads.
    ///
    /// `num_workers == 0` means one worker per available CPU core.
    pub fn new(name: &str, num_workers: u32, config: Config) -> Result<Scheduler, InitError> {
        let num_workers = if num_workers == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            num_workers as usize
        };

        if config.max_processes == 0 {
            return Err(InitError::InvalidConfig("max_processes must be nonzero"));
        }
        if config.heap_min_words == 0 {
            return Err(InitError::InvalidConfig("heap_min_words must be nonzero"));
        }
        if config.process_stack_size < 16 * 1024 {
            return Err(InitError::InvalidConfig("process_stack_size below 16 KiB"));
        }
        if config.context_reductions == 0 {
            return Err(InitError::InvalidConfig("context_reductions must be nonzero"));
        }

        CELL_POOL_CAP.store(config.msg_freelist_cap, Ordering::Relaxed);

        let arena = Arena::new(config.max_processes, config.heap_min_words, num_workers);
        let workers: Box<[Worker]> = (0..num_workers).map(Worker::new).collect();

        Ok(Scheduler {
            name: name.to_string(),
            timers: TimerWheel::new(config.timer_spare_cap),
            registry: Registry::with_capacity(config.registry_buckets),
            links: LinkTable::new(config.max_processes),
            arena,
            workers,
            hooks: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
            next_pid: AtomicU64::new(1),
            spawn_rr: AtomicUsize::new(0),
            live: AtomicU64::new(0),
            spawned_total: AtomicU64::new(0),
            exited_total: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            config,
        })
    }

    /// Start the worker threads. On any thread-spawn failure the already
    /// started workers are torn down and the runtime refuses to start.
    pub fn start(self: &Arc<Self>) -> Result<(), InitError> {
        let mut handles = self.handles.lock();
        for i in 0..self.workers.len() {
            let sched = Arc::clone(self);
            let spawned = thread::Builder::new()
                .name(format!("{}-worker-{}", self.name, i))
                .spawn(move || {
                    let worker = &sched.workers[i];
                    worker.run_loop(&sched);
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    self.shutdown.store(true, Ordering::SeqCst);
                    for w in self.workers.iter() {
                        w.wake();
                    }
                    for h in handles.drain(..) {
                        let _ = h.join();
                    }
                    return Err(InitError::ThreadSpawn(e));
                }
            }
        }
        log::debug!(
            "runtime '{}' started: {} workers, {} slots",
            self.name,
            self.workers.len(),
            self.arena.max_procs()
        );
        Ok(())
    }

    /// Signal the workers to exit, join them, and drop pending timers.
    ///
    /// Must be called from outside the runtime's own worker threads.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        for w in self.workers.iter() {
            w.wake();
        }
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for h in handles {
            let _ = h.join();
        }
        self.timers.clear();
        log::debug!("runtime '{}' shut down", self.name);
    }

    #[inline]
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    /// Count of live (spawned, not yet recycled) processes.
    pub fn live_count(&self) -> u64 {
        self.live.load(Ordering::SeqCst)
    }

    /// `(free_slots, free_blocks)` across all partitions. A conservation
    /// check only at quiescence.
    pub fn free_counts(&self) -> (usize, usize) {
        self.arena.free_counts()
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    // -----------------------------------------------------------------------
    // Spawn and exit
    // -----------------------------------------------------------------------

    /// Spawn a process. `link_to_caller` installs a parent/child link before
    /// the child is enqueued, so the child can never exit unobserved.
    pub fn spawn_process(
        &self,
        entry: EntryFn,
        arg: *mut u8,
        priority: Priority,
        link_to_caller: bool,
    ) -> Result<ProcessRef, SpawnError> {
        if self.is_shutdown() {
            return Err(SpawnError::ShuttingDown);
        }

        // Keep parent/child affinity when spawning from a worker; spread
        // external spawns round-robin.
        let worker_idx = worker::current_worker_on(self).unwrap_or_else(|| {
            self.spawn_rr.fetch_add(1, Ordering::Relaxed) % self.workers.len()
        });
        let partition = worker_idx;

        let slot = match self.arena.pop_slot(partition) {
            Some(s) => s,
            None => {
                self.arena.steal_round(partition);
                match self.arena.pop_slot(partition) {
                    Some(s) => s,
                    None => return Err(SpawnError::OutOfResources),
                }
            }
        };
        let block = match self.arena.pop_block(partition) {
            Some(b) => b,
            None => {
                self.arena.steal_round(partition);
                match self.arena.pop_block(partition) {
                    Some(b) => b,
                    None => {
                        // Every live slot owns a block; give the slot back
                        // before reporting failure.
                        self.arena.push_slot(partition, slot);
                        return Err(SpawnError::OutOfResources);
                    }
                }
            }
        };

        let pid = Pid(self.next_pid.fetch_add(1, Ordering::Relaxed));
        let parent = self.current_ref().map(|r| r.pid).unwrap_or(Pid::NONE);

        let proc = self.arena.slot(slot);
        proc.init_for_spawn(
            pid,
            priority,
            worker_idx as u32,
            parent,
            entry,
            arg,
            self.config.context_reductions,
        );
        unsafe {
            (*proc.heap.get()).attach(
                self.arena.block_ptr(block),
                self.config.heap_min_words,
                block,
            );
        }
        let child = proc.reference();

        if link_to_caller {
            if let Some(parent_ref) = self.current_ref() {
                self.links
                    .link(&self.arena, parent_ref, child, &mut |p| self.enqueue_proc(p));
            }
        }

        self.live.fetch_add(1, Ordering::SeqCst);
        self.spawned_total.fetch_add(1, Ordering::Relaxed);
        log::trace!("spawned {} on worker {}", pid, worker_idx);

        self.workers[worker_idx].enqueue(self.arena.slot_ptr(slot));
        Ok(child)
    }

    /// Handle of the process running on the current thread, if this thread
    /// is one of our workers executing a process.
    pub fn current_ref(&self) -> Option<ProcessRef> {
        let p = stack::current_process_ptr();
        if p.is_null() || worker::current_worker_on(self).is_none() {
            return None;
        }
        Some(unsafe { (*p).reference() })
    }

    /// Force-exit `target` with `reason`. The target observes the kill at
    /// its next receive or scheduler turn. Returns whether it was alive.
    pub fn kill(&self, target: ProcessRef, reason: u64) -> bool {
        let Some(proc) = self.live_slot(target) else {
            return false;
        };
        proc.exit_reason.store(reason, Ordering::Release);
        // SeqCst pairs with the receiver's arm-then-recheck; see receive_core.
        proc.kill_flag.store(true, Ordering::SeqCst);
        if proc.mailbox.take_waiting() {
            self.enqueue_proc(proc);
        }
        true
    }

    /// Exit propagation and slot recycling, run on the exiting process's
    /// home worker.
    pub(crate) fn finish_exit(&self, worker_idx: usize, proc: &Process) {
        let reason = proc.exit_reason.load(Ordering::Acquire);
        let me = proc.reference();
        log::trace!("{} exiting, reason {}", me.pid, reason);

        self.links
            .propagate_exit(&self.arena, proc, reason, &mut |p| self.enqueue_proc(p));

        for hook in self.hooks.lock().iter() {
            hook(me);
        }
        self.registry.cleanup(me.pid.as_u64());

        // Recycle into the worker's own partition: spawns go where free
        // slots are, which is what balances the system.
        let block = unsafe { (*proc.heap.get()).detach() };
        unsafe { (*proc.exec.get()).clear() };
        proc.reset_for_free();
        self.arena.push_slot(worker_idx, proc.slot);
        if let Some(b) = block {
            self.arena.push_block(worker_idx, b);
        }

        self.live.fetch_sub(1, Ordering::SeqCst);
        self.exited_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Register an external-subsystem cleanup hook (§ exit propagation).
    pub fn register_cleanup_hook(&self, hook: CleanupHook) {
        self.hooks.lock().push(hook);
    }

    // -----------------------------------------------------------------------
    // Messaging
    // -----------------------------------------------------------------------

    /// Deliver `payload` to `target` with `tag`, waking it if it committed
    /// to sleeping. On `Err` the payload still belongs to the caller.
    pub(crate) fn deliver_to(
        &self,
        target: ProcessRef,
        tag: u32,
        payload: *mut u8,
        from: Pid,
    ) -> Result<(), SendError> {
        let Some(proc) = self.live_slot(target) else {
            return Err(SendError::NoProcess);
        };
        let cell = alloc_cell(tag, from, payload);
        proc.mailbox.push(cell);
        if proc.mailbox.take_waiting() {
            self.enqueue_proc(proc);
        }
        Ok(())
    }

    /// Send a tagged message from the current process (or the kernel, when
    /// called from an external thread).
    pub fn send_tagged(
        &self,
        target: ProcessRef,
        tag: u32,
        payload: *mut u8,
    ) -> Result<(), SendError> {
        let from = match self.current_ref() {
            Some(me) => {
                let sender = self.arena.slot(me.slot);
                sender.stats.msgs_sent.fetch_add(1, Ordering::Relaxed);
                me.pid
            }
            None => Pid::NONE,
        };
        self.deliver_to(target, tag, payload, from)
    }

    /// Send to a registered name.
    pub fn send_named(&self, name: &str, tag: u32, payload: *mut u8) -> Result<(), SendError> {
        let target = self.registry.whereis(name).ok_or(SendError::NoProcess)?;
        self.send_tagged(target, tag, payload)
    }

    /// The blocking/selective receive loop. Returns `(tag, payload, from)`.
    ///
    /// `timeout_ms`: `u64::MAX` = infinite, 0 = poll. Returns `None` on
    /// timeout, on kill, or when called from outside a process.
    pub(crate) fn receive_core(
        &self,
        filter: Option<u32>,
        timeout_ms: u64,
    ) -> Option<(u32, *mut u8, Pid)> {
        let p = stack::current_process_ptr();
        if p.is_null() || !stack::in_process_context() {
            return None;
        }
        let proc = unsafe { &*p };
        let mb = &proc.mailbox;
        let me = proc.reference();
        let deadline = if timeout_ms == u64::MAX {
            None
        } else {
            Some(Instant::now() + Duration::from_millis(timeout_ms))
        };

        loop {
            if proc.kill_flag.load(Ordering::Acquire) {
                return None;
            }

            unsafe { mb.drain() };
            if let Some(cell) = unsafe { Self::match_next(mb, filter) } {
                return Some(Self::consume(proc, cell));
            }

            if timeout_ms == 0 {
                return None;
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return None;
                }
            }

            // Commit to sleeping, then re-inspect one final time. Whoever
            // atomically clears `waiting` owns re-scheduling this process.
            proc.set_state(ProcState::Waiting);
            mb.arm_waiting();

            unsafe { mb.drain() };
            if let Some(cell) = unsafe { Self::match_next(mb, filter) } {
                if mb.take_waiting() {
                    // We won the exchange: we are not on any run queue.
                    proc.set_state(ProcState::Running);
                    return Some(Self::consume(proc, cell));
                }
                // A sender beat us to the flag and already enqueued this
                // process. Hand the message back, take the scheduler turn;
                // the next dispatch finds it in the private queue.
                unsafe { mb.push_front(cell) };
                stack::yield_current();
                continue;
            }

            // A kill racing our arm would have tried to clear `waiting`
            // before we published it; re-check under the same exchange rule
            // so the wake cannot be lost.
            if proc.kill_flag.load(Ordering::SeqCst) {
                if mb.take_waiting() {
                    proc.set_state(ProcState::Running);
                    return None;
                }
                // The killer (or a sender) already enqueued us.
                stack::yield_current();
                continue;
            }

            // Nothing matched: arm the timeout wake-up (if any) and give up
            // the worker until a send, timer, or kill re-enqueues us.
            let timer_ref =
                deadline.map(|d| self.timers.insert_at(d, me, TAG_NONE, std::ptr::null_mut()));
            stack::yield_current();
            if let Some(r) = timer_ref {
                self.timers.cancel(r);
            }
        }
    }

    unsafe fn match_next(
        mb: &crate::mailbox::Mailbox,
        filter: Option<u32>,
    ) -> Option<*mut crate::mailbox::MsgCell> {
        match filter {
            Some(tag) => mb.pop_tag(tag),
            None => mb.pop_front(),
        }
    }

    fn consume(proc: &Process, cell: *mut crate::mailbox::MsgCell) -> (u32, *mut u8, Pid) {
        proc.stats.msgs_received.fetch_add(1, Ordering::Relaxed);
        let (tag, payload, from) = unsafe { ((*cell).tag, (*cell).payload, (*cell).from) };
        free_cell(cell);
        (tag, payload, from)
    }

    // -----------------------------------------------------------------------
    // Registry facade
    // -----------------------------------------------------------------------

    /// Register `target` under `name` after re-validating that it is alive.
    pub fn register(&self, name: &str, target: ProcessRef) -> Result<(), RegistryError> {
        if self.live_slot(target).is_none() {
            return Err(RegistryError::NoProcess);
        }
        self.registry.register(name, target)
    }

    pub fn unregister(&self, name: &str) -> Result<(), RegistryError> {
        self.registry.unregister(name)
    }

    /// Look up a name, filtering out registrations whose process died but
    /// has not been cleaned up yet.
    pub fn whereis(&self, name: &str) -> Option<ProcessRef> {
        let target = self.registry.whereis(name)?;
        self.live_slot(target).map(|_| target)
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Schedule a tagged send (or a pure wake-up for `TAG_NONE` + null
    /// payload) `delay_ms` from now. Returns the timer reference.
    pub fn send_after(
        &self,
        delay_ms: u64,
        dest: ProcessRef,
        tag: u32,
        payload: *mut u8,
    ) -> u64 {
        self.timers.insert(delay_ms, dest, tag, payload)
    }

    /// Cancel a pending timer. Returns whether it was still pending; the
    /// payload then belongs to the caller again.
    pub fn cancel_timer(&self, reference: u64) -> bool {
        self.timers.cancel(reference)
    }

    /// Number of pending timers (diagnostics).
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Fire every due timer. Called by each worker per loop iteration; any
    /// worker may fire any timer.
    pub(crate) fn service_timers(&self) {
        let now = Instant::now();
        self.timers.fire_due(now, |t| {
            if t.is_pure_wake() {
                if let Some(proc) = self.live_slot(t.dest) {
                    if proc.mailbox.take_waiting() {
                        self.enqueue_proc(proc);
                    }
                }
            } else {
                // An undeliverable payload is dropped with the timer; the
                // kernel cannot free an opaque pointer.
                let _ = self.deliver_to(t.dest, t.tag, t.payload, Pid::NONE);
            }
        });
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    /// Write a diagnostic summary to `out`.
    pub fn stats_to(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let (free_slots, free_blocks) = self.free_counts();
        writeln!(out, "runtime '{}'", self.name)?;
        writeln!(
            out,
            "  workers: {}  max_processes: {}",
            self.workers.len(),
            self.arena.max_procs()
        )?;
        writeln!(
            out,
            "  live: {}  free slots: {}  free blocks: {}",
            self.live_count(),
            free_slots,
            free_blocks
        )?;
        writeln!(
            out,
            "  spawned: {}  exited: {}",
            self.spawned_total.load(Ordering::Relaxed),
            self.exited_total.load(Ordering::Relaxed)
        )?;
        writeln!(
            out,
            "  registered names: {}  pending timers: {}",
            self.registry.len(),
            self.timers.len()
        )?;
        Ok(())
    }

    /// Write the diagnostic summary to stderr.
    pub fn stats(&self) {
        let _ = self.stats_to(&mut std::io::stderr());
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    /// Resolve a `ProcessRef` to its slot iff the pid still lives there.
    pub(crate) fn live_slot(&self, target: ProcessRef) -> Option<&Process> {
        if target.slot as usize >= self.arena.max_procs() {
            return None;
        }
        let proc = self.arena.slot(target.slot);
        if proc.is_alive(target.pid) {
            Some(proc)
        } else {
            None
        }
    }

    /// Push a process onto its home worker's run queue.
    pub(crate) fn enqueue_proc(&self, proc: &Process) {
        let home = proc.home_worker.load(Ordering::Relaxed) as usize;
        self.workers[home].enqueue(proc as *const Process as *mut Process);
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("workers", &self.workers.len())
            .field("live", &self.live_count())
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
