//! SwarmRT: a BEAM-inspired scheduling and process kernel.
//!
//! Millions of cheap, isolated processes communicating only by message
//! passing, multiplexed cooperatively across a small pool of worker threads,
//! with links and monitors to contain failure.
//!
//! ## Architecture
//!
//! - **Arena** (`arena.rs`): pre-allocated slab of process slots and heap
//!   blocks with per-worker free-index stacks, so spawn never touches the
//!   allocator or the kernel.
//! - **Run queues** (`runq.rs`): one intrusive lock-free MPSC queue per
//!   worker per priority, anchored by a stub node.
//! - **Mailbox** (`mailbox.rs`): lock-free multi-producer signal stack plus
//!   an owner-only FIFO with a race-free wait/wake handshake.
//! - **Coroutines** (`stack.rs`): corosensei stackful coroutines; a process
//!   runs until it yields, blocks on receive, or returns.
//! - **Workers** (`worker.rs`): the scheduler loop — timers, dequeue,
//!   context switch, dispose.
//! - **Lifecycle** (`scheduler.rs`, `link.rs`): spawn, exit propagation
//!   through links and monitors, trap-exit, registry cleanup, slot
//!   recycling.
//! - **Timers** (`timer.rs`): one sorted pending list driving receive
//!   timeouts and deferred sends.
//!
//! ## Using the kernel
//!
//! Call [`init`] once to create the process-wide runtime, then [`spawn`]
//! processes whose entry functions use [`receive`], [`send`], [`yield_now`]
//! and friends. Messages are `(tag, payload)` pairs where the payload is an
//! opaque pointer owned by the receiver after a successful receive. Tags
//! below [`FIRST_USER_TAG`] are reserved for kernel signals (EXIT, DOWN,
//! timers).
//!
//! The runtime is also available as an owned value ([`Scheduler`]) for
//! embedders that want several isolated instances or explicit teardown.

pub mod arena;
pub mod config;
pub mod heap;
pub mod link;
pub mod mailbox;
pub mod process;
pub mod registry;
pub mod runq;
pub mod scheduler;
mod stack;
pub mod timer;
pub mod worker;

pub use config::{Config, CONTEXT_REDS, NUM_PRIORITIES, REG_NAME_MAX};
pub use link::{Signal, FIRST_USER_TAG, TAG_DOWN, TAG_EXIT, TAG_NONE, TAG_TIMER};
pub use process::{
    EntryFn, Pid, Priority, ProcessRef, PROC_FLAG_TRAP_EXIT, REASON_KILL, REASON_NOPROC,
    REASON_NORMAL,
};
pub use registry::RegistryError;
pub use scheduler::{CleanupHook, InitError, Scheduler, SendError, SpawnError};

use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};

/// Timeout sentinel: block forever.
pub const INFINITE: u64 = u64::MAX;

// ---------------------------------------------------------------------------
// Global runtime instance
// ---------------------------------------------------------------------------

/// The process-wide runtime, created by [`init`].
static GLOBAL_RUNTIME: OnceLock<Arc<Scheduler>> = OnceLock::new();

/// The runtime governing the current call: the worker thread's own instance
/// when called from inside a process, the global instance otherwise.
pub fn runtime() -> Option<Arc<Scheduler>> {
    worker::current_runtime().or_else(|| GLOBAL_RUNTIME.get().cloned())
}

/// Create and start the process-wide runtime with default tunables.
///
/// Idempotent: once a runtime exists, later calls are no-ops.
pub fn init(name: &str, num_workers: u32) -> Result<(), InitError> {
    init_with_config(name, num_workers, Config::default())
}

/// Create and start the process-wide runtime with explicit tunables.
pub fn init_with_config(name: &str, num_workers: u32, config: Config) -> Result<(), InitError> {
    if GLOBAL_RUNTIME.get().is_some() {
        return Ok(());
    }
    let sched = Arc::new(Scheduler::new(name, num_workers, config)?);
    sched.start()?;
    if GLOBAL_RUNTIME.set(Arc::clone(&sched)).is_err() {
        // Lost an init race; tear down the redundant instance.
        sched.shutdown();
    }
    Ok(())
}

/// Stop the process-wide runtime: signal all workers to exit and join them.
/// Must be called from outside the runtime's worker threads.
pub fn shutdown() {
    if let Some(sched) = GLOBAL_RUNTIME.get() {
        sched.shutdown();
    }
}

/// Write the runtime's diagnostic summary to stderr.
pub fn stats() {
    if let Some(sched) = runtime() {
        sched.stats();
    }
}

// ---------------------------------------------------------------------------
// Process control
// ---------------------------------------------------------------------------

/// Spawn a process at normal priority. Returns `None` when the arena is
/// exhausted (after one round of partition stealing) or no runtime exists.
pub fn spawn(entry: EntryFn, arg: *mut u8) -> Option<ProcessRef> {
    let rt = runtime()?;
    rt.spawn_process(entry, arg, Priority::Normal, false).ok()
}

/// Spawn with an explicit priority.
pub fn spawn_with_priority(entry: EntryFn, arg: *mut u8, priority: Priority) -> Option<ProcessRef> {
    let rt = runtime()?;
    rt.spawn_process(entry, arg, priority, false).ok()
}

/// Spawn and atomically link the child to the calling process. The link is
/// installed before the child is enqueued, so the child cannot exit
/// unobserved. From an external thread this degrades to a plain [`spawn`].
pub fn spawn_link(entry: EntryFn, arg: *mut u8) -> Option<ProcessRef> {
    let rt = runtime()?;
    rt.spawn_process(entry, arg, Priority::Normal, true).ok()
}

/// Handle of the calling process, or `None` from an external thread.
pub fn current() -> Option<ProcessRef> {
    runtime()?.current_ref()
}

/// Pid of the calling process, or `None` from an external thread.
pub fn getpid() -> Option<Pid> {
    current().map(|r| r.pid)
}

/// Cooperatively give up the rest of this timeslice. No-op outside a
/// process.
pub fn yield_now() {
    stack::yield_current();
}

/// Consume `cost` reductions; yields when the timeslice budget is spent.
/// The budget is advisory — the kernel never preempts — but generated code
/// calls this at loop back-edges and call sites to stay cooperative.
pub fn check_reds(cost: u32) {
    let p = stack::current_process_ptr();
    if p.is_null() {
        return;
    }
    let proc = unsafe { &*p };
    proc.stats.reductions.fetch_add(cost as u64, Ordering::Relaxed);
    let fcalls = unsafe {
        let exec = &mut *proc.exec.get();
        exec.fcalls -= cost as i32;
        exec.fcalls
    };
    if fcalls <= 0 {
        stack::yield_current();
    }
}

/// Allocate `bytes` (8-byte aligned, zero-initialized at arena creation)
/// from the calling process's heap block. Returns null outside a process or
/// when the block is exhausted — the kernel never grows a heap. The memory
/// lives until the process exits; there is no free.
pub fn heap_alloc(bytes: usize) -> *mut u8 {
    let p = stack::current_process_ptr();
    if p.is_null() {
        return std::ptr::null_mut();
    }
    unsafe { (*(*p).heap.get()).alloc_bytes(bytes) }
}

/// Store a non-zero exit reason to be reported when the entry function
/// returns. No-op outside a process.
pub fn set_exit_reason(reason: u64) {
    let p = stack::current_process_ptr();
    if p.is_null() {
        return;
    }
    unsafe { (*p).exit_reason.store(reason, Ordering::Release) };
}

/// Force-exit `target` with `reason`; it observes the kill at its next
/// receive or scheduler turn. Returns whether the target was alive.
pub fn process_kill(target: ProcessRef, reason: u64) -> bool {
    match runtime() {
        Some(rt) => rt.kill(target, reason),
        None => false,
    }
}

/// Set or clear a process flag on the calling process, returning the
/// previous value. Supports [`PROC_FLAG_TRAP_EXIT`]. Returns `false` from
/// an external thread.
pub fn process_flag(flag: u32, value: bool) -> bool {
    let p = stack::current_process_ptr();
    if p.is_null() {
        return false;
    }
    unsafe { (*p).set_flag(flag, value) }
}

/// Link the calling process to `other`. Linking to a dead process delivers
/// the exit signal the link would have produced (reason [`REASON_NOPROC`]).
/// Returns `false` from an external thread.
pub fn link(other: ProcessRef) -> bool {
    let Some(rt) = runtime() else { return false };
    let Some(me) = rt.current_ref() else {
        return false;
    };
    rt.links
        .link(&rt.arena, me, other, &mut |p| rt.enqueue_proc(p));
    true
}

/// Remove the link between the calling process and `other`.
pub fn unlink(other: ProcessRef) -> bool {
    let Some(rt) = runtime() else { return false };
    let Some(me) = rt.current_ref() else {
        return false;
    };
    rt.links.unlink(me, other);
    true
}

/// Monitor `other`; a DOWN message tagged [`TAG_DOWN`] arrives when it
/// exits. Returns the monitor reference, or 0 when `other` is `None` or the
/// caller is not a process.
pub fn monitor(other: Option<ProcessRef>) -> u64 {
    let Some(target) = other else { return 0 };
    let Some(rt) = runtime() else { return 0 };
    let Some(me) = rt.current_ref() else { return 0 };
    rt.links
        .monitor(&rt.arena, me, target, &mut |p| rt.enqueue_proc(p))
}

/// Remove a monitor previously created by [`monitor`].
pub fn demonitor(reference: u64) -> bool {
    let Some(rt) = runtime() else { return false };
    let Some(me) = rt.current_ref() else {
        return false;
    };
    rt.links.demonitor(me, reference)
}

/// Register an external-subsystem cleanup hook, run for every exiting
/// process during exit propagation.
pub fn register_cleanup_hook(hook: CleanupHook) {
    if let Some(rt) = runtime() {
        rt.register_cleanup_hook(hook);
    }
}

// ---------------------------------------------------------------------------
// Messaging
// ---------------------------------------------------------------------------

/// Send an untagged message (tag [`TAG_NONE`]). Ownership of `payload`
/// passes to the receiver on a successful receive; on `Err` it stays with
/// the caller.
pub fn send(target: ProcessRef, payload: *mut u8) -> Result<(), SendError> {
    send_tagged(target, TAG_NONE, payload)
}

/// Send a tagged message. User tags must be >= [`FIRST_USER_TAG`].
pub fn send_tagged(target: ProcessRef, tag: u32, payload: *mut u8) -> Result<(), SendError> {
    match runtime() {
        Some(rt) => rt.send_tagged(target, tag, payload),
        None => Err(SendError::NoProcess),
    }
}

/// Receive the first message of any tag. `timeout_ms`: 0 = poll,
/// [`INFINITE`] = block forever. Returns `None` on timeout, kill, or when
/// called from outside a process.
pub fn receive(timeout_ms: u64) -> Option<*mut u8> {
    let rt = runtime()?;
    rt.receive_core(None, timeout_ms).map(|(_, payload, _)| payload)
}

/// Selective receive: the first message whose tag equals `tag`, skipping
/// (and preserving the order of) everything else.
pub fn receive_tagged(tag: u32, timeout_ms: u64) -> Option<*mut u8> {
    let rt = runtime()?;
    rt.receive_core(Some(tag), timeout_ms)
        .map(|(_, payload, _)| payload)
}

/// Receive the first message of any tag, returning `(tag, payload)`.
pub fn receive_any(timeout_ms: u64) -> Option<(u32, *mut u8)> {
    let rt = runtime()?;
    rt.receive_core(None, timeout_ms)
        .map(|(tag, payload, _)| (tag, payload))
}

/// Non-blocking receive: the first pending message, or `None` immediately.
pub fn receive_nowait() -> Option<*mut u8> {
    receive(0)
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Register `target` under `name`. One name per process, one process per
/// name; the registration disappears when the process exits.
pub fn register(name: &str, target: ProcessRef) -> Result<(), RegistryError> {
    match runtime() {
        Some(rt) => rt.register(name, target),
        None => Err(RegistryError::NoProcess),
    }
}

/// Remove a registration by name.
pub fn unregister(name: &str) -> Result<(), RegistryError> {
    match runtime() {
        Some(rt) => rt.unregister(name),
        None => Err(RegistryError::NotFound),
    }
}

/// Look up a registered name.
pub fn whereis(name: &str) -> Option<ProcessRef> {
    runtime()?.whereis(name)
}

/// Send a tagged message to a registered name.
pub fn send_named(name: &str, tag: u32, payload: *mut u8) -> Result<(), SendError> {
    match runtime() {
        Some(rt) => rt.send_named(name, tag, payload),
        None => Err(SendError::NoProcess),
    }
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

/// Schedule a tagged send to `dest` after `delay_ms`. With [`TAG_NONE`] and
/// a null payload this is a pure wake-up. Returns the timer reference, or 0
/// when no runtime exists.
pub fn send_after(delay_ms: u64, dest: ProcessRef, tag: u32, payload: *mut u8) -> u64 {
    match runtime() {
        Some(rt) => rt.send_after(delay_ms, dest, tag, payload),
        None => 0,
    }
}

/// Cancel a pending timer. Returns whether it was still pending; ownership
/// of its payload then reverts to the caller.
pub fn cancel_timer(reference: u64) -> bool {
    match runtime() {
        Some(rt) => rt.cancel_timer(reference),
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // These run without initializing the global runtime, so they cover the
    // outside-of-process degradations of the API surface.

    #[test]
    fn test_outside_process_context() {
        assert!(current().is_none());
        assert!(getpid().is_none());
        assert_eq!(monitor(None), 0);
        assert!(!demonitor(1));
        assert!(!process_flag(PROC_FLAG_TRAP_EXIT, true));
        // Yield and reduction checks are harmless no-ops.
        yield_now();
        check_reds(100);
        set_exit_reason(1);
    }

    #[test]
    fn test_reserved_tag_space() {
        assert!(TAG_NONE < FIRST_USER_TAG);
        assert!(TAG_EXIT < FIRST_USER_TAG);
        assert!(TAG_DOWN < FIRST_USER_TAG);
        assert!(TAG_TIMER < FIRST_USER_TAG);
        assert_eq!(FIRST_USER_TAG, 16);
    }

    #[test]
    fn test_infinite_sentinel() {
        assert_eq!(INFINITE, u64::MAX);
    }
}
