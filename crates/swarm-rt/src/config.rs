//! Compile-time defaults and init-time tunables for the runtime kernel.
//!
//! Every knob has a compile-time default; `Config` lets embedders override
//! them at init time without recompiling. `num_priorities` is fixed at four
//! (max, high, normal, low) and is not configurable.

/// Number of scheduling priority levels.
pub const NUM_PRIORITIES: usize = 4;

/// Default capacity of the process arena (slots and heap blocks).
pub const DEFAULT_MAX_PROCESSES: usize = 8192;

/// Default size of a process heap block, in 64-bit words.
pub const DEFAULT_HEAP_MIN_WORDS: usize = 256;

/// Default coroutine stack size: 64 KiB.
///
/// Virtual memory lazy-commits pages, so large process counts with 64 KiB
/// virtual stacks are feasible on modern systems.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Default number of reductions granted per scheduling timeslice.
pub const CONTEXT_REDS: u32 = 4000;

/// Maximum registered-name length in bytes, including the terminator a C
/// embedder would append.
pub const REG_NAME_MAX: usize = 64;

/// Default cap on the per-thread message-cell freelist.
pub const MSG_FREELIST_CAP: usize = 128;

/// Default cap on spare capacity retained by the pending-timer list.
pub const TIMER_SPARE_CAP: usize = 128;

/// Number of slot/block indices moved per cross-partition steal.
pub const STEAL_BATCH: usize = 32;

/// Init-time tunables for a [`Scheduler`](crate::Scheduler) instance.
///
/// `Default` reproduces the compile-time constants above.
#[derive(Debug, Clone)]
pub struct Config {
    /// Capacity of the process arena. Spawn fails once exhausted.
    pub max_processes: usize,
    /// Heap block size per process, in 64-bit words.
    pub heap_min_words: usize,
    /// Private coroutine stack size per process, in bytes.
    pub process_stack_size: usize,
    /// Reductions granted per timeslice (advisory; see [`check_reds`](crate::check_reds)).
    pub context_reductions: u32,
    /// Capacity hint for the name registry's hash map.
    pub registry_buckets: usize,
    /// Cap on the per-thread message-cell freelist.
    pub msg_freelist_cap: usize,
    /// Cap on spare capacity retained by the pending-timer list.
    pub timer_spare_cap: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_processes: DEFAULT_MAX_PROCESSES,
            heap_min_words: DEFAULT_HEAP_MIN_WORDS,
            process_stack_size: DEFAULT_STACK_SIZE,
            context_reductions: CONTEXT_REDS,
            registry_buckets: 256,
            msg_freelist_cap: MSG_FREELIST_CAP,
            timer_spare_cap: TIMER_SPARE_CAP,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
