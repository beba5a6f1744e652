//! Links, monitors, and exit-signal propagation.
//!
//! Links are symmetric: each side appears in the other's link list, and the
//! exit of either side fans out to the other according to the trap-exit
//! rule. Monitors are one-way: the watcher gets a DOWN message when the
//! watched process exits. Both relation kinds live in per-slot lists under
//! one global mutex, held only for structural mutation — never across a
//! suspension.
//!
//! System signals (EXIT, DOWN) are ordinary mailbox messages carrying a
//! heap-allocated [`Signal`] payload whose ownership passes to the receiver.

use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::arena::Arena;
use crate::mailbox::alloc_cell;
use crate::process::{Pid, Process, ProcessRef, REASON_NORMAL};

// ---------------------------------------------------------------------------
// System tags
// ---------------------------------------------------------------------------

/// Tag of an untagged message.
pub const TAG_NONE: u32 = 0;
/// Tag of an EXIT signal from a linked process.
pub const TAG_EXIT: u32 = 1;
/// Tag of a DOWN notification from a monitored process.
pub const TAG_DOWN: u32 = 2;
/// Tag reserved for kernel timer bookkeeping.
pub const TAG_TIMER: u32 = 3;
/// First tag available to user code; 1..16 are reserved for the kernel.
pub const FIRST_USER_TAG: u32 = 16;

// ---------------------------------------------------------------------------
// Signal payload
// ---------------------------------------------------------------------------

/// Payload of an EXIT or DOWN message.
///
/// Delivered boxed; the receiver owns it after a successful receive and
/// reclaims it with [`Signal::from_payload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signal {
    /// Pid of the process that exited.
    pub from: Pid,
    /// Monitor reference for DOWN signals; 0 for EXIT signals.
    pub reference: u64,
    /// The exit reason.
    pub reason: u64,
}

impl Signal {
    /// Box the signal into an opaque mailbox payload.
    pub fn into_payload(self) -> *mut u8 {
        Box::into_raw(Box::new(self)) as *mut u8
    }

    /// Reclaim a signal payload received with tag [`TAG_EXIT`] or
    /// [`TAG_DOWN`].
    ///
    /// # Safety
    ///
    /// `payload` must have come from [`Signal::into_payload`] and must not
    /// be reclaimed twice.
    pub unsafe fn from_payload(payload: *mut u8) -> Signal {
        *Box::from_raw(payload as *mut Signal)
    }
}

// ---------------------------------------------------------------------------
// Relation storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct MonitorEntry {
    reference: u64,
    peer: ProcessRef,
}

#[derive(Default)]
struct Rel {
    /// Symmetric links (each entry mirrored in the peer's list).
    links: Vec<ProcessRef>,
    /// Monitors this process holds on others ("I watch X").
    watching: Vec<MonitorEntry>,
    /// Monitors others hold on this process ("X watches me").
    watched_by: Vec<MonitorEntry>,
}

/// Result of [`LinkTable::link`] / [`LinkTable::unlink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    /// The relation was installed (or removed).
    Linked,
    /// The target was already dead; an exit signal was delivered instead.
    TargetDead,
}

/// The global link/monitor table: one relation record per arena slot.
pub struct LinkTable {
    rels: Mutex<Box<[Rel]>>,
    next_ref: AtomicU64,
}

impl LinkTable {
    pub fn new(max_procs: usize) -> LinkTable {
        LinkTable {
            rels: Mutex::new((0..max_procs).map(|_| Rel::default()).collect()),
            next_ref: AtomicU64::new(1),
        }
    }

    /// Install a symmetric link between `a` and `b`, idempotently.
    ///
    /// If `b` is already exiting or gone, no link is made; instead `a`
    /// receives the exit signal it would have gotten had the link existed
    /// (reason [`REASON_NOPROC`](crate::process::REASON_NOPROC)).
    pub fn link(
        &self,
        arena: &Arena,
        a: ProcessRef,
        b: ProcessRef,
        wake: &mut dyn FnMut(&Process),
    ) -> LinkOutcome {
        if a == b {
            return LinkOutcome::Linked;
        }
        let mut rels = self.rels.lock();

        if !slot_alive(arena, b) {
            drop(rels);
            apply_exit_signal(arena, a, b.pid, crate::process::REASON_NOPROC, wake);
            return LinkOutcome::TargetDead;
        }

        let fwd = &mut rels[a.slot as usize].links;
        if !fwd.iter().any(|p| p.pid == b.pid) {
            fwd.push(b);
        }
        let rev = &mut rels[b.slot as usize].links;
        if !rev.iter().any(|p| p.pid == a.pid) {
            rev.push(a);
        }
        LinkOutcome::Linked
    }

    /// Remove the link between `a` and `b` in both directions.
    pub fn unlink(&self, a: ProcessRef, b: ProcessRef) {
        let mut rels = self.rels.lock();
        let len = rels.len();
        if (a.slot as usize) < len {
            rels[a.slot as usize].links.retain(|p| p.pid != b.pid);
        }
        if (b.slot as usize) < len {
            rels[b.slot as usize].links.retain(|p| p.pid != a.pid);
        }
    }

    /// Start monitoring `target` on behalf of `watcher`. Returns the monitor
    /// reference; if `target` is already dead, a DOWN with reason
    /// [`REASON_NOPROC`](crate::process::REASON_NOPROC) is delivered
    /// immediately under the fresh reference.
    pub fn monitor(
        &self,
        arena: &Arena,
        watcher: ProcessRef,
        target: ProcessRef,
        wake: &mut dyn FnMut(&Process),
    ) -> u64 {
        let reference = self.next_ref.fetch_add(1, Ordering::Relaxed);
        let mut rels = self.rels.lock();

        if !slot_alive(arena, target) {
            drop(rels);
            deliver(
                arena,
                watcher,
                TAG_DOWN,
                Signal {
                    from: target.pid,
                    reference,
                    reason: crate::process::REASON_NOPROC,
                },
                wake,
            );
            return reference;
        }

        rels[watcher.slot as usize].watching.push(MonitorEntry {
            reference,
            peer: target,
        });
        rels[target.slot as usize].watched_by.push(MonitorEntry {
            reference,
            peer: watcher,
        });
        reference
    }

    /// Remove the monitor identified by `reference`. Returns whether it was
    /// found in `watcher`'s list.
    pub fn demonitor(&self, watcher: ProcessRef, reference: u64) -> bool {
        let mut rels = self.rels.lock();
        let watching = &mut rels[watcher.slot as usize].watching;
        let Some(pos) = watching.iter().position(|m| m.reference == reference) else {
            return false;
        };
        let entry = watching.remove(pos);
        rels[entry.peer.slot as usize]
            .watched_by
            .retain(|m| m.reference != reference);
        true
    }

    /// Fan out the exit of `me` (already in the EXITING state):
    ///
    /// 1. For each linked peer: remove the reverse link, then apply the
    ///    trap-exit rule (deliver EXIT, or kill the peer for a non-normal
    ///    reason).
    /// 2. For each watcher of `me`: remove its watching entry and deliver a
    ///    DOWN tagged with the monitor reference.
    /// 3. Remove `me` from the watched-by lists of everything it monitored.
    pub fn propagate_exit(
        &self,
        arena: &Arena,
        me: &Process,
        reason: u64,
        wake: &mut dyn FnMut(&Process),
    ) {
        let me_pid = Pid(me.pid.load(Ordering::Acquire));
        let mut rels = self.rels.lock();

        let (links, watched_by, watching) = {
            let rel = &mut rels[me.slot as usize];
            (
                mem::take(&mut rel.links),
                mem::take(&mut rel.watched_by),
                mem::take(&mut rel.watching),
            )
        };

        for peer in links {
            rels[peer.slot as usize].links.retain(|p| p.pid != me_pid);
            apply_exit_signal(arena, peer, me_pid, reason, wake);
        }

        for m in watched_by {
            rels[m.peer.slot as usize]
                .watching
                .retain(|w| w.reference != m.reference);
            deliver(
                arena,
                m.peer,
                TAG_DOWN,
                Signal {
                    from: me_pid,
                    reference: m.reference,
                    reason,
                },
                wake,
            );
        }

        for m in watching {
            rels[m.peer.slot as usize]
                .watched_by
                .retain(|w| w.reference != m.reference);
        }
    }

    /// Current link peers of a slot (diagnostics and tests).
    pub fn links_of(&self, slot: u32) -> Vec<ProcessRef> {
        self.rels.lock()[slot as usize].links.clone()
    }

    /// `(watching, watched_by)` counts for a slot (diagnostics and tests).
    pub fn monitor_counts(&self, slot: u32) -> (usize, usize) {
        let rels = self.rels.lock();
        let rel = &rels[slot as usize];
        (rel.watching.len(), rel.watched_by.len())
    }
}

// ---------------------------------------------------------------------------
// Delivery helpers
// ---------------------------------------------------------------------------

/// Bounds-checked liveness probe for caller-supplied handles.
fn slot_alive(arena: &Arena, r: ProcessRef) -> bool {
    (r.slot as usize) < arena.max_procs() && arena.slot(r.slot).is_alive(r.pid)
}

/// Push a signal message to `target`'s mailbox and re-schedule it if it had
/// committed to sleeping. Dead targets drop the signal.
fn deliver(
    arena: &Arena,
    target: ProcessRef,
    tag: u32,
    sig: Signal,
    wake: &mut dyn FnMut(&Process),
) {
    if !slot_alive(arena, target) {
        return;
    }
    let proc = arena.slot(target.slot);
    let cell = alloc_cell(tag, sig.from, sig.into_payload());
    proc.mailbox.push(cell);
    if proc.mailbox.take_waiting() {
        wake(proc);
    }
}

/// Apply an exit signal from `from` with `reason` to `peer`, following the
/// trap-exit rule: normal exits are messages (trap) or nothing; non-normal
/// exits are messages (trap) or a kill.
pub(crate) fn apply_exit_signal(
    arena: &Arena,
    peer: ProcessRef,
    from: Pid,
    reason: u64,
    wake: &mut dyn FnMut(&Process),
) {
    if !slot_alive(arena, peer) {
        return;
    }
    let proc = arena.slot(peer.slot);

    if reason == REASON_NORMAL {
        if proc.traps_exits() {
            deliver(
                arena,
                peer,
                TAG_EXIT,
                Signal {
                    from,
                    reference: 0,
                    reason,
                },
                wake,
            );
        }
        return;
    }

    if proc.traps_exits() {
        deliver(
            arena,
            peer,
            TAG_EXIT,
            Signal {
                from,
                reference: 0,
                reason,
            },
            wake,
        );
    } else {
        proc.exit_reason.store(reason, Ordering::Release);
        // SeqCst pairs with the receiver's arm-then-recheck; see receive_core.
        proc.kill_flag.store(true, Ordering::SeqCst);
        if proc.mailbox.take_waiting() {
            wake(proc);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
