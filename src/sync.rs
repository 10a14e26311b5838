//! Per-target synchronization between in-flight calls and chain rebuilds.
//!
//! Every detoured target owns a [`SyncGate`]. Generated call-site proxies bracket each
//! call with [`SyncGate::enter`] and the returned guard's drop, while rebuilds bracket
//! their relink work with [`SyncGate::begin_update`]. The gate busy-spins rather than
//! parking: stalls are expected to last microseconds, and detoured targets can be called
//! from contexts where blocking on an OS primitive is not acceptable.
//!
//! Two rules keep the two sides from deadlocking or corrupting each other:
//!
//! - A call that arrives while an update is published waits for the update to finish,
//!   unless the calling thread is already inside the target (a nested call), in which
//!   case it passes through; the updater is waiting for that thread's outer frame, and
//!   making the nested frame wait too would deadlock both.
//! - A thread inside the target may not start an update, and the updating thread may not
//!   call the target. Both directions fail with
//!   [`Error::ChainUpdateReentrancy`](crate::Error::ChainUpdateReentrancy) instead of
//!   deadlocking.
//!
//! The gate also quarantines trampolines stolen from removed detours: each carries a
//! redirect onto the removed stub, and the queue is flushed back to the pool when the
//! last active call exits, once no stale reference obtained during an earlier call can
//! still reach the stub. A forced drain reaches the same proof through an empty update
//! cycle, for targets that stop being called after the steal.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::marker::PhantomData;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;

use crate::{runtime::Redirect, trampoline::Trampoline, Error, Result};

/// Sentinel for "no update in progress"; real thread tokens start at 1.
const NO_UPDATER: u64 = 0;

static NEXT_GATE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: Cell<u64> = const { Cell::new(0) };
    /// Per-thread call depth for each gate this thread is currently inside.
    static CALL_DEPTHS: RefCell<Vec<(u64, u32)>> = const { RefCell::new(Vec::new()) };
}

fn thread_token() -> u64 {
    THREAD_TOKEN.with(|token| {
        let current = token.get();
        if current != 0 {
            return current;
        }
        let assigned = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
        token.set(assigned);
        assigned
    })
}

fn depth_of(gate: u64) -> u32 {
    CALL_DEPTHS.with(|depths| {
        depths
            .borrow()
            .iter()
            .find(|(id, _)| *id == gate)
            .map_or(0, |(_, depth)| *depth)
    })
}

fn push_depth(gate: u64) {
    CALL_DEPTHS.with(|depths| {
        let mut depths = depths.borrow_mut();
        match depths.iter_mut().find(|(id, _)| *id == gate) {
            Some(entry) => entry.1 += 1,
            None => depths.push((gate, 1)),
        }
    });
}

fn pop_depth(gate: u64) {
    CALL_DEPTHS.with(|depths| {
        let mut depths = depths.borrow_mut();
        if let Some(idx) = depths.iter().position(|(id, _)| *id == gate) {
            depths[idx].1 -= 1;
            if depths[idx].1 == 0 {
                depths.swap_remove(idx);
            }
        }
    });
}

fn spin(counter: &mut u32) {
    *counter = counter.wrapping_add(1);
    if *counter & 0x3f == 0 {
        std::thread::yield_now();
    } else {
        std::hint::spin_loop();
    }
}

/// Spin-based gate arbitrating between calls into a target and rebuilds of its chain.
///
/// Created one per detoured target and shared with the runtime-generated proxies that
/// guard the target's entry.
pub struct SyncGate {
    id: u64,
    active_calls: AtomicUsize,
    updating_thread: AtomicU64,
    has_stolen: AtomicBool,
    stolen: Mutex<Vec<StolenTrampoline>>,
}

impl SyncGate {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(SyncGate {
            id: NEXT_GATE_ID.fetch_add(1, Ordering::Relaxed),
            active_calls: AtomicUsize::new(0),
            updating_thread: AtomicU64::new(NO_UPDATER),
            has_stolen: AtomicBool::new(false),
            stolen: Mutex::new(Vec::new()),
        })
    }

    /// Enters the gate on behalf of a call into the target.
    ///
    /// Registers the call optimistically, then re-checks for a published update: if one
    /// is in progress the registration is rolled back and the call spins until the
    /// update completes, re-registering afterwards. Nested calls (this thread already
    /// holds a [`CallGuard`] for this gate) pass through without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChainUpdateReentrancy`] when the in-progress update was started
    /// by the calling thread; waiting would deadlock against our own rebuild.
    pub fn enter(&self) -> Result<CallGuard<'_>> {
        let token = thread_token();
        let nested = depth_of(self.id) > 0;
        let mut spins = 0u32;
        loop {
            self.active_calls.fetch_add(1, Ordering::AcqRel);
            let updater = self.updating_thread.load(Ordering::Acquire);
            if updater == NO_UPDATER || nested {
                break;
            }
            self.active_calls.fetch_sub(1, Ordering::AcqRel);
            if updater == token {
                return Err(Error::ChainUpdateReentrancy);
            }
            while self.updating_thread.load(Ordering::Acquire) != NO_UPDATER {
                spin(&mut spins);
            }
        }
        push_depth(self.id);
        Ok(CallGuard {
            gate: self,
            _not_send: PhantomData,
        })
    }

    /// Publishes an update and drains the target of active calls.
    ///
    /// When this returns, every call that entered before the publication has exited and
    /// new calls are held at the gate until the returned guard drops. The caller must
    /// already hold whatever lock serializes updates for the target; the gate only
    /// arbitrates against calls.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChainUpdateReentrancy`] when the calling thread is itself inside
    /// the target; draining would wait on our own frames forever.
    pub fn begin_update(&self) -> Result<UpdateGuard<'_>> {
        if depth_of(self.id) > 0 {
            return Err(Error::ChainUpdateReentrancy);
        }
        let prev = self.updating_thread.swap(thread_token(), Ordering::AcqRel);
        debug_assert_eq!(prev, NO_UPDATER, "concurrent chain updates on one gate");
        let mut spins = 0u32;
        while self.active_calls.load(Ordering::Acquire) > 0 {
            spin(&mut spins);
        }
        Ok(UpdateGuard {
            gate: self,
            _not_send: PhantomData,
        })
    }

    /// Number of calls currently inside the target.
    #[must_use]
    pub fn active_calls(&self) -> usize {
        self.active_calls.load(Ordering::Acquire)
    }

    /// Whether an update is currently published on this gate.
    #[must_use]
    pub fn updating(&self) -> bool {
        self.updating_thread.load(Ordering::Acquire) != NO_UPDATER
    }

    /// The calling thread's nesting depth inside this gate.
    #[must_use]
    pub fn thread_call_depth(&self) -> u32 {
        depth_of(self.id)
    }

    /// Queues a stolen trampoline for release once the target drains.
    pub(crate) fn steal(&self, stolen: StolenTrampoline) {
        self.stolen.lock().push(stolen);
        self.has_stolen.store(true, Ordering::Release);
    }

    /// Releases all queued stolen trampolines back to their pool.
    ///
    /// Only one caller wins the flush; others see the flag already cleared and return.
    pub(crate) fn return_stolen(&self) {
        if self
            .has_stolen
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let stolen = std::mem::take(&mut *self.stolen.lock());
        for trampoline in stolen {
            trampoline.release();
        }
    }

    /// Forces the stolen queue to flush by proving the target is quiescent.
    ///
    /// Runs an empty update cycle: publishes an update, spins until every in-flight
    /// call has exited, releases the queued trampolines while new calls are still held
    /// at the gate, then withdraws the publication. As with
    /// [`begin_update`](Self::begin_update), the caller must hold the lock that
    /// serializes updates for the target. The normal release path is the last call's
    /// exit; this exists for targets that stop being called after a steal.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChainUpdateReentrancy`] when called from inside the target.
    pub(crate) fn drain_stolen(&self) -> Result<()> {
        let _update = self.begin_update()?;
        self.return_stolen();
        Ok(())
    }
}

impl fmt::Debug for SyncGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncGate")
            .field("active_calls", &self.active_calls())
            .field("updating", &self.updating())
            .finish()
    }
}

/// Active-call registration, released on drop.
///
/// Not `Send`: the guard tracks per-thread nesting depth and must drop on the thread
/// that entered. Dropping the last guard flushes the gate's stolen trampolines.
pub struct CallGuard<'a> {
    gate: &'a SyncGate,
    _not_send: PhantomData<*const ()>,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        pop_depth(self.gate.id);
        if self.gate.active_calls.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.gate.return_stolen();
        }
    }
}

impl fmt::Debug for CallGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallGuard").finish_non_exhaustive()
    }
}

/// Published update, withdrawn on drop.
///
/// Not `Send`: the reentrancy check identifies the updater by thread.
pub struct UpdateGuard<'a> {
    gate: &'a SyncGate,
    _not_send: PhantomData<*const ()>,
}

impl Drop for UpdateGuard<'_> {
    fn drop(&mut self) {
        self.gate.updating_thread.store(NO_UPDATER, Ordering::Release);
    }
}

impl fmt::Debug for UpdateGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateGuard").finish_non_exhaustive()
    }
}

/// A trampoline stolen from a removed detour, still redirected onto the removed stub.
///
/// Held by the gate until the target drains; releasing undoes the redirect and lets the
/// trampoline drop back into its pool.
pub(crate) struct StolenTrampoline {
    trampoline: Trampoline,
    removed_redirect: Box<dyn Redirect>,
}

impl StolenTrampoline {
    pub(crate) fn new(trampoline: Trampoline, removed_redirect: Box<dyn Redirect>) -> Self {
        StolenTrampoline {
            trampoline,
            removed_redirect,
        }
    }

    fn release(self) {
        let StolenTrampoline {
            trampoline,
            mut removed_redirect,
        } = self;
        match removed_redirect.undo() {
            Ok(()) => drop(trampoline),
            Err(err) => {
                // Still redirected; recycling it would hand out a poisoned stub.
                tracing::error!(
                    stub = %trampoline.code(),
                    error = %err,
                    "failed to undo removed-stub redirect, quarantining trampoline"
                );
                std::mem::forget(trampoline);
            }
        }
    }
}

impl fmt::Debug for StolenTrampoline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StolenTrampoline({:?})", self.trampoline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{DetourFactory, DetourRuntime, Signature};
    use crate::testing::MockRuntime;
    use crate::trampoline::TrampolinePool;

    #[test]
    fn test_enter_tracks_active_calls() {
        let gate = SyncGate::new();
        assert_eq!(gate.active_calls(), 0);

        let guard = gate.enter().unwrap();
        assert_eq!(gate.active_calls(), 1);
        assert_eq!(gate.thread_call_depth(), 1);

        drop(guard);
        assert_eq!(gate.active_calls(), 0);
        assert_eq!(gate.thread_call_depth(), 0);
    }

    #[test]
    fn test_nested_calls_stack() {
        let gate = SyncGate::new();
        let outer = gate.enter().unwrap();
        let inner = gate.enter().unwrap();

        assert_eq!(gate.active_calls(), 2);
        assert_eq!(gate.thread_call_depth(), 2);

        drop(inner);
        assert_eq!(gate.thread_call_depth(), 1);
        drop(outer);
        assert_eq!(gate.thread_call_depth(), 0);
    }

    #[test]
    fn test_begin_update_rejected_inside_call() {
        let gate = SyncGate::new();
        let _guard = gate.enter().unwrap();

        assert!(matches!(
            gate.begin_update(),
            Err(Error::ChainUpdateReentrancy)
        ));
    }

    #[test]
    fn test_enter_rejected_during_own_update() {
        let gate = SyncGate::new();
        let update = gate.begin_update().unwrap();

        assert!(matches!(gate.enter(), Err(Error::ChainUpdateReentrancy)));

        drop(update);
        assert!(gate.enter().is_ok());
    }

    #[test]
    fn test_update_guard_withdraws_publication() {
        let gate = SyncGate::new();
        drop(gate.begin_update().unwrap());
        assert!(!gate.updating());
    }

    #[test]
    fn test_depths_are_per_gate() {
        let first = SyncGate::new();
        let second = SyncGate::new();
        let _call = first.enter().unwrap();

        // Being inside one target does not make us reentrant on another.
        let update = second.begin_update().unwrap();
        drop(update);
    }

    fn steal_one(gate: &SyncGate, pool: &Arc<TrampolinePool>, runtime: &Arc<MockRuntime>) {
        let trampoline = pool.rent(&Signature::new("() -> ()")).unwrap();
        let removed = runtime
            .create_removed_stub(&Signature::new("() -> ()"))
            .unwrap();
        let redirect = runtime
            .create_detour(trampoline.code(), &removed, true)
            .unwrap();
        gate.steal(StolenTrampoline::new(trampoline, redirect));
    }

    #[test]
    fn test_last_exit_flushes_stolen_queue() {
        let runtime = MockRuntime::new();
        let pool = TrampolinePool::new(runtime.clone());
        let gate = SyncGate::new();

        steal_one(&gate, &pool, &runtime);
        assert_eq!(pool.pooled(), 0);

        let guard = gate.enter().unwrap();
        drop(guard);
        assert_eq!(pool.pooled(), 1);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_drain_stolen_flushes_idle_target() {
        let runtime = MockRuntime::new();
        let pool = TrampolinePool::new(runtime.clone());
        let gate = SyncGate::new();

        // No call ever enters, so the last-exit path never runs.
        steal_one(&gate, &pool, &runtime);
        assert_eq!(pool.pooled(), 0);

        gate.drain_stolen().unwrap();
        assert_eq!(pool.pooled(), 1);
        assert!(!gate.updating());
    }

    #[test]
    fn test_drain_stolen_rejected_inside_call() {
        let runtime = MockRuntime::new();
        let pool = TrampolinePool::new(runtime.clone());
        let gate = SyncGate::new();

        let guard = gate.enter().unwrap();
        steal_one(&gate, &pool, &runtime);

        assert!(matches!(
            gate.drain_stolen(),
            Err(Error::ChainUpdateReentrancy)
        ));
        assert_eq!(pool.pooled(), 0);

        drop(guard);
        assert_eq!(pool.pooled(), 1);
        gate.drain_stolen().unwrap();
    }
}
