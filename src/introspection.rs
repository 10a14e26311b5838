//! Read-only views over a target's detour chain.
//!
//! Obtained from [`DetourRegistry::method_info`](crate::DetourRegistry::method_info) and
//! [`DetourRegistry::function_info`](crate::DetourRegistry::function_info). The detour
//! list is a snapshot taken under the target's lock: it reflects the chain as of the
//! moment of the call and does not change as hooks come and go afterwards. The
//! gate-backed members ([`has_active_call`](MethodDetourInfo::has_active_call),
//! [`drain_stolen`](MethodDetourInfo::drain_stolen)) act on the live gate, not the
//! snapshot.
//!
//! # Examples
//!
//! ```rust,no_run
//! # use hookchain::testing::MockRuntime;
//! # use hookchain::{CodeRef, DetourRegistry, Signature};
//! # let runtime = MockRuntime::new();
//! # let registry = DetourRegistry::new(runtime.clone(), runtime);
//! # let target = CodeRef::new("target", Signature::new("() -> ()"));
//! if let Some(info) = registry.method_info(&target) {
//!     for detour in info.detours() {
//!         println!("{} (config: {:?})", detour.entry(), detour.config().map(|c| c.id()));
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use crate::{
    chain::MethodChain,
    ordering::{DetourConfig, OrderingConflict},
    runtime::{ChainCell, CodeRef, FnAddr, NativeCallback},
    sync::SyncGate,
    Result,
};

/// Snapshot of one managed target's detour chain.
#[derive(Clone)]
pub struct MethodDetourInfo {
    target: CodeRef,
    detours: Vec<DetourInfo>,
    conflicts: Vec<OrderingConflict>,
    end_of_chain: CodeRef,
    version: u64,
    chain: Arc<MethodChain>,
}

impl MethodDetourInfo {
    pub(crate) fn new(
        target: CodeRef,
        detours: Vec<DetourInfo>,
        conflicts: Vec<OrderingConflict>,
        end_of_chain: CodeRef,
        version: u64,
        chain: Arc<MethodChain>,
    ) -> Self {
        MethodDetourInfo {
            target,
            detours,
            conflicts,
            end_of_chain,
            version,
            chain,
        }
    }

    /// The detoured target.
    #[must_use]
    pub fn target(&self) -> &CodeRef {
        &self.target
    }

    /// The applied detours in run order, first to run first.
    #[must_use]
    pub fn detours(&self) -> &[DetourInfo] {
        &self.detours
    }

    /// Number of applied detours.
    #[must_use]
    pub fn detour_count(&self) -> usize {
        self.detours.len()
    }

    /// Whether any detour was applied when the snapshot was taken.
    #[must_use]
    pub fn is_detoured(&self) -> bool {
        !self.detours.is_empty()
    }

    /// The preserved original behavior the last detour continues into.
    #[must_use]
    pub fn end_of_chain(&self) -> &CodeRef {
        &self.end_of_chain
    }

    /// Contradictory ordering declarations observed for this target, oldest first.
    #[must_use]
    pub fn ordering_conflicts(&self) -> &[OrderingConflict] {
        &self.conflicts
    }

    /// Chain version as of the snapshot; each add or remove increments it.
    #[must_use]
    pub fn chain_version(&self) -> u64 {
        self.version
    }

    /// Whether a call is inside the target right now. Live, not part of the snapshot.
    #[must_use]
    pub fn has_active_call(&self) -> bool {
        self.chain.active_calls() > 0
    }

    /// Forces stolen trampolines back to the pool.
    ///
    /// Runs an empty update cycle on the target's gate, serialized with chain rebuilds
    /// like any other update: spins until every in-flight call has exited, then
    /// releases the quarantined stubs. The stubs would otherwise wait for the next
    /// call to exit, which never comes on a target that stopped being called.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChainUpdateReentrancy`](crate::Error::ChainUpdateReentrancy)
    /// when called from inside the target.
    pub fn drain_stolen(&self) -> Result<()> {
        self.chain.drain_stolen()
    }
}

impl fmt::Debug for MethodDetourInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDetourInfo")
            .field("target", &self.target)
            .field("detours", &self.detours)
            .field("conflicts", &self.conflicts)
            .field("end_of_chain", &self.end_of_chain)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// One applied detour in a [`MethodDetourInfo`] snapshot.
#[derive(Debug, Clone)]
pub struct DetourInfo {
    entry: CodeRef,
    next_trampoline: CodeRef,
    config: Option<DetourConfig>,
}

impl DetourInfo {
    pub(crate) fn new(
        entry: CodeRef,
        next_trampoline: CodeRef,
        config: Option<DetourConfig>,
    ) -> Self {
        DetourInfo {
            entry,
            next_trampoline,
            config,
        }
    }

    /// The detour's entry, the code a call reaches when the chain transfers to it.
    #[must_use]
    pub fn entry(&self) -> &CodeRef {
        &self.entry
    }

    /// The trampoline this detour continues through when it invokes the original.
    #[must_use]
    pub fn next_trampoline(&self) -> &CodeRef {
        &self.next_trampoline
    }

    /// The ordering config the detour was applied with, when it had one.
    #[must_use]
    pub fn config(&self) -> Option<&DetourConfig> {
        self.config.as_ref()
    }
}

/// Snapshot of one native function's detour chain.
#[derive(Debug, Clone)]
pub struct FunctionDetourInfo {
    function: FnAddr,
    detours: Vec<NativeDetourInfo>,
    conflicts: Vec<OrderingConflict>,
    version: u64,
    gate: Arc<SyncGate>,
}

impl FunctionDetourInfo {
    pub(crate) fn new(
        function: FnAddr,
        detours: Vec<NativeDetourInfo>,
        conflicts: Vec<OrderingConflict>,
        version: u64,
        gate: Arc<SyncGate>,
    ) -> Self {
        FunctionDetourInfo {
            function,
            detours,
            conflicts,
            version,
            gate,
        }
    }

    /// The detoured function.
    #[must_use]
    pub fn function(&self) -> FnAddr {
        self.function
    }

    /// The applied callbacks in run order, first to run first.
    #[must_use]
    pub fn detours(&self) -> &[NativeDetourInfo] {
        &self.detours
    }

    /// Whether any callback was applied when the snapshot was taken.
    #[must_use]
    pub fn is_detoured(&self) -> bool {
        !self.detours.is_empty()
    }

    /// Contradictory ordering declarations observed for this function, oldest first.
    #[must_use]
    pub fn ordering_conflicts(&self) -> &[OrderingConflict] {
        &self.conflicts
    }

    /// Chain version as of the snapshot; each add or remove increments it.
    #[must_use]
    pub fn chain_version(&self) -> u64 {
        self.version
    }

    /// Whether a call is inside the function right now. Live, not part of the snapshot.
    #[must_use]
    pub fn has_active_call(&self) -> bool {
        self.gate.active_calls() > 0
    }
}

/// One applied callback in a [`FunctionDetourInfo`] snapshot.
#[derive(Debug, Clone)]
pub struct NativeDetourInfo {
    callback: NativeCallback,
    next: Option<Arc<ChainCell>>,
    config: Option<DetourConfig>,
}

impl NativeDetourInfo {
    pub(crate) fn new(
        callback: NativeCallback,
        next: Option<Arc<ChainCell>>,
        config: Option<DetourConfig>,
    ) -> Self {
        NativeDetourInfo {
            callback,
            next,
            config,
        }
    }

    /// The callback hooked into the chain.
    #[must_use]
    pub fn callback(&self) -> &NativeCallback {
        &self.callback
    }

    /// The callable this callback currently continues into.
    ///
    /// Live: reads the published chain cell, so it tracks later rebuilds. `None` when
    /// the callback does not chain (it never declared a next parameter).
    #[must_use]
    pub fn next(&self) -> Option<NativeCallback> {
        self.next.as_ref().and_then(|cell| cell.load())
    }

    /// The ordering config the callback was applied with, when it had one.
    #[must_use]
    pub fn config(&self) -> Option<&DetourConfig> {
        self.config.as_ref()
    }
}
