//! Disposable hook handles.
//!
//! A [`Hook`] (managed target) or [`NativeHook`] (raw function) represents one
//! registered detour and owns its membership in the target's chain. Handles move
//! through three states: dormant, applied, disposed. [`apply`](Hook::apply) and
//! [`undo`](Hook::undo) are idempotent; [`dispose`](Hook::dispose) undoes the hook if
//! needed and retires the handle for good. Dropping a handle disposes it, so a hook
//! cannot outlive the code that registered it by accident.
//!
//! Handles are created by [`DetourRegistry`](crate::DetourRegistry), never directly.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::{
    chain::{FunctionChain, MethodChain, NodeSlot},
    introspection::{DetourInfo, NativeDetourInfo},
    ordering::DetourConfig,
    runtime::{CodeRef, DetourFactory, FnAddr, NativeCallback},
    Error, Result,
};

enum HandleState {
    Applied(NodeSlot),
    Dormant,
    Disposed,
}

/// A registered detour on a managed target.
///
/// While applied, the hook's entry sits in the target's chain at the position its
/// config dictates, and the hook owns a rented trampoline its entry continues the
/// chain through. Undoing surrenders both; the trampoline is quarantined by the
/// target's gate until provably unused and only then returns to the pool.
///
/// # Examples
///
/// ```rust,no_run
/// use hookchain::testing::MockRuntime;
/// use hookchain::{CodeRef, DetourRegistry, Signature};
///
/// let runtime = MockRuntime::new();
/// let registry = DetourRegistry::new(runtime.clone(), runtime.clone());
/// let target = CodeRef::new("game::update", Signature::new("(f32) -> ()"));
/// let entry = CodeRef::new("mod::update_hook", Signature::new("(f32) -> ()"));
///
/// let hook = registry.hook(&target, &entry)?;
/// assert!(hook.is_applied());
/// hook.undo()?;
/// hook.apply()?;
/// hook.dispose()?;
/// # Ok::<(), hookchain::Error>(())
/// ```
pub struct Hook {
    chain: Arc<MethodChain>,
    entry: CodeRef,
    config: Option<DetourConfig>,
    factory: Arc<dyn DetourFactory>,
    state: Mutex<HandleState>,
}

impl Hook {
    pub(crate) fn new(
        chain: Arc<MethodChain>,
        entry: CodeRef,
        config: Option<DetourConfig>,
        factory: Arc<dyn DetourFactory>,
        apply_by_default: bool,
    ) -> Result<Self> {
        let hook = Hook {
            chain,
            entry,
            config,
            factory,
            state: Mutex::new(HandleState::Dormant),
        };
        if apply_by_default {
            hook.apply()?;
        }
        Ok(hook)
    }

    /// Applies this hook if it is not already applied.
    ///
    /// Rents a fresh trampoline and joins the target's chain at the position the
    /// hook's config dictates.
    ///
    /// # Errors
    ///
    /// [`Error::HookDisposed`] after [`dispose`](Hook::dispose); otherwise whatever the
    /// chain rebuild reports, such as [`Error::OrderingCycle`] or
    /// [`Error::ChainUpdateReentrancy`]. A failed apply leaves the hook dormant.
    pub fn apply(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            HandleState::Disposed => Err(Error::HookDisposed),
            HandleState::Applied(_) => Ok(()),
            HandleState::Dormant => {
                let trampoline = self.chain.pool().rent(self.chain.target().signature())?;
                let slot =
                    self.chain
                        .add(&self.entry, self.config.as_ref(), &self.factory, trampoline)?;
                *state = HandleState::Applied(slot);
                Ok(())
            }
        }
    }

    /// Undoes this hook if it is applied.
    ///
    /// # Errors
    ///
    /// [`Error::HookDisposed`] after [`dispose`](Hook::dispose); otherwise whatever the
    /// chain rebuild reports. The hook counts as undone even when the rebuild fails,
    /// matching the chain's no-rollback policy.
    pub fn undo(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            HandleState::Disposed => Err(Error::HookDisposed),
            HandleState::Dormant => Ok(()),
            HandleState::Applied(slot) => {
                let result = self.chain.remove(slot);
                *state = HandleState::Dormant;
                result
            }
        }
    }

    /// Undoes this hook if needed and retires the handle.
    ///
    /// Disposing twice is a no-op. A disposed hook can never be applied again.
    ///
    /// # Errors
    ///
    /// Whatever the final undo reports; the handle is disposed either way.
    pub fn dispose(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            HandleState::Disposed => Ok(()),
            HandleState::Dormant => {
                *state = HandleState::Disposed;
                Ok(())
            }
            HandleState::Applied(slot) => {
                let result = self.chain.remove(slot);
                *state = HandleState::Disposed;
                result
            }
        }
    }

    /// Whether this hook is currently applied.
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(*self.state.lock(), HandleState::Applied(_))
    }

    /// Whether this hook has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        matches!(*self.state.lock(), HandleState::Disposed)
    }

    /// The hooked target.
    #[must_use]
    pub fn target(&self) -> &CodeRef {
        self.chain.target()
    }

    /// The entry the chain transfers to when it reaches this hook.
    #[must_use]
    pub fn entry(&self) -> &CodeRef {
        &self.entry
    }

    /// The ordering config this hook was registered with, if any.
    #[must_use]
    pub fn config(&self) -> Option<&DetourConfig> {
        self.config.as_ref()
    }

    /// This hook's slice of the target's current chain snapshot.
    ///
    /// `None` while the hook is not applied.
    #[must_use]
    pub fn detour_info(&self) -> Option<DetourInfo> {
        if !self.is_applied() {
            return None;
        }
        MethodChain::snapshot(&self.chain)
            .detours()
            .iter()
            .find(|detour| detour.entry() == &self.entry)
            .cloned()
    }
}

impl Drop for Hook {
    fn drop(&mut self) {
        if let Err(err) = self.dispose() {
            warn!(method = %self.chain.target(), error = %err, "failed to undo hook on drop");
        }
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("target", self.chain.target())
            .field("entry", &self.entry)
            .field("applied", &self.is_applied())
            .finish()
    }
}

/// A registered detour on a raw native function.
///
/// The native analog of [`Hook`]: the callback sits in the function's chain at the
/// position its config dictates, and if it chains, its successor cell tracks every
/// rebuild. There is no trampoline to own; undoing poisons the callback's successor
/// cell so stale continuations fail loud.
pub struct NativeHook {
    chain: Arc<FunctionChain>,
    callback: NativeCallback,
    config: Option<DetourConfig>,
    factory: Arc<dyn DetourFactory>,
    state: Mutex<HandleState>,
}

impl NativeHook {
    pub(crate) fn new(
        chain: Arc<FunctionChain>,
        callback: NativeCallback,
        config: Option<DetourConfig>,
        factory: Arc<dyn DetourFactory>,
        apply_by_default: bool,
    ) -> Result<Self> {
        let hook = NativeHook {
            chain,
            callback,
            config,
            factory,
            state: Mutex::new(HandleState::Dormant),
        };
        if apply_by_default {
            hook.apply()?;
        }
        Ok(hook)
    }

    /// Applies this hook if it is not already applied.
    ///
    /// # Errors
    ///
    /// [`Error::HookDisposed`] after [`dispose`](NativeHook::dispose); otherwise
    /// whatever the chain rebuild reports. A failed apply leaves the hook dormant.
    pub fn apply(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            HandleState::Disposed => Err(Error::HookDisposed),
            HandleState::Applied(_) => Ok(()),
            HandleState::Dormant => {
                let slot = self
                    .chain
                    .add(&self.callback, self.config.as_ref(), &self.factory)?;
                *state = HandleState::Applied(slot);
                Ok(())
            }
        }
    }

    /// Undoes this hook if it is applied.
    ///
    /// # Errors
    ///
    /// [`Error::HookDisposed`] after [`dispose`](NativeHook::dispose); otherwise
    /// whatever the chain rebuild reports. The hook counts as undone even when the
    /// rebuild fails.
    pub fn undo(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            HandleState::Disposed => Err(Error::HookDisposed),
            HandleState::Dormant => Ok(()),
            HandleState::Applied(slot) => {
                let result = self.chain.remove(slot);
                *state = HandleState::Dormant;
                result
            }
        }
    }

    /// Undoes this hook if needed and retires the handle.
    ///
    /// Disposing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Whatever the final undo reports; the handle is disposed either way.
    pub fn dispose(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            HandleState::Disposed => Ok(()),
            HandleState::Dormant => {
                *state = HandleState::Disposed;
                Ok(())
            }
            HandleState::Applied(slot) => {
                let result = self.chain.remove(slot);
                *state = HandleState::Disposed;
                result
            }
        }
    }

    /// Whether this hook is currently applied.
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(*self.state.lock(), HandleState::Applied(_))
    }

    /// Whether this hook has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        matches!(*self.state.lock(), HandleState::Disposed)
    }

    /// The hooked function.
    #[must_use]
    pub fn function(&self) -> FnAddr {
        self.chain.function()
    }

    /// The callback this hook chains in.
    #[must_use]
    pub fn callback(&self) -> &NativeCallback {
        &self.callback
    }

    /// The ordering config this hook was registered with, if any.
    #[must_use]
    pub fn config(&self) -> Option<&DetourConfig> {
        self.config.as_ref()
    }

    /// This hook's slice of the function's current chain snapshot.
    ///
    /// `None` while the hook is not applied.
    #[must_use]
    pub fn detour_info(&self) -> Option<NativeDetourInfo> {
        if !self.is_applied() {
            return None;
        }
        self.chain
            .snapshot()
            .detours()
            .iter()
            .find(|detour| detour.callback() == &self.callback)
            .cloned()
    }
}

impl Drop for NativeHook {
    fn drop(&mut self) {
        if let Err(err) = self.dispose() {
            warn!(function = %self.chain.function(), error = %err, "failed to undo hook on drop");
        }
    }
}

impl fmt::Debug for NativeHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeHook")
            .field("function", &self.chain.function())
            .field("callback", &self.callback.name())
            .field("applied", &self.is_applied())
            .finish()
    }
}
