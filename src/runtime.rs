//! Injected collaborator seam for code generation and physical patching.
//!
//! The chain core never touches machine code. Everything that clones a method body,
//! materializes a stub, or writes a jump is reached through the traits in this module,
//! which a runtime backend implements and injects when constructing a
//! [`DetourRegistry`](crate::DetourRegistry). This is the seam that keeps the ordering and
//! synchronization logic portable across runtimes and architectures; the test suite drives
//! the whole crate through an in-memory implementation.
//!
//! # Key Components
//!
//! - [`DetourRuntime`]: Code materialization capabilities (clones, stubs, sync proxies)
//! - [`DetourFactory`]: Installs and removes physical redirects
//! - [`Redirect`] / [`NativeRedirect`]: Live redirect handles returned by the factory
//! - [`CodeRef`] / [`Signature`]: Identities of invocable code and of call shapes
//! - [`FnAddr`] / [`NativeCallback`] / [`ChainCell`]: Native-chain identities and the
//!   swap-published slots in-flight native calls read
//!
//! # Thread Safety
//!
//! All traits require `Send + Sync`: redirect installation happens under a per-target
//! lock, but proxies generated by the runtime are invoked concurrently from arbitrary
//! threads and may read [`ChainCell`]s while an update is swapping them.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::{sync::SyncGate, Result};

/// Identity of a call shape, used to key the trampoline pool.
///
/// Two stubs are interchangeable exactly when their signatures compare equal. The
/// descriptor text is opaque to this crate; backends are free to encode calling
/// convention, parameter types, and return type however they can compare cheaply.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Signature(Arc<str>);

impl Signature {
    /// Creates a signature from its backend-defined descriptor.
    pub fn new(descriptor: impl Into<Arc<str>>) -> Self {
        Signature(descriptor.into())
    }

    /// The backend-defined descriptor text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self.0)
    }
}

/// Identity of one piece of invocable code: a method, a stub, or a clone.
///
/// A `CodeRef` compares and hashes by *identity*, not by name: two refs are equal only
/// when they were produced by the same mint call (clones of a method are distinct from
/// it). Cloning the ref is cheap and yields the same identity.
#[derive(Clone)]
pub struct CodeRef {
    inner: Arc<CodeRefInner>,
}

struct CodeRefInner {
    name: String,
    signature: Signature,
}

impl CodeRef {
    /// Mints a new code identity with a debug name and a call signature.
    pub fn new(name: impl Into<String>, signature: Signature) -> Self {
        CodeRef {
            inner: Arc::new(CodeRefInner {
                name: name.into(),
                signature,
            }),
        }
    }

    /// The debug name this identity was minted with.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The call signature of the code behind this identity.
    #[must_use]
    pub fn signature(&self) -> &Signature {
        &self.inner.signature
    }
}

impl PartialEq for CodeRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for CodeRef {}

impl std::hash::Hash for CodeRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.inner) as usize).hash(state);
    }
}

impl fmt::Display for CodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.name)
    }
}

impl fmt::Debug for CodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodeRef({} : {})", self.inner.name, self.inner.signature)
    }
}

/// Raw entrypoint address of a native function.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FnAddr(usize);

impl FnAddr {
    /// Wraps a raw address.
    #[must_use]
    pub fn new(addr: usize) -> Self {
        FnAddr(addr)
    }

    /// The raw address value.
    #[must_use]
    pub fn addr(&self) -> usize {
        self.0
    }
}

impl fmt::Display for FnAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for FnAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FnAddr({:#x})", self.0)
    }
}

/// Identity of a callable hooked into a native function chain.
///
/// Callbacks that want to continue the chain declare `wants_next`: they accept the next
/// callable of the chain as a leading parameter, and the manager keeps the matching
/// [`ChainCell`] pointed at their current successor. Callbacks without it terminate the
/// visible chain. Compares and hashes by identity, like [`CodeRef`].
#[derive(Clone)]
pub struct NativeCallback {
    inner: Arc<NativeCallbackInner>,
}

struct NativeCallbackInner {
    name: String,
    wants_next: bool,
}

impl NativeCallback {
    /// Mints a new callback identity.
    pub fn new(name: impl Into<String>, wants_next: bool) -> Self {
        NativeCallback {
            inner: Arc::new(NativeCallbackInner {
                name: name.into(),
                wants_next,
            }),
        }
    }

    /// The debug name this callback was minted with.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether this callback accepts the next chain callable as a parameter.
    #[must_use]
    pub fn wants_next(&self) -> bool {
        self.inner.wants_next
    }
}

impl PartialEq for NativeCallback {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for NativeCallback {}

impl fmt::Debug for NativeCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeCallback({})", self.inner.name)
    }
}

/// Swap-published slot holding the next callable of a native chain position.
///
/// Rebuilds store new successors while in-flight calls concurrently load the slot, so
/// publication must be atomic; a caller either sees the complete old successor or the
/// complete new one, never a torn value.
#[derive(Default)]
pub struct ChainCell {
    slot: ArcSwapOption<NativeCallback>,
}

impl ChainCell {
    /// Creates an empty cell.
    #[must_use]
    pub fn new() -> Self {
        ChainCell {
            slot: ArcSwapOption::empty(),
        }
    }

    /// Publishes a new successor (or clears the slot).
    pub fn store(&self, next: Option<NativeCallback>) {
        self.slot.store(next.map(Arc::new));
    }

    /// Loads the current successor.
    #[must_use]
    pub fn load(&self) -> Option<NativeCallback> {
        self.slot.load_full().map(|cb| (*cb).clone())
    }
}

impl fmt::Debug for ChainCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChainCell({:?})", self.load())
    }
}

/// A live redirect between two pieces of managed code.
///
/// Returned by [`DetourFactory::create_detour`]. Dropping the handle without undoing it
/// leaves the redirect installed; the chain core always undoes redirects it owns before
/// releasing them.
pub trait Redirect: Send + Sync {
    /// The code whose entry is redirected.
    fn source(&self) -> &CodeRef;

    /// The code the source is redirected to.
    fn target(&self) -> &CodeRef;

    /// Installs the redirect.
    ///
    /// # Errors
    ///
    /// Backend failures propagate as [`Error::Backend`](crate::Error::Backend). Applying
    /// an already-applied redirect is a backend-defined error.
    fn apply(&mut self) -> Result<()>;

    /// Removes the redirect.
    ///
    /// # Errors
    ///
    /// Backend failures propagate as [`Error::Backend`](crate::Error::Backend). Undoing a
    /// redirect that is not applied is a backend-defined error.
    fn undo(&mut self) -> Result<()>;

    /// Whether the redirect is currently installed.
    fn is_applied(&self) -> bool;
}

/// A live redirect writing over a native function's prologue.
///
/// Backends that relocate the overwritten prologue expose the displaced original through
/// [`orig_entrypoint`](NativeRedirect::orig_entrypoint), which the chain uses as the
/// final fallback of a native chain.
pub trait NativeRedirect: Send + Sync {
    /// The redirected function.
    fn source(&self) -> FnAddr;

    /// The address calls are redirected to.
    fn target(&self) -> FnAddr;

    /// Callable address of the displaced original, when the backend preserves one.
    fn orig_entrypoint(&self) -> Option<FnAddr>;

    /// Installs the redirect.
    ///
    /// # Errors
    ///
    /// Backend failures propagate as [`Error::Backend`](crate::Error::Backend).
    fn apply(&mut self) -> Result<()>;

    /// Removes the redirect.
    ///
    /// # Errors
    ///
    /// Backend failures propagate as [`Error::Backend`](crate::Error::Backend).
    fn undo(&mut self) -> Result<()>;

    /// Whether the redirect is currently installed.
    fn is_applied(&self) -> bool;
}

/// Writes and removes physical redirects.
///
/// Every hook carries a factory (explicit, ambient, or the registry default), and each
/// link of a chain is re-pointed with the factory of the node best placed to know how:
/// the next node's, else the current node's, else the one whose mutation triggered the
/// update.
pub trait DetourFactory: Send + Sync {
    /// Creates a redirect from `source` to `target`, installing it first when `apply`
    /// is set.
    ///
    /// # Errors
    ///
    /// Backend failures propagate as [`Error::Backend`](crate::Error::Backend); the
    /// chain walk does not roll back links already re-pointed before the failure.
    fn create_detour(
        &self,
        source: &CodeRef,
        target: &CodeRef,
        apply: bool,
    ) -> Result<Box<dyn Redirect>>;

    /// Creates a native redirect from `source` to `target`, installing it first when
    /// `apply` is set.
    ///
    /// # Errors
    ///
    /// Backend failures propagate as [`Error::Backend`](crate::Error::Backend).
    fn create_native_detour(
        &self,
        source: FnAddr,
        target: FnAddr,
        apply: bool,
    ) -> Result<Box<dyn NativeRedirect>>;
}

/// Materializes invocable code on behalf of the chain core.
///
/// One runtime is injected per [`DetourRegistry`](crate::DetourRegistry) and shared by
/// every target registered through it.
pub trait DetourRuntime: Send + Sync {
    /// Clones a method body into an independently callable form.
    ///
    /// The clone becomes the end of the detour chain: the last detour's next-trampoline
    /// is re-pointed at it, so the original behavior stays reachable while the original
    /// entry is redirected into the chain.
    ///
    /// # Errors
    ///
    /// Backend failures propagate as [`Error::Backend`](crate::Error::Backend).
    fn clone_code(&self, source: &CodeRef) -> Result<CodeRef>;

    /// Materializes a fresh invocable stub with the given signature.
    ///
    /// Stubs are pooled by [`TrampolinePool`](crate::TrampolinePool); the runtime is only
    /// asked when the pool has nothing to recycle.
    ///
    /// # Errors
    ///
    /// Backend failures propagate as [`Error::Backend`](crate::Error::Backend).
    fn create_stub(&self, signature: &Signature) -> Result<CodeRef>;

    /// Materializes the per-signature stub that raises when invoked.
    ///
    /// Trampolines of removed detours are re-pointed here until they provably cannot be
    /// reached anymore. Cached per signature by the registry; the runtime is asked once.
    ///
    /// # Errors
    ///
    /// Backend failures propagate as [`Error::Backend`](crate::Error::Backend).
    fn create_removed_stub(&self, signature: &Signature) -> Result<CodeRef>;

    /// Emits the call-site wrapper guarding a managed target's chain.
    ///
    /// The wrapper must enter `gate` before invoking `continue_to`, exit it on all paths
    /// including unwinding, and flush the gate's stolen trampolines when its exit was the
    /// last active call.
    ///
    /// # Errors
    ///
    /// Backend failures propagate as [`Error::Backend`](crate::Error::Backend).
    fn create_sync_proxy(
        &self,
        original: &CodeRef,
        gate: &Arc<SyncGate>,
        continue_to: &CodeRef,
    ) -> Result<CodeRef>;

    /// Emits the native entrypoint guarding a native function's chain.
    ///
    /// The emitted code enters `gate`, loads the current first callback from `first` and
    /// invokes it, then exits the gate on all paths.
    ///
    /// # Errors
    ///
    /// Backend failures propagate as [`Error::Backend`](crate::Error::Backend).
    fn create_native_sync_proxy(
        &self,
        function: FnAddr,
        gate: &Arc<SyncGate>,
        first: &Arc<ChainCell>,
    ) -> Result<FnAddr>;

    /// Wraps a preserved native entrypoint as a callable chain callback.
    ///
    /// # Errors
    ///
    /// Backend failures propagate as [`Error::Backend`](crate::Error::Backend).
    fn callback_for_entrypoint(&self, entrypoint: FnAddr) -> Result<NativeCallback>;

    /// The callback stored into a removed chain position's next slot; raises when
    /// invoked.
    ///
    /// Stale references to a removed native hook's continuation reach this instead of a
    /// dangling callable. One shared callback is enough; it must not chain.
    ///
    /// # Errors
    ///
    /// Backend failures propagate as [`Error::Backend`](crate::Error::Backend).
    fn removed_callback(&self) -> Result<NativeCallback>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_ref_identity_not_name() {
        let sig = Signature::new("(i32) -> i32");
        let a = CodeRef::new("target", sig.clone());
        let b = CodeRef::new("target", sig);

        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_signature_compares_by_content() {
        assert_eq!(Signature::new("() -> ()"), Signature::new("() -> ()"));
        assert_ne!(Signature::new("() -> ()"), Signature::new("(u8) -> ()"));
    }

    #[test]
    fn test_chain_cell_swaps_successors() {
        let cell = ChainCell::new();
        assert!(cell.load().is_none());

        let cb = NativeCallback::new("hook", true);
        cell.store(Some(cb.clone()));
        assert_eq!(cell.load().as_ref(), Some(&cb));

        cell.store(None);
        assert!(cell.load().is_none());
    }
}
