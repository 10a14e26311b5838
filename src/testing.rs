//! In-memory runtime and factory for tests and examples.
//!
//! The chain core is abstract over [`DetourRuntime`] and [`DetourFactory`], so nothing
//! in this crate runs without a backend. [`MockRuntime`] is the reference backend: it
//! mints opaque [`CodeRef`]s instead of machine code and records redirects in tables
//! instead of writing jumps. The crate's own test-suite drives everything through it,
//! and downstream code can use it to test hook ordering and lifecycle logic without
//! patching anything real.
//!
//! [`trace_managed_call`] and [`trace_native_call`] simulate a call through the
//! recorded tables, entering the target's gate exactly like a generated proxy would,
//! and return the names of the chain positions the call would visit in order.
//!
//! # Examples
//!
//! ```rust,no_run
//! use hookchain::testing::MockRuntime;
//! use hookchain::{DetourRegistry, Signature, CodeRef};
//!
//! let runtime = MockRuntime::new();
//! let registry = DetourRegistry::new(runtime.clone(), runtime.clone());
//! let target = CodeRef::new("game::update", Signature::new("(f32) -> ()"));
//! let hook = CodeRef::new("mod::update_hook", Signature::new("(f32) -> ()"));
//! let _applied = registry.hook(&target, &hook)?;
//! # Ok::<(), hookchain::Error>(())
//! ```

use std::fmt;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, OnceLock,
};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::{
    introspection::{FunctionDetourInfo, MethodDetourInfo},
    runtime::{
        ChainCell, CodeRef, DetourFactory, DetourRuntime, FnAddr, NativeCallback, NativeRedirect,
        Redirect, Signature,
    },
    sync::SyncGate,
    Error, Result,
};

/// Gate and continuation recorded for a generated managed sync proxy.
#[derive(Clone)]
pub struct ProxyInfo {
    /// The gate the proxy brackets every call with.
    pub gate: Arc<SyncGate>,
    /// The code the proxy continues to after entering the gate.
    pub continue_to: CodeRef,
}

/// Gate and first-callback cell recorded for a generated native sync proxy.
#[derive(Clone)]
pub struct NativeProxyInfo {
    /// The gate the proxy brackets every call with.
    pub gate: Arc<SyncGate>,
    /// The cell the proxy loads its first callback from on every call.
    pub first: Arc<ChainCell>,
}

/// In-memory implementation of [`DetourRuntime`] and [`DetourFactory`].
///
/// Code identities are minted with readable debug names (`stub#3`, `target#clone1`,
/// `target#syncproxy`); redirects live in lookup tables a test can inspect through
/// [`resolve`](MockRuntime::resolve) and the counters. Applying two redirects with the
/// same source, or undoing one that is not applied, fails with
/// [`Error::Backend`]; real backends would corrupt code where the mock can catch the
/// bug instead.
pub struct MockRuntime {
    serial: AtomicUsize,
    next_fn_addr: AtomicUsize,
    redirects: Arc<DashMap<CodeRef, CodeRef>>,
    native_redirects: Arc<DashMap<FnAddr, FnAddr>>,
    proxies: DashMap<CodeRef, ProxyInfo>,
    native_proxies: DashMap<FnAddr, NativeProxyInfo>,
    orig_entrypoints: DashMap<FnAddr, FnAddr>,
    stubs_minted: AtomicUsize,
    clones_minted: AtomicUsize,
    removed_stubs_minted: AtomicUsize,
    detours_created: AtomicUsize,
    native_detours_created: AtomicUsize,
    removed_native: OnceLock<NativeCallback>,
    fail_next_detour: Mutex<Option<String>>,
}

impl MockRuntime {
    /// Creates a fresh backend with empty tables.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(MockRuntime {
            serial: AtomicUsize::new(1),
            next_fn_addr: AtomicUsize::new(0x1000),
            redirects: Arc::new(DashMap::new()),
            native_redirects: Arc::new(DashMap::new()),
            proxies: DashMap::new(),
            native_proxies: DashMap::new(),
            orig_entrypoints: DashMap::new(),
            stubs_minted: AtomicUsize::new(0),
            clones_minted: AtomicUsize::new(0),
            removed_stubs_minted: AtomicUsize::new(0),
            detours_created: AtomicUsize::new(0),
            native_detours_created: AtomicUsize::new(0),
            removed_native: OnceLock::new(),
            fail_next_detour: Mutex::new(None),
        })
    }

    fn next_serial(&self) -> usize {
        self.serial.fetch_add(1, Ordering::Relaxed)
    }

    /// Mints a unique native function address.
    #[must_use]
    pub fn mint_function(&self) -> FnAddr {
        FnAddr::new(self.next_fn_addr.fetch_add(0x10, Ordering::Relaxed))
    }

    /// Where `code` is currently redirected to, if anywhere.
    #[must_use]
    pub fn resolve(&self, code: &CodeRef) -> Option<CodeRef> {
        self.redirects.get(code).map(|entry| entry.value().clone())
    }

    /// Where native `function` is currently redirected to, if anywhere.
    #[must_use]
    pub fn resolve_native(&self, function: FnAddr) -> Option<FnAddr> {
        self.native_redirects
            .get(&function)
            .map(|entry| *entry.value())
    }

    /// The proxy record for a generated managed sync proxy.
    #[must_use]
    pub fn proxy_info(&self, proxy: &CodeRef) -> Option<ProxyInfo> {
        self.proxies.get(proxy).map(|entry| entry.value().clone())
    }

    /// The proxy record for a generated native sync proxy.
    #[must_use]
    pub fn native_proxy_info(&self, proxy: FnAddr) -> Option<NativeProxyInfo> {
        self.native_proxies
            .get(&proxy)
            .map(|entry| entry.value().clone())
    }

    /// The preserved original entrypoint minted for a detoured native function.
    #[must_use]
    pub fn orig_entrypoint_of(&self, function: FnAddr) -> Option<FnAddr> {
        self.orig_entrypoints
            .get(&function)
            .map(|entry| *entry.value())
    }

    /// Number of fresh stubs minted (recycled rents do not count).
    #[must_use]
    pub fn stubs_minted(&self) -> usize {
        self.stubs_minted.load(Ordering::Relaxed)
    }

    /// Number of method clones minted.
    #[must_use]
    pub fn clones_minted(&self) -> usize {
        self.clones_minted.load(Ordering::Relaxed)
    }

    /// Number of removed stubs minted.
    #[must_use]
    pub fn removed_stubs_minted(&self) -> usize {
        self.removed_stubs_minted.load(Ordering::Relaxed)
    }

    /// Number of managed redirects created by the factory.
    #[must_use]
    pub fn detours_created(&self) -> usize {
        self.detours_created.load(Ordering::Relaxed)
    }

    /// Number of native redirects created by the factory.
    #[must_use]
    pub fn native_detours_created(&self) -> usize {
        self.native_detours_created.load(Ordering::Relaxed)
    }

    /// Number of managed redirects currently applied.
    #[must_use]
    pub fn applied_redirects(&self) -> usize {
        self.redirects.len()
    }

    /// Makes the next factory call fail with [`Error::Backend`] carrying `message`.
    pub fn fail_next_detour(&self, message: impl Into<String>) {
        *self.fail_next_detour.lock() = Some(message.into());
    }

    fn take_injected_failure(&self) -> Option<String> {
        self.fail_next_detour.lock().take()
    }
}

impl fmt::Debug for MockRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockRuntime")
            .field("applied_redirects", &self.redirects.len())
            .field("applied_native_redirects", &self.native_redirects.len())
            .field("detours_created", &self.detours_created())
            .finish()
    }
}

impl DetourRuntime for MockRuntime {
    fn clone_code(&self, source: &CodeRef) -> Result<CodeRef> {
        self.clones_minted.fetch_add(1, Ordering::Relaxed);
        Ok(CodeRef::new(
            format!("{}#clone{}", source.name(), self.next_serial()),
            source.signature().clone(),
        ))
    }

    fn create_stub(&self, signature: &Signature) -> Result<CodeRef> {
        self.stubs_minted.fetch_add(1, Ordering::Relaxed);
        Ok(CodeRef::new(
            format!("stub#{}", self.next_serial()),
            signature.clone(),
        ))
    }

    fn create_removed_stub(&self, signature: &Signature) -> Result<CodeRef> {
        self.removed_stubs_minted.fetch_add(1, Ordering::Relaxed);
        Ok(CodeRef::new(
            format!("removed#{}", self.next_serial()),
            signature.clone(),
        ))
    }

    fn create_sync_proxy(
        &self,
        original: &CodeRef,
        gate: &Arc<SyncGate>,
        continue_to: &CodeRef,
    ) -> Result<CodeRef> {
        let proxy = CodeRef::new(
            format!("{}#syncproxy", original.name()),
            original.signature().clone(),
        );
        self.proxies.insert(
            proxy.clone(),
            ProxyInfo {
                gate: Arc::clone(gate),
                continue_to: continue_to.clone(),
            },
        );
        Ok(proxy)
    }

    fn create_native_sync_proxy(
        &self,
        function: FnAddr,
        gate: &Arc<SyncGate>,
        first: &Arc<ChainCell>,
    ) -> Result<FnAddr> {
        let _ = function;
        let proxy = self.mint_function();
        self.native_proxies.insert(
            proxy,
            NativeProxyInfo {
                gate: Arc::clone(gate),
                first: Arc::clone(first),
            },
        );
        Ok(proxy)
    }

    fn callback_for_entrypoint(&self, entrypoint: FnAddr) -> Result<NativeCallback> {
        Ok(NativeCallback::new(format!("orig@{entrypoint}"), false))
    }

    fn removed_callback(&self) -> Result<NativeCallback> {
        Ok(self
            .removed_native
            .get_or_init(|| NativeCallback::new("removed", false))
            .clone())
    }
}

impl DetourFactory for MockRuntime {
    fn create_detour(
        &self,
        source: &CodeRef,
        target: &CodeRef,
        apply: bool,
    ) -> Result<Box<dyn Redirect>> {
        if let Some(message) = self.take_injected_failure() {
            return Err(Error::Backend(message));
        }
        self.detours_created.fetch_add(1, Ordering::Relaxed);
        let mut redirect = MockRedirect {
            table: Arc::clone(&self.redirects),
            source: source.clone(),
            target: target.clone(),
            applied: false,
        };
        if apply {
            redirect.apply()?;
        }
        Ok(Box::new(redirect))
    }

    fn create_native_detour(
        &self,
        source: FnAddr,
        target: FnAddr,
        apply: bool,
    ) -> Result<Box<dyn NativeRedirect>> {
        if let Some(message) = self.take_injected_failure() {
            return Err(Error::Backend(message));
        }
        self.native_detours_created.fetch_add(1, Ordering::Relaxed);
        let orig = *self
            .orig_entrypoints
            .entry(source)
            .or_insert_with(|| self.mint_function());
        let mut redirect = MockNativeRedirect {
            table: Arc::clone(&self.native_redirects),
            source,
            target,
            orig,
            applied: false,
        };
        if apply {
            redirect.apply()?;
        }
        Ok(Box::new(redirect))
    }
}

struct MockRedirect {
    table: Arc<DashMap<CodeRef, CodeRef>>,
    source: CodeRef,
    target: CodeRef,
    applied: bool,
}

impl Redirect for MockRedirect {
    fn source(&self) -> &CodeRef {
        &self.source
    }

    fn target(&self) -> &CodeRef {
        &self.target
    }

    fn apply(&mut self) -> Result<()> {
        if self.applied {
            return Err(Error::Backend(format!(
                "redirect {} -> {} is already applied",
                self.source, self.target
            )));
        }
        match self.table.entry(self.source.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::Backend(format!(
                "{} is already redirected elsewhere",
                self.source
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(self.target.clone());
                self.applied = true;
                Ok(())
            }
        }
    }

    fn undo(&mut self) -> Result<()> {
        if !self.applied {
            return Err(Error::Backend(format!(
                "redirect {} -> {} is not applied",
                self.source, self.target
            )));
        }
        self.table.remove(&self.source);
        self.applied = false;
        Ok(())
    }

    fn is_applied(&self) -> bool {
        self.applied
    }
}

struct MockNativeRedirect {
    table: Arc<DashMap<FnAddr, FnAddr>>,
    source: FnAddr,
    target: FnAddr,
    orig: FnAddr,
    applied: bool,
}

impl NativeRedirect for MockNativeRedirect {
    fn source(&self) -> FnAddr {
        self.source
    }

    fn target(&self) -> FnAddr {
        self.target
    }

    fn orig_entrypoint(&self) -> Option<FnAddr> {
        Some(self.orig)
    }

    fn apply(&mut self) -> Result<()> {
        if self.applied {
            return Err(Error::Backend(format!(
                "native redirect {} -> {} is already applied",
                self.source, self.target
            )));
        }
        match self.table.entry(self.source) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::Backend(format!(
                "{} is already redirected elsewhere",
                self.source
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(self.target);
                self.applied = true;
                Ok(())
            }
        }
    }

    fn undo(&mut self) -> Result<()> {
        if !self.applied {
            return Err(Error::Backend(format!(
                "native redirect {} -> {} is not applied",
                self.source, self.target
            )));
        }
        self.table.remove(&self.source);
        self.applied = false;
        Ok(())
    }

    fn is_applied(&self) -> bool {
        self.applied
    }
}

/// Simulates one call into a managed target and returns the names visited, in order.
///
/// Follows the recorded redirects the way real execution would: the target's entry
/// resolves to its sync proxy, the proxy's gate is entered for the duration of the
/// walk, and each detour continues through its next-trampoline. The final element is
/// the end-of-chain clone. Returns an empty list when the target is not detoured.
///
/// # Errors
///
/// Propagates [`Error::ChainUpdateReentrancy`] when the calling thread is updating this
/// target's chain, exactly as a real call would; returns [`Error::Backend`] when the
/// recorded linkage is malformed.
pub fn trace_managed_call(runtime: &MockRuntime, info: &MethodDetourInfo) -> Result<Vec<String>> {
    let Some(proxy) = runtime.resolve(info.target()) else {
        return Ok(Vec::new());
    };
    let proxy_info = runtime.proxy_info(&proxy).ok_or_else(|| {
        Error::Backend(format!("{} is not redirected to a sync proxy", info.target()))
    })?;
    let _call = proxy_info.gate.enter()?;

    let detours = info.detours();
    let mut names = Vec::new();
    let mut trampoline = proxy_info.continue_to;
    loop {
        let Some(code) = runtime.resolve(&trampoline) else {
            return Err(Error::Backend(format!("{trampoline} is not linked")));
        };
        names.push(code.name().to_string());
        match detours.iter().find(|detour| detour.entry() == &code) {
            Some(detour) => trampoline = detour.next_trampoline().clone(),
            None => break,
        }
    }
    Ok(names)
}

/// Simulates one call into a native function and returns the names visited, in order.
///
/// Enters the function's gate, loads the first callback from its published cell and
/// follows each chaining callback's next cell. The walk ends at the first callback
/// that does not chain; when the chain is intact that is the preserved original.
/// Returns an empty list when the function is not detoured.
///
/// # Errors
///
/// Propagates [`Error::ChainUpdateReentrancy`] when the calling thread is updating this
/// function's chain; returns [`Error::Backend`] when the recorded linkage is malformed.
pub fn trace_native_call(runtime: &MockRuntime, info: &FunctionDetourInfo) -> Result<Vec<String>> {
    let Some(proxy) = runtime.resolve_native(info.function()) else {
        return Ok(Vec::new());
    };
    let proxy_info = runtime.native_proxy_info(proxy).ok_or_else(|| {
        Error::Backend(format!(
            "{} is not redirected to a native sync proxy",
            info.function()
        ))
    })?;
    let _call = proxy_info.gate.enter()?;

    let detours = info.detours();
    let mut names = Vec::new();
    let mut current = proxy_info.first.load();
    while let Some(callback) = current {
        names.push(callback.name().to_string());
        if !callback.wants_next() {
            break;
        }
        match detours.iter().find(|detour| detour.callback() == &callback) {
            Some(detour) => current = detour.next(),
            None => break,
        }
    }
    Ok(names)
}
