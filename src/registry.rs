//! Process-scoped registry mapping targets to their chain managers.
//!
//! A [`DetourRegistry`] owns the per-target chain state for every method and native
//! function hooked through it, the shared trampoline pool, and the event sink. Chain
//! managers are created lazily on a target's first hook and live for the registry's
//! lifetime; separate registries are fully independent, so tests can run against
//! isolated instances instead of process-wide statics.
//!
//! The registry is constructed over the two injected collaborators: a
//! [`DetourRuntime`] that clones bodies and materializes stubs and proxies, and a
//! default [`DetourFactory`] that writes redirects. Individual hooks can override the
//! factory, explicitly or through the ambient [`DetourContext`](crate::DetourContext).
//!
//! # Examples
//!
//! ```rust,no_run
//! use hookchain::testing::MockRuntime;
//! use hookchain::{CodeRef, DetourConfig, DetourRegistry, Signature};
//!
//! let runtime = MockRuntime::new();
//! let registry = DetourRegistry::new(runtime.clone(), runtime.clone());
//!
//! let target = CodeRef::new("game::update", Signature::new("(f32) -> ()"));
//! let entry = CodeRef::new("mod::update_hook", Signature::new("(f32) -> ()"));
//! let hook = registry
//!     .build_hook(&target, &entry)
//!     .with_config(DetourConfig::new("mod.core").with_priority(10))
//!     .install()?;
//!
//! let info = registry.method_info(&target).unwrap();
//! assert_eq!(info.detour_count(), 1);
//! # drop(hook);
//! # Ok::<(), hookchain::Error>(())
//! ```

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use crate::{
    chain::{FunctionChain, MethodChain},
    context::DetourContext,
    events::{DetourEvent, EventMask, EventSink, EventSubscription},
    hook::{Hook, NativeHook},
    introspection::{FunctionDetourInfo, MethodDetourInfo},
    ordering::DetourConfig,
    runtime::{CodeRef, DetourFactory, DetourRuntime, FnAddr, NativeCallback},
    trampoline::{RemovedStubCache, TrampolinePool},
    Result,
};

/// Registry of detoured targets and the entry point for registering hooks.
pub struct DetourRegistry {
    runtime: Arc<dyn DetourRuntime>,
    factory: Arc<dyn DetourFactory>,
    pool: Arc<TrampolinePool>,
    removed_stubs: Arc<RemovedStubCache>,
    methods: DashMap<CodeRef, Arc<MethodChain>>,
    functions: DashMap<FnAddr, Arc<FunctionChain>>,
    events: Arc<EventSink>,
}

impl DetourRegistry {
    /// Creates an empty registry over the given collaborators.
    ///
    /// `factory` is the default used for hooks that neither carry an explicit factory
    /// nor find one in the ambient context.
    pub fn new(runtime: Arc<dyn DetourRuntime>, factory: Arc<dyn DetourFactory>) -> Self {
        let pool = TrampolinePool::new(Arc::clone(&runtime));
        let removed_stubs = RemovedStubCache::new(Arc::clone(&runtime));
        DetourRegistry {
            runtime,
            factory,
            pool,
            removed_stubs,
            methods: DashMap::new(),
            functions: DashMap::new(),
            events: EventSink::new(),
        }
    }

    /// Registers and applies a hook on a managed target with ambient defaults.
    ///
    /// Shorthand for [`build_hook`](DetourRegistry::build_hook) followed by
    /// [`install`](HookBuilder::install).
    ///
    /// # Errors
    ///
    /// Whatever hook installation reports; see [`HookBuilder::install`].
    pub fn hook(&self, target: &CodeRef, entry: &CodeRef) -> Result<Hook> {
        self.build_hook(target, entry).install()
    }

    /// Starts building a hook on a managed target.
    #[must_use]
    pub fn build_hook(&self, target: &CodeRef, entry: &CodeRef) -> HookBuilder<'_> {
        HookBuilder {
            registry: self,
            target: target.clone(),
            entry: entry.clone(),
            config: ConfigChoice::Ambient,
            factory: None,
            apply_by_default: true,
        }
    }

    /// Registers and applies a hook on a native function with ambient defaults.
    ///
    /// # Errors
    ///
    /// Whatever hook installation reports; see [`NativeHookBuilder::install`].
    pub fn hook_function(&self, function: FnAddr, callback: &NativeCallback) -> Result<NativeHook> {
        self.build_function_hook(function, callback).install()
    }

    /// Starts building a hook on a native function.
    #[must_use]
    pub fn build_function_hook(
        &self,
        function: FnAddr,
        callback: &NativeCallback,
    ) -> NativeHookBuilder<'_> {
        NativeHookBuilder {
            registry: self,
            function,
            callback: callback.clone(),
            config: ConfigChoice::Ambient,
            factory: None,
            apply_by_default: true,
        }
    }

    /// Snapshot of a managed target's chain, or `None` if it was never hooked here.
    ///
    /// Purely observational: unlike hook registration this never creates chain state
    /// for the target.
    #[must_use]
    pub fn method_info(&self, target: &CodeRef) -> Option<MethodDetourInfo> {
        let chain = Arc::clone(self.methods.get(target)?.value());
        Some(MethodChain::snapshot(&chain))
    }

    /// Snapshot of a native function's chain, or `None` if it was never hooked here.
    #[must_use]
    pub fn function_info(&self, function: FnAddr) -> Option<FunctionDetourInfo> {
        self.functions.get(&function).map(|chain| chain.snapshot())
    }

    /// Subscribes `handler` to chain events matching `mask`, for every target in this
    /// registry.
    ///
    /// Events are dispatched on the thread that mutated the chain, outside the chain's
    /// lock, so handlers may themselves register or undo hooks. The subscription lasts
    /// until the returned handle is dropped.
    pub fn on_event(
        &self,
        mask: EventMask,
        handler: impl Fn(&DetourEvent) + Send + Sync + 'static,
    ) -> EventSubscription {
        self.events.subscribe(mask, handler)
    }

    /// The shared trampoline pool backing this registry's managed hooks.
    #[must_use]
    pub fn trampoline_pool(&self) -> &Arc<TrampolinePool> {
        &self.pool
    }

    fn method_chain(&self, target: &CodeRef) -> Result<Arc<MethodChain>> {
        let chain = self
            .methods
            .entry(target.clone())
            .or_try_insert_with(|| {
                MethodChain::new(
                    target.clone(),
                    &self.runtime,
                    Arc::clone(&self.pool),
                    Arc::clone(&self.removed_stubs),
                    Arc::clone(&self.events),
                )
                .map(Arc::new)
            })?
            .clone();
        Ok(chain)
    }

    fn function_chain(&self, function: FnAddr) -> Result<Arc<FunctionChain>> {
        let chain = self
            .functions
            .entry(function)
            .or_try_insert_with(|| {
                FunctionChain::new(function, &self.runtime, Arc::clone(&self.events)).map(Arc::new)
            })?
            .clone();
        Ok(chain)
    }
}

impl fmt::Debug for DetourRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetourRegistry")
            .field("methods", &self.methods.len())
            .field("functions", &self.functions.len())
            .finish()
    }
}

/// How a builder resolves its ordering config.
enum ConfigChoice {
    /// Inherit from the ambient context, if any.
    Ambient,
    Explicit(DetourConfig),
    /// No config, even when the ambient context provides one.
    Suppressed,
}

/// Configures and installs a [`Hook`].
///
/// Created by [`DetourRegistry::build_hook`]. Settings not given explicitly come from
/// the ambient [`DetourContext`](crate::DetourContext), then the registry's defaults.
#[must_use = "the hook is only registered by install()"]
pub struct HookBuilder<'a> {
    registry: &'a DetourRegistry,
    target: CodeRef,
    entry: CodeRef,
    config: ConfigChoice,
    factory: Option<Arc<dyn DetourFactory>>,
    apply_by_default: bool,
}

impl HookBuilder<'_> {
    /// Uses `config` for chain ordering instead of the ambient default.
    #[must_use]
    pub fn with_config(mut self, config: DetourConfig) -> Self {
        self.config = ConfigChoice::Explicit(config);
        self
    }

    /// Registers the hook without a config, ignoring any ambient default.
    ///
    /// The hook joins the no-config bucket and runs after every configured detour.
    #[must_use]
    pub fn without_config(mut self) -> Self {
        self.config = ConfigChoice::Suppressed;
        self
    }

    /// Uses `factory` to write this hook's redirects instead of the ambient or
    /// registry default.
    #[must_use]
    pub fn with_factory(mut self, factory: Arc<dyn DetourFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Whether [`install`](HookBuilder::install) applies the hook immediately.
    ///
    /// Defaults to `true`; pass `false` to register a dormant hook and apply it later.
    #[must_use]
    pub fn apply_by_default(mut self, apply: bool) -> Self {
        self.apply_by_default = apply;
        self
    }

    /// Resolves the remaining settings and registers the hook.
    ///
    /// # Errors
    ///
    /// [`Error::Backend`](crate::Error::Backend) when creating the target's chain
    /// scaffolding fails, plus everything [`Hook::apply`] can report when the hook is
    /// applied immediately.
    pub fn install(self) -> Result<Hook> {
        let config = match self.config {
            ConfigChoice::Explicit(config) => Some(config),
            ConfigChoice::Ambient => DetourContext::current_config(),
            ConfigChoice::Suppressed => None,
        };
        let factory = self
            .factory
            .or_else(DetourContext::current_factory)
            .unwrap_or_else(|| Arc::clone(&self.registry.factory));

        trace!(method = %self.target, entry = %self.entry, "creating hook");
        let chain = self.registry.method_chain(&self.target)?;
        Hook::new(chain, self.entry, config, factory, self.apply_by_default)
    }
}

/// Configures and installs a [`NativeHook`].
///
/// Created by [`DetourRegistry::build_function_hook`]; resolution mirrors
/// [`HookBuilder`].
#[must_use = "the hook is only registered by install()"]
pub struct NativeHookBuilder<'a> {
    registry: &'a DetourRegistry,
    function: FnAddr,
    callback: NativeCallback,
    config: ConfigChoice,
    factory: Option<Arc<dyn DetourFactory>>,
    apply_by_default: bool,
}

impl NativeHookBuilder<'_> {
    /// Uses `config` for chain ordering instead of the ambient default.
    #[must_use]
    pub fn with_config(mut self, config: DetourConfig) -> Self {
        self.config = ConfigChoice::Explicit(config);
        self
    }

    /// Registers the hook without a config, ignoring any ambient default.
    #[must_use]
    pub fn without_config(mut self) -> Self {
        self.config = ConfigChoice::Suppressed;
        self
    }

    /// Uses `factory` to write this hook's redirects instead of the ambient or
    /// registry default.
    #[must_use]
    pub fn with_factory(mut self, factory: Arc<dyn DetourFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Whether [`install`](NativeHookBuilder::install) applies the hook immediately.
    #[must_use]
    pub fn apply_by_default(mut self, apply: bool) -> Self {
        self.apply_by_default = apply;
        self
    }

    /// Resolves the remaining settings and registers the hook.
    ///
    /// # Errors
    ///
    /// [`Error::Backend`](crate::Error::Backend) when creating the function's chain
    /// scaffolding fails, plus everything [`NativeHook::apply`] can report when the
    /// hook is applied immediately.
    pub fn install(self) -> Result<NativeHook> {
        let config = match self.config {
            ConfigChoice::Explicit(config) => Some(config),
            ConfigChoice::Ambient => DetourContext::current_config(),
            ConfigChoice::Suppressed => None,
        };
        let factory = self
            .factory
            .or_else(DetourContext::current_factory)
            .unwrap_or_else(|| Arc::clone(&self.registry.factory));

        trace!(function = %self.function, callback = self.callback.name(), "creating native hook");
        let chain = self.registry.function_chain(self.function)?;
        NativeHook::new(
            chain,
            self.callback,
            config,
            factory,
            self.apply_by_default,
        )
    }
}
