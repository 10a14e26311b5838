//! Ambient defaults for hook registration.
//!
//! A [`DetourContext`] carries an optional default [`DetourConfig`] and an optional
//! default [`DetourFactory`]. Pushing one onto the current thread's context stack makes
//! those defaults apply to every hook registered without explicit settings while the
//! returned [`ContextScope`] is alive; dropping the scope restores the previous
//! defaults, on every exit path. A process-wide fallback context can be installed with
//! [`DetourContext::set_global`] for hooks registered on threads with an empty stack.
//!
//! Resolution walks the thread's stack top-down and takes the first context that
//! provides the requested default, then consults the global context. A context can
//! provide "no config" explicitly via [`without_config`](DetourContext::without_config),
//! which shadows any config an outer scope would have supplied.
//!
//! # Examples
//!
//! ```rust
//! use hookchain::{DetourConfig, DetourContext};
//!
//! let ctx = DetourContext::new().with_config(DetourConfig::new("mod.core").with_priority(10));
//! {
//!     let _scope = ctx.push();
//!     // hooks registered here without a config inherit "mod.core"
//!     assert_eq!(DetourContext::current_config().map(|c| c.id().to_string()),
//!                Some("mod.core".to_string()));
//! }
//! assert!(DetourContext::current_config().is_none());
//! ```

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use arc_swap::ArcSwapOption;

use crate::{ordering::DetourConfig, runtime::DetourFactory};

/// What a context says about the default config.
#[derive(Clone)]
enum ConfigDefault {
    /// Use this config.
    Set(DetourConfig),
    /// Use no config, even if an outer scope provides one.
    Cleared,
}

/// A bundle of ambient defaults for hooks registered while it is active.
///
/// Contexts are immutable values; activate one with [`push`](DetourContext::push) or
/// install it globally with [`set_global`](DetourContext::set_global).
#[derive(Clone, Default)]
pub struct DetourContext {
    config: Option<ConfigDefault>,
    factory: Option<Arc<dyn DetourFactory>>,
}

struct ScopeEntry {
    token: u64,
    context: DetourContext,
    active: bool,
}

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<ScopeEntry>> = const { RefCell::new(Vec::new()) };
}

static GLOBAL_CONTEXT: ArcSwapOption<DetourContext> = ArcSwapOption::const_empty();
static NEXT_SCOPE_TOKEN: AtomicU64 = AtomicU64::new(1);

impl DetourContext {
    /// Creates a context that provides no defaults.
    #[must_use]
    pub fn new() -> Self {
        DetourContext::default()
    }

    /// Returns a copy of this context that provides `config` as the default.
    #[must_use]
    pub fn with_config(mut self, config: DetourConfig) -> Self {
        self.config = Some(ConfigDefault::Set(config));
        self
    }

    /// Returns a copy of this context that resolves to no config.
    ///
    /// Unlike a context that simply does not provide a config, this stops the lookup:
    /// hooks registered under it get no config even when an outer scope or the global
    /// context would have supplied one.
    #[must_use]
    pub fn without_config(mut self) -> Self {
        self.config = Some(ConfigDefault::Cleared);
        self
    }

    /// Returns a copy of this context that provides `factory` as the default.
    #[must_use]
    pub fn with_factory(mut self, factory: Arc<dyn DetourFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// The config this context provides, if any.
    #[must_use]
    pub fn config(&self) -> Option<&DetourConfig> {
        match &self.config {
            Some(ConfigDefault::Set(config)) => Some(config),
            _ => None,
        }
    }

    /// The factory this context provides, if any.
    #[must_use]
    pub fn factory(&self) -> Option<&Arc<dyn DetourFactory>> {
        self.factory.as_ref()
    }

    /// Pushes this context onto the current thread's stack.
    ///
    /// The context stays active until the returned scope is dropped. Scopes may be
    /// dropped out of order; a scope dropped early stops resolving immediately, and the
    /// stack storage is reclaimed once the scopes above it are gone.
    pub fn push(self) -> ContextScope {
        let token = NEXT_SCOPE_TOKEN.fetch_add(1, Ordering::Relaxed);
        CONTEXT_STACK.with(|stack| {
            stack.borrow_mut().push(ScopeEntry {
                token,
                context: self,
                active: true,
            });
        });
        ContextScope {
            token,
            _not_send: PhantomData,
        }
    }

    /// Replaces the process-wide fallback context, returning the previous one.
    ///
    /// The global context is consulted only when no scope on the calling thread's stack
    /// provides the requested default. Pass `None` to remove it.
    pub fn set_global(context: Option<DetourContext>) -> Option<DetourContext> {
        GLOBAL_CONTEXT
            .swap(context.map(Arc::new))
            .map(|previous| (*previous).clone())
    }

    /// The default config at the current location, if any.
    #[must_use]
    pub fn current_config() -> Option<DetourConfig> {
        let provided = CONTEXT_STACK.with(|stack| {
            stack
                .borrow()
                .iter()
                .rev()
                .filter(|entry| entry.active)
                .find_map(|entry| entry.context.config.clone())
        });
        match provided.or_else(|| {
            GLOBAL_CONTEXT
                .load_full()
                .and_then(|context| context.config.clone())
        }) {
            Some(ConfigDefault::Set(config)) => Some(config),
            _ => None,
        }
    }

    /// The default factory at the current location, if any.
    #[must_use]
    pub fn current_factory() -> Option<Arc<dyn DetourFactory>> {
        CONTEXT_STACK
            .with(|stack| {
                stack
                    .borrow()
                    .iter()
                    .rev()
                    .filter(|entry| entry.active)
                    .find_map(|entry| entry.context.factory.clone())
            })
            .or_else(|| {
                GLOBAL_CONTEXT
                    .load_full()
                    .and_then(|context| context.factory.clone())
            })
    }
}

impl fmt::Debug for DetourContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetourContext")
            .field("config", &self.config())
            .field("has_factory", &self.factory.is_some())
            .finish()
    }
}

/// Keeps a pushed [`DetourContext`] active on its thread until dropped.
#[must_use = "dropping the scope immediately deactivates the context"]
pub struct ContextScope {
    token: u64,
    // Scopes belong to the thread whose stack they were pushed on.
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(entry) = stack.iter_mut().find(|entry| entry.token == self.token) {
                entry.active = false;
            }
            while stack.last().is_some_and(|entry| !entry.active) {
                stack.pop();
            }
        });
    }
}

impl fmt::Debug for ContextScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextScope")
            .field("token", &self.token)
            .finish()
    }
}
