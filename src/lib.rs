// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![deny(unsafe_code)]
#![allow(dead_code)]
#![allow(clippy::too_many_arguments)]

//! # hookchain
//!
//! [![Crates.io](https://img.shields.io/crates/v/hookchain.svg)](https://crates.io/crates/hookchain)
//! [![Documentation](https://docs.rs/hookchain/badge.svg)](https://docs.rs/hookchain)
//! ![License](https://img.shields.io/badge/license-Apache--2.0-blue.svg)
//!
//! A deterministic detour-chain manager for hot-patching frameworks. `hookchain` tracks
//! every active patch on a method or native function, orders competing patches through a
//! dependency graph of before/after/priority constraints, and rewrites the live call
//! chain without racing in-flight calls. The machinery that physically writes redirects
//! and materializes stubs is injected through two small traits, so the ordering and
//! synchronization core stays portable across runtimes and architectures.
//!
//! ## Features
//!
//! - **🔗 Deterministic ordering** - Priorities, before/after constraints, and cycle
//!   detection produce one reproducible chain order per target
//! - **🚦 Safe live rebuilds** - A per-target spin gate drains in-flight calls before
//!   pointers move; no call ever observes a half-linked chain
//! - **♻️ Trampoline lifecycle** - Pooled, signature-keyed stubs with ownership
//!   stealing, so removing a patch never frees code a stale caller might still reach
//! - **🎯 Two chain families** - Managed targets chained through trampolines, native
//!   functions chained through published callback cells
//! - **🧪 Isolated registries** - No process-wide statics; every [`DetourRegistry`] is
//!   independent, and the bundled [`testing`] backend runs the whole core in memory
//! - **📣 Events and introspection** - Applied/undone notifications and point-in-time
//!   chain snapshots per target
//!
//! ## Quick Start
//!
//! Add `hookchain` to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! hookchain = "0.1"
//! ```
//!
//! ### Using the Prelude
//!
//! For convenient access to the most commonly used types, import the prelude:
//!
//! ```rust,no_run
//! use hookchain::prelude::*;
//! use hookchain::testing::MockRuntime;
//!
//! let runtime = MockRuntime::new();
//! let registry = DetourRegistry::new(runtime.clone(), runtime.clone());
//!
//! let target = CodeRef::new("game::update", Signature::new("(f32) -> ()"));
//! let entry = CodeRef::new("mod::update_hook", Signature::new("(f32) -> ()"));
//! let hook = registry.hook(&target, &entry)?;
//! assert!(hook.is_applied());
//! # Ok::<(), hookchain::Error>(())
//! ```
//!
//! ### Ordered Patches
//!
//! ```rust,no_run
//! use hookchain::prelude::*;
//! use hookchain::testing::MockRuntime;
//!
//! let runtime = MockRuntime::new();
//! let registry = DetourRegistry::new(runtime.clone(), runtime.clone());
//! let target = CodeRef::new("game::render", Signature::new("() -> ()"));
//!
//! // "overlay" runs ahead of "theme" regardless of their priorities.
//! let theme = registry
//!     .build_hook(&target, &CodeRef::new("theme::render", target.signature().clone()))
//!     .with_config(DetourConfig::new("ui.theme").with_priority(10))
//!     .install()?;
//! let overlay = registry
//!     .build_hook(&target, &CodeRef::new("overlay::render", target.signature().clone()))
//!     .with_config(DetourConfig::new("ui.overlay").add_before("ui.theme"))
//!     .install()?;
//!
//! let info = registry.method_info(&target).unwrap();
//! let order: Vec<_> = info.detours().iter().map(|d| d.entry().name().to_string()).collect();
//! assert_eq!(order, ["overlay::render", "theme::render"]);
//! # drop((theme, overlay));
//! # Ok::<(), hookchain::Error>(())
//! ```
//!
//! ## Architecture
//!
//! `hookchain` is organized into several key modules:
//!
//! - [`prelude`] - Convenient re-exports of commonly used types and traits
//! - [`registry`] - Per-target chain state, hook registration, and builders
//! - [`hook`] - Disposable handles with idempotent apply/undo/dispose
//! - [`ordering`] - Configs, the dependency graph, and conflict records
//! - [`sync`] - The per-target gate coordinating calls with chain rebuilds
//! - [`trampoline`] - The signature-keyed stub pool and stolen-stub quarantine
//! - [`runtime`] - The injected collaborator traits and code identities
//! - [`context`] - Ambient default config/factory scopes
//! - [`events`] / [`introspection`] - Notifications and chain snapshots
//! - [`testing`] - The in-memory reference backend and call tracers
//!
//! ## Error Handling
//!
//! All operations return [`Result<T, Error>`](Result) with comprehensive error
//! information:
//!
//! ```rust,no_run
//! use hookchain::{CodeRef, DetourRegistry, Error, Signature};
//! use hookchain::testing::MockRuntime;
//!
//! # let runtime = MockRuntime::new();
//! # let registry = DetourRegistry::new(runtime.clone(), runtime.clone());
//! # let target = CodeRef::new("t", Signature::new("() -> ()"));
//! # let entry = CodeRef::new("e", Signature::new("() -> ()"));
//! match registry.hook(&target, &entry) {
//!     Ok(hook) => println!("hook applied: {:?}", hook),
//!     Err(Error::OrderingCycle { id }) => println!("cyclic constraints at '{id}'"),
//!     Err(Error::ChainUpdateReentrancy) => println!("called from inside the target"),
//!     Err(e) => println!("other error: {e}"),
//! }
//! ```
//!
//! ## Testing
//!
//! The crate never patches anything by itself, so the whole test suite runs against the
//! in-memory backend:
//!
//! ```bash
//! cargo test
//! cargo bench  # chain rebuild and gate throughput benchmarks
//! ```

mod chain;
pub(crate) mod error;

/// Convenient re-exports of the most commonly used types and traits.
///
/// This module provides a curated selection of the most frequently used types
/// from across the hookchain library, allowing for convenient glob imports.
///
/// # Example
///
/// ```rust,no_run
/// use hookchain::prelude::*;
/// use hookchain::testing::MockRuntime;
///
/// let runtime = MockRuntime::new();
/// let registry = DetourRegistry::new(runtime.clone(), runtime.clone());
/// # let _ = registry;
/// ```
pub mod prelude;

/// Ambient default config and factory scopes.
///
/// Lets callers push defaults that hooks registered without explicit settings inherit,
/// with RAII-guaranteed restoration. See [`DetourContext`].
pub mod context;

/// Chain mutation notifications.
///
/// Registries broadcast an event after every successful apply or undo; subscribe with
/// [`DetourRegistry::on_event`] filtered by [`EventMask`].
pub mod events;

/// Point-in-time snapshots of a target's detour chain.
///
/// [`MethodDetourInfo`] and [`FunctionDetourInfo`] enumerate the applied detours in
/// effective run order, together with the recorded ordering conflicts and live gate
/// observations.
pub mod introspection;

/// Deterministic ordering of competing detours.
///
/// [`DetourConfig`] carries one detour's identity, priority, and before/after
/// constraints; the module's dependency graph turns the configs applied to one target
/// into a single total order, detecting cycles and logging contradictions.
pub mod ordering;

/// Per-target chain state and hook registration.
///
/// [`DetourRegistry`] is the entry point of the crate: it maps each hooked method or
/// native function to its chain manager and hands out [`Hook`]/[`NativeHook`] handles.
pub mod registry;

/// Disposable hook handles.
///
/// Each handle owns one registered detour and supports idempotent
/// [`apply`](Hook::apply), [`undo`](Hook::undo), and [`dispose`](Hook::dispose).
pub mod hook;

/// The injected collaborator seams and code identities.
///
/// Everything that physically touches code lives behind [`DetourRuntime`] (cloning,
/// stub and proxy materialization) and [`DetourFactory`] (redirect writing); the chain
/// core manipulates opaque [`CodeRef`]/[`FnAddr`] identities only.
pub mod runtime;

/// Per-target synchronization between calls and chain rebuilds.
///
/// [`SyncGate`] counts in-flight calls and lets a rebuild drain them before pointers
/// move; generated sync proxies bracket every call with it.
pub mod sync;

/// The in-memory reference backend.
///
/// [`testing::MockRuntime`] implements both collaborator traits over lookup tables so
/// ordering, lifecycle, and synchronization logic can be exercised without patching any
/// real code.
pub mod testing;

/// Pooled, signature-keyed invocable stubs.
///
/// Managed hooks rent a [`Trampoline`] per application; removed hooks' trampolines are
/// quarantined until provably unused and then recycled.
pub mod trampoline;

/// `hookchain` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always
/// [`Error`]. This is used consistently throughout the crate for all fallible
/// operations.
///
/// # Examples
///
/// ```rust,no_run
/// use hookchain::{DetourRegistry, Hook, Result, CodeRef};
///
/// fn install(registry: &DetourRegistry, target: &CodeRef, entry: &CodeRef) -> Result<Hook> {
///     registry.hook(target, entry)
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;

/// `hookchain` Error type
///
/// The main error type for all operations in this crate. Covers ordering configuration
/// errors, chain mutation errors, handle misuse, and failures reported by the injected
/// collaborators.
///
/// # Examples
///
/// ```rust,no_run
/// use hookchain::{DetourConfig, Error};
///
/// # fn add(_: &DetourConfig) -> Result<(), Error> { Ok(()) }
/// match add(&DetourConfig::new("mod.a").add_before("mod.b")) {
///     Ok(()) => println!("applied"),
///     Err(Error::OrderingCycle { id }) => println!("cycle at '{id}'"),
///     Err(e) => println!("error: {e}"),
/// }
/// ```
pub use error::Error;

/// Main entry point for registering and introspecting detours.
///
/// See [`registry::DetourRegistry`] for hook registration, chain snapshots, and event
/// subscriptions.
///
/// # Example
///
/// ```rust,no_run
/// use hookchain::{CodeRef, DetourRegistry, Signature};
/// use hookchain::testing::MockRuntime;
///
/// let runtime = MockRuntime::new();
/// let registry = DetourRegistry::new(runtime.clone(), runtime.clone());
/// let target = CodeRef::new("game::tick", Signature::new("() -> ()"));
/// let hook = registry.hook(&target, &CodeRef::new("mod::tick", target.signature().clone()))?;
/// assert!(hook.is_applied());
/// # Ok::<(), hookchain::Error>(())
/// ```
pub use registry::DetourRegistry;

/// Disposable handles representing one registered detour each.
pub use hook::{Hook, NativeHook};

/// Ordering metadata attached to one detour.
///
/// # Example
///
/// ```rust
/// use hookchain::DetourConfig;
///
/// let config = DetourConfig::new("ui.overlay").with_priority(50).add_before("ui.theme");
/// assert_eq!(config.before(), ["ui.theme"]);
/// ```
pub use ordering::{DetourConfig, OrderingConflict};

/// Identities the chain core manipulates in place of real code.
///
/// [`CodeRef`] names a piece of managed code with its [`Signature`]; [`FnAddr`] is a raw
/// native entrypoint; [`NativeCallback`] is one native chain participant.
pub use runtime::{CodeRef, FnAddr, NativeCallback, Signature};

/// The injected collaborator seams.
pub use runtime::{DetourFactory, DetourRuntime};

/// Ambient defaults for hooks registered without explicit settings.
pub use context::{ContextScope, DetourContext};

/// Chain mutation notifications and their subscription mask.
pub use events::{DetourEvent, EventMask, EventSubscription};

/// Point-in-time snapshots of a target's applied detours.
pub use introspection::{DetourInfo, FunctionDetourInfo, MethodDetourInfo, NativeDetourInfo};

/// The per-target call/rebuild gate, exposed for [`DetourRuntime`] implementors.
pub use sync::SyncGate;

/// Pooled invocable stubs and the pool managing them.
pub use trampoline::{Trampoline, TrampolinePool};
