//! Deterministic ordering of competing detours.
//!
//! Every detour can carry a [`DetourConfig`] describing its identity, an optional numeric
//! priority, and the ids of other detours it must run before or after. This module turns a
//! set of such configs into one total order: priority and insertion order form the default
//! sequence, and explicit before/after constraints override it through a dependency graph
//! with cycle detection.
//!
//! # Key Components
//!
//! - [`DetourConfig`]: Immutable ordering metadata attached to one detour
//! - [`OrderingConflict`]: Record of a contradictory before+after declaration between two detours
//! - [`DependencyGraph`](graph::DependencyGraph): Arena-backed graph producing the realized order
//!
//! # Ordering Rules
//!
//! - **Priority**: Higher priority runs earlier; detours without a priority run after all
//!   detours that have one.
//! - **Ties**: Equal priorities keep insertion order; `sub_priority` refines ties among
//!   equal priorities, higher first.
//! - **Constraints**: `before`/`after` relations override priorities by forcing local
//!   reordering. A cyclic constraint set is a configuration bug and is reported as
//!   [`Error::OrderingCycle`](crate::Error::OrderingCycle).
//! - **Contradictions**: A pair related in both directions resolves in favor of `before`
//!   and records an [`OrderingConflict`].
//!
//! # Examples
//!
//! ```rust
//! use hookchain::DetourConfig;
//!
//! let config = DetourConfig::new("inventory.overhaul")
//!     .with_priority(100)
//!     .add_before("inventory.display")
//!     .add_after("core.init");
//!
//! assert_eq!(config.id(), "inventory.overhaul");
//! assert_eq!(config.priority(), Some(100));
//! ```

mod config;
pub(crate) mod graph;

pub use config::DetourConfig;
pub use graph::OrderingConflict;
