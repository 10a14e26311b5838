//! Per-target chain managers.
//!
//! Each detoured target, managed method or raw native function, gets exactly one chain
//! manager that owns its ordering state and its physical linkage. The two families
//! share the same skeleton: a dependency graph for configured detours, a newest-first
//! bucket for the rest, a version counter, and a rebuild that re-points links under the
//! target's gate. They differ in how the chain is wired: [`MethodChain`] re-points
//! per-node trampoline redirects, [`FunctionChain`] publishes successor callbacks into
//! shared cells.
//!
//! Managers are crate-internal; [`DetourRegistry`](crate::DetourRegistry) creates them
//! lazily and hands out [`Hook`](crate::Hook) handles bound to them.

mod function;
mod method;

pub(crate) use function::FunctionChain;
pub(crate) use method::MethodChain;

use crate::ordering::graph::NodeKey;

/// Where an applied detour lives within its chain.
#[derive(Debug, Clone, Copy)]
pub(crate) enum NodeSlot {
    /// In the dependency graph, under its config.
    Ordered(NodeKey),
    /// In the no-config bucket, identified by serial.
    Bucket(u64),
}
