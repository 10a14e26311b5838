//! # hookchain Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the hookchain library. Import this module to get quick access to the essential
//! types for registering and ordering detours.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all hookchain operations
pub use crate::Error;

/// The result type used throughout hookchain
pub use crate::Result;

// ================================================================================================
// Main Entry Points
// ================================================================================================

/// Registry of detoured targets and entry point for registering hooks
pub use crate::registry::{DetourRegistry, HookBuilder, NativeHookBuilder};

/// Disposable handles representing one registered detour each
pub use crate::hook::{Hook, NativeHook};

// ================================================================================================
// Ordering
// ================================================================================================

/// Ordering metadata attached to one detour
pub use crate::ordering::DetourConfig;

/// Record of a contradictory before+after declaration between two detours
pub use crate::ordering::OrderingConflict;

// ================================================================================================
// Target and Collaborator Identities
// ================================================================================================

/// Identities of managed code, native functions, and chain callbacks
pub use crate::runtime::{ChainCell, CodeRef, FnAddr, NativeCallback, Signature};

/// The injected collaborator seams the chain core is abstract over
pub use crate::runtime::{DetourFactory, DetourRuntime, NativeRedirect, Redirect};

// ================================================================================================
// Ambient Context
// ================================================================================================

/// Ambient defaults for hooks registered without explicit settings
pub use crate::context::{ContextScope, DetourContext};

// ================================================================================================
// Introspection and Events
// ================================================================================================

/// Point-in-time snapshots of a target's applied detours
pub use crate::introspection::{DetourInfo, FunctionDetourInfo, MethodDetourInfo, NativeDetourInfo};

/// Chain mutation notifications and subscription management
pub use crate::events::{DetourEvent, EventMask, EventSubscription, FunctionEvent, MethodEvent};

// ================================================================================================
// Trampolines
// ================================================================================================

/// The signature-keyed pool of invocable stubs backing managed hooks
pub use crate::trampoline::{Trampoline, TrampolinePool};
