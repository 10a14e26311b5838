//! Registry-level notifications for detour lifecycle changes.
//!
//! Handlers subscribe on a [`DetourRegistry`](crate::DetourRegistry) with an
//! [`EventMask`] selecting the kinds they care about and receive a [`DetourEvent`] per
//! matching mutation. Events are dispatched *after* the per-target lock is released, so
//! a handler may inspect the registry or even mutate other targets; what it observes is
//! the state after the mutation it is being told about, or later.
//!
//! # Key Components
//!
//! - [`EventMask`]: Bitflags selecting event kinds at subscription time
//! - [`DetourEvent`]: The notification payload, one variant per kind
//! - [`EventSubscription`]: RAII handle; dropping it unsubscribes
//!
//! # Examples
//!
//! ```rust,no_run
//! use hookchain::{DetourEvent, EventMask};
//! # use hookchain::testing::MockRuntime;
//! # let runtime = MockRuntime::new();
//! # let registry = hookchain::DetourRegistry::new(runtime.clone(), runtime);
//! let subscription = registry.on_event(EventMask::DETOUR_APPLIED, |event| {
//!     if let DetourEvent::DetourApplied(applied) = event {
//!         println!("{} hooked by {}", applied.target, applied.entry);
//!     }
//! });
//! // handlers run until the subscription is dropped
//! drop(subscription);
//! ```

use std::fmt;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

use bitflags::bitflags;
use crossbeam_skiplist::SkipMap;

use crate::{
    ordering::DetourConfig,
    runtime::{CodeRef, FnAddr, NativeCallback},
};

bitflags! {
    /// Selects which [`DetourEvent`] kinds a subscription receives.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventMask: u32 {
        /// A detour was added to a managed target's chain.
        const DETOUR_APPLIED = 1;
        /// A detour was removed from a managed target's chain.
        const DETOUR_UNDONE = 1 << 1;
        /// A callback was added to a native function's chain.
        const NATIVE_DETOUR_APPLIED = 1 << 2;
        /// A callback was removed from a native function's chain.
        const NATIVE_DETOUR_UNDONE = 1 << 3;
        /// Every event kind.
        const ALL = Self::DETOUR_APPLIED.bits()
            | Self::DETOUR_UNDONE.bits()
            | Self::NATIVE_DETOUR_APPLIED.bits()
            | Self::NATIVE_DETOUR_UNDONE.bits();
    }
}

/// Payload of a managed-chain event.
#[derive(Debug, Clone)]
pub struct MethodEvent {
    /// The detoured target.
    pub target: CodeRef,
    /// Entry of the detour that was applied or undone.
    pub entry: CodeRef,
    /// The detour's ordering config, when it had one.
    pub config: Option<DetourConfig>,
}

/// Payload of a native-chain event.
#[derive(Debug, Clone)]
pub struct FunctionEvent {
    /// The detoured function.
    pub function: FnAddr,
    /// Callback that was applied or undone.
    pub callback: NativeCallback,
    /// The callback's ordering config, when it had one.
    pub config: Option<DetourConfig>,
}

/// A detour lifecycle notification.
#[derive(Debug, Clone)]
pub enum DetourEvent {
    /// A detour joined a managed target's chain.
    DetourApplied(MethodEvent),
    /// A detour left a managed target's chain.
    DetourUndone(MethodEvent),
    /// A callback joined a native function's chain.
    NativeDetourApplied(FunctionEvent),
    /// A callback left a native function's chain.
    NativeDetourUndone(FunctionEvent),
}

impl DetourEvent {
    /// The mask bit this event matches.
    #[must_use]
    pub fn mask(&self) -> EventMask {
        match self {
            DetourEvent::DetourApplied(_) => EventMask::DETOUR_APPLIED,
            DetourEvent::DetourUndone(_) => EventMask::DETOUR_UNDONE,
            DetourEvent::NativeDetourApplied(_) => EventMask::NATIVE_DETOUR_APPLIED,
            DetourEvent::NativeDetourUndone(_) => EventMask::NATIVE_DETOUR_UNDONE,
        }
    }
}

struct HandlerEntry {
    mask: EventMask,
    handler: Box<dyn Fn(&DetourEvent) + Send + Sync>,
}

/// Concurrent handler table shared by a registry and its chains.
///
/// Backed by a skip list so dispatch iterates without locking while subscriptions come
/// and go on other threads. A handler removed mid-dispatch may still observe the event
/// being dispatched; it will not observe later ones.
pub(crate) struct EventSink {
    /// Backref cloned into subscriptions for their drop-unsubscribe.
    me: Weak<EventSink>,
    handlers: SkipMap<u64, HandlerEntry>,
    next_id: AtomicU64,
}

impl EventSink {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| EventSink {
            me: me.clone(),
            handlers: SkipMap::new(),
            next_id: AtomicU64::new(1),
        })
    }

    pub(crate) fn subscribe(
        &self,
        mask: EventMask,
        handler: impl Fn(&DetourEvent) + Send + Sync + 'static,
    ) -> EventSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.insert(
            id,
            HandlerEntry {
                mask,
                handler: Box::new(handler),
            },
        );
        EventSubscription {
            sink: self.me.clone(),
            id,
        }
    }

    pub(crate) fn dispatch(&self, event: &DetourEvent) {
        let bit = event.mask();
        for entry in self.handlers.iter() {
            if entry.value().mask.contains(bit) {
                (entry.value().handler)(event);
            }
        }
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Keeps an event handler registered; dropping it unsubscribes.
pub struct EventSubscription {
    sink: Weak<EventSink>,
    id: u64,
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.upgrade() {
            sink.handlers.remove(&self.id);
        }
    }
}

impl fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSubscription")
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Signature;
    use std::sync::Mutex;

    fn method_event(name: &str) -> DetourEvent {
        let sig = Signature::new("() -> ()");
        DetourEvent::DetourApplied(MethodEvent {
            target: CodeRef::new(name, sig.clone()),
            entry: CodeRef::new("entry", sig),
            config: None,
        })
    }

    #[test]
    fn test_dispatch_respects_mask() {
        let sink = EventSink::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_applied = Arc::clone(&seen);
        let _applied = sink.subscribe(EventMask::DETOUR_APPLIED, move |event| {
            seen_applied.lock().unwrap().push(event.mask());
        });
        let seen_undone = Arc::clone(&seen);
        let _undone = sink.subscribe(EventMask::DETOUR_UNDONE, move |event| {
            seen_undone.lock().unwrap().push(event.mask());
        });

        sink.dispatch(&method_event("target"));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[EventMask::DETOUR_APPLIED]);
    }

    #[test]
    fn test_dropping_subscription_unsubscribes() {
        let sink = EventSink::new();
        let count = Arc::new(Mutex::new(0));

        let counter = Arc::clone(&count);
        let subscription = sink.subscribe(EventMask::ALL, move |_| {
            *counter.lock().unwrap() += 1;
        });

        sink.dispatch(&method_event("one"));
        drop(subscription);
        sink.dispatch(&method_event("two"));

        assert_eq!(*count.lock().unwrap(), 1);
    }
}
