//! Chain manager for raw native functions.
//!
//! Native targets have no rewritable body to clone and no per-detour trampolines;
//! there is exactly one physical redirect, from the function's entry onto its sync
//! proxy, and the rest of the chain is soft state. Each chaining callback owns a
//! [`ChainCell`] holding its current successor, and the proxy loads the first callback
//! from the chain's entry cell on every call:
//!
//! ```text
//! function ──> sync proxy ──╮ entry cell ──> callback 1
//!                             callback 1's cell ──> callback 2
//!                             callback 2's cell ──> preserved original
//! ```
//!
//! Rebuilds republish cell contents under the gate instead of re-pointing jumps. A
//! removed callback's cell is poisoned with the runtime's removed callback so a stale
//! continuation captured before the removal fails loud instead of calling freed state.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    chain::NodeSlot,
    events::{DetourEvent, EventSink, FunctionEvent},
    introspection::{FunctionDetourInfo, NativeDetourInfo},
    ordering::{
        graph::{ConflictJournal, DependencyGraph, NodeKey},
        DetourConfig,
    },
    runtime::{ChainCell, DetourFactory, DetourRuntime, FnAddr, NativeCallback, NativeRedirect},
    sync::SyncGate,
    Error, Result,
};

struct NativeNode {
    callback: NativeCallback,
    factory: Arc<dyn DetourFactory>,
    /// The successor cell; only callbacks that chain get one.
    cell: Option<Arc<ChainCell>>,
    serial: u64,
}

struct FunctionInner {
    /// Cell the sync proxy loads its first callback from.
    first: Arc<ChainCell>,
    sync_proxy: FnAddr,
    /// The function's single entry redirect, created on the first rebuild and kept
    /// across empty periods.
    redirect: Option<Box<dyn NativeRedirect>>,
    graph: DependencyGraph<NativeNode>,
    /// Callbacks without a config, newest first.
    bucket: Vec<NativeNode>,
    next_serial: u64,
}

/// Per-function manager of a native detour chain.
pub(crate) struct FunctionChain {
    function: FnAddr,
    runtime: Arc<dyn DetourRuntime>,
    events: Arc<EventSink>,
    gate: Arc<SyncGate>,
    version: AtomicU64,
    journal: ConflictJournal,
    inner: Mutex<FunctionInner>,
}

impl FunctionChain {
    /// Prepares the chain scaffolding for `function` without touching its entry.
    ///
    /// Emits the sync proxy over an empty entry cell. The entry itself is only
    /// redirected once the first callback is added.
    pub(crate) fn new(
        function: FnAddr,
        runtime: &Arc<dyn DetourRuntime>,
        events: Arc<EventSink>,
    ) -> Result<Self> {
        let gate = SyncGate::new();
        let first = Arc::new(ChainCell::new());
        let sync_proxy = runtime.create_native_sync_proxy(function, &gate, &first)?;
        Ok(FunctionChain {
            function,
            runtime: Arc::clone(runtime),
            events,
            gate,
            version: AtomicU64::new(0),
            journal: ConflictJournal::new(),
            inner: Mutex::new(FunctionInner {
                first,
                sync_proxy,
                redirect: None,
                graph: DependencyGraph::new(),
                bucket: Vec::new(),
                next_serial: 1,
            }),
        })
    }

    pub(crate) fn function(&self) -> FnAddr {
        self.function
    }

    /// Adds a callback and rebuilds the chain.
    ///
    /// Configured callbacks join the dependency graph; the rest go to the front of the
    /// no-config bucket, which runs after the whole configured section. On any failure
    /// the chain's membership is as if the add never happened.
    ///
    /// # Errors
    ///
    /// [`Error::OrderingCycle`] when the config's constraints close a cycle,
    /// [`Error::ChainUpdateReentrancy`] when called from inside the function, and
    /// [`Error::Backend`] for factory failures during the rebuild.
    pub(crate) fn add(
        &self,
        callback: &NativeCallback,
        config: Option<&DetourConfig>,
        factory: &Arc<dyn DetourFactory>,
    ) -> Result<NodeSlot> {
        let slot = {
            let mut inner = self.inner.lock();
            self.version.fetch_add(1, Ordering::Relaxed);
            let serial = inner.next_serial;
            inner.next_serial += 1;
            let node = NativeNode {
                callback: callback.clone(),
                factory: Arc::clone(factory),
                cell: callback.wants_next().then(|| Arc::new(ChainCell::new())),
                serial,
            };
            let slot = match config {
                Some(cfg) => NodeSlot::Ordered(inner.graph.insert(cfg.clone(), node, &self.journal)?),
                None => {
                    inner.bucket.insert(0, node);
                    NodeSlot::Bucket(serial)
                }
            };
            if let Err(err) = self.update_chain(&mut inner, factory) {
                self.back_out(&mut inner, slot);
                return Err(err);
            }
            slot
        };

        debug!(function = %self.function, callback = callback.name(), "native detour applied");
        self.events
            .dispatch(&DetourEvent::NativeDetourApplied(FunctionEvent {
                function: self.function,
                callback: callback.clone(),
                config: config.cloned(),
            }));
        Ok(slot)
    }

    /// Removes an applied callback, rebuilds the chain, and poisons its successor cell.
    ///
    /// # Errors
    ///
    /// [`Error::NotApplied`] when the slot is stale,
    /// [`Error::ChainUpdateReentrancy`] when called from inside the function, and
    /// [`Error::Backend`] for factory failures during the rebuild.
    pub(crate) fn remove(&self, slot: NodeSlot) -> Result<()> {
        let event = {
            let mut inner = self.inner.lock();
            self.version.fetch_add(1, Ordering::Relaxed);
            let (node, config) = match slot {
                NodeSlot::Ordered(key) => {
                    let (config, node) = inner.graph.remove(key)?;
                    (node, Some(config))
                }
                NodeSlot::Bucket(serial) => {
                    let Some(idx) = inner.bucket.iter().position(|n| n.serial == serial) else {
                        return Err(Error::NotApplied);
                    };
                    (inner.bucket.remove(idx), None)
                }
            };
            let updating = Arc::clone(&node.factory);
            self.update_chain(&mut inner, &updating)?;
            if let Some(cell) = &node.cell {
                cell.store(Some(self.runtime.removed_callback()?));
            }
            DetourEvent::NativeDetourUndone(FunctionEvent {
                function: self.function,
                callback: node.callback.clone(),
                config,
            })
        };

        debug!(function = %self.function, "native detour undone");
        self.events.dispatch(&event);
        Ok(())
    }

    /// Takes a consistent snapshot of the chain for introspection.
    pub(crate) fn snapshot(&self) -> FunctionDetourInfo {
        let inner = self.inner.lock();
        let mut detours = Vec::with_capacity(inner.graph.len() + inner.bucket.len());
        for &key in inner.graph.realized_keys() {
            let node = inner.graph.payload(key);
            detours.push(NativeDetourInfo::new(
                node.callback.clone(),
                node.cell.clone(),
                Some(inner.graph.config(key).clone()),
            ));
        }
        for node in &inner.bucket {
            detours.push(NativeDetourInfo::new(
                node.callback.clone(),
                node.cell.clone(),
                None,
            ));
        }
        FunctionDetourInfo::new(
            self.function,
            detours,
            self.journal.snapshot(),
            self.version.load(Ordering::Relaxed),
            Arc::clone(&self.gate),
        )
    }

    /// Recomputes the desired chain and republishes the cells, under the gate.
    ///
    /// The entry redirect is engaged exactly while the chain is non-empty; the entry
    /// cell never falls back to the original, an empty chain withdraws the redirect
    /// instead. Successor cells do fall back to the preserved original, looked up after
    /// the redirect toggles because the backend only preserves it while applied.
    fn update_chain(
        &self,
        inner: &mut FunctionInner,
        updating: &Arc<dyn DetourFactory>,
    ) -> Result<()> {
        let ordered: Vec<NodeKey> = inner.graph.realized_keys().to_vec();

        let mut callbacks = Vec::with_capacity(ordered.len() + inner.bucket.len());
        let mut factories = Vec::with_capacity(ordered.len() + inner.bucket.len());
        for &key in &ordered {
            let node = inner.graph.payload(key);
            callbacks.push(node.callback.clone());
            factories.push(Arc::clone(&node.factory));
        }
        for node in &inner.bucket {
            callbacks.push(node.callback.clone());
            factories.push(Arc::clone(&node.factory));
        }

        let _update = self.gate.begin_update()?;

        let FunctionInner {
            first,
            sync_proxy,
            redirect,
            graph,
            bucket,
            ..
        } = inner;

        if redirect.is_none() {
            let factory = factories.first().unwrap_or(updating);
            *redirect = Some(factory.create_native_detour(self.function, *sync_proxy, false)?);
        }
        if let Some(redirect) = redirect.as_mut() {
            if callbacks.is_empty() {
                if redirect.is_applied() {
                    redirect.undo()?;
                }
            } else if !redirect.is_applied() {
                redirect.apply()?;
            }
        }
        let fallback = match redirect.as_ref().and_then(|r| r.orig_entrypoint()) {
            Some(entry) => Some(self.runtime.callback_for_entrypoint(entry)?),
            None => None,
        };

        first.store(callbacks.first().cloned());
        for (i, &key) in ordered.iter().enumerate() {
            if let Some(cell) = &graph.payload(key).cell {
                cell.store(callbacks.get(i + 1).cloned().or_else(|| fallback.clone()));
            }
        }
        for (i, node) in bucket.iter().enumerate() {
            if let Some(cell) = &node.cell {
                let pos = ordered.len() + i;
                cell.store(callbacks.get(pos + 1).cloned().or_else(|| fallback.clone()));
            }
        }
        Ok(())
    }

    /// Drops a node whose add failed mid-rebuild.
    ///
    /// Cell publication is the rebuild's last, infallible step, so a failed add never
    /// made it into the published chain; detaching the node is enough.
    fn back_out(&self, inner: &mut FunctionInner, slot: NodeSlot) {
        match slot {
            NodeSlot::Ordered(key) => {
                let _ = inner.graph.remove(key);
            }
            NodeSlot::Bucket(serial) => {
                if let Some(idx) = inner.bucket.iter().position(|n| n.serial == serial) {
                    inner.bucket.remove(idx);
                }
            }
        }
    }
}

impl std::fmt::Debug for FunctionChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionChain")
            .field("function", &self.function)
            .field("version", &self.version.load(Ordering::Relaxed))
            .finish()
    }
}
