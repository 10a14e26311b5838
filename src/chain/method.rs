//! Chain manager for managed (rewritable-body) targets.
//!
//! One [`MethodChain`] exists per detoured target and owns everything behind its entry:
//! the dependency graph of configured detours, the no-config bucket, the end-of-chain
//! clone, the root linkage through the sync proxy, and the target's gate. The physical
//! shape it maintains is a straight line of redirects:
//!
//! ```text
//! target ──> sync proxy ──> root trampoline ──> detour 1 entry
//!                           detour 1 trampoline ──> detour 2 entry
//!                           detour 2 trampoline ──> end-of-chain clone
//! ```
//!
//! Mutations recompute the desired order first, then publish an update on the gate,
//! drain active calls, and re-point only the links whose target actually changed. The
//! entry redirect onto the sync proxy is engaged exactly while the chain is non-empty,
//! so an undetoured target runs its original body with zero overhead.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    chain::NodeSlot,
    events::{DetourEvent, EventSink, MethodEvent},
    introspection::{DetourInfo, MethodDetourInfo},
    ordering::{
        graph::{ConflictJournal, DependencyGraph, NodeKey},
        DetourConfig,
    },
    runtime::{CodeRef, DetourFactory, DetourRuntime, Redirect},
    sync::{StolenTrampoline, SyncGate},
    trampoline::{RemovedStubCache, Trampoline, TrampolinePool},
    Error, Result,
};

/// Re-points a link redirect, skipping the work when the target is unchanged.
fn relink(
    source: &CodeRef,
    last_target: &mut Option<CodeRef>,
    redirect: &mut Option<Box<dyn Redirect>>,
    factory: &Arc<dyn DetourFactory>,
    to: &CodeRef,
) -> Result<()> {
    if last_target.as_ref() == Some(to) {
        return Ok(());
    }
    // Cleared before touching the old redirect: a failure below must not leave a
    // recorded target with no live redirect behind it, or the next rebuild would
    // skip this link as unchanged.
    *last_target = None;
    if let Some(mut old) = redirect.take() {
        old.undo()?;
    }
    *redirect = Some(factory.create_detour(source, to, true)?);
    *last_target = Some(to.clone());
    Ok(())
}

struct DetourNode {
    entry: CodeRef,
    factory: Arc<dyn DetourFactory>,
    trampoline: Trampoline,
    last_target: Option<CodeRef>,
    redirect: Option<Box<dyn Redirect>>,
    serial: u64,
}

impl DetourNode {
    fn unlink(&mut self) -> Result<()> {
        if let Some(mut redirect) = self.redirect.take() {
            redirect.undo()?;
        }
        Ok(())
    }
}

/// The chain's head: owns the entry redirect and the trampoline the sync proxy
/// continues into.
struct RootNode {
    target: CodeRef,
    trampoline: Trampoline,
    sync_proxy: CodeRef,
    last_target: Option<CodeRef>,
    redirect: Option<Box<dyn Redirect>>,
    sync_redirect: Option<Box<dyn Redirect>>,
}

impl RootNode {
    /// Engages or withdraws the entry redirect onto the sync proxy.
    ///
    /// Created lazily on the first update because only updates carry a factory, and
    /// kept across empty periods so re-hooking does not re-mint it.
    fn set_entry_redirect(&mut self, factory: &Arc<dyn DetourFactory>, engaged: bool) -> Result<()> {
        if self.sync_redirect.is_none() {
            self.sync_redirect = Some(factory.create_detour(&self.target, &self.sync_proxy, false)?);
        }
        if let Some(redirect) = self.sync_redirect.as_mut() {
            if engaged && !redirect.is_applied() {
                redirect.apply()?;
            } else if !engaged && redirect.is_applied() {
                redirect.undo()?;
            }
        }
        Ok(())
    }
}

struct ChainInner {
    root: RootNode,
    graph: DependencyGraph<DetourNode>,
    /// Detours without a config, newest first.
    bucket: Vec<DetourNode>,
    end_of_chain: CodeRef,
    next_serial: u64,
}

/// Per-target manager of a managed detour chain.
pub(crate) struct MethodChain {
    target: CodeRef,
    pool: Arc<TrampolinePool>,
    removed_stubs: Arc<RemovedStubCache>,
    events: Arc<EventSink>,
    gate: Arc<SyncGate>,
    version: AtomicU64,
    journal: ConflictJournal,
    inner: Mutex<ChainInner>,
}

impl MethodChain {
    /// Prepares the chain scaffolding for `target` without touching its entry.
    ///
    /// Clones the body eagerly (the clone is the chain's permanent fallback), rents the
    /// root trampoline, and emits the sync proxy. The entry itself is only redirected
    /// once the first detour is added.
    pub(crate) fn new(
        target: CodeRef,
        runtime: &Arc<dyn DetourRuntime>,
        pool: Arc<TrampolinePool>,
        removed_stubs: Arc<RemovedStubCache>,
        events: Arc<EventSink>,
    ) -> Result<Self> {
        let end_of_chain = runtime.clone_code(&target)?;
        let gate = SyncGate::new();
        let trampoline = pool.rent(target.signature())?;
        let sync_proxy = runtime.create_sync_proxy(&target, &gate, trampoline.code())?;
        Ok(MethodChain {
            target: target.clone(),
            pool,
            removed_stubs,
            events,
            gate,
            version: AtomicU64::new(0),
            journal: ConflictJournal::new(),
            inner: Mutex::new(ChainInner {
                root: RootNode {
                    target,
                    trampoline,
                    sync_proxy,
                    last_target: None,
                    redirect: None,
                    sync_redirect: None,
                },
                graph: DependencyGraph::new(),
                bucket: Vec::new(),
                end_of_chain,
                next_serial: 1,
            }),
        })
    }

    pub(crate) fn target(&self) -> &CodeRef {
        &self.target
    }

    pub(crate) fn pool(&self) -> &Arc<TrampolinePool> {
        &self.pool
    }

    /// Adds a detour and rebuilds the chain.
    ///
    /// Configured detours join the dependency graph; the rest go to the front of the
    /// no-config bucket, which runs after the whole configured section. The caller
    /// supplies the rented next-trampoline; on any failure it is released back to the
    /// pool and the chain's membership is as if the add never happened (links already
    /// re-pointed by a partial rebuild are not rolled back).
    ///
    /// # Errors
    ///
    /// [`Error::OrderingCycle`] when the config's constraints close a cycle,
    /// [`Error::ChainUpdateReentrancy`] when called from inside the target, and
    /// [`Error::Backend`] for factory failures during the rebuild.
    pub(crate) fn add(
        &self,
        entry: &CodeRef,
        config: Option<&DetourConfig>,
        factory: &Arc<dyn DetourFactory>,
        trampoline: Trampoline,
    ) -> Result<NodeSlot> {
        let slot = {
            let mut inner = self.inner.lock();
            self.version.fetch_add(1, Ordering::Relaxed);
            let serial = inner.next_serial;
            inner.next_serial += 1;
            let node = DetourNode {
                entry: entry.clone(),
                factory: Arc::clone(factory),
                trampoline,
                last_target: None,
                redirect: None,
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

        debug!(method = %self.target, entry = %entry, "detour applied");
        self.events.dispatch(&DetourEvent::DetourApplied(MethodEvent {
            target: self.target.clone(),
            entry: entry.clone(),
            config: config.cloned(),
        }));
        Ok(slot)
    }

    /// Removes an applied detour, rebuilds the chain, and steals its trampoline.
    ///
    /// The trampoline is re-pointed at the removed stub and queued on the gate; stale
    /// references to it fail loud until the queue flushes back to the pool.
    ///
    /// # Errors
    ///
    /// [`Error::NotApplied`] when the slot is stale,
    /// [`Error::ChainUpdateReentrancy`] when called from inside the target, and
    /// [`Error::Backend`] for factory failures during the rebuild or steal.
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
            let entry = node.entry.clone();
            let updating = Arc::clone(&node.factory);
            // Steal even when the relink fails: the node is already out of the chain,
            // and dropping it would return a still-redirected trampoline to the pool.
            let relinked = self.update_chain(&mut inner, &updating);
            let stolen = self.steal_trampoline(node);
            relinked.and(stolen)?;
            DetourEvent::DetourUndone(MethodEvent {
                target: self.target.clone(),
                entry,
                config,
            })
        };

        debug!(method = %self.target, "detour undone");
        self.events.dispatch(&event);
        Ok(())
    }

    /// Takes a consistent snapshot of `chain`, which the snapshot keeps a handle to
    /// for its live gate operations.
    pub(crate) fn snapshot(chain: &Arc<MethodChain>) -> MethodDetourInfo {
        let inner = chain.inner.lock();
        let mut detours = Vec::with_capacity(inner.graph.len() + inner.bucket.len());
        for &key in inner.graph.realized_keys() {
            let node = inner.graph.payload(key);
            detours.push(DetourInfo::new(
                node.entry.clone(),
                node.trampoline.code().clone(),
                Some(inner.graph.config(key).clone()),
            ));
        }
        for node in &inner.bucket {
            detours.push(DetourInfo::new(
                node.entry.clone(),
                node.trampoline.code().clone(),
                None,
            ));
        }
        MethodDetourInfo::new(
            chain.target.clone(),
            detours,
            chain.journal.snapshot(),
            inner.end_of_chain.clone(),
            chain.version.load(Ordering::Relaxed),
            Arc::clone(chain),
        )
    }

    /// Flushes the gate's stolen-trampoline queue.
    ///
    /// Takes the target lock so the quiescence proof, an empty update cycle on the
    /// gate, cannot race a rebuild's own published update.
    ///
    /// # Errors
    ///
    /// [`Error::ChainUpdateReentrancy`] when called from inside the target.
    pub(crate) fn drain_stolen(&self) -> Result<()> {
        let _inner = self.inner.lock();
        self.gate.drain_stolen()
    }

    pub(crate) fn active_calls(&self) -> usize {
        self.gate.active_calls()
    }

    /// Recomputes the desired linkage and re-points what changed, under the gate.
    ///
    /// Order and factory bookkeeping happen before the gate is published; only the
    /// physical redirect work runs with calls drained. Each link prefers the factory of
    /// the node it points *to*, then the owning node's, then the one whose mutation
    /// triggered this update.
    fn update_chain(&self, inner: &mut ChainInner, updating: &Arc<dyn DetourFactory>) -> Result<()> {
        let ordered: Vec<NodeKey> = inner.graph.realized_keys().to_vec();

        let mut entries = Vec::with_capacity(ordered.len() + inner.bucket.len());
        let mut factories = Vec::with_capacity(ordered.len() + inner.bucket.len());
        for &key in &ordered {
            let node = inner.graph.payload(key);
            entries.push(node.entry.clone());
            factories.push(Arc::clone(&node.factory));
        }
        for node in &inner.bucket {
            entries.push(node.entry.clone());
            factories.push(Arc::clone(&node.factory));
        }

        let _update = self.gate.begin_update()?;

        let ChainInner {
            root,
            graph,
            bucket,
            end_of_chain,
            ..
        } = inner;

        let root_factory = factories.first().unwrap_or(updating);
        let root_to = entries.first().unwrap_or(end_of_chain);
        relink(
            root.trampoline.code(),
            &mut root.last_target,
            &mut root.redirect,
            root_factory,
            root_to,
        )?;

        for (i, &key) in ordered.iter().enumerate() {
            let to = entries.get(i + 1).unwrap_or(end_of_chain);
            let factory = factories.get(i + 1).unwrap_or(&factories[i]);
            let node = graph.payload_mut(key);
            relink(
                node.trampoline.code(),
                &mut node.last_target,
                &mut node.redirect,
                factory,
                to,
            )?;
        }
        for (i, node) in bucket.iter_mut().enumerate() {
            let pos = ordered.len() + i;
            let to = entries.get(pos + 1).unwrap_or(end_of_chain);
            let factory = factories.get(pos + 1).unwrap_or(&factories[pos]);
            relink(
                node.trampoline.code(),
                &mut node.last_target,
                &mut node.redirect,
                factory,
                to,
            )?;
        }

        root.set_entry_redirect(root_factory, !entries.is_empty())
    }

    /// Quarantines a removed node's trampoline on the gate.
    fn steal_trampoline(&self, mut node: DetourNode) -> Result<()> {
        let result = node.unlink().and_then(|()| {
            let removed = self.removed_stubs.get(node.trampoline.code().signature())?;
            node.factory
                .create_detour(node.trampoline.code(), &removed, true)
        });
        match result {
            Ok(redirect) => {
                self.gate.steal(StolenTrampoline::new(node.trampoline, redirect));
                Ok(())
            }
            Err(err) => {
                // A stub that could not be re-pointed at the removed stub may still be
                // reachable from a stale next reference; it must not return to the pool.
                std::mem::forget(node.trampoline);
                Err(err)
            }
        }
    }

    /// Drops a node whose add failed mid-rebuild, undoing its own link if it got one.
    fn back_out(&self, inner: &mut ChainInner, slot: NodeSlot) {
        let node = match slot {
            NodeSlot::Ordered(key) => inner.graph.remove(key).ok().map(|(_, node)| node),
            NodeSlot::Bucket(serial) => inner
                .bucket
                .iter()
                .position(|n| n.serial == serial)
                .map(|idx| inner.bucket.remove(idx)),
        };
        if let Some(mut node) = node {
            if let Err(err) = node.unlink() {
                debug!(method = %self.target, error = %err, "could not undo link of backed-out detour");
            }
        }
    }
}

impl std::fmt::Debug for MethodChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodChain")
            .field("target", &self.target)
            .field("version", &self.version.load(Ordering::Relaxed))
            .finish()
    }
}
