//! Arena-backed dependency graph computing the realized detour order.
//!
//! The graph keeps a flat membership list sorted by priority with insertion-order ties,
//! plus one adjacency list per node (`before_this`: the nodes that must be sequenced ahead
//! of it). The realized order is *derived*, not maintained: every insert or remove throws
//! the previous order away and recomputes it with a depth-first walk, visiting each node's
//! prerequisites first. Chains are expected to stay in the single digits to low tens of
//! entries, so the wholesale rebuild buys correctness for negligible cost.
//!
//! Cycles are detected during the walk and reported as
//! [`Error::OrderingCycle`](crate::Error::OrderingCycle). Contradictory declarations
//! between a pair (both "before" and "after") resolve in favor of before and are recorded
//! in the target's [`ConflictJournal`].

use slab::Slab;
use tracing::warn;

use crate::{ordering::DetourConfig, Result};

/// Key of a node stored in a [`DependencyGraph`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeKey(usize);

/// Record of a contradictory ordering declaration between two detours.
///
/// Produced when inserting a detour reveals that a pair is related in both directions,
/// for example the new detour lists an existing id in `before` while the existing detour
/// also lists the new id in `before`. The before relation of the pair member that was
/// checked first wins; the losing relation is dropped and this record is appended to the
/// target's journal, observable through
/// [`MethodDetourInfo::ordering_conflicts`](crate::MethodDetourInfo::ordering_conflicts).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderingConflict {
    /// Id of the detour whose insertion surfaced the contradiction.
    pub detour: String,
    /// Id of the already-applied detour it contradicts.
    pub other: String,
}

impl std::fmt::Display for OrderingConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Detour '{}' is marked as being both before and after '{}'",
            self.detour, self.other
        )
    }
}

/// Append-only journal of [`OrderingConflict`]s for one target.
///
/// Backed by a lock-free vector so introspection can read it without taking the target's
/// mutation lock. Never cleared; conflicts are configuration facts worth keeping visible.
#[derive(Debug, Default)]
pub(crate) struct ConflictJournal {
    entries: boxcar::Vec<OrderingConflict>,
}

impl ConflictJournal {
    pub(crate) fn new() -> Self {
        ConflictJournal { entries: boxcar::Vec::new() }
    }

    fn record(&self, detour: &str, other: &str) {
        warn!(detour, other, "detour is marked as being both before and after another");
        self.entries.push(OrderingConflict {
            detour: detour.to_string(),
            other: other.to_string(),
        });
    }

    /// Copies the journal out in record order.
    pub(crate) fn snapshot(&self) -> Vec<OrderingConflict> {
        self.entries.iter().map(|(_, c)| c.clone()).collect()
    }
}

struct DepNode<P> {
    config: DetourConfig,
    payload: P,
    /// Nodes that must be sequenced ahead of this one, priority-ordered.
    before_this: Vec<NodeKey>,
    visiting: bool,
    visited: bool,
}

/// Dependency graph over the configured detours of one target.
///
/// `P` is an opaque payload carried per node, typically the arena key of the chain node
/// the config belongs to. The graph itself never inspects it.
pub(crate) struct DependencyGraph<P> {
    nodes: Slab<DepNode<P>>,
    /// Membership in priority order, insertion-order ties.
    by_priority: Vec<NodeKey>,
    /// Derived total order, rebuilt wholesale after every mutation.
    realized: Vec<NodeKey>,
}

impl<P> DependencyGraph<P> {
    pub(crate) fn new() -> Self {
        DependencyGraph {
            nodes: Slab::new(),
            by_priority: Vec::new(),
            realized: Vec::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn payload(&self, key: NodeKey) -> &P {
        &self.nodes[key.0].payload
    }

    pub(crate) fn payload_mut(&mut self, key: NodeKey) -> &mut P {
        &mut self.nodes[key.0].payload
    }

    pub(crate) fn config(&self, key: NodeKey) -> &DetourConfig {
        &self.nodes[key.0].config
    }

    /// The realized order, prerequisites first.
    ///
    /// Valid until the next `insert` or `remove`; the chain relink step consumes it
    /// immediately after every mutation.
    pub(crate) fn realized(&self) -> impl Iterator<Item = &P> + '_ {
        self.realized.iter().map(|key| &self.nodes[key.0].payload)
    }

    /// Keys of the realized order, prerequisites first.
    pub(crate) fn realized_keys(&self) -> &[NodeKey] {
        &self.realized
    }

    /// Inserts a configured node and recomputes the realized order.
    ///
    /// Scans the existing membership once, recording the priority insertion position and
    /// checking all four directional relationships against each existing node. Each
    /// surviving relationship contributes one priority-ordered adjacency entry. A config
    /// naming the same id in both its before and after sets keeps only the before
    /// relation, recorded in `journal`; contradictory declarations across two configs
    /// both become edges and surface as a cycle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OrderingCycle`](crate::Error::OrderingCycle) if the new
    /// constraints close a cycle. The offending node is backed out again before
    /// returning, leaving membership, adjacency, and the realized order as they were.
    pub(crate) fn insert(
        &mut self,
        config: DetourConfig,
        payload: P,
        journal: &ConflictJournal,
    ) -> Result<NodeKey> {
        let key = NodeKey(self.nodes.insert(DepNode {
            config,
            payload,
            before_this: Vec::new(),
            visiting: false,
            visited: false,
        }));

        let mut insert_idx = None;
        // (owner, dependency) pairs: dependency must run before owner.
        let mut edges: Vec<(NodeKey, NodeKey)> = Vec::new();

        for (i, &cur_key) in self.by_priority.iter().enumerate() {
            let node_cfg = &self.nodes[key.0].config;
            let cur_cfg = &self.nodes[cur_key.0].config;

            if insert_idx.is_none() && sorts_before(node_cfg, cur_cfg) {
                insert_idx = Some(i);
            }

            let node_says_before = node_cfg.before().iter().any(|id| id == cur_cfg.id());
            let node_says_after = node_cfg.after().iter().any(|id| id == cur_cfg.id());
            let cur_says_before = cur_cfg.before().iter().any(|id| id == node_cfg.id());
            let cur_says_after = cur_cfg.after().iter().any(|id| id == node_cfg.id());

            // A config naming the same id in both sets is a contradiction; its before
            // declaration wins and the after declaration is dropped. Contradictions
            // *across* two configs are not resolved here: both edges go in, and a real
            // cycle surfaces from the rebuild walk.
            if node_says_before && node_says_after {
                journal.record(node_cfg.id(), cur_cfg.id());
            }
            if cur_says_before && cur_says_after {
                journal.record(cur_cfg.id(), node_cfg.id());
            }

            if node_says_before {
                edges.push((cur_key, key));
            }
            if node_says_after && !node_says_before {
                edges.push((key, cur_key));
            }
            if cur_says_before {
                edges.push((key, cur_key));
            }
            if cur_says_after && !cur_says_before {
                edges.push((cur_key, key));
            }
        }

        for (owner, dependency) in edges {
            let mut list = std::mem::take(&mut self.nodes[owner.0].before_this);
            prio_insert(&self.nodes, &mut list, dependency);
            self.nodes[owner.0].before_this = list;
        }

        let insert_idx = insert_idx.unwrap_or(self.by_priority.len());
        self.by_priority.insert(insert_idx, key);

        match self.rebuild() {
            Ok(()) => Ok(key),
            Err(err) => {
                // Back the offender out; the pre-insert state was acyclic, so this
                // rebuild cannot fail again.
                self.detach(key);
                let restored = self.rebuild();
                debug_assert!(restored.is_ok());
                Err(err)
            }
        }
    }

    /// Removes a node, strips it from every adjacency list, and recomputes the order.
    ///
    /// Returns the node's config together with its payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotApplied`](crate::Error::NotApplied) when `key` is not a
    /// member, typically because it was already removed.
    pub(crate) fn remove(&mut self, key: NodeKey) -> Result<(DetourConfig, P)> {
        if !self.nodes.contains(key.0) {
            return Err(crate::Error::NotApplied);
        }
        let removed = self.detach(key);
        // Removing edges cannot introduce a cycle and inserts that would have left one
        // are rolled back, so this rebuild always succeeds.
        let rebuilt = self.rebuild();
        debug_assert!(rebuilt.is_ok());
        rebuilt.map(|()| (removed.config, removed.payload))
    }

    fn detach(&mut self, key: NodeKey) -> DepNode<P> {
        self.by_priority.retain(|&k| k != key);
        for (_, node) in self.nodes.iter_mut() {
            node.before_this.retain(|&k| k != key);
        }
        self.nodes.remove(key.0)
    }

    /// Recomputes the realized order with a cycle-detecting depth-first walk.
    ///
    /// Walks the membership in priority/insertion order so that order remains the
    /// default sequence; explicit edges only force local reordering.
    fn rebuild(&mut self) -> Result<()> {
        for (_, node) in self.nodes.iter_mut() {
            node.visiting = false;
            node.visited = false;
        }
        self.realized.clear();

        let roster = self.by_priority.clone();
        for key in roster {
            self.visit(key)?;
        }
        Ok(())
    }

    fn visit(&mut self, key: NodeKey) -> Result<()> {
        {
            let node = &self.nodes[key.0];
            if node.visiting {
                return Err(crate::Error::OrderingCycle {
                    id: node.config.id().to_string(),
                });
            }
            if node.visited {
                return Ok(());
            }
        }

        self.nodes[key.0].visiting = true;
        let prerequisites = self.nodes[key.0].before_this.clone();
        for dep in prerequisites {
            self.visit(dep)?;
        }

        let node = &mut self.nodes[key.0];
        node.visiting = false;
        node.visited = true;
        self.realized.push(key);
        Ok(())
    }
}

/// Whether `node` sorts strictly ahead of `cur` in a priority-ordered list.
///
/// Present priorities sort before absent ones and higher values sort earlier; equal
/// priorities fall back to sub-priority, higher first. Equal on both means *not* before,
/// which is what keeps insertion-order ties stable.
fn sorts_before(node: &DetourConfig, cur: &DetourConfig) -> bool {
    let Some(nprio) = node.priority() else {
        return false;
    };
    match cur.priority() {
        None => true,
        Some(cprio) => {
            cprio < nprio || (cprio == nprio && cur.sub_priority() < node.sub_priority())
        }
    }
}

/// Inserts `key` into a priority-ordered adjacency list, keeping insertion-order ties.
fn prio_insert<P>(nodes: &Slab<DepNode<P>>, list: &mut Vec<NodeKey>, key: NodeKey) {
    let config = &nodes[key.0].config;
    let idx = list
        .iter()
        .position(|&cur| sorts_before(config, &nodes[cur.0].config))
        .unwrap_or(list.len());
    list.insert(idx, key);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids<P: Clone>(graph: &DependencyGraph<P>) -> Vec<String> {
        graph
            .realized
            .iter()
            .map(|key| graph.nodes[key.0].config.id().to_string())
            .collect()
    }

    fn insert(
        graph: &mut DependencyGraph<u32>,
        journal: &ConflictJournal,
        config: DetourConfig,
    ) -> NodeKey {
        let payload = graph.len() as u32;
        graph.insert(config, payload, journal).unwrap()
    }

    #[test]
    fn test_priority_orders_descending() {
        let mut graph = DependencyGraph::new();
        let journal = ConflictJournal::new();
        insert(&mut graph, &journal, DetourConfig::new("low").with_priority(-5));
        insert(&mut graph, &journal, DetourConfig::new("high").with_priority(10));
        insert(&mut graph, &journal, DetourConfig::new("mid").with_priority(3));

        assert_eq!(ids(&graph), ["high", "mid", "low"]);
    }

    #[test]
    fn test_no_priority_sorts_last() {
        let mut graph = DependencyGraph::new();
        let journal = ConflictJournal::new();
        insert(&mut graph, &journal, DetourConfig::new("unranked"));
        insert(&mut graph, &journal, DetourConfig::new("ranked").with_priority(-100));

        assert_eq!(ids(&graph), ["ranked", "unranked"]);
    }

    #[test]
    fn test_equal_priority_keeps_insertion_order() {
        let mut graph = DependencyGraph::new();
        let journal = ConflictJournal::new();
        insert(&mut graph, &journal, DetourConfig::new("first").with_priority(1));
        insert(&mut graph, &journal, DetourConfig::new("second").with_priority(1));
        insert(&mut graph, &journal, DetourConfig::new("third").with_priority(1));

        assert_eq!(ids(&graph), ["first", "second", "third"]);
    }

    #[test]
    fn test_sub_priority_breaks_ties() {
        let mut graph = DependencyGraph::new();
        let journal = ConflictJournal::new();
        insert(&mut graph, &journal, DetourConfig::new("plain").with_priority(1));
        insert(
            &mut graph,
            &journal,
            DetourConfig::new("eager").with_priority(1).with_sub_priority(5),
        );

        assert_eq!(ids(&graph), ["eager", "plain"]);
    }

    #[test]
    fn test_before_overrides_priority() {
        let mut graph = DependencyGraph::new();
        let journal = ConflictJournal::new();
        insert(&mut graph, &journal, DetourConfig::new("a").with_priority(10));
        insert(
            &mut graph,
            &journal,
            DetourConfig::new("b").with_priority(5).add_before("a"),
        );

        assert_eq!(ids(&graph), ["b", "a"]);
    }

    #[test]
    fn test_after_overrides_priority() {
        let mut graph = DependencyGraph::new();
        let journal = ConflictJournal::new();
        insert(&mut graph, &journal, DetourConfig::new("a").with_priority(1));
        insert(
            &mut graph,
            &journal,
            DetourConfig::new("b").with_priority(50).add_after("a"),
        );

        assert_eq!(ids(&graph), ["a", "b"]);
    }

    #[test]
    fn test_cycle_is_detected() {
        let mut graph = DependencyGraph::new();
        let journal = ConflictJournal::new();
        insert(&mut graph, &journal, DetourConfig::new("a").add_before("b"));
        let result = graph.insert(DetourConfig::new("b").add_before("a"), 1, &journal);

        assert!(matches!(result, Err(crate::Error::OrderingCycle { .. })));
    }

    #[test]
    fn test_failed_insert_is_backed_out() {
        let mut graph = DependencyGraph::new();
        let journal = ConflictJournal::new();
        insert(&mut graph, &journal, DetourConfig::new("a").add_before("b"));
        let offender = graph
            .insert(DetourConfig::new("b").add_before("a"), 1, &journal)
            .unwrap_err();
        assert!(matches!(offender, crate::Error::OrderingCycle { .. }));

        // the offender was rolled back; the graph keeps working as if it never joined
        assert_eq!(graph.len(), 1);
        assert_eq!(ids(&graph), ["a"]);
        insert(&mut graph, &journal, DetourConfig::new("c").add_after("a"));
        assert_eq!(ids(&graph), ["a", "c"]);
    }

    #[test]
    fn test_remove_of_stale_key_errors() {
        let mut graph = DependencyGraph::new();
        let journal = ConflictJournal::new();
        let key = insert(&mut graph, &journal, DetourConfig::new("a"));

        graph.remove(key).unwrap();
        assert!(matches!(graph.remove(key), Err(crate::Error::NotApplied)));
    }

    #[test]
    fn test_contradiction_resolves_before_wins() {
        let mut graph = DependencyGraph::new();
        let journal = ConflictJournal::new();
        insert(&mut graph, &journal, DetourConfig::new("a").with_priority(1));
        insert(
            &mut graph,
            &journal,
            DetourConfig::new("b")
                .with_priority(50)
                .add_before("a")
                .add_after("a"),
        );

        assert_eq!(ids(&graph), ["b", "a"]);
        let conflicts = journal.snapshot();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].detour, "b");
        assert_eq!(conflicts[0].other, "a");
    }

    #[test]
    fn test_mutual_after_is_a_cycle() {
        let mut graph = DependencyGraph::new();
        let journal = ConflictJournal::new();
        insert(&mut graph, &journal, DetourConfig::new("a").add_after("b"));
        let result = graph.insert(DetourConfig::new("b").add_after("a"), 1, &journal);

        assert!(matches!(result, Err(crate::Error::OrderingCycle { .. })));
        assert!(journal.snapshot().is_empty());
    }

    #[test]
    fn test_contradiction_in_existing_config_still_resolves() {
        let mut graph = DependencyGraph::new();
        let journal = ConflictJournal::new();
        insert(
            &mut graph,
            &journal,
            DetourConfig::new("a").add_before("b").add_after("b"),
        );
        insert(&mut graph, &journal, DetourConfig::new("b").with_priority(99));

        // a's before declaration wins even though b joined later with a high priority
        assert_eq!(ids(&graph), ["a", "b"]);
        let conflicts = journal.snapshot();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].detour, "a");
        assert_eq!(conflicts[0].other, "b");
    }

    #[test]
    fn test_remove_restores_priority_order() {
        let mut graph = DependencyGraph::new();
        let journal = ConflictJournal::new();
        insert(&mut graph, &journal, DetourConfig::new("a").with_priority(10));
        let b = insert(
            &mut graph,
            &journal,
            DetourConfig::new("b").with_priority(5).add_before("a"),
        );
        insert(&mut graph, &journal, DetourConfig::new("c").with_priority(1));
        assert_eq!(ids(&graph), ["b", "a", "c"]);

        let (config, payload) = graph.remove(b).unwrap();
        assert_eq!(config.id(), "b");
        assert_eq!(payload, 1);
        assert_eq!(ids(&graph), ["a", "c"]);
    }

    #[test]
    fn test_transitive_constraints_pull_chains_forward() {
        let mut graph = DependencyGraph::new();
        let journal = ConflictJournal::new();
        insert(&mut graph, &journal, DetourConfig::new("a").with_priority(100));
        insert(
            &mut graph,
            &journal,
            DetourConfig::new("b").with_priority(1).add_before("a"),
        );
        insert(
            &mut graph,
            &journal,
            DetourConfig::new("c").with_priority(-7).add_before("b"),
        );

        assert_eq!(ids(&graph), ["c", "b", "a"]);
    }
}
