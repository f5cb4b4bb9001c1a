//! Immutable call graphs materialized from a live registry.
//!
//! Roots are methods that ran but were never entered from an instrumented
//! caller, except recursively. When methods only ever enter one another, the
//! costliest unreached one is promoted, so every active method appears. From
//! each root the builder follows callee
//! edges depth-first, copying every value it reads, so the result shares
//! nothing with the registry.
//!
//! Cycle guard: the builder tracks the methods on the current root-to-node
//! path. An edge whose target is already on the path (the node itself or an
//! ancestor) is emitted with `cyclic` set and is not descended, so a
//! recursive program produces a finite graph.
//!
//! No lock is held across the traversal; counters may move while it runs.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use crate::measure::Measurement;
use crate::registry::{timestamp_ms, MethodId, MethodStats, Registry};

/// Copied statistics of one method.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodSummary {
    pub calls: u64,
    pub recursive_calls: u64,
    pub errors: u64,
    pub sum: Option<Measurement>,
    pub min: Option<Measurement>,
    pub max: Option<Measurement>,
}

impl MethodSummary {
    fn of(stats: &MethodStats) -> Self {
        Self {
            calls: stats.calls(),
            recursive_calls: stats.recursive_calls(),
            errors: stats.errors(),
            sum: stats.sum(),
            min: stats.min(),
            max: stats.max(),
        }
    }

    /// Primary component of `sum`, zero when absent.
    pub fn total_ns(&self) -> u64 {
        self.sum.map_or(0, |s| s.primary())
    }
}

/// A method in the snapshot with its outgoing edges.
#[derive(Debug, Clone, PartialEq)]
pub struct CallNode {
    pub id: MethodId,
    pub class: String,
    pub method: String,
    pub stats: MethodSummary,
    pub edges: Vec<CallEdge>,
}

impl CallNode {
    /// `Class::method`.
    pub fn qualified_name(&self) -> String {
        format!("{}::{}", self.class, self.method)
    }

    /// This node and everything below it, preorder.
    pub fn descendants(&self) -> Vec<&CallNode> {
        let mut out = Vec::new();
        let mut pending = vec![self];
        while let Some(node) = pending.pop() {
            out.push(node);
            pending.extend(node.edges.iter().rev().map(|e| &e.target));
        }
        out
    }
}

/// Calls from one node to another.
#[derive(Debug, Clone, PartialEq)]
pub struct CallEdge {
    /// Accumulated measurement of all calls through this edge.
    pub value: Measurement,
    pub calls: u64,
    /// Calls that entered the target while it was already active.
    pub recursive_calls: u64,
    /// Target is already on the path from the root; `target` has no edges.
    pub cyclic: bool,
    /// Set by analysis passes, e.g. the most expensive edge of its node.
    pub highlighted: bool,
    pub target: CallNode,
}

/// Call graph plus the window it covers.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub roots: Vec<CallNode>,
    /// Window start, ms since the Unix epoch.
    pub started_at_ms: u64,
    /// Window end (snapshot time), ms since the Unix epoch.
    pub ended_at_ms: u64,
    /// Name of the measurement source (`"wall"`, `"wall+cpu"`).
    pub source: String,
}

impl Snapshot {
    /// Every node in the graph, preorder from each root.
    pub fn nodes(&self) -> Vec<&CallNode> {
        self.roots.iter().flat_map(|r| r.descendants()).collect()
    }

    /// First node for `class::method`, searching roots in order.
    pub fn find(&self, class: &str, method: &str) -> Option<&CallNode> {
        self.nodes()
            .into_iter()
            .find(|n| n.class == class && n.method == method)
    }

    /// All edges in the graph.
    pub fn edges(&self) -> Vec<&CallEdge> {
        self.nodes().into_iter().flat_map(|n| n.edges.iter()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

/// Build a snapshot of `registry`. `source` names the measurement source.
pub fn build(registry: &Registry, source: &str) -> Snapshot {
    let started_at_ms = registry.started_at_ms();
    let methods = registry.methods();

    // Targets entered non-recursively from an instrumented caller.
    let mut called: HashSet<MethodId> = HashSet::new();
    for method in &methods {
        for edge in method.callees() {
            if edge.outermost_calls() > 0 {
                called.insert(edge.target_id());
            }
        }
    }

    let active: Vec<&Arc<MethodStats>> = methods
        .iter()
        .filter(|m| m.calls() + m.recursive_calls() > 0)
        .collect();

    let mut path = HashSet::new();
    let mut roots: Vec<CallNode> = active
        .iter()
        .filter(|m| !called.contains(&m.id()))
        .map(|m| visit(m, &mut path))
        .collect();

    // Methods entered from each other in both directions (b → a, later
    // a → b) all have callers, so none qualifies as a root. Promote the
    // costliest unreached one until every active method is in the graph.
    let mut reached: HashSet<MethodId> = roots
        .iter()
        .flat_map(|r| r.descendants())
        .map(|n| n.id)
        .collect();
    loop {
        let next = active
            .iter()
            .filter(|m| !reached.contains(&m.id()))
            .min_by(|a, b| {
                stats_cost(b)
                    .cmp(&stats_cost(a))
                    .then_with(|| a.class().cmp(b.class()))
                    .then_with(|| a.method().cmp(b.method()))
            });
        let Some(next) = next else {
            break;
        };
        let root = visit(next, &mut path);
        reached.extend(root.descendants().into_iter().map(|n| n.id));
        roots.push(root);
    }
    roots.sort_by(|a, b| by_cost(a.stats.total_ns(), b.stats.total_ns(), a, b));

    let snapshot = Snapshot {
        roots,
        started_at_ms,
        ended_at_ms: timestamp_ms(),
        source: source.to_owned(),
    };
    log::debug!(
        "snapshot: {} root(s), {} node(s)",
        snapshot.roots.len(),
        snapshot.nodes().len()
    );
    snapshot
}

fn visit(stats: &Arc<MethodStats>, path: &mut HashSet<MethodId>) -> CallNode {
    path.insert(stats.id());
    let mut edges: Vec<CallEdge> = stats
        .callees()
        .into_iter()
        .filter(|edge| edge.calls() > 0)
        .filter_map(|edge| {
            let target = edge.target()?;
            let cyclic = path.contains(&target.id());
            let target = if cyclic {
                leaf(&target)
            } else {
                visit(&target, path)
            };
            Some(CallEdge {
                value: edge.sum(),
                calls: edge.calls(),
                recursive_calls: edge.recursive_calls(),
                cyclic,
                highlighted: false,
                target,
            })
        })
        .collect();
    edges.sort_by(|a, b| by_cost(a.value.primary(), b.value.primary(), &a.target, &b.target));
    path.remove(&stats.id());

    CallNode {
        edges,
        ..leaf(stats)
    }
}

fn stats_cost(stats: &MethodStats) -> u64 {
    stats.sum().map_or(0, |s| s.primary())
}

fn leaf(stats: &MethodStats) -> CallNode {
    CallNode {
        id: stats.id(),
        class: stats.class().to_owned(),
        method: stats.method().to_owned(),
        stats: MethodSummary::of(stats),
        edges: Vec::new(),
    }
}

/// Most expensive first; ties broken by name for stable output.
fn by_cost(a_ns: u64, b_ns: u64, a: &CallNode, b: &CallNode) -> Ordering {
    b_ns.cmp(&a_ns)
        .then_with(|| a.class.cmp(&b.class))
        .then_with(|| a.method.cmp(&b.method))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Record what a finished session would: the call plus its caller edge.
    fn call(caller: Option<&Arc<MethodStats>>, callee: &Arc<MethodStats>, ns: u64, recursive: bool) {
        let delta = Measurement::wall(ns);
        callee.add_call(&delta, !recursive);
        if let Some(caller) = caller {
            caller.callee(callee).add(&delta, recursive);
        }
    }

    #[test]
    fn empty_registry_gives_empty_snapshot() {
        let registry = Registry::new(1);
        registry.method("Idle", "never");
        let snapshot = build(&registry, "wall");
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.source, "wall");
        assert!(snapshot.ended_at_ms >= snapshot.started_at_ms);
    }

    #[test]
    fn two_node_cycle_terminates_with_one_cyclic_edge() {
        let registry = Registry::new(1);
        let a = registry.method("App", "a");
        let b = registry.method("App", "b");
        // a → b → a (inner a is recursive)
        call(Some(&b), &a, 3, true);
        call(Some(&a), &b, 5, false);
        call(None, &a, 9, false);

        let snapshot = build(&registry, "wall");
        assert_eq!(snapshot.roots.len(), 1);
        let root = &snapshot.roots[0];
        assert_eq!(root.method, "a");
        assert_eq!(root.edges.len(), 1);
        let to_b = &root.edges[0];
        assert!(!to_b.cyclic);
        assert_eq!(to_b.target.method, "b");
        assert_eq!(to_b.target.edges.len(), 1);
        let back = &to_b.target.edges[0];
        assert!(back.cyclic);
        assert_eq!(back.target.method, "a");
        assert!(back.target.edges.is_empty());
        assert_eq!(snapshot.edges().iter().filter(|e| e.cyclic).count(), 1);
    }

    #[test]
    fn self_recursive_root_is_still_a_root() {
        let registry = Registry::new(1);
        let a = registry.method("App", "a");
        let b = registry.method("App", "b");
        call(Some(&a), &a, 2, true);
        call(Some(&a), &b, 4, false);
        call(None, &a, 10, false);

        let snapshot = build(&registry, "wall");
        let roots: Vec<_> = snapshot.roots.iter().map(|r| r.method.as_str()).collect();
        assert_eq!(roots, ["a"]);
        let root = &snapshot.roots[0];
        assert_eq!(root.edges.len(), 2);
        assert_eq!(root.edges[0].target.method, "b", "sorted by cost");
        assert!(root.edges[1].cyclic, "self edge is cyclic");
    }

    #[test]
    fn methods_entered_from_each_other_still_appear() {
        let registry = Registry::new(1);
        let a = registry.method("App", "a");
        let b = registry.method("App", "b");
        // b → a, then separately a → b; neither call is recursive.
        call(Some(&b), &a, 2, false);
        call(None, &b, 5, false);
        call(Some(&a), &b, 3, false);
        call(None, &a, 7, false);

        let snapshot = build(&registry, "wall");
        assert!(!snapshot.is_empty());
        assert_eq!(snapshot.roots.len(), 1);
        let root = &snapshot.roots[0];
        assert_eq!(root.method, "a", "costliest method is promoted");
        assert_eq!(root.stats.calls, 2);
        let to_b = &root.edges[0];
        assert_eq!(to_b.target.method, "b");
        assert_eq!(to_b.target.stats.calls, 2);
        assert!(to_b.target.edges[0].cyclic);
        assert_eq!(snapshot.nodes().len(), 3);
    }

    #[test]
    fn every_active_method_is_reachable() {
        let registry = Registry::new(1);
        let methods: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|m| registry.method("Ring", m))
            .collect();
        // a → b → c → a, each edge entered from outside the ring once.
        for i in 0..3 {
            let caller = &methods[i];
            let callee = &methods[(i + 1) % 3];
            call(Some(caller), callee, 1, false);
            call(None, caller, 4, false);
        }
        let snapshot = build(&registry, "wall");
        for m in ["a", "b", "c"] {
            assert!(snapshot.find("Ring", m).is_some(), "{m} missing");
        }
    }

    #[test]
    fn snapshot_is_detached_from_registry() {
        let registry = Registry::new(1);
        let a = registry.method("App", "a");
        call(None, &a, 10, false);
        let snapshot = build(&registry, "wall");
        call(None, &a, 10, false);
        registry.clear();
        assert_eq!(snapshot.roots[0].stats.calls, 1);
        assert_eq!(snapshot.roots[0].stats.total_ns(), 10);
    }

    #[test]
    fn roots_sorted_by_total_and_nodes_listed_preorder() {
        let registry = Registry::new(1);
        let cheap = registry.method("App", "cheap");
        let costly = registry.method("App", "costly");
        let child = registry.method("App", "child");
        call(None, &cheap, 1, false);
        call(Some(&costly), &child, 40, false);
        call(None, &costly, 50, false);

        let snapshot = build(&registry, "wall");
        let order: Vec<_> = snapshot.nodes().iter().map(|n| n.method.clone()).collect();
        assert_eq!(order, ["costly", "child", "cheap"]);
        assert_eq!(snapshot.find("App", "child").unwrap().stats.calls, 1);
        assert!(snapshot.find("App", "missing").is_none());
    }
}
