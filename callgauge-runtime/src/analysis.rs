//! Read-only passes that annotate a snapshot. They never touch the registry.

use crate::snapshot::{CallEdge, CallNode, Snapshot};

/// Flag, at every node, the most expensive outgoing edge that is not cyclic.
/// Clears any earlier highlight first.
pub fn highlight_critical_path(snapshot: &mut Snapshot) {
    for root in &mut snapshot.roots {
        highlight_node(root);
    }
}

fn highlight_node(node: &mut CallNode) {
    for edge in &mut node.edges {
        edge.highlighted = false;
    }
    let critical = node
        .edges
        .iter()
        .enumerate()
        .filter(|(_, e)| !e.cyclic)
        // Ties go to the first edge, which the builder ordered by name.
        .max_by(|(ia, a), (ib, b)| a.value.cmp_primary(&b.value).then(ib.cmp(ia)))
        .map(|(i, _)| i);
    if let Some(i) = critical {
        node.edges[i].highlighted = true;
    }
    for edge in &mut node.edges {
        highlight_node(&mut edge.target);
    }
}

/// Follow highlighted edges down from the most expensive root.
///
/// Run [`highlight_critical_path`] first; on an unannotated snapshot this is
/// just that root.
pub fn hottest_path(snapshot: &Snapshot) -> Vec<&CallNode> {
    let Some(mut node) = snapshot
        .roots
        .iter()
        .max_by_key(|r| r.stats.total_ns())
    else {
        return Vec::new();
    };
    let mut path = vec![node];
    while let Some(edge) = node.edges.iter().find(|e| e.highlighted) {
        node = &edge.target;
        path.push(node);
    }
    path
}

/// The highlighted edges, preorder.
pub fn highlighted_edges(snapshot: &Snapshot) -> Vec<&CallEdge> {
    snapshot.edges().into_iter().filter(|e| e.highlighted).collect()
}
