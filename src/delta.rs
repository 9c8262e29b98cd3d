//! Decides which store paths travel with an instruction.
//!
//! Pure function over path-info data: the store adapter queries the closures,
//! this module diffs and orders them. Output order is deterministic so two
//! builds of the same revisions produce identical instructions.

use std::collections::{BTreeSet, HashMap, HashSet};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use tracing::instrument;

use crate::errors::Error;
use crate::path_info::PathInfo;
use crate::store_path::StorePath;

/// The outcome of diffing a "to" closure against a set of "from" closures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delta {
    /// Paths of the "to" closure absent from every "from" closure.
    pub added: Vec<PathInfo>,
    /// The full "to" closure.
    pub all_resulting_items: Vec<PathInfo>,
}

impl Delta {
    pub fn added_paths(&self) -> Vec<StorePath> {
        self.added.iter().map(|i| i.path.clone()).collect()
    }

    pub fn all_paths(&self) -> Vec<StorePath> {
        self.all_resulting_items
            .iter()
            .map(|i| i.path.clone())
            .collect()
    }
}

/// Diff the closure of the new toplevel against the union of the closures
/// assumed present on the target.
///
/// `to_closure` is the full closure of the "to" root, as returned by the
/// adapter; `from_paths` the union of the "from" closures, by path. Both
/// result lists are deduplicated by path and ordered so a path appears after
/// everything it references, ties broken lexicographically. With an empty
/// `from_paths`, everything is added.
///
/// Membership is decided by path string alone: the adapter's path infos are
/// authoritative, nothing is re-hashed here. Reference cycles cannot occur in
/// a well-formed store; if one shows up anyway, [Error::ClosureCycle] names a
/// path on it.
#[instrument(skip_all, fields(to = to_closure.len(), from = from_paths.len()), err)]
pub fn compute_delta(
    to_closure: Vec<PathInfo>,
    from_paths: &HashSet<StorePath>,
) -> Result<Delta, Error> {
    let all_resulting_items = sort_topologically(to_closure)?;

    let added = all_resulting_items
        .iter()
        .filter(|info| !from_paths.contains(&info.path))
        .cloned()
        .collect();

    Ok(Delta {
        added,
        all_resulting_items,
    })
}

/// Order a closure so every path appears after all of its references,
/// deduplicated by path, ties broken by lexicographic order on the path.
fn sort_topologically(closure: Vec<PathInfo>) -> Result<Vec<PathInfo>, Error> {
    // Deduplicate by path and fix the lexicographic base order. Node indices
    // are handed out in insertion order, so ties below resolve to the
    // lexicographically smallest path.
    let mut by_path: HashMap<StorePath, PathInfo> = HashMap::new();
    for info in closure {
        by_path.entry(info.path.clone()).or_insert(info);
    }
    let mut infos: Vec<PathInfo> = by_path.into_values().collect();
    infos.sort_by(|a, b| a.path.cmp(&b.path));

    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let mut node_of: HashMap<&StorePath, NodeIndex> = HashMap::new();
    for (i, info) in infos.iter().enumerate() {
        node_of.insert(&info.path, graph.add_node(i));
    }

    // Edge a -> b: a references b. Self-references and references leaving the
    // closure carry no ordering information.
    for info in infos.iter() {
        let from = node_of[&info.path];
        for reference in info.references_excluding_self() {
            if let Some(&to) = node_of.get(reference) {
                graph.add_edge(from, to, ());
            }
        }
    }

    // Kahn's algorithm, emitting references-first. The ready set is ordered
    // by node index, i.e. lexicographically by path.
    let mut remaining: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|ix| (ix, graph.edges_directed(ix, Direction::Outgoing).count()))
        .collect();
    let mut ready: BTreeSet<NodeIndex> = remaining
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(ix, _)| *ix)
        .collect();

    let mut order: Vec<NodeIndex> = Vec::with_capacity(graph.node_count());
    while let Some(ix) = ready.pop_first() {
        order.push(ix);
        for dependent in graph.neighbors_directed(ix, Direction::Incoming) {
            let deg = remaining.get_mut(&dependent).expect("node is known");
            *deg -= 1;
            if *deg == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() != graph.node_count() {
        // Some node never drained: it sits on a cycle. Name the smallest one.
        let stuck = graph
            .node_indices()
            .find(|ix| !order.contains(ix))
            .expect("at least one node is stuck");
        return Err(Error::ClosureCycle(infos[graph[stuck]].path.clone()));
    }

    let positions: Vec<usize> = order.iter().map(|ix| graph[*ix]).collect();
    let mut slots: Vec<Option<PathInfo>> = infos.into_iter().map(Some).collect();
    Ok(positions
        .into_iter()
        .map(|i| slots[i].take().expect("each slot drained once"))
        .collect())
}
