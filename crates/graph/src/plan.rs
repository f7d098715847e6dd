//! Build planning
//!
//! Produces a depth-sorted ordering of the elements that actually need
//! work: runtime dependencies plan at the same depth, build dependencies
//! of uncached elements one deeper, and the deepest elements dispatch
//! first to maximize downstream parallelism.

use crate::graph::{DepKind, Graph};
use petgraph::graph::NodeIndex;
use std::collections::{HashMap, HashSet};

struct Planner {
    depth_map: HashMap<NodeIndex, usize>,
    visiting: HashSet<NodeIndex>,
}

impl Planner {
    // An element reachable from several places is deliberately revisited;
    // we want the deepest occurrence of every element.
    fn plan_element(&mut self, graph: &Graph, node: NodeIndex, depth: usize) {
        if self.visiting.contains(&node) {
            // circular runtime dependency, already being processed
            return;
        }
        if let Some(prev) = self.depth_map.get(&node) {
            if *prev >= depth {
                return;
            }
        }

        self.visiting.insert(node);
        for dep in graph.direct_deps(node, DepKind::Runtime) {
            self.plan_element(graph, dep, depth);
        }

        // No need to plan builds of elements that are already cached
        if !graph.element(node).cached() {
            for dep in graph.direct_deps(node, DepKind::Build) {
                self.plan_element(graph, dep, depth + 1);
            }
        }

        self.depth_map.insert(node, depth);
        self.visiting.remove(&node);
    }
}

/// Plan a build of `targets`.
///
/// Returns elements deepest-first with a stable tie-break; cached elements
/// are dropped unless `plan_cached` is set.
#[must_use]
pub fn plan(graph: &Graph, targets: &[NodeIndex], plan_cached: bool) -> Vec<NodeIndex> {
    let mut planner = Planner {
        depth_map: HashMap::new(),
        visiting: HashSet::new(),
    };
    for target in targets {
        planner.plan_element(graph, *target, 0);
    }

    let mut entries: Vec<(NodeIndex, usize)> = planner.depth_map.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    entries
        .into_iter()
        .map(|(node, _)| node)
        .filter(|node| plan_cached || !graph.element(*node).cached())
        .collect()
}
