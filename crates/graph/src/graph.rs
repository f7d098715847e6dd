//! The element dependency graph

use crate::element::{DepType, Element, ElementDecl, ElementState};
use crate::error::{GraphError, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{EdgeFiltered, EdgeRef};
use petgraph::Direction;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Edge kind in the element graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepKind {
    /// The target is needed to build the source
    Build,
    /// The target is needed when the source runs
    Runtime,
}

/// Dependency traversal scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The element itself only
    None,
    /// Everything reachable over build and runtime edges
    All,
    /// Direct build dependencies plus their transitive runtime closure
    Build,
    /// The element plus its transitive runtime closure
    Run,
}

/// A project's element DAG
pub struct Graph {
    graph: DiGraph<Element, DepKind>,
    name_to_node: HashMap<String, NodeIndex>,
    project: String,
}

impl Graph {
    /// Build a graph from element declarations.
    ///
    /// Cycles over build edges are rejected; cycles over runtime edges are
    /// allowed (the planner treats them as already-visiting).
    pub fn from_decls(
        project: impl Into<String>,
        decls: &BTreeMap<String, ElementDecl>,
    ) -> Result<Self> {
        let mut graph = Self {
            graph: DiGraph::new(),
            name_to_node: HashMap::new(),
            project: project.into(),
        };

        for (name, decl) in decls {
            let element = Element::from_decl(name, decl)?;
            let node = graph.graph.add_node(element);
            graph.name_to_node.insert(name.clone(), node);
            debug!(element = %name, "Added element");
        }

        for (name, decl) in decls {
            let from = graph.name_to_node[name];
            for dep in &decl.depends {
                let to = graph.node(&dep.filename)?;
                match dep.dep_type {
                    DepType::Build => {
                        graph.graph.add_edge(from, to, DepKind::Build);
                    }
                    DepType::Runtime => {
                        graph.graph.add_edge(from, to, DepKind::Runtime);
                    }
                    DepType::All => {
                        graph.graph.add_edge(from, to, DepKind::Build);
                        graph.graph.add_edge(from, to, DepKind::Runtime);
                    }
                }
            }
        }

        graph.check_build_cycles()?;
        Ok(graph)
    }

    fn check_build_cycles(&self) -> Result<()> {
        let build_only = EdgeFiltered::from_fn(&self.graph, |e| *e.weight() == DepKind::Build);
        toposort(&build_only, None).map_err(|cycle| GraphError::Cycle {
            element: self.graph[cycle.node_id()].name.clone(),
        })?;
        Ok(())
    }

    /// The project name.
    #[must_use]
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Look up an element's node by name.
    pub fn node(&self, name: &str) -> Result<NodeIndex> {
        self.name_to_node
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::UnknownElement {
                name: name.to_string(),
            })
    }

    /// All nodes, in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    /// Immutable element access.
    #[must_use]
    pub fn element(&self, node: NodeIndex) -> &Element {
        &self.graph[node]
    }

    /// Mutable element access.
    pub fn element_mut(&mut self, node: NodeIndex) -> &mut Element {
        &mut self.graph[node]
    }

    /// Direct dependencies over one edge kind, in declaration order.
    #[must_use]
    pub fn direct_deps(&self, node: NodeIndex, kind: DepKind) -> Vec<NodeIndex> {
        let mut edges: Vec<_> = self
            .graph
            .edges_directed(node, Direction::Outgoing)
            .filter(|e| *e.weight() == kind)
            .map(|e| (e.id(), e.target()))
            .collect();
        // Edge ids grow with insertion; sorting restores declaration order
        edges.sort_by_key(|(id, _)| *id);
        edges.into_iter().map(|(_, target)| target).collect()
    }

    /// Dependencies of `node` in `scope`, deduplicated, dependencies
    /// before dependents, stable across runs.
    #[must_use]
    pub fn dependencies(&self, node: NodeIndex, scope: Scope) -> Vec<NodeIndex> {
        let mut visited = HashSet::new();
        let mut out = Vec::new();

        match scope {
            Scope::None => out.push(node),
            Scope::All => {
                self.walk_postorder(node, &[DepKind::Build, DepKind::Runtime], &mut visited, &mut out);
            }
            Scope::Run => {
                self.walk_postorder(node, &[DepKind::Runtime], &mut visited, &mut out);
            }
            Scope::Build => {
                for dep in self.direct_deps(node, DepKind::Build) {
                    self.walk_postorder(dep, &[DepKind::Runtime], &mut visited, &mut out);
                }
            }
        }

        out
    }

    fn walk_postorder(
        &self,
        node: NodeIndex,
        kinds: &[DepKind],
        visited: &mut HashSet<NodeIndex>,
        out: &mut Vec<NodeIndex>,
    ) {
        if !visited.insert(node) {
            return;
        }
        for kind in kinds {
            for dep in self.direct_deps(node, *kind) {
                self.walk_postorder(dep, kinds, visited, out);
            }
        }
        out.push(node);
    }

    /// Recompute an element's lifecycle state.
    ///
    /// `artifact_cached` is whether its artifact resolves locally under the
    /// strong key; `sources_local` is whether all sources are staged or
    /// stageable without fetching.
    pub fn update_state(&mut self, node: NodeIndex, artifact_cached: bool, sources_local: bool) {
        if self.graph[node].failed() {
            return;
        }

        let new_state = if !self.graph[node].sources_resolved() {
            ElementState::Inconsistent
        } else if artifact_cached {
            ElementState::Cached
        } else if !sources_local {
            ElementState::FetchNeeded
        } else if self
            .dependencies(node, Scope::Build)
            .iter()
            .all(|dep| self.graph[*dep].cached())
        {
            ElementState::Buildable
        } else {
            ElementState::Resolved
        };

        let element = &mut self.graph[node];
        if element.state != new_state {
            debug!(element = %element.name, state = ?new_state, "Element state change");
            element.state = new_state;
        }
    }
}
