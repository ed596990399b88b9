// src/dag/graph.rs

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::Direction;
use petgraph::algo::has_path_connecting;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use tracing::debug;

use crate::types::ResourceName;

/// Node weight: the resource name plus whether a resource by that name is
/// actually registered. Absent nodes exist only because something refs them.
#[derive(Debug, Clone)]
struct DagNode {
    name: ResourceName,
    present: bool,
}

/// Dependency graph induced by resources' `refs`.
///
/// Edge direction is `ref -> resource`: for `B.refs = [A]` we store `A -> B`,
/// so children are the resources that depend on a node.
///
/// Adding a resource whose refs would close a cycle is rejected; the caller
/// (the catalog) tracks such resources as cyclic and retries them later.
#[derive(Debug, Default)]
pub struct Dag {
    graph: StableDiGraph<DagNode, ()>,
    index: HashMap<String, NodeIndex>,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` with the given refs, replacing any previous refs.
    ///
    /// Returns `false` (and leaves `name` out of the graph) if the refs would
    /// introduce a cycle.
    pub fn add(&mut self, name: &ResourceName, refs: &[ResourceName]) -> bool {
        let idx = self.ensure_node(name);

        for r in refs {
            if r == name {
                debug!(%name, "self reference; rejecting");
                self.remove(name);
                return false;
            }
            if let Some(&ref_idx) = self.index.get(&r.key()) {
                // Adding ref -> name closes a cycle iff name already reaches ref.
                if has_path_connecting(&self.graph, idx, ref_idx, None) {
                    debug!(%name, r#ref = %r, "ref would close a cycle; rejecting");
                    self.remove(name);
                    return false;
                }
            }
        }

        let old_parents = self.detach_parents(idx);

        for r in refs {
            let ref_idx = self.ensure_node(r);
            if self.graph.find_edge(ref_idx, idx).is_none() {
                self.graph.add_edge(ref_idx, idx, ());
            }
        }

        if let Some(node) = self.graph.node_weight_mut(idx) {
            node.present = true;
        }

        for p in old_parents {
            self.collect_garbage(p);
        }

        true
    }

    /// Remove `name` from the graph. Children keep their edge to it (as an
    /// absent node) so they are linked again if it comes back.
    pub fn remove(&mut self, name: &ResourceName) {
        let Some(&idx) = self.index.get(&name.key()) else {
            return;
        };

        if let Some(node) = self.graph.node_weight_mut(idx) {
            node.present = false;
        }

        let old_parents = self.detach_parents(idx);
        self.collect_garbage(idx);
        for p in old_parents {
            self.collect_garbage(p);
        }
    }

    /// Whether `name` is registered (present) in the graph.
    pub fn contains(&self, name: &ResourceName) -> bool {
        self.index
            .get(&name.key())
            .and_then(|&idx| self.graph.node_weight(idx))
            .is_some_and(|n| n.present)
    }

    /// Immediate parents (refs) of `name` that are present.
    pub fn parents(&self, name: &ResourceName) -> Vec<ResourceName> {
        self.neighbors(name, Direction::Incoming)
    }

    /// Immediate children (resources that ref `name`).
    pub fn children(&self, name: &ResourceName) -> Vec<ResourceName> {
        self.neighbors(name, Direction::Outgoing)
    }

    /// All transitive children of `name`, breadth first, excluding `name`.
    pub fn descendants(&self, name: &ResourceName) -> Vec<ResourceName> {
        let Some(&root) = self.index.get(&name.key()) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        let mut seen: HashSet<NodeIndex> = HashSet::from([root]);
        let mut queue: VecDeque<NodeIndex> = VecDeque::from([root]);

        while let Some(idx) = queue.pop_front() {
            for child in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if seen.insert(child) {
                    if let Some(node) = self.graph.node_weight(child) {
                        out.push(node.name.clone());
                    }
                    queue.push_back(child);
                }
            }
        }

        out
    }

    fn neighbors(&self, name: &ResourceName, dir: Direction) -> Vec<ResourceName> {
        let Some(&idx) = self.index.get(&name.key()) else {
            return Vec::new();
        };

        let mut out: Vec<ResourceName> = self
            .graph
            .neighbors_directed(idx, dir)
            .filter_map(|n| self.graph.node_weight(n))
            .filter(|n| n.present)
            .map(|n| n.name.clone())
            .collect();
        out.sort();
        out
    }

    fn ensure_node(&mut self, name: &ResourceName) -> NodeIndex {
        let key = name.key();
        if let Some(&idx) = self.index.get(&key) {
            return idx;
        }
        let idx = self.graph.add_node(DagNode {
            name: name.clone(),
            present: false,
        });
        self.index.insert(key, idx);
        idx
    }

    /// Drop every incoming edge of `idx`, returning the former parents.
    fn detach_parents(&mut self, idx: NodeIndex) -> Vec<NodeIndex> {
        let edges: Vec<_> = self
            .graph
            .edges_directed(idx, Direction::Incoming)
            .map(|e| (e.id(), e.source()))
            .collect();

        edges
            .into_iter()
            .map(|(edge, source)| {
                self.graph.remove_edge(edge);
                source
            })
            .collect()
    }

    /// Absent nodes that nothing refs anymore are dropped.
    fn collect_garbage(&mut self, idx: NodeIndex) {
        let Some(node) = self.graph.node_weight(idx) else {
            return;
        };
        if node.present {
            return;
        }
        let has_edges = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .next()
            .is_some()
            || self
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .next()
                .is_some();
        if has_edges {
            return;
        }
        let key = node.name.key();
        self.graph.remove_node(idx);
        self.index.remove(&key);
    }
}
