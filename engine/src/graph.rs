//! FILENAME: engine/src/graph.rs
//! PURPOSE: A typed directed multigraph over generic node handles, with
//! cached strongly-connected-component and topological-order queries.
//! CONTEXT: Two edge kinds distinguish references that are always read
//! (`STATIC`) from references recorded during the last evaluation of a lazy
//! function (`EVALUATED`), per the evaluator's need to keep `IF`'s untaken
//! branch from forming a cycle. SCC/topo results are computed lazily and
//! cached until the next mutation, using an iterative (non-recursive)
//! Tarjan's algorithm so deep dependency chains don't blow the stack.

use bitflags::bitflags;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EdgeKinds: u8 {
        const STATIC = 0b01;
        const EVALUATED = 0b10;
    }
}

#[derive(Debug, Clone)]
struct EdgeMap<N> {
    forward: HashMap<N, HashMap<N, EdgeKinds>>,
    backward: HashMap<N, HashMap<N, EdgeKinds>>,
}

impl<N: Eq + Hash + Clone> EdgeMap<N> {
    fn new() -> Self {
        EdgeMap {
            forward: HashMap::new(),
            backward: HashMap::new(),
        }
    }
}

/// Cached result of an SCC + topological-order computation.
#[derive(Debug, Clone)]
pub struct SccResult<N> {
    /// Node -> index of its SCC in `components`.
    pub component_of: HashMap<N, usize>,
    /// SCCs in reverse-topological discovery order, each as its member nodes.
    pub components: Vec<Vec<N>>,
    /// All nodes in one valid topological order (dependency-respecting:
    /// a node appears before anything that reads it).
    pub topological_order: Vec<N>,
}

impl<N: Eq + Hash + Clone> SccResult<N> {
    pub fn is_in_cycle(&self, node: &N, has_self_loop: impl Fn(&N) -> bool) -> bool {
        match self.component_of.get(node) {
            None => false,
            Some(&idx) => self.components[idx].len() > 1 || has_self_loop(node),
        }
    }
}

pub struct Graph<N: Eq + Hash + Clone> {
    edges: EdgeMap<N>,
    nodes: HashSet<N>,
    cached: Option<SccResult<N>>,
    dirty: bool,
}

impl<N: Eq + Hash + Clone> Graph<N> {
    pub fn new() -> Self {
        Graph {
            edges: EdgeMap::new(),
            nodes: HashSet::new(),
            cached: None,
            dirty: true,
        }
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn touch(&mut self, node: &N) {
        self.nodes.insert(node.clone());
    }

    /// Adds (or widens the kind set of) an edge `from -> to`. Idempotent on
    /// kind sets: linking the same kind twice has no additional effect.
    pub fn link(&mut self, from: &N, to: &N, kinds: EdgeKinds) {
        self.touch(from);
        self.touch(to);
        let existing = self
            .edges
            .forward
            .entry(from.clone())
            .or_default()
            .entry(to.clone())
            .or_insert(EdgeKinds::empty());
        let before = *existing;
        *existing |= kinds;
        let changed = before != *existing;

        let back = self
            .edges
            .backward
            .entry(to.clone())
            .or_default()
            .entry(from.clone())
            .or_insert(EdgeKinds::empty());
        *back |= kinds;

        if changed {
            self.mark_dirty();
        }
    }

    /// Removes `kinds` from an edge `from -> to`; drops the edge entirely
    /// once no kind remains.
    pub fn unlink(&mut self, from: &N, to: &N, kinds: EdgeKinds) {
        let mut changed = false;
        if let Some(targets) = self.edges.forward.get_mut(from) {
            if let Some(existing) = targets.get_mut(to) {
                let before = *existing;
                existing.remove(kinds);
                changed = before != *existing;
                if existing.is_empty() {
                    targets.remove(to);
                }
            }
        }
        if let Some(sources) = self.edges.backward.get_mut(to) {
            if let Some(existing) = sources.get_mut(from) {
                existing.remove(kinds);
                if existing.is_empty() {
                    sources.remove(from);
                }
            }
        }
        if changed {
            self.mark_dirty();
        }
    }

    /// Removes all outgoing edges of `kinds` from `from`.
    pub fn clear_forward(&mut self, from: &N, kinds: EdgeKinds) {
        let targets: Vec<N> = self
            .edges
            .forward
            .get(from)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        for to in targets {
            self.unlink(from, &to, kinds);
        }
    }

    /// Removes all incoming edges of `kinds` into `to`.
    pub fn clear_backward(&mut self, to: &N, kinds: EdgeKinds) {
        let sources: Vec<N> = self
            .edges
            .backward
            .get(to)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        for from in sources {
            self.unlink(&from, to, kinds);
        }
    }

    pub fn precedents(&self, node: &N, kinds: EdgeKinds) -> Vec<N> {
        self.edges
            .forward
            .get(node)
            .map(|m| {
                m.iter()
                    .filter(|(_, k)| k.intersects(kinds))
                    .map(|(n, _)| n.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn dependents(&self, node: &N, kinds: EdgeKinds) -> Vec<N> {
        self.edges
            .backward
            .get(node)
            .map(|m| {
                m.iter()
                    .filter(|(_, k)| k.intersects(kinds))
                    .map(|(n, _)| n.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn has_self_loop(&self, node: &N, kinds: EdgeKinds) -> bool {
        self.edges
            .forward
            .get(node)
            .and_then(|m| m.get(node))
            .map(|k| k.intersects(kinds))
            .unwrap_or(false)
    }

    /// Nodes reachable by following backward edges (i.e. dependents) from any
    /// member of `nodes`, excluding the seed members themselves.
    pub fn ancestors_of_set(&self, nodes: &HashSet<N>, kinds: EdgeKinds) -> HashSet<N> {
        let mut visited: HashSet<N> = HashSet::new();
        let mut stack: Vec<N> = nodes.iter().cloned().collect();
        while let Some(node) = stack.pop() {
            for dep in self.dependents(&node, kinds) {
                if !nodes.contains(&dep) && visited.insert(dep.clone()) {
                    stack.push(dep);
                }
            }
        }
        visited
    }

    /// Computes (or returns the cached) SCC decomposition and a topological
    /// order, considering only edges matching `kinds`. The cache is
    /// invalidated by any mutating call above.
    pub fn strongly_connected_components_and_topological_order(&mut self, kinds: EdgeKinds) -> &SccResult<N> {
        if self.dirty || self.cached.is_none() {
            self.cached = Some(self.compute_scc(kinds));
            self.dirty = false;
        }
        self.cached.as_ref().unwrap()
    }

    pub fn is_in_cycle(&self, node: &N, kinds: EdgeKinds) -> bool {
        match &self.cached {
            Some(result) => result.is_in_cycle(node, |n| self.has_self_loop(n, kinds)),
            None => false,
        }
    }

    /// Iterative (non-recursive) Tarjan's algorithm. Each stack frame tracks
    /// an explicit iterator position into the node's precedent list instead
    /// of relying on the call stack, so arbitrarily deep dependency chains
    /// don't overflow it.
    fn compute_scc(&self, kinds: EdgeKinds) -> SccResult<N> {
        let mut index_counter: usize = 0;
        let mut indices: HashMap<N, usize> = HashMap::new();
        let mut lowlink: HashMap<N, usize> = HashMap::new();
        let mut on_stack: HashSet<N> = HashSet::new();
        let mut tarjan_stack: Vec<N> = Vec::new();
        let mut components: Vec<Vec<N>> = Vec::new();

        struct Frame<N> {
            node: N,
            neighbor_idx: usize,
        }

        // Iteration order only affects which SCC is discovered first within
        // a pass, never correctness of the resulting decomposition.
        let all_nodes: Vec<N> = self.nodes.iter().cloned().collect();

        for start in all_nodes {
            if indices.contains_key(&start) {
                continue;
            }
            let mut call_stack: Vec<Frame<N>> = vec![Frame {
                node: start.clone(),
                neighbor_idx: 0,
            }];
            indices.insert(start.clone(), index_counter);
            lowlink.insert(start.clone(), index_counter);
            index_counter += 1;
            tarjan_stack.push(start.clone());
            on_stack.insert(start.clone());

            while let Some(frame) = call_stack.last_mut() {
                let node = frame.node.clone();
                let neighbors = self.precedents(&node, kinds);

                if frame.neighbor_idx < neighbors.len() {
                    let next = neighbors[frame.neighbor_idx].clone();
                    frame.neighbor_idx += 1;

                    if !indices.contains_key(&next) {
                        indices.insert(next.clone(), index_counter);
                        lowlink.insert(next.clone(), index_counter);
                        index_counter += 1;
                        tarjan_stack.push(next.clone());
                        on_stack.insert(next.clone());
                        call_stack.push(Frame {
                            node: next,
                            neighbor_idx: 0,
                        });
                    } else if on_stack.contains(&next) {
                        let next_index = indices[&next];
                        let entry = lowlink.get_mut(&node).unwrap();
                        *entry = (*entry).min(next_index);
                    }
                } else {
                    call_stack.pop();
                    if let Some(parent_frame) = call_stack.last() {
                        let node_low = lowlink[&node];
                        let parent = &parent_frame.node;
                        let parent_low = lowlink[parent];
                        lowlink.insert(parent.clone(), parent_low.min(node_low));
                    }

                    if lowlink[&node] == indices[&node] {
                        let mut component = Vec::new();
                        loop {
                            let member = tarjan_stack.pop().unwrap();
                            on_stack.remove(&member);
                            let member_is_root = member == node;
                            component.push(member);
                            if member_is_root {
                                break;
                            }
                        }
                        components.push(component);
                    }
                }
            }
        }

        let mut component_of: HashMap<N, usize> = HashMap::new();
        for (idx, comp) in components.iter().enumerate() {
            for node in comp {
                component_of.insert(node.clone(), idx);
            }
        }

        // Tarjan emits SCCs in reverse topological order (a component's
        // dependencies are fully discovered, and thus finished, before it
        // is); within each component, members are emitted in pop order.
        // Reading components front-to-back and flattening therefore already
        // yields a valid topological order with respect to "precedent before
        // dependent" — i.e. a node precedes anything that reads it.
        let topological_order: Vec<N> = components.iter().flatten().cloned().collect();

        SccResult {
            component_of,
            components,
            topological_order,
        }
    }
}

impl<N: Eq + Hash + Clone> Default for Graph<N> {
    fn default() -> Self {
        Self::new()
    }
}
