//! Dependency Manager — validate a workflow graph, order it, and compute
//! which nodes are dispatchable for a given execution state.
//!
//! Rules enforced by [`validate`]:
//! 1. Node IDs must be unique within the workflow.
//! 2. Every edge must reference valid node IDs (both source and target).
//! 3. DATA/CONTROL edges must be acyclic; a self-loop of any type is a cycle.
//! 4. RESOURCE peers must not be start-coupled through ON_START control
//!    edges, and no node may need more of a resource than the pool holds.
//!
//! All conflicts are collected in one pass so a caller can fix the
//! definition in a single edit.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use crate::conflict::{Conflict, ConflictKind};
use crate::models::{ControlGate, DependencyType, Workflow};
use crate::state::{ExecutionState, NodeState};

#[derive(Debug, Default, Clone)]
struct Links {
    data_preds: BTreeSet<String>,
    control_preds: BTreeMap<String, ControlGate>,
    resource_peers: BTreeSet<String>,
    /// DATA and CONTROL targets.
    successors: BTreeSet<String>,
    data_successors: BTreeSet<String>,
    /// CONTROL targets released as soon as this node starts.
    start_successors: BTreeSet<String>,
}

/// Adjacency view of a validated workflow.
///
/// Only obtainable through [`validate`], so every `DependencyGraph` is
/// acyclic and references only existing nodes.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    links: BTreeMap<String, Links>,
    order: Vec<String>,
    position: HashMap<String, usize>,
}

/// Validate the workflow and build its dependency graph.
///
/// # Errors
/// Every conflict found, in discovery order: duplicate nodes, invalid
/// edges, self-loops, cycles, then resource deadlocks.
pub fn validate(workflow: &Workflow) -> Result<DependencyGraph, Vec<Conflict>> {
    let mut conflicts = Vec::new();

    // -----------------------------------------------------------------------
    // 1. Ensure node IDs are unique
    // -----------------------------------------------------------------------
    let mut seen_ids: HashSet<&str> = HashSet::new();
    let mut reported: HashSet<&str> = HashSet::new();
    for node in &workflow.nodes {
        if !seen_ids.insert(node.id.as_str()) && reported.insert(node.id.as_str()) {
            conflicts.push(Conflict::new(
                ConflictKind::DuplicateNode,
                vec![node.id.clone()],
                format!("node id '{}' is used more than once", node.id),
            ));
        }
    }

    let mut links: BTreeMap<String, Links> = workflow
        .nodes
        .iter()
        .map(|n| (n.id.clone(), Links::default()))
        .collect();

    // -----------------------------------------------------------------------
    // 2. Validate edge endpoints and build adjacency
    // -----------------------------------------------------------------------
    let mut resource_edges: BTreeSet<(String, String)> = BTreeSet::new();

    for edge in &workflow.edges {
        let (src, dst) = (edge.source_id.as_str(), edge.target_id.as_str());
        let mut valid = true;
        for (id, side) in [(src, "source"), (dst, "target")] {
            if !links.contains_key(id) {
                valid = false;
                conflicts.push(Conflict::new(
                    ConflictKind::InvalidEdge,
                    vec![src.to_owned(), dst.to_owned()],
                    format!("edge references unknown node '{id}' ({side} side)"),
                ));
            }
        }
        if !valid {
            continue;
        }

        if src == dst {
            conflicts.push(Conflict::new(
                ConflictKind::Cycle,
                vec![src.to_owned()],
                format!("node '{src}' depends on itself"),
            ));
            continue;
        }

        match edge.dependency_type {
            DependencyType::Data => {
                if let Some(l) = links.get_mut(dst) {
                    l.data_preds.insert(src.to_owned());
                }
                if let Some(l) = links.get_mut(src) {
                    l.successors.insert(dst.to_owned());
                    l.data_successors.insert(dst.to_owned());
                }
            }
            DependencyType::Control => {
                if let Some(l) = links.get_mut(dst) {
                    // Duplicate control edges keep the stricter gate.
                    let gate = l.control_preds.entry(src.to_owned()).or_insert(edge.gate);
                    if edge.gate == ControlGate::OnFinish {
                        *gate = ControlGate::OnFinish;
                    }
                }
                if let Some(l) = links.get_mut(src) {
                    l.successors.insert(dst.to_owned());
                    if edge.gate == ControlGate::OnStart {
                        l.start_successors.insert(dst.to_owned());
                    }
                }
            }
            DependencyType::Resource => {
                if let Some(l) = links.get_mut(src) {
                    l.resource_peers.insert(dst.to_owned());
                }
                if let Some(l) = links.get_mut(dst) {
                    l.resource_peers.insert(src.to_owned());
                }
                let pair = if src < dst { (src, dst) } else { (dst, src) };
                resource_edges.insert((pair.0.to_owned(), pair.1.to_owned()));
            }
        }
    }

    // A start-gated successor that also waits on completion is not start-coupled.
    let mut finish_coupled: Vec<(String, String)> = Vec::new();
    for (src, l) in &links {
        for dst in &l.start_successors {
            let gate = links.get(dst).and_then(|d| d.control_preds.get(src));
            if l.data_successors.contains(dst) || gate == Some(&ControlGate::OnFinish) {
                finish_coupled.push((src.clone(), dst.clone()));
            }
        }
    }
    for (src, dst) in finish_coupled {
        if let Some(l) = links.get_mut(&src) {
            l.start_successors.remove(&dst);
        }
    }

    // -----------------------------------------------------------------------
    // 3. Cycle detection (DFS over DATA/CONTROL edges)
    // -----------------------------------------------------------------------
    for cycle in find_cycles(&links) {
        conflicts.push(Conflict::new(
            ConflictKind::Cycle,
            cycle.clone(),
            format!("dependency cycle: {} -> {}", cycle.join(" -> "), cycle[0]),
        ));
    }

    // -----------------------------------------------------------------------
    // 4. Resource compatibility
    // -----------------------------------------------------------------------
    for (a, b) in &resource_edges {
        if start_reachable(&links, a, b) || start_reachable(&links, b, a) {
            conflicts.push(Conflict::new(
                ConflictKind::ResourceDeadlock,
                vec![a.clone(), b.clone()],
                format!(
                    "'{a}' and '{b}' are mutually exclusive but linked by on-start control edges \
                     with no intervening completion"
                ),
            ));
        }
    }

    for node in &workflow.nodes {
        for (resource, &amount) in &node.resource_requirements {
            let capacity = workflow.resource_pool.get(resource).copied().unwrap_or(0);
            if amount > capacity {
                conflicts.push(Conflict::new(
                    ConflictKind::ResourceDeadlock,
                    vec![node.id.clone()],
                    format!(
                        "node '{}' needs {amount} of '{resource}' but the pool holds {capacity}",
                        node.id
                    ),
                ));
            }
        }
    }

    if !conflicts.is_empty() {
        return Err(conflicts);
    }

    let order = kahn_order(&links);
    let position = order.iter().enumerate().map(|(i, id)| (id.clone(), i)).collect();

    Ok(DependencyGraph { links, order, position })
}

/// Topological order of the workflow's nodes (ties by ascending id).
///
/// # Errors
/// The conflicts reported by [`validate`].
pub fn topological_order(workflow: &Workflow) -> Result<Vec<String>, Vec<Conflict>> {
    validate(workflow).map(|graph| graph.order)
}

/// Free-function form of [`DependencyGraph::compute_ready_set`].
pub fn compute_ready_set(graph: &DependencyGraph, state: &ExecutionState) -> BTreeSet<String> {
    graph.compute_ready_set(state)
}

impl DependencyGraph {
    /// Deterministic topological order; ties broken by ascending node id.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Position of the node in [`Self::order`].
    pub fn position(&self, id: &str) -> Option<usize> {
        self.position.get(id).copied()
    }

    /// Number of distinct DATA/CONTROL targets of the node.
    pub fn direct_dependents(&self, id: &str) -> usize {
        self.links.get(id).map_or(0, |l| l.successors.len())
    }

    pub fn resource_peers(&self, id: &str) -> impl Iterator<Item = &str> {
        self.links
            .get(id)
            .into_iter()
            .flat_map(|l| l.resource_peers.iter().map(String::as_str))
    }

    /// All nodes reachable from `id` through DATA edges only, breadth-first.
    pub fn transitive_data_dependents(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([id]);

        while let Some(current) = queue.pop_front() {
            if let Some(l) = self.links.get(current) {
                for next in &l.data_successors {
                    if seen.insert(next.as_str()) {
                        out.push(next.clone());
                        queue.push_back(next.as_str());
                    }
                }
            }
        }
        out
    }

    /// Whether `ancestor` reaches `id` through DATA/CONTROL edges.
    pub fn is_ancestor(&self, ancestor: &str, id: &str) -> bool {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = vec![ancestor];
        while let Some(current) = stack.pop() {
            if let Some(l) = self.links.get(current) {
                for next in &l.successors {
                    if next == id {
                        return true;
                    }
                    if seen.insert(next.as_str()) {
                        stack.push(next.as_str());
                    }
                }
            }
        }
        false
    }

    /// Nodes whose dependency conditions hold in `state`.
    ///
    /// A WAITING or READY node qualifies when every DATA predecessor has
    /// SUCCEEDED, every CONTROL predecessor has started (ON_START) or
    /// finished (ON_FINISH), and no RESOURCE peer is RUNNING. Capacity of the
    /// resource pool is a dispatch concern and is not considered here.
    ///
    /// Pure: never mutates `state`, so repeated calls agree.
    pub fn compute_ready_set(&self, state: &ExecutionState) -> BTreeSet<String> {
        let state_of = |id: &str| state.node_state(id);

        state
            .nodes
            .iter()
            .filter(|(_, record)| matches!(record.state, NodeState::Waiting | NodeState::Ready))
            .filter_map(|(id, _)| {
                let links = self.links.get(id)?;

                let data_ok = links
                    .data_preds
                    .iter()
                    .all(|p| state_of(p) == Some(NodeState::Succeeded));
                let control_ok = links.control_preds.iter().all(|(p, gate)| match (gate, state_of(p)) {
                    (ControlGate::OnStart, Some(s)) => s.has_started(),
                    (ControlGate::OnFinish, Some(s)) => s.is_terminal(),
                    (_, None) => false,
                });
                let exclusive_ok = links
                    .resource_peers
                    .iter()
                    .all(|p| state_of(p) != Some(NodeState::Running));

                (data_ok && control_ok && exclusive_ok).then(|| id.clone())
            })
            .collect()
    }
}

/// Kahn's algorithm over DATA/CONTROL edges with an ordered ready pool, so
/// ties come out in ascending id order.
fn kahn_order(links: &BTreeMap<String, Links>) -> Vec<String> {
    let mut in_degree: HashMap<&str, usize> = links.keys().map(|id| (id.as_str(), 0)).collect();
    for l in links.values() {
        for next in &l.successors {
            *in_degree.entry(next.as_str()).or_insert(0) += 1;
        }
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();

    let mut sorted = Vec::with_capacity(links.len());
    while let Some(id) = ready.pop_first() {
        sorted.push(id.to_owned());
        if let Some(l) = links.get(id) {
            for next in &l.successors {
                if let Some(deg) = in_degree.get_mut(next.as_str()) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(next.as_str());
                    }
                }
            }
        }
    }
    sorted
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Iterative DFS returning one node list per distinct cycle found.
fn find_cycles(links: &BTreeMap<String, Links>) -> Vec<Vec<String>> {
    let successors: HashMap<&str, Vec<&str>> = links
        .iter()
        .map(|(id, l)| (id.as_str(), l.successors.iter().map(String::as_str).collect()))
        .collect();
    let mut marks: HashMap<&str, Mark> = links.keys().map(|id| (id.as_str(), Mark::Unvisited)).collect();
    let mut cycles = Vec::new();
    let mut seen_sets: HashSet<Vec<String>> = HashSet::new();

    for start in links.keys() {
        if marks.get(start.as_str()) != Some(&Mark::Unvisited) {
            continue;
        }

        // (node, index of the next successor to visit)
        let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
        marks.insert(start.as_str(), Mark::OnStack);

        while let Some(&(node, idx)) = stack.last() {
            let next = successors.get(node).and_then(|succ| succ.get(idx)).copied();
            let Some(next) = next else {
                marks.insert(node, Mark::Done);
                stack.pop();
                continue;
            };
            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }

            match marks.get(next) {
                Some(Mark::Unvisited) => {
                    marks.insert(next, Mark::OnStack);
                    stack.push((next, 0));
                }
                Some(Mark::OnStack) => {
                    if let Some(pos) = stack.iter().position(|(n, _)| *n == next) {
                        let cycle: Vec<String> = stack[pos..].iter().map(|(n, _)| (*n).to_owned()).collect();
                        let mut key = cycle.clone();
                        key.sort();
                        if seen_sets.insert(key) {
                            cycles.push(cycle);
                        }
                    }
                }
                _ => {}
            }
        }
    }
    cycles
}

/// Whether `to` is reachable from `from` using only ON_START control edges.
fn start_reachable(links: &BTreeMap<String, Links>, from: &str, to: &str) -> bool {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut stack = vec![from];
    while let Some(current) = stack.pop() {
        if let Some(l) = links.get(current) {
            for next in &l.start_successors {
                if next == to {
                    return true;
                }
                if seen.insert(next.as_str()) {
                    stack.push(next.as_str());
                }
            }
        }
    }
    false
}
