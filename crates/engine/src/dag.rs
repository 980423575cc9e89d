//! DAG validation: run this before optimizing or executing a workflow.
//!
//! Rules enforced:
//! 1. Every dependency must reference a step that exists in the workflow.
//! 2. The directed graph must be acyclic (depth-first search with an
//!    on-stack set; self-dependencies are reported as `self_loop`).
//! 3. Kahn's algorithm must place every step into a level. A leftover step
//!    with no reported cycle is still treated as an error.
//!
//! Graphs are built over step IDs through an adjacency map rather than
//! object references, so cycles in the input are representable and cheap to
//! traverse.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::VersionCache;
use crate::models::WorkflowDefinition;
use crate::EngineError;

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// A dependency that names a step the workflow does not contain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DanglingReference {
    pub step_id: String,
    pub missing: String,
}

/// Adjacency view of a workflow: step id -> direct successor ids.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Declaration order; used to keep every traversal deterministic.
    nodes: Vec<String>,
    position: HashMap<String, usize>,
    successors: HashMap<String, Vec<String>>,
    predecessors: HashMap<String, Vec<String>>,
    dangling: Vec<DanglingReference>,
    edge_count: usize,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, id: impl Into<String>) {
        let id = id.into();
        if self.position.contains_key(&id) {
            return;
        }
        self.position.insert(id.clone(), self.nodes.len());
        self.successors.entry(id.clone()).or_default();
        self.predecessors.entry(id.clone()).or_default();
        self.nodes.push(id);
    }

    /// Add `from -> to`. Both endpoints must already be nodes; duplicates are ignored.
    pub fn add_edge(&mut self, from: &str, to: &str) {
        if !self.contains(from) || !self.contains(to) {
            return;
        }
        let succ = self.successors.entry(from.to_owned()).or_default();
        if succ.iter().any(|s| s == to) {
            return;
        }
        succ.push(to.to_owned());
        self.predecessors
            .entry(to.to_owned())
            .or_default()
            .push(from.to_owned());
        self.edge_count += 1;
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position.contains_key(id)
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn successors(&self, id: &str) -> &[String] {
        self.successors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn predecessors(&self, id: &str) -> &[String] {
        self.predecessors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    /// References dropped while building because their target is unknown.
    pub fn dangling(&self) -> &[DanglingReference] {
        &self.dangling
    }

    fn position(&self, id: &str) -> usize {
        self.position.get(id).copied().unwrap_or(usize::MAX)
    }
}

/// Build the adjacency list from explicit ∪ inferred dependencies.
pub fn build_graph(def: &WorkflowDefinition) -> DependencyGraph {
    let mut graph = DependencyGraph::new();
    for step in def.steps() {
        graph.add_node(step.id.as_str());
    }

    for step_id in def.explicit_dependencies().keys() {
        if !graph.contains(step_id) {
            graph.dangling.push(DanglingReference {
                step_id: step_id.clone(),
                missing: step_id.clone(),
            });
        }
    }

    for step in def.steps() {
        let mut prereqs: Vec<&str> = def.prerequisites(&step.id).into_iter().collect();
        prereqs.sort_by_key(|p| def.position(p).unwrap_or(usize::MAX));
        for prereq in prereqs {
            if graph.contains(prereq) {
                graph.add_edge(prereq, &step.id);
            } else {
                graph.dangling.push(DanglingReference {
                    step_id: step.id.clone(),
                    missing: prereq.to_owned(),
                });
            }
        }
    }
    graph
}

// ---------------------------------------------------------------------------
// Cycle detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleKind {
    SelfLoop,
    Complex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cycle {
    /// Nodes in edge order; the last node points back at the first.
    pub nodes: Vec<String>,
    pub edges: Vec<(String, String)>,
    pub length: usize,
    #[serde(rename = "type")]
    pub kind: CycleKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub cycles: Vec<Cycle>,
}

impl CycleReport {
    pub fn has_cycles(&self) -> bool {
        !self.cycles.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cycles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cycles.is_empty()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    OnStack,
    Done,
}

/// Depth-first search with an on-stack set. Reaching a node that is still on
/// the stack closes a cycle, reported once per distinct node rotation.
pub fn detect_cycles(graph: &DependencyGraph) -> CycleReport {
    let mut state: HashMap<&str, Visit> = HashMap::new();
    let mut seen: HashSet<Vec<String>> = HashSet::new();
    let mut report = CycleReport::default();

    for root in graph.nodes() {
        if state.contains_key(root.as_str()) {
            continue;
        }

        // (node, index of next successor to visit)
        let mut stack: Vec<(&str, usize)> = vec![(root.as_str(), 0)];
        let mut path: Vec<&str> = vec![root.as_str()];
        state.insert(root.as_str(), Visit::OnStack);

        while let Some(top) = stack.last_mut() {
            let node = top.0;
            let successors = graph.successors(node);
            if top.1 >= successors.len() {
                state.insert(node, Visit::Done);
                path.pop();
                stack.pop();
                continue;
            }
            let next = successors[top.1].as_str();
            top.1 += 1;

            match state.get(next) {
                Some(Visit::OnStack) => {
                    let start = path.iter().position(|n| *n == next).unwrap_or(0);
                    let nodes: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
                    if seen.insert(canonical_rotation(&nodes)) {
                        report.cycles.push(make_cycle(nodes));
                    }
                }
                Some(Visit::Done) => {}
                None => {
                    state.insert(next, Visit::OnStack);
                    path.push(next);
                    stack.push((next, 0));
                }
            }
        }
    }
    report
}

fn canonical_rotation(nodes: &[String]) -> Vec<String> {
    let start = nodes
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(0);
    nodes[start..].iter().chain(&nodes[..start]).cloned().collect()
}

fn make_cycle(nodes: Vec<String>) -> Cycle {
    let edges = nodes
        .iter()
        .zip(nodes.iter().cycle().skip(1))
        .map(|(from, to)| (from.clone(), to.clone()))
        .collect();
    let length = nodes.len();
    let kind = if length == 1 { CycleKind::SelfLoop } else { CycleKind::Complex };
    Cycle { nodes, edges, length, kind }
}

// ---------------------------------------------------------------------------
// Levels and metrics
// ---------------------------------------------------------------------------

/// Kahn's algorithm, one level per round. Returns the levels that could be
/// formed plus every node that was never released (cycle members and their
/// descendants), both in declaration order.
fn kahn_levels(graph: &DependencyGraph) -> (Vec<Vec<String>>, Vec<String>) {
    let mut in_degree: HashMap<&str, usize> = graph
        .nodes()
        .iter()
        .map(|n| (n.as_str(), graph.predecessors(n).len()))
        .collect();

    let mut current: Vec<&str> = graph
        .nodes()
        .iter()
        .map(String::as_str)
        .filter(|n| in_degree.get(n).copied() == Some(0))
        .collect();

    let mut levels: Vec<Vec<String>> = Vec::new();
    while !current.is_empty() {
        let mut next: Vec<&str> = Vec::new();
        for &node in &current {
            for succ in graph.successors(node) {
                if let Some(deg) = in_degree.get_mut(succ.as_str()) {
                    *deg -= 1;
                    if *deg == 0 {
                        next.push(succ.as_str());
                    }
                }
            }
        }
        next.sort_by_key(|n| graph.position(n));
        levels.push(current.iter().map(|n| n.to_string()).collect());
        current = next;
    }

    let remaining = graph
        .nodes()
        .iter()
        .filter(|n| in_degree.get(n.as_str()).copied().unwrap_or(0) > 0)
        .cloned()
        .collect();
    (levels, remaining)
}

/// Group steps into levels of mutually independent work.
///
/// # Errors
/// [`EngineError::UnresolvedSteps`] if any step could not be placed, which
/// only happens when the graph is cyclic.
pub fn graph_levels(graph: &DependencyGraph) -> Result<Vec<Vec<String>>, EngineError> {
    let (levels, remaining) = kahn_levels(graph);
    if !remaining.is_empty() {
        return Err(EngineError::UnresolvedSteps(remaining));
    }
    Ok(levels)
}

/// Level ordering for a workflow definition.
pub fn get_execution_order(def: &WorkflowDefinition) -> Result<Vec<Vec<String>>, EngineError> {
    graph_levels(&build_graph(def))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphMetrics {
    pub node_count: usize,
    pub edge_count: usize,
    /// Longest path, counted in nodes.
    pub max_depth: usize,
    /// Size of the largest level.
    pub max_width: usize,
    /// `clamp(1 - max_depth / node_count, 0, 1)`.
    pub parallelization_factor: f64,
}

/// Compute shape metrics. Nodes Kahn's algorithm cannot release (cycle
/// members) are counted but contribute no depth or width.
pub fn compute_metrics(graph: &DependencyGraph) -> GraphMetrics {
    let (levels, _) = kahn_levels(graph);

    let mut depth: HashMap<&str, usize> = HashMap::new();
    for node in levels.iter().flatten() {
        let d = 1 + graph
            .predecessors(node)
            .iter()
            .filter_map(|p| depth.get(p.as_str()))
            .max()
            .copied()
            .unwrap_or(0);
        depth.insert(node.as_str(), d);
    }

    let node_count = graph.node_count();
    let max_depth = depth.values().copied().max().unwrap_or(0);
    let max_width = levels.iter().map(Vec::len).max().unwrap_or(0);
    let parallelization_factor = if node_count == 0 {
        0.0
    } else {
        (1.0 - max_depth as f64 / node_count as f64).clamp(0.0, 1.0)
    };

    GraphMetrics {
        node_count,
        edge_count: graph.edge_count(),
        max_depth,
        max_width,
        parallelization_factor,
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Outcome of validating one `(id, version)` of a workflow.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DagValidation {
    pub workflow_id: String,
    pub version: String,
    pub is_valid_dag: bool,
    pub cycles_detected: CycleReport,
    pub integrity_violations: Vec<DanglingReference>,
    /// Steps Kahn's algorithm could not place although no cycle was reported.
    pub unresolved: Vec<String>,
    pub graph_metrics: GraphMetrics,
    /// Execution levels; empty unless the workflow is a valid DAG.
    pub levels: Vec<Vec<String>>,
}

impl DagValidation {
    /// Turn a failed validation into the first error it carries.
    pub fn ensure_valid(&self) -> Result<(), EngineError> {
        if let Some(v) = self.integrity_violations.first() {
            return Err(EngineError::UnknownStepReference {
                step_id: v.step_id.clone(),
                missing: v.missing.clone(),
            });
        }
        if let Some(cycle) = self.cycles_detected.cycles.first() {
            return Err(EngineError::CycleDetected {
                count: self.cycles_detected.len(),
                first: cycle.nodes.clone(),
            });
        }
        if !self.unresolved.is_empty() {
            return Err(EngineError::UnresolvedSteps(self.unresolved.clone()));
        }
        Ok(())
    }
}

/// Validate a workflow. Fails closed: any cycle, dangling reference or
/// unplaceable step makes `is_valid_dag` false.
pub fn validate_dag(def: &WorkflowDefinition) -> DagValidation {
    let graph = build_graph(def);
    let cycles = detect_cycles(&graph);
    let metrics = compute_metrics(&graph);
    let (levels, unresolved) = kahn_levels(&graph);
    let integrity_violations = graph.dangling().to_vec();

    // Kahn leftovers are expected when cycles were found; only a leftover
    // without a reported cycle is a separate failure.
    let unresolved = if cycles.has_cycles() { Vec::new() } else { unresolved };
    let is_valid_dag =
        !cycles.has_cycles() && integrity_violations.is_empty() && unresolved.is_empty();

    if !is_valid_dag {
        warn!(
            workflow_id = def.id(),
            version = def.version(),
            cycles = cycles.len(),
            dangling = integrity_violations.len(),
            "workflow failed DAG validation"
        );
    }

    DagValidation {
        workflow_id: def.id().to_owned(),
        version: def.version().to_owned(),
        is_valid_dag,
        cycles_detected: cycles,
        integrity_violations,
        unresolved,
        graph_metrics: metrics,
        levels: if is_valid_dag { levels } else { Vec::new() },
    }
}

/// Validation results per `(id, version)`; shareable across engines.
pub type ValidationCache = VersionCache<DagValidation>;

/// Memoising front-end for [`validate_dag`], keyed by `(id, version)`.
#[derive(Debug, Clone, Default)]
pub struct DagValidator {
    cache: Arc<ValidationCache>,
}

impl DagValidator {
    pub fn new(cache: Arc<ValidationCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<ValidationCache> {
        &self.cache
    }

    pub fn validate(&self, def: &WorkflowDefinition) -> Arc<DagValidation> {
        if let Some(hit) = self.cache.get(def.id(), def.version()) {
            debug!(workflow_id = def.id(), version = def.version(), "validation cache hit");
            return hit;
        }
        let validation = Arc::new(validate_dag(def));
        self.cache.insert(def.id(), def.version(), validation.clone());
        validation
    }
}
