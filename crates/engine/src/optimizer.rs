//! Read-only annotations over a validated workflow: parallel groups, the
//! critical path, shortest-job-first ordering within levels, and an overall
//! optimisation score.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::VersionCache;
use crate::dag::{build_graph, graph_levels, DagValidation, DependencyGraph, GraphMetrics};
use crate::models::{Resources, WorkflowDefinition};
use crate::resources::{AllocationPlan, Utilization};
use crate::EngineError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelGroup {
    pub level: usize,
    pub steps: Vec<String>,
}

/// Every level is its own parallel group; single-step groups are kept.
pub fn identify_parallel_groups(levels: &[Vec<String>]) -> Vec<ParallelGroup> {
    levels
        .iter()
        .enumerate()
        .map(|(level, steps)| ParallelGroup { level, steps: steps.clone() })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CriticalPath {
    pub steps: Vec<String>,
    pub total_duration: f64,
}

/// Longest duration-weighted chain, by dynamic programming over a
/// topological order:
/// `earliest_finish[n] = duration[n] + max(earliest_finish[pred])`.
///
/// Ties go to the node declared first, for predecessors and sinks alike.
/// Missing durations count as zero.
///
/// # Errors
/// [`EngineError::UnresolvedSteps`] if the graph is cyclic.
pub fn calculate_critical_path(
    graph: &DependencyGraph,
    durations: &HashMap<String, f64>,
) -> Result<CriticalPath, EngineError> {
    let levels = graph_levels(graph)?;

    let mut earliest_finish: HashMap<&str, f64> = HashMap::new();
    let mut back: HashMap<&str, &str> = HashMap::new();

    for node in levels.iter().flatten() {
        let node = node.as_str();
        let mut best: Option<(&str, f64)> = None;
        for pred in graph.predecessors(node) {
            let finish = earliest_finish.get(pred.as_str()).copied().unwrap_or(0.0);
            if best.map_or(true, |(_, b)| finish > b) {
                best = Some((pred.as_str(), finish));
            }
        }
        let start = best.map_or(0.0, |(_, f)| f);
        if let Some((pred, _)) = best {
            back.insert(node, pred);
        }
        let own = durations.get(node).copied().unwrap_or(0.0);
        earliest_finish.insert(node, start + own);
    }

    let mut end: Option<(&str, f64)> = None;
    for node in graph.nodes() {
        if !graph.successors(node).is_empty() {
            continue;
        }
        let finish = earliest_finish.get(node.as_str()).copied().unwrap_or(0.0);
        if end.map_or(true, |(_, f)| finish > f) {
            end = Some((node.as_str(), finish));
        }
    }

    let Some((sink, total_duration)) = end else {
        return Ok(CriticalPath::default());
    };

    let mut steps = vec![sink.to_owned()];
    let mut cursor = sink;
    while let Some(&pred) = back.get(cursor) {
        steps.push(pred.to_owned());
        cursor = pred;
    }
    steps.reverse();

    Ok(CriticalPath { steps, total_duration })
}

/// Shortest-job-first within each level. Levels keep their order; equal
/// durations keep their relative order.
pub fn optimize_execution_order(
    levels: &[Vec<String>],
    durations: &HashMap<String, f64>,
) -> Vec<Vec<String>> {
    levels
        .iter()
        .map(|level| {
            let mut level = level.clone();
            level.sort_by(|a, b| {
                let da = durations.get(a).copied().unwrap_or(0.0);
                let db = durations.get(b).copied().unwrap_or(0.0);
                da.total_cmp(&db)
            });
            level
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerWeights {
    pub parallelism: f64,
    pub resource: f64,
    pub step_count: f64,
}

impl Default for OptimizerWeights {
    fn default() -> Self {
        Self { parallelism: 0.4, resource: 0.3, step_count: 0.3 }
    }
}

impl OptimizerWeights {
    pub fn validate(&self) -> Result<(), EngineError> {
        let all = [self.parallelism, self.resource, self.step_count];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(EngineError::InvalidConfig(
                "optimizer weights must be finite and non-negative".into(),
            ));
        }
        if all.iter().sum::<f64>() <= 0.0 {
            return Err(EngineError::InvalidConfig(
                "optimizer weights must not all be zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationScore {
    pub parallelism: f64,
    pub resource_efficiency: f64,
    pub step_count_efficiency: f64,
    /// Weighted sum, weights normalised to 1.
    pub score: f64,
}

/// Weighted blend of parallelisation, resource efficiency
/// (`1 - mean utilisation`) and step-count efficiency (`1 / (1 + ln n)`).
pub fn optimization_score(
    metrics: &GraphMetrics,
    allocated: &Resources,
    capacity: &Resources,
    weights: &OptimizerWeights,
) -> OptimizationScore {
    let parallelism = metrics.parallelization_factor;
    let resource_efficiency = (1.0 - Utilization::of(allocated, capacity).mean()).clamp(0.0, 1.0);
    let step_count_efficiency = if metrics.node_count == 0 {
        0.0
    } else {
        1.0 / (1.0 + (metrics.node_count as f64).ln())
    };

    let weight_sum = weights.parallelism + weights.resource + weights.step_count;
    let score = if weight_sum > 0.0 {
        (weights.parallelism * parallelism
            + weights.resource * resource_efficiency
            + weights.step_count * step_count_efficiency)
            / weight_sum
    } else {
        0.0
    };

    OptimizationScore { parallelism, resource_efficiency, step_count_efficiency, score }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationPlan {
    pub parallel_groups: Vec<ParallelGroup>,
    /// Levels with each level sorted shortest-job-first.
    pub ordered_levels: Vec<Vec<String>>,
    pub critical_path: CriticalPath,
    pub score: OptimizationScore,
}

#[derive(Debug, Clone, Default)]
pub struct Optimizer {
    weights: OptimizerWeights,
    critical_paths: Arc<VersionCache<CriticalPath>>,
}

impl Optimizer {
    pub fn new(weights: OptimizerWeights) -> Self {
        Self { weights, critical_paths: Arc::default() }
    }

    pub fn weights(&self) -> &OptimizerWeights {
        &self.weights
    }

    pub fn critical_paths(&self) -> &Arc<VersionCache<CriticalPath>> {
        &self.critical_paths
    }

    /// Critical path for `def`, memoised by `(id, version)`.
    pub fn critical_path(&self, def: &WorkflowDefinition) -> Result<Arc<CriticalPath>, EngineError> {
        if let Some(hit) = self.critical_paths.get(def.id(), def.version()) {
            return Ok(hit);
        }
        let path = Arc::new(calculate_critical_path(&build_graph(def), &def.durations())?);
        self.critical_paths.insert(def.id(), def.version(), path.clone());
        Ok(path)
    }

    /// Annotate a validated workflow.
    ///
    /// # Errors
    /// The validation's own error if the workflow is not a valid DAG.
    pub fn optimize(
        &self,
        def: &WorkflowDefinition,
        validation: &DagValidation,
        plan: &AllocationPlan,
        capacity: &Resources,
    ) -> Result<OptimizationPlan, EngineError> {
        validation.ensure_valid()?;

        let durations = def.durations();
        let critical_path = self.critical_path(def)?;
        let score = optimization_score(&validation.graph_metrics, &plan.total, capacity, &self.weights);

        debug!(
            workflow_id = def.id(),
            critical_path = ?critical_path.steps,
            total_duration = critical_path.total_duration,
            score = score.score,
            "optimized workflow"
        );

        Ok(OptimizationPlan {
            parallel_groups: identify_parallel_groups(&validation.levels),
            ordered_levels: optimize_execution_order(&validation.levels, &durations),
            critical_path: (*critical_path).clone(),
            score,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{compute_metrics, validate_dag};
    use crate::parser::parse_raw;
    use crate::resources::{ExceededPolicy, ResourceAllocator, AllocationStrategy};
    use serde_json::json;

    fn diamond() -> WorkflowDefinition {
        parse_raw(&json!({
            "id": "diamond", "name": "Diamond",
            "steps": [
                { "id": "A", "type": "t", "estimatedDurationSeconds": 10 },
                { "id": "B", "type": "t", "estimatedDurationSeconds": 5, "dependencies": ["A"] },
                { "id": "C", "type": "t", "estimatedDurationSeconds": 3, "dependencies": ["A"] },
                { "id": "D", "type": "t", "estimatedDurationSeconds": 2, "dependencies": ["B", "C"] }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn diamond_critical_path() {
        let def = diamond();
        let path = calculate_critical_path(&build_graph(&def), &def.durations()).unwrap();
        assert_eq!(path.steps, vec!["A", "B", "D"]);
        assert_eq!(path.total_duration, 17.0);
    }

    #[test]
    fn critical_path_picks_longest_sink() {
        let def = parse_raw(&json!({
            "id": "wf", "name": "n",
            "steps": [
                { "id": "short", "type": "t", "estimatedDurationSeconds": 4 },
                { "id": "long1", "type": "t", "estimatedDurationSeconds": 3 },
                { "id": "long2", "type": "t", "estimatedDurationSeconds": 3, "dependencies": ["long1"] }
            ]
        }))
        .unwrap();
        let path = calculate_critical_path(&build_graph(&def), &def.durations()).unwrap();
        assert_eq!(path.steps, vec!["long1", "long2"]);
        assert_eq!(path.total_duration, 6.0);
    }

    #[test]
    fn tied_predecessors_resolve_to_first_declared() {
        let def = parse_raw(&json!({
            "id": "wf", "name": "n",
            "steps": [
                { "id": "zeta", "type": "t", "estimatedDurationSeconds": 5 },
                { "id": "alpha", "type": "t", "estimatedDurationSeconds": 5 },
                { "id": "join", "type": "t", "estimatedDurationSeconds": 1, "dependencies": ["alpha", "zeta"] }
            ]
        }))
        .unwrap();
        let path = calculate_critical_path(&build_graph(&def), &def.durations()).unwrap();
        assert_eq!(path.steps, vec!["zeta", "join"]);
        assert_eq!(path.total_duration, 6.0);
    }

    #[test]
    fn critical_path_rejects_cycles() {
        let def = parse_raw(&json!({
            "id": "wf", "name": "n",
            "steps": [
                { "id": "a", "type": "t", "dependencies": ["b"] },
                { "id": "b", "type": "t", "dependencies": ["a"] }
            ]
        }))
        .unwrap();
        assert!(calculate_critical_path(&build_graph(&def), &def.durations()).is_err());
    }

    #[test]
    fn levels_are_sorted_shortest_first_without_reordering_levels() {
        let def = parse_raw(&json!({
            "id": "wf", "name": "n",
            "steps": [
                { "id": "slow", "type": "t", "estimatedDurationSeconds": 30 },
                { "id": "fast", "type": "t", "estimatedDurationSeconds": 1 },
                { "id": "mid", "type": "t", "estimatedDurationSeconds": 10 },
                { "id": "last", "type": "t", "estimatedDurationSeconds": 0, "dependencies": ["slow"] }
            ]
        }))
        .unwrap();
        let levels = validate_dag(&def).levels;
        let ordered = optimize_execution_order(&levels, &def.durations());
        assert_eq!(ordered, vec![vec!["fast", "mid", "slow"], vec!["last"]]);
    }

    #[test]
    fn parallel_groups_mirror_levels() {
        let levels = vec![vec!["a".to_string(), "b".to_string()], vec!["c".to_string()]];
        let groups = identify_parallel_groups(&levels);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[1], ParallelGroup { level: 1, steps: vec!["c".into()] });
    }

    #[test]
    fn score_uses_normalised_weights() {
        let def = diamond();
        let metrics = compute_metrics(&build_graph(&def));
        let capacity = Resources::new(8.0, 8.0, 8.0, 8.0);

        let idle = optimization_score(&metrics, &Resources::default(), &capacity, &OptimizerWeights::default());
        assert_eq!(idle.resource_efficiency, 1.0);
        assert!((idle.parallelism - 0.25).abs() < 1e-9);

        let only_resources = OptimizerWeights { parallelism: 0.0, resource: 2.0, step_count: 0.0 };
        let busy = optimization_score(&metrics, &Resources::new(4.0, 4.0, 4.0, 4.0), &capacity, &only_resources);
        assert!((busy.score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn invalid_weights_are_rejected() {
        assert!(OptimizerWeights { parallelism: -1.0, ..Default::default() }.validate().is_err());
        assert!(OptimizerWeights { parallelism: 0.0, resource: 0.0, step_count: 0.0 }.validate().is_err());
        assert!(OptimizerWeights::default().validate().is_ok());
    }

    #[test]
    fn optimize_produces_full_plan_and_caches_critical_path() {
        let def = diamond();
        let validation = validate_dag(&def);
        let allocator = ResourceAllocator::new(
            Resources::new(16.0, 64.0, 100.0, 1000.0),
            ExceededPolicy::FallbackMinimal,
            Resources::default(),
        );
        let plan = allocator.reserve(&def, AllocationStrategy::Balanced).unwrap();
        let optimizer = Optimizer::default();

        let result = optimizer
            .optimize(&def, &validation, &plan, &allocator.snapshot().capacity)
            .unwrap();
        assert_eq!(result.ordered_levels, vec![vec!["A"], vec!["C", "B"], vec!["D"]]);
        assert_eq!(result.critical_path.total_duration, 17.0);
        assert!(result.score.score > 0.0 && result.score.score <= 1.0);
        assert!(optimizer.critical_paths().get("diamond", "1").is_some());
    }
}
