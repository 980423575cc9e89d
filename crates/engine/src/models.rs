//! Core domain models for the workflow engine.
//!
//! A [`WorkflowDefinition`] is only ever produced by the parser and is
//! read-only afterwards; changing a workflow means parsing a new version.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

/// Amounts along the four resource dimensions the engine schedules against.
///
/// Used for step requirements, per-step allocations and pool capacity alike.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Resources {
    /// CPU cores.
    pub cpu: f64,
    pub memory_gb: f64,
    pub disk_gb: f64,
    pub network_mbps: f64,
}

impl Resources {
    pub const DIMENSIONS: [&'static str; 4] = ["cpu", "memoryGb", "diskGb", "networkMbps"];

    pub fn new(cpu: f64, memory_gb: f64, disk_gb: f64, network_mbps: f64) -> Self {
        Self { cpu, memory_gb, disk_gb, network_mbps }
    }

    /// Values in [`Self::DIMENSIONS`] order.
    pub fn values(&self) -> [f64; 4] {
        [self.cpu, self.memory_gb, self.disk_gb, self.network_mbps]
    }

    pub fn from_values(v: [f64; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }

    /// Apply `f` to each dimension pairwise.
    pub fn zip_with(&self, other: &Self, f: impl Fn(f64, f64) -> f64) -> Self {
        let (a, b) = (self.values(), other.values());
        Self::from_values([f(a[0], b[0]), f(a[1], b[1]), f(a[2], b[2]), f(a[3], b[3])])
    }

    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        let v = self.values();
        Self::from_values([f(v[0]), f(v[1]), f(v[2]), f(v[3])])
    }

    pub fn add(&self, other: &Self) -> Self {
        self.zip_with(other, |a, b| a + b)
    }

    /// Pairwise subtraction floored at zero.
    pub fn saturating_sub(&self, other: &Self) -> Self {
        self.zip_with(other, |a, b| (a - b).max(0.0))
    }

    pub fn min(&self, other: &Self) -> Self {
        self.zip_with(other, f64::min)
    }

    pub fn is_non_negative(&self) -> bool {
        self.values().iter().all(|v| v.is_finite() && *v >= 0.0)
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// A single unit of work in the workflow graph.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Unique identifier within this workflow (referenced by dependencies).
    pub id: String,
    pub name: String,
    /// Free-form step type from the definition, if any.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub step_type: Option<String>,
    /// Key used to look up the `StepExecutor` that runs this step.
    pub executor_ref: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    /// Prerequisites declared on the step itself.
    pub dependencies: Vec<String>,
    pub estimated_duration_seconds: f64,
    pub resource_requirements: Resources,
    pub timeout_seconds: Option<f64>,
    /// Maximum number of attempts.
    pub retries: Option<u32>,
    /// Backup reference handed to the executor when rolling this step back.
    pub rollback_ref: Option<String>,
    /// Opaque configuration passed to the executor.
    pub config: Value,
}

impl Step {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }
}

/// An edge synthesised because `step` consumes a name that `prerequisite` produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InferredDependency {
    pub step: String,
    pub prerequisite: String,
    pub via: String,
}

/// An output name declared by more than one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AmbiguousOutput {
    pub output: String,
    /// In declaration order; the first one is used for inference.
    pub producers: Vec<String>,
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// A complete, parsed workflow definition.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    id: String,
    name: String,
    version: String,
    steps: Vec<Step>,
    /// Explicit edges: step id -> prerequisite ids.
    dependencies: BTreeMap<String, BTreeSet<String>>,
    inferred_dependencies: Vec<InferredDependency>,
    ambiguous_outputs: Vec<AmbiguousOutput>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl WorkflowDefinition {
    pub(crate) fn new(
        id: String,
        name: String,
        version: String,
        steps: Vec<Step>,
        dependencies: BTreeMap<String, BTreeSet<String>>,
        inferred_dependencies: Vec<InferredDependency>,
        ambiguous_outputs: Vec<AmbiguousOutput>,
    ) -> Self {
        let index = steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();
        Self {
            id,
            name,
            version,
            steps,
            dependencies,
            inferred_dependencies,
            ambiguous_outputs,
            index,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Steps in declaration order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.index.get(id).map(|&i| &self.steps[i])
    }

    /// Position of the step in declaration order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn explicit_dependencies(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.dependencies
    }

    pub fn inferred_dependencies(&self) -> &[InferredDependency] {
        &self.inferred_dependencies
    }

    pub fn ambiguous_outputs(&self) -> &[AmbiguousOutput] {
        &self.ambiguous_outputs
    }

    /// Explicit and inferred prerequisites of a step.
    pub fn prerequisites(&self, step_id: &str) -> BTreeSet<&str> {
        let mut prereqs: BTreeSet<&str> = self
            .dependencies
            .get(step_id)
            .map(|set| set.iter().map(String::as_str).collect())
            .unwrap_or_default();
        prereqs.extend(
            self.inferred_dependencies
                .iter()
                .filter(|d| d.step == step_id)
                .map(|d| d.prerequisite.as_str()),
        );
        prereqs
    }

    /// Cache identity. Content changes must come with a new version.
    pub fn cache_key(&self) -> (String, String) {
        (self.id.clone(), self.version.clone())
    }

    pub fn durations(&self) -> HashMap<String, f64> {
        self.steps
            .iter()
            .map(|s| (s.id.clone(), s.estimated_duration_seconds))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Execution state
// ---------------------------------------------------------------------------

/// Per-step lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
    RolledBack,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Whether a step may move from `self` to `next`.
    ///
    /// `Failed`/`TimedOut` -> `Running` is the retry edge; the engine only takes
    /// it while attempts remain.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, TimedOut)
                | (Failed, Running)
                | (TimedOut, Running)
                | (Pending, Cancelled)
                | (Running, Cancelled)
                | (Completed, RolledBack)
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
            Self::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

/// Workflow-level aggregate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    /// The workflow deadline passed before every level was dispatched.
    TimedOut,
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// Category of a step-level error. Timeouts are kept apart from executor
/// failures so they can be counted separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    Execution,
    Timeout,
    Cancelled,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepErrorDetail {
    pub kind: StepErrorKind,
    pub message: String,
}

impl StepErrorDetail {
    pub fn new(kind: StepErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

/// Outcome of one step within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepErrorDetail>,
}

impl StepResult {
    pub fn pending(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            attempts: 0,
            started_at: None,
            ended_at: None,
            error: None,
        }
    }
}

/// How one logical level was dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelReport {
    pub index: usize,
    /// Steps in dispatch order.
    pub steps: Vec<String>,
    /// Number of sequential waves the level was sliced into.
    pub waves: usize,
}

/// The full report of a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub version: String,
    pub status: WorkflowStatus,
    /// One entry per step, in declaration order.
    pub step_results: Vec<StepResult>,
    pub total_duration_seconds: f64,
    pub critical_path: Vec<String>,
    pub levels: Vec<LevelReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rollback_errors: Vec<StepErrorDetail>,
}

impl ExecutionResult {
    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.iter().find(|r| r.step_id == step_id)
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.step_results.iter().filter(|r| r.status == status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resources_saturating_sub_floors_at_zero() {
        let a = Resources::new(2.0, 4.0, 1.0, 0.0);
        let b = Resources::new(3.0, 1.0, 1.0, 5.0);
        assert_eq!(a.saturating_sub(&b), Resources::new(0.0, 3.0, 0.0, 0.0));
    }

    #[test]
    fn step_transitions_follow_lifecycle() {
        use StepStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Failed.can_transition_to(Running));
        assert!(TimedOut.can_transition_to(Running));
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Cancelled.can_transition_to(Running));
    }

    #[test]
    fn status_serializes_as_snake_case() {
        let json = serde_json::to_string(&StepStatus::TimedOut).unwrap();
        assert_eq!(json, "\"timed_out\"");
        assert_eq!(StepStatus::RolledBack.to_string(), "rolled_back");
    }
}
