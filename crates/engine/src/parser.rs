//! Workflow parsing: turns an untyped JSON description into a
//! [`WorkflowDefinition`].
//!
//! Rules enforced:
//! 1. `id`, `name` and a non-empty `steps` list are required.
//! 2. Step IDs must be unique and every step must name an executor
//!    (`executorRef`, falling back to `type`).
//! 3. When a set of known executors is configured, every step's executor
//!    must be in it.
//!
//! Implicit dependencies are synthesised from input/output name matching and
//! recorded on the definition next to the explicit ones. Referential integrity
//! of dependency IDs is left to the validator.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::models::{AmbiguousOutput, InferredDependency, Resources, Step, WorkflowDefinition};
use crate::EngineError;

const DEFAULT_VERSION: &str = "1";

/// What to do when several steps declare the same output name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateProducerPolicy {
    /// Log a warning and infer edges from the first declared producer.
    #[default]
    FirstWins,
    /// Refuse to parse the workflow.
    Reject,
}

#[derive(Debug, Clone, Default)]
pub struct ParserOptions {
    /// Registered executor keys. `None` accepts any executor.
    pub known_executors: Option<BTreeSet<String>>,
    pub duplicate_producers: DuplicateProducerPolicy,
}

// ---------------------------------------------------------------------------
// Raw input shape
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawWorkflow {
    id: Option<String>,
    name: Option<String>,
    version: Option<Value>,
    steps: Option<Vec<RawStep>>,
    #[serde(default)]
    dependencies: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStep {
    id: Option<String>,
    name: Option<String>,
    #[serde(rename = "type")]
    step_type: Option<String>,
    executor_ref: Option<String>,
    #[serde(default)]
    inputs: Vec<String>,
    #[serde(default)]
    outputs: Vec<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    resource_requirements: Resources,
    estimated_duration_seconds: Option<f64>,
    timeout_seconds: Option<f64>,
    retries: Option<u32>,
    rollback_ref: Option<String>,
    #[serde(default)]
    config: Value,
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct Parser {
    options: ParserOptions,
}

/// Parse with default options.
pub fn parse_raw(input: &Value) -> Result<WorkflowDefinition, EngineError> {
    Parser::default().parse_raw(input)
}

/// Parse JSON text with default options.
pub fn parse_str(input: &str) -> Result<WorkflowDefinition, EngineError> {
    Parser::default().parse_str(input)
}

impl Parser {
    pub fn new(options: ParserOptions) -> Self {
        Self { options }
    }

    pub fn parse_str(&self, input: &str) -> Result<WorkflowDefinition, EngineError> {
        let value: Value = serde_json::from_str(input)
            .map_err(|e| EngineError::MalformedWorkflow(format!("invalid JSON: {e}")))?;
        self.parse_raw(&value)
    }

    /// Build a validated-shape, immutable workflow definition.
    ///
    /// # Errors
    /// - [`EngineError::MalformedWorkflow`] for missing or ill-typed fields.
    /// - [`EngineError::DuplicateStepId`] if two steps share an ID.
    /// - [`EngineError::UnknownExecutor`] if a step's executor is not known.
    /// - [`EngineError::AmbiguousOutput`] under [`DuplicateProducerPolicy::Reject`].
    pub fn parse_raw(&self, input: &Value) -> Result<WorkflowDefinition, EngineError> {
        let raw: RawWorkflow = RawWorkflow::deserialize(input)
            .map_err(|e| EngineError::MalformedWorkflow(e.to_string()))?;

        let id = required(raw.id, "id")?;
        let name = required(raw.name, "name")?;
        let version = match raw.version {
            None | Some(Value::Null) => DEFAULT_VERSION.to_owned(),
            Some(Value::String(s)) if !s.trim().is_empty() => s,
            Some(Value::Number(n)) => n.to_string(),
            Some(other) => {
                return Err(EngineError::MalformedWorkflow(format!(
                    "version must be a string or number, got {other}"
                )))
            }
        };

        let raw_steps = raw
            .steps
            .ok_or_else(|| EngineError::MalformedWorkflow("missing required field 'steps'".into()))?;
        if raw_steps.is_empty() {
            return Err(EngineError::MalformedWorkflow("workflow has no steps".into()));
        }

        let mut steps = Vec::with_capacity(raw_steps.len());
        let mut seen: HashSet<String> = HashSet::new();
        for (position, raw_step) in raw_steps.into_iter().enumerate() {
            let step = self.parse_step(raw_step, position)?;
            if !seen.insert(step.id.clone()) {
                return Err(EngineError::DuplicateStepId(step.id));
            }
            steps.push(step);
        }

        // Explicit edges: step-level lists merged with the top-level mapping.
        let mut dependencies: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for step in &steps {
            if !step.dependencies.is_empty() {
                dependencies
                    .entry(step.id.clone())
                    .or_default()
                    .extend(step.dependencies.iter().cloned());
            }
        }
        for (step_id, prereqs) in raw.dependencies {
            dependencies.entry(step_id).or_default().extend(prereqs);
        }

        let ambiguous_outputs = self.find_ambiguous_outputs(&id, &steps)?;
        let inferred = infer_dependencies(&steps, &dependencies);

        debug!(
            workflow_id = %id,
            version = %version,
            steps = steps.len(),
            inferred = inferred.len(),
            "parsed workflow"
        );

        Ok(WorkflowDefinition::new(
            id,
            name,
            version,
            steps,
            dependencies,
            inferred,
            ambiguous_outputs,
        ))
    }

    fn parse_step(&self, raw: RawStep, position: usize) -> Result<Step, EngineError> {
        let id = raw
            .id
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| EngineError::MalformedWorkflow(format!("step #{position} has no id")))?;

        let executor_ref = raw
            .executor_ref
            .or_else(|| raw.step_type.clone())
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| {
                EngineError::MalformedWorkflow(format!(
                    "step '{id}' declares neither 'executorRef' nor 'type'"
                ))
            })?;

        if let Some(known) = &self.options.known_executors {
            if !known.contains(&executor_ref) {
                return Err(EngineError::UnknownExecutor { step_id: id, executor: executor_ref });
            }
        }

        let estimated = raw.estimated_duration_seconds.unwrap_or(0.0);
        if !estimated.is_finite() || estimated < 0.0 {
            return Err(EngineError::MalformedWorkflow(format!(
                "step '{id}' has invalid estimatedDurationSeconds {estimated}"
            )));
        }
        if let Some(t) = raw.timeout_seconds {
            if t <= 0.0 || Duration::try_from_secs_f64(t).is_err() {
                return Err(EngineError::MalformedWorkflow(format!(
                    "step '{id}' has invalid timeoutSeconds {t}"
                )));
            }
        }
        if raw.retries == Some(0) {
            return Err(EngineError::MalformedWorkflow(format!(
                "step '{id}' must allow at least one attempt"
            )));
        }
        if !raw.resource_requirements.is_non_negative() {
            return Err(EngineError::MalformedWorkflow(format!(
                "step '{id}' has negative resource requirements"
            )));
        }

        Ok(Step {
            name: raw.name.unwrap_or_else(|| id.clone()),
            id,
            step_type: raw.step_type,
            executor_ref,
            inputs: raw.inputs,
            outputs: raw.outputs,
            dependencies: raw.dependencies,
            estimated_duration_seconds: estimated,
            resource_requirements: raw.resource_requirements,
            timeout_seconds: raw.timeout_seconds,
            retries: raw.retries,
            rollback_ref: raw.rollback_ref,
            config: raw.config,
        })
    }

    fn find_ambiguous_outputs(
        &self,
        workflow_id: &str,
        steps: &[Step],
    ) -> Result<Vec<AmbiguousOutput>, EngineError> {
        let mut ambiguous = Vec::new();
        for (output, producers) in producers_by_output(steps) {
            if producers.len() < 2 {
                continue;
            }
            let producers: Vec<String> = producers.into_iter().map(str::to_owned).collect();
            if self.options.duplicate_producers == DuplicateProducerPolicy::Reject {
                return Err(EngineError::AmbiguousOutput { output: output.to_owned(), producers });
            }
            warn!(
                workflow_id,
                output,
                producers = ?producers,
                "output declared by several steps; first producer wins"
            );
            ambiguous.push(AmbiguousOutput { output: output.to_owned(), producers });
        }
        Ok(ambiguous)
    }
}

fn required(field: Option<String>, name: &str) -> Result<String, EngineError> {
    field
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| EngineError::MalformedWorkflow(format!("missing required field '{name}'")))
}

/// Output name -> producing step IDs in declaration order, outputs in first-seen order.
fn producers_by_output(steps: &[Step]) -> Vec<(&str, Vec<&str>)> {
    let mut order: Vec<&str> = Vec::new();
    let mut producers: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in steps {
        for output in &step.outputs {
            let entry = producers.entry(output.as_str()).or_default();
            if entry.is_empty() {
                order.push(output.as_str());
            }
            if !entry.contains(&step.id.as_str()) {
                entry.push(step.id.as_str());
            }
        }
    }
    order
        .into_iter()
        .map(|name| (name, producers.remove(name).unwrap_or_default()))
        .collect()
}

/// Add `producer -> consumer` whenever the consumer declares an input the
/// producer declares as an output, unless an explicit edge already relates them.
fn infer_dependencies(
    steps: &[Step],
    explicit: &BTreeMap<String, BTreeSet<String>>,
) -> Vec<InferredDependency> {
    let first_producer: HashMap<&str, &str> = producers_by_output(steps)
        .into_iter()
        .filter_map(|(name, producers)| producers.first().map(|p| (name, *p)))
        .collect();

    let explicitly_related = |a: &str, b: &str| {
        explicit.get(a).is_some_and(|deps| deps.contains(b))
            || explicit.get(b).is_some_and(|deps| deps.contains(a))
    };

    let mut inferred: Vec<InferredDependency> = Vec::new();
    for step in steps {
        for input in &step.inputs {
            let Some(&producer) = first_producer.get(input.as_str()) else {
                continue;
            };
            if producer == step.id || explicitly_related(step.id.as_str(), producer) {
                continue;
            }
            if inferred.iter().any(|d| d.step == step.id && d.prerequisite == producer) {
                continue;
            }
            info!(
                step = %step.id,
                prerequisite = producer,
                via = %input,
                "inferred implicit dependency from matching input/output name"
            );
            inferred.push(InferredDependency {
                step: step.id.clone(),
                prerequisite: producer.to_owned(),
                via: input.clone(),
            });
        }
    }
    inferred
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_minimal_workflow_with_defaults() {
        let def = parse_raw(&json!({
            "id": "wf",
            "name": "Minimal",
            "steps": [{ "id": "a", "type": "shell" }]
        }))
        .expect("should parse");

        assert_eq!(def.id(), "wf");
        assert_eq!(def.version(), "1");
        let step = def.step("a").unwrap();
        assert_eq!(step.name, "a");
        assert_eq!(step.executor_ref, "shell");
        assert_eq!(step.estimated_duration_seconds, 0.0);
    }

    #[test]
    fn executor_ref_takes_precedence_over_type() {
        let def = parse_raw(&json!({
            "id": "wf", "name": "n", "version": 3,
            "steps": [{ "id": "a", "type": "transform", "executorRef": "python" }]
        }))
        .unwrap();
        assert_eq!(def.step("a").unwrap().executor_ref, "python");
        assert_eq!(def.version(), "3");
    }

    #[test]
    fn missing_required_fields_are_malformed() {
        for input in [
            json!({ "name": "n", "steps": [{ "id": "a", "type": "t" }] }),
            json!({ "id": "wf", "steps": [{ "id": "a", "type": "t" }] }),
            json!({ "id": "wf", "name": "n" }),
            json!({ "id": "wf", "name": "n", "steps": [] }),
            json!({ "id": "wf", "name": "n", "steps": [{ "type": "t" }] }),
            json!({ "id": "wf", "name": "n", "steps": [{ "id": "a" }] }),
        ] {
            let err = parse_raw(&input).unwrap_err();
            assert!(matches!(err, EngineError::MalformedWorkflow(_)), "got {err:?} for {input}");
        }
    }

    #[test]
    fn wrong_field_type_is_malformed() {
        let err = parse_raw(&json!({ "id": "wf", "name": "n", "steps": "nope" })).unwrap_err();
        assert!(err.is_malformed());
    }

    #[test]
    fn out_of_range_numbers_are_malformed() {
        for step in [
            json!({ "id": "a", "type": "t", "timeoutSeconds": 1e20 }),
            json!({ "id": "a", "type": "t", "timeoutSeconds": 0 }),
            json!({ "id": "a", "type": "t", "estimatedDurationSeconds": -1 }),
            json!({ "id": "a", "type": "t", "retries": 0 }),
        ] {
            let err = parse_raw(&json!({ "id": "wf", "name": "n", "steps": [step.clone()] }))
                .unwrap_err();
            assert!(err.is_malformed(), "{step}: {err:?}");
        }
    }

    #[test]
    fn duplicate_step_id_is_rejected() {
        let err = parse_raw(&json!({
            "id": "wf", "name": "n",
            "steps": [{ "id": "a", "type": "t" }, { "id": "a", "type": "t" }]
        }))
        .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateStepId(id) if id == "a"));
    }

    #[test]
    fn unknown_executor_is_rejected_when_registry_is_known() {
        let parser = Parser::new(ParserOptions {
            known_executors: Some(["shell".to_string()].into_iter().collect()),
            ..Default::default()
        });
        let err = parser
            .parse_raw(&json!({
                "id": "wf", "name": "n",
                "steps": [{ "id": "a", "type": "shell" }, { "id": "b", "executorRef": "gpu" }]
            }))
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::UnknownExecutor { step_id, executor } if step_id == "b" && executor == "gpu"
        ));
    }

    #[test]
    fn explicit_dependencies_merge_step_and_top_level() {
        let def = parse_raw(&json!({
            "id": "wf", "name": "n",
            "steps": [
                { "id": "a", "type": "t" },
                { "id": "b", "type": "t" },
                { "id": "c", "type": "t", "dependencies": ["a"] }
            ],
            "dependencies": { "c": ["b"] }
        }))
        .unwrap();
        let prereqs: Vec<&str> = def.prerequisites("c").into_iter().collect();
        assert_eq!(prereqs, vec!["a", "b"]);
    }

    #[test]
    fn infers_dependency_from_matching_names() {
        let def = parse_raw(&json!({
            "id": "wf", "name": "n",
            "steps": [
                { "id": "load", "type": "t", "inputs": ["dataset"] },
                { "id": "fetch", "type": "t", "outputs": ["dataset"] }
            ]
        }))
        .unwrap();
        assert_eq!(
            def.inferred_dependencies(),
            &[InferredDependency {
                step: "load".into(),
                prerequisite: "fetch".into(),
                via: "dataset".into(),
            }]
        );
        assert!(def.prerequisites("load").contains("fetch"));
    }

    #[test]
    fn explicit_edge_suppresses_inference_in_either_direction() {
        let def = parse_raw(&json!({
            "id": "wf", "name": "n",
            "steps": [
                { "id": "a", "type": "t", "outputs": ["x"], "dependencies": ["b"] },
                { "id": "b", "type": "t", "inputs": ["x"] }
            ]
        }))
        .unwrap();
        assert!(def.inferred_dependencies().is_empty());
    }

    #[test]
    fn first_producer_wins_and_is_flagged() {
        let def = parse_raw(&json!({
            "id": "wf", "name": "n",
            "steps": [
                { "id": "p1", "type": "t", "outputs": ["x"] },
                { "id": "p2", "type": "t", "outputs": ["x"] },
                { "id": "c", "type": "t", "inputs": ["x"] }
            ]
        }))
        .unwrap();
        assert_eq!(def.ambiguous_outputs().len(), 1);
        assert_eq!(def.ambiguous_outputs()[0].producers, vec!["p1", "p2"]);
        let prereqs: Vec<&str> = def.prerequisites("c").into_iter().collect();
        assert_eq!(prereqs, vec!["p1"]);
    }

    #[test]
    fn duplicate_producers_rejected_in_strict_mode() {
        let parser = Parser::new(ParserOptions {
            duplicate_producers: DuplicateProducerPolicy::Reject,
            ..Default::default()
        });
        let err = parser
            .parse_raw(&json!({
                "id": "wf", "name": "n",
                "steps": [
                    { "id": "p1", "type": "t", "outputs": ["x"] },
                    { "id": "p2", "type": "t", "outputs": ["x"] }
                ]
            }))
            .unwrap_err();
        assert!(matches!(err, EngineError::AmbiguousOutput { output, .. } if output == "x"));
    }

    #[test]
    fn unknown_dependency_ids_are_left_for_validation() {
        let def = parse_raw(&json!({
            "id": "wf", "name": "n",
            "steps": [{ "id": "a", "type": "t", "dependencies": ["ghost"] }]
        }))
        .expect("parser does not check referential integrity");
        assert!(def.prerequisites("a").contains("ghost"));
    }

    #[test]
    fn invalid_json_text_is_malformed() {
        assert!(matches!(parse_str("{ not json"), Err(EngineError::MalformedWorkflow(_))));
    }
}
