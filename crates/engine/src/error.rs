//! Engine-level error types.
//!
//! Only workflow-level failures live here. Errors raised while a step runs are
//! caught by the engine and recorded on that step's result instead.

use thiserror::Error;

/// Errors produced by the workflow engine (parsing, validation, allocation).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Parse errors ------

    /// A required field is missing or has the wrong shape.
    #[error("malformed workflow: {0}")]
    MalformedWorkflow(String),

    /// Two or more steps share the same ID.
    #[error("duplicate step ID: '{0}'")]
    DuplicateStepId(String),

    /// A step names an executor that is not registered.
    #[error("step '{step_id}' references unknown executor '{executor}'")]
    UnknownExecutor { step_id: String, executor: String },

    /// More than one step declares the same output (strict parsing only).
    #[error("output '{output}' is produced by more than one step: {producers:?}")]
    AmbiguousOutput { output: String, producers: Vec<String> },

    // ------ Validation errors ------

    /// A dependency references a step ID that doesn't exist in the workflow.
    #[error("step '{step_id}' depends on unknown step '{missing}'")]
    UnknownStepReference { step_id: String, missing: String },

    /// Cycle detection found at least one cycle.
    #[error("workflow graph contains {count} cycle(s), first: {first:?}")]
    CycleDetected { count: usize, first: Vec<String> },

    /// Level ordering could not place these steps.
    #[error("execution order left steps unresolved: {0:?}")]
    UnresolvedSteps(Vec<String>),

    // ------ Resource errors ------

    /// The summed allocation for one resource dimension does not fit the pool.
    #[error("{dimension} allocation {requested:.2} exceeds available {available:.2}")]
    ResourceExceeded {
        dimension: &'static str,
        requested: f64,
        available: f64,
    },

    // ------ Configuration errors ------

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("configuration error: {0}")]
    Config(#[from] ::config::ConfigError),
}

impl EngineError {
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::MalformedWorkflow(_)
                | Self::DuplicateStepId(_)
                | Self::UnknownExecutor { .. }
                | Self::AmbiguousOutput { .. }
        )
    }
}
