//! The `StepExecutor` trait: the contract every executor must fulfil.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::StepError;

/// Inputs resolved from the outputs of completed prerequisites, keyed by name.
pub type StepInputs = BTreeMap<String, Value>;

/// Named values produced by a step.
pub type StepOutputs = BTreeMap<String, Value>;

/// Everything an executor is told about the step it is running.
///
/// Defined here (in the steps crate) so both the engine and individual executor
/// implementations can import it without a circular dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDescriptor {
    /// ID of the parent workflow.
    pub workflow_id: String,
    /// ID of the current execution run.
    pub execution_id: uuid::Uuid,
    pub step_id: String,
    pub name: String,
    /// Key the executor was resolved by.
    pub executor_ref: String,
    /// Output names the step declared; dependents look these up by name.
    pub outputs: Vec<String>,
    /// Opaque per-step configuration from the workflow definition.
    pub config: Value,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Result of a single executor invocation that did not raise an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub success: bool,
    pub outputs: StepOutputs,
    pub error: Option<String>,
}

impl StepOutcome {
    pub fn succeeded(outputs: StepOutputs) -> Self {
        Self { success: true, outputs, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { success: false, outputs: StepOutputs::new(), error: Some(error.into()) }
    }
}

/// The core executor trait.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Run the step once with inputs resolved from its prerequisites.
    ///
    /// An `Ok` outcome with `success == false` is treated like a
    /// [`StepError::Retryable`].
    async fn execute(
        &self,
        step: &StepDescriptor,
        inputs: &StepInputs,
    ) -> Result<StepOutcome, StepError>;

    /// Whether the engine may invoke `execute` more than once for the same step.
    ///
    /// Non-idempotent executors get exactly one attempt.
    fn is_idempotent(&self) -> bool {
        true
    }

    /// Restore side effects of a completed step from its backup reference.
    async fn rollback(&self, step: &StepDescriptor, backup_ref: &str) -> Result<(), StepError> {
        let _ = step;
        Err(StepError::Fatal(format!(
            "executor does not support rollback (backup '{backup_ref}')"
        )))
    }
}
