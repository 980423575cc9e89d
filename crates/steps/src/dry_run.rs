//! `DryRunExecutor`: walks a workflow without doing any real work.
//!
//! Each step "succeeds" after an optional simulated delay and emits a
//! placeholder value for every output it declares, so downstream input
//! resolution can be exercised end to end from the CLI.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::{StepDescriptor, StepError, StepExecutor, StepInputs, StepOutcome};

#[derive(Debug, Clone, Default)]
pub struct DryRunExecutor {
    delay: Duration,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl StepExecutor for DryRunExecutor {
    async fn execute(
        &self,
        step: &StepDescriptor,
        inputs: &StepInputs,
    ) -> Result<StepOutcome, StepError> {
        debug!(
            step_id = %step.step_id,
            executor = %step.executor_ref,
            inputs = ?inputs.keys().collect::<Vec<_>>(),
            "dry run"
        );

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let outputs = step
            .outputs
            .iter()
            .map(|name| {
                (
                    name.clone(),
                    json!({ "dryRun": true, "step": step.step_id, "output": name }),
                )
            })
            .collect();
        Ok(StepOutcome::succeeded(outputs))
    }

    async fn rollback(&self, step: &StepDescriptor, backup_ref: &str) -> Result<(), StepError> {
        debug!(step_id = %step.step_id, backup_ref, "dry run rollback");
        Ok(())
    }
}
