//! `MockExecutor`: a test double for `StepExecutor`.
//!
//! Useful in unit and integration tests where a real executor is either
//! unavailable or irrelevant. Behaviour is configured per step id; every call is
//! recorded, as is the peak number of concurrent invocations.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use crate::{StepDescriptor, StepError, StepExecutor, StepInputs, StepOutcome, StepOutputs};

/// Behaviour injected into `MockExecutor` for a given step.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Succeed with these outputs.
    Succeed(StepOutputs),
    /// Return an unsuccessful outcome (no error raised).
    Unsuccessful(String),
    /// Fail with a `Retryable` error.
    FailRetryable(String),
    /// Fail with a `Fatal` error.
    FailFatal(String),
    /// Fail with a `Retryable` error for the first `failures` calls, then succeed.
    Flaky { failures: u32, outputs: StepOutputs },
    /// Never finish; only a timeout or cancellation ends the call.
    Hang,
}

/// A single recorded invocation.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub step_id: String,
    pub attempt: u32,
    pub inputs: StepInputs,
}

/// A mock executor that records every call it receives and returns a
/// programmer-specified result.
///
/// Steps with no configured behaviour succeed, producing one value per
/// declared output name.
pub struct MockExecutor {
    behaviours: HashMap<String, MockBehaviour>,
    delay: Duration,
    idempotent: bool,
    failing_rollbacks: HashSet<String>,
    calls: Mutex<Vec<MockCall>>,
    rollbacks: Mutex<Vec<(String, String)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExecutor {
    pub fn new() -> Self {
        Self {
            behaviours: HashMap::new(),
            delay: Duration::ZERO,
            idempotent: true,
            failing_rollbacks: HashSet::new(),
            calls: Mutex::new(Vec::new()),
            rollbacks: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Configure the behaviour for one step.
    pub fn with(mut self, step_id: impl Into<String>, behaviour: MockBehaviour) -> Self {
        self.behaviours.insert(step_id.into(), behaviour);
        self
    }

    pub fn succeeding(self, step_id: impl Into<String>, outputs: StepOutputs) -> Self {
        self.with(step_id, MockBehaviour::Succeed(outputs))
    }

    pub fn failing_retryable(self, step_id: impl Into<String>, msg: impl Into<String>) -> Self {
        self.with(step_id, MockBehaviour::FailRetryable(msg.into()))
    }

    pub fn failing_fatal(self, step_id: impl Into<String>, msg: impl Into<String>) -> Self {
        self.with(step_id, MockBehaviour::FailFatal(msg.into()))
    }

    pub fn hanging(self, step_id: impl Into<String>) -> Self {
        self.with(step_id, MockBehaviour::Hang)
    }

    /// Every call sleeps this long before producing its result.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }

    /// Rolling back this step reports an error.
    pub fn failing_rollback(mut self, step_id: impl Into<String>) -> Self {
        self.failing_rollbacks.insert(step_id.into());
        self
    }

    /// Number of times the given step has been executed.
    pub fn call_count(&self, step_id: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.step_id == step_id).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }

    /// All calls in the order they started.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    /// `(step_id, backup_ref)` pairs passed to `rollback`, in call order.
    pub fn rollbacks(&self) -> Vec<(String, String)> {
        self.rollbacks.lock().clone()
    }

    /// Highest number of `execute` calls that were running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn default_outputs(step: &StepDescriptor) -> StepOutputs {
        step.outputs
            .iter()
            .map(|name| (name.clone(), json!({ "producedBy": step.step_id })))
            .collect()
    }
}

/// Decrements the in-flight counter even when the call future is dropped.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StepExecutor for MockExecutor {
    async fn execute(
        &self,
        step: &StepDescriptor,
        inputs: &StepInputs,
    ) -> Result<StepOutcome, StepError> {
        let previous_calls = self.call_count(&step.step_id) as u32;
        self.calls.lock().push(MockCall {
            step_id: step.step_id.clone(),
            attempt: step.attempt,
            inputs: inputs.clone(),
        });

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match self.behaviours.get(&step.step_id) {
            None => Ok(StepOutcome::succeeded(Self::default_outputs(step))),
            Some(MockBehaviour::Succeed(outputs)) => Ok(StepOutcome::succeeded(outputs.clone())),
            Some(MockBehaviour::Unsuccessful(msg)) => Ok(StepOutcome::failed(msg.clone())),
            Some(MockBehaviour::FailRetryable(msg)) => Err(StepError::Retryable(msg.clone())),
            Some(MockBehaviour::FailFatal(msg)) => Err(StepError::Fatal(msg.clone())),
            Some(MockBehaviour::Flaky { failures, outputs }) => {
                if previous_calls < *failures {
                    Err(StepError::Retryable(format!(
                        "flaky failure {} of {}",
                        previous_calls + 1,
                        failures
                    )))
                } else {
                    Ok(StepOutcome::succeeded(outputs.clone()))
                }
            }
            Some(MockBehaviour::Hang) => std::future::pending().await,
        }
    }

    fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    async fn rollback(&self, step: &StepDescriptor, backup_ref: &str) -> Result<(), StepError> {
        self.rollbacks
            .lock()
            .push((step.step_id.clone(), backup_ref.to_owned()));
        if self.failing_rollbacks.contains(&step.step_id) {
            return Err(StepError::Fatal(format!("could not restore '{backup_ref}'")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(step_id: &str, attempt: u32) -> StepDescriptor {
        StepDescriptor {
            workflow_id: "wf".into(),
            execution_id: uuid::Uuid::new_v4(),
            step_id: step_id.into(),
            name: step_id.into(),
            executor_ref: "mock".into(),
            outputs: vec!["report".into()],
            config: serde_json::Value::Null,
            attempt,
        }
    }

    #[tokio::test]
    async fn unconfigured_step_produces_declared_outputs() {
        let mock = MockExecutor::new();
        let outcome = mock
            .execute(&descriptor("a", 1), &StepInputs::new())
            .await
            .expect("default behaviour succeeds");

        assert!(outcome.success);
        assert_eq!(outcome.outputs["report"]["producedBy"], "a");
        assert_eq!(mock.call_count("a"), 1);
    }

    #[tokio::test]
    async fn flaky_step_recovers_after_configured_failures() {
        let mock = MockExecutor::new().with(
            "a",
            MockBehaviour::Flaky { failures: 2, outputs: StepOutputs::new() },
        );
        let inputs = StepInputs::new();

        assert!(mock.execute(&descriptor("a", 1), &inputs).await.is_err());
        assert!(mock.execute(&descriptor("a", 2), &inputs).await.is_err());
        assert!(mock.execute(&descriptor("a", 3), &inputs).await.is_ok());
        assert_eq!(mock.call_count("a"), 3);
    }

    #[tokio::test]
    async fn rollback_is_recorded_and_can_fail() {
        let mock = MockExecutor::new().failing_rollback("b");

        assert!(mock.rollback(&descriptor("a", 1), "snap-a").await.is_ok());
        assert!(mock.rollback(&descriptor("b", 1), "snap-b").await.is_err());
        assert_eq!(
            mock.rollbacks(),
            vec![("a".to_string(), "snap-a".to_string()), ("b".to_string(), "snap-b".to_string())]
        );
    }
}
