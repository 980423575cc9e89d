//! Workflow execution engine.
//!
//! `WorkflowEngine` is the central orchestrator:
//! 1. Validates the DAG (memoised per `(id, version)`) and refuses to run
//!    anything that is not a valid DAG.
//! 2. Reserves resources for every step and orders each level shortest-job-first.
//! 3. Runs level by level. A level's steps are spawned as concurrent tasks in
//!    waves of at most `max_parallelism`, and the next level starts only once
//!    every step of the current one is terminal.
//! 4. Feeds each step the outputs of its completed prerequisites, matched by name.
//! 5. Wraps every attempt in a timeout and retries retryable failures with
//!    exponential back-off. Step errors are recorded, never returned.
//! 6. On failure, stops dispatching (unless configured to continue) and rolls
//!    back completed steps that carry a backup reference.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use steps::{StepDescriptor, StepExecutor, StepInputs, StepOutputs};

use crate::dag::{DagValidator, ValidationCache};
use crate::models::{
    ExecutionResult, LevelReport, Resources, StepErrorDetail, StepErrorKind, StepResult,
    StepStatus, WorkflowDefinition, WorkflowStatus,
};
use crate::optimizer::{OptimizationPlan, Optimizer, OptimizerWeights};
use crate::resources::{AllocationStrategy, ExceededPolicy, ResourceAllocator};
use crate::EngineError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Most steps of one level that may be in flight at once.
    pub max_parallelism: usize,
    /// Per-attempt timeout for steps that don't set their own.
    pub default_timeout: Duration,
    /// Attempts per step for steps that don't set `retries`.
    pub max_attempts: u32,
    /// Delay before the second attempt; later delays grow by `backoff_multiplier`.
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Keep dispatching later levels after a step fails.
    pub continue_on_failure: bool,
    /// Checked before each level is dispatched.
    pub workflow_deadline: Option<Duration>,
    pub allocation_strategy: AllocationStrategy,
    pub on_resource_exceeded: ExceededPolicy,
    pub minimal_floor: Resources,
    pub pool_capacity: Resources,
    pub optimizer_weights: OptimizerWeights,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 10,
            default_timeout: Duration::from_secs(300),
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            continue_on_failure: false,
            workflow_deadline: None,
            allocation_strategy: AllocationStrategy::Balanced,
            on_resource_exceeded: ExceededPolicy::FallbackMinimal,
            minimal_floor: Resources::new(0.25, 0.5, 1.0, 10.0),
            pool_capacity: Resources::new(16.0, 64.0, 500.0, 1000.0),
            optimizer_weights: OptimizerWeights::default(),
        }
    }
}

impl EngineConfig {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.retry_base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = secs.min(self.retry_max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.retry_max_delay)
    }
}

// ---------------------------------------------------------------------------
// Executor registry
// ---------------------------------------------------------------------------

/// Maps executor keys (`executorRef`) to `StepExecutor` implementations.
pub type ExecutorRegistry = HashMap<String, Arc<dyn StepExecutor>>;

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Orchestrator that validates, plans and runs workflows.
///
/// One engine can serve many runs; validation results and critical paths are
/// cached per `(id, version)` and the resource pool is shared by every run.
pub struct WorkflowEngine {
    registry: ExecutorRegistry,
    config: EngineConfig,
    validator: DagValidator,
    optimizer: Optimizer,
    allocator: Arc<ResourceAllocator>,
}

impl WorkflowEngine {
    pub fn new(registry: ExecutorRegistry, config: EngineConfig) -> Self {
        let allocator = Arc::new(ResourceAllocator::new(
            config.pool_capacity,
            config.on_resource_exceeded,
            config.minimal_floor,
        ));
        Self {
            registry,
            validator: DagValidator::default(),
            optimizer: Optimizer::new(config.optimizer_weights),
            allocator,
            config,
        }
    }

    /// Share a resource pool with other engines.
    pub fn with_allocator(mut self, allocator: Arc<ResourceAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Share a validation cache with other engines.
    pub fn with_validation_cache(mut self, cache: Arc<ValidationCache>) -> Self {
        self.validator = DagValidator::new(cache);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn validator(&self) -> &DagValidator {
        &self.validator
    }

    pub fn optimizer(&self) -> &Optimizer {
        &self.optimizer
    }

    pub fn allocator(&self) -> &Arc<ResourceAllocator> {
        &self.allocator
    }

    /// Keys of every registered executor, for strict parsing.
    pub fn known_executors(&self) -> BTreeSet<String> {
        self.registry.keys().cloned().collect()
    }

    /// Run the workflow to a terminal state.
    ///
    /// # Errors
    /// Only pre-execution failures: an invalid DAG or an allocation the
    /// configured policy refuses. Step failures are reported in the result.
    pub async fn execute(&self, def: &WorkflowDefinition) -> Result<ExecutionResult, EngineError> {
        self.execute_with_cancellation(def, CancellationToken::new()).await
    }

    /// Like [`Self::execute`], stopping early once `cancel` fires. Running
    /// steps are abandoned on a best-effort basis and reported `Cancelled`.
    #[instrument(skip(self, def, cancel), fields(workflow_id = %def.id(), version = %def.version()))]
    pub async fn execute_with_cancellation(
        &self,
        def: &WorkflowDefinition,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, EngineError> {
        let started = Instant::now();

        // ------------------------------------------------------------------
        // Validate, allocate, optimize. Nothing has run yet.
        // ------------------------------------------------------------------
        let validation = self.validator.validate(def);
        validation.ensure_valid()?;

        let placed: usize = validation.levels.iter().map(Vec::len).sum();
        if placed != def.steps().len() {
            let placed: BTreeSet<&str> = validation.levels.iter().flatten().map(String::as_str).collect();
            let missing = def
                .steps()
                .iter()
                .filter(|s| !placed.contains(s.id.as_str()))
                .map(|s| s.id.clone())
                .collect();
            return Err(EngineError::UnresolvedSteps(missing));
        }

        let plan = self.allocator.reserve(def, self.config.allocation_strategy)?;
        let capacity = self.allocator.snapshot().capacity;
        let optimization = match self.optimizer.optimize(def, &validation, &plan, &capacity) {
            Ok(optimization) => optimization,
            Err(err) => {
                self.allocator.release(&plan);
                return Err(err);
            }
        };

        let execution_id = Uuid::new_v4();
        info!(
            %execution_id,
            levels = optimization.ordered_levels.len(),
            steps = def.steps().len(),
            critical_path = ?optimization.critical_path.steps,
            "DAG validated, executing workflow"
        );

        // ------------------------------------------------------------------
        // Dispatch level by level.
        // ------------------------------------------------------------------
        let mut run = RunState::new(def);
        let status = self
            .drive(def, execution_id, &optimization, &mut run, &cancel, started)
            .await;

        let rollback_errors = if status == WorkflowStatus::Failed {
            self.rollback(def, execution_id, &mut run).await
        } else {
            Vec::new()
        };

        self.allocator.release(&plan);

        let (step_results, levels) = run.into_parts(def);
        info!(
            %execution_id,
            %status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "workflow finished"
        );

        Ok(ExecutionResult {
            execution_id,
            workflow_id: def.id().to_owned(),
            version: def.version().to_owned(),
            status,
            step_results,
            total_duration_seconds: started.elapsed().as_secs_f64(),
            critical_path: optimization.critical_path.steps.clone(),
            levels,
            rollback_errors,
        })
    }

    // -----------------------------------------------------------------------
    // Internal: level loop.
    // -----------------------------------------------------------------------

    async fn drive(
        &self,
        def: &WorkflowDefinition,
        execution_id: Uuid,
        optimization: &OptimizationPlan,
        run: &mut RunState,
        cancel: &CancellationToken,
        started: Instant,
    ) -> WorkflowStatus {
        let ceiling = self.config.max_parallelism.max(1);

        for (index, level) in optimization.ordered_levels.iter().enumerate() {
            if cancel.is_cancelled() {
                return run.abort(WorkflowStatus::Cancelled, "workflow cancelled");
            }
            if let Some(deadline) = self.config.workflow_deadline {
                if started.elapsed() >= deadline {
                    warn!(level = index, ?deadline, "workflow deadline exceeded");
                    return run.abort(WorkflowStatus::TimedOut, "workflow deadline exceeded");
                }
            }

            // Only reachable with `continue_on_failure`: a prerequisite did not complete.
            let mut runnable: Vec<&str> = Vec::with_capacity(level.len());
            for step_id in level {
                if run.prerequisites_completed(def, step_id) {
                    runnable.push(step_id);
                } else {
                    run.skip(step_id, "upstream step did not complete");
                }
            }

            let mut report = LevelReport { index, steps: level.clone(), waves: 0 };
            for wave in runnable.chunks(ceiling) {
                if cancel.is_cancelled() {
                    break;
                }
                report.waves += 1;
                debug!(level = index, wave = report.waves, size = wave.len(), "dispatching wave");

                let mut in_flight = FuturesUnordered::new();
                for &step_id in wave {
                    let task = self.prepare_task(def, execution_id, step_id, run, cancel);
                    run.mark_running(step_id);
                    let handle = tokio::spawn(task.run());
                    in_flight.push(async move { (step_id, handle.await) });
                }

                while let Some((step_id, joined)) = in_flight.next().await {
                    let outcome = joined.unwrap_or_else(|join_err| {
                        error!(step_id, error = %join_err, "step task panicked");
                        StepRunOutcome::finished(
                            1,
                            StepErrorDetail::new(
                                StepErrorKind::Execution,
                                format!("step task panicked: {join_err}"),
                            ),
                        )
                    });
                    run.record(step_id, outcome);
                }
            }
            run.levels.push(report);

            // Barrier: every dispatched step of this level is terminal here.
            if cancel.is_cancelled() {
                return run.abort(WorkflowStatus::Cancelled, "workflow cancelled");
            }

            let failed: Vec<&str> = level
                .iter()
                .map(String::as_str)
                .filter(|id| run.status(id).is_some_and(|s| matches!(s, StepStatus::Failed | StepStatus::TimedOut)))
                .collect();
            if !failed.is_empty() {
                if self.config.continue_on_failure {
                    warn!(level = index, failed = ?failed, "step failure; continuing with later levels");
                } else {
                    error!(level = index, failed = ?failed, "step failure; halting dispatch");
                    return WorkflowStatus::Failed;
                }
            }
        }

        if run.any_failed() {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Completed
        }
    }

    fn prepare_task(
        &self,
        def: &WorkflowDefinition,
        execution_id: Uuid,
        step_id: &str,
        run: &RunState,
        cancel: &CancellationToken,
    ) -> StepTask {
        // Validation guarantees the id exists; fall back to a bare descriptor otherwise.
        let step = def.step(step_id);
        let executor_ref = step.map(|s| s.executor_ref.clone()).unwrap_or_default();

        let descriptor = StepDescriptor {
            workflow_id: def.id().to_owned(),
            execution_id,
            step_id: step_id.to_owned(),
            name: step.map(|s| s.name.clone()).unwrap_or_else(|| step_id.to_owned()),
            executor_ref: executor_ref.clone(),
            outputs: step.map(|s| s.outputs.clone()).unwrap_or_default(),
            config: step.map(|s| s.config.clone()).unwrap_or_default(),
            attempt: 0,
        };

        StepTask {
            executor: self.registry.get(&executor_ref).cloned(),
            descriptor,
            inputs: run.resolve_inputs(def, step_id),
            max_attempts: step
                .and_then(|s| s.retries)
                .unwrap_or(self.config.max_attempts)
                .max(1),
            timeout: step.and_then(|s| s.timeout()).unwrap_or(self.config.default_timeout),
            config: self.config.clone(),
            cancel: cancel.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Internal: rollback of completed steps after a failure.
    // -----------------------------------------------------------------------

    async fn rollback(
        &self,
        def: &WorkflowDefinition,
        execution_id: Uuid,
        run: &mut RunState,
    ) -> Vec<StepErrorDetail> {
        let mut errors = Vec::new();
        let completed: Vec<String> = run.completion_order.iter().rev().cloned().collect();

        for step_id in completed {
            let Some(step) = def.step(&step_id) else { continue };
            let Some(backup_ref) = step.rollback_ref.as_deref() else { continue };

            let Some(executor) = self.registry.get(&step.executor_ref) else {
                errors.push(StepErrorDetail::new(
                    StepErrorKind::Rollback,
                    format!("step '{step_id}': no executor registered for '{}'", step.executor_ref),
                ));
                continue;
            };

            let descriptor = StepDescriptor {
                workflow_id: def.id().to_owned(),
                execution_id,
                step_id: step_id.clone(),
                name: step.name.clone(),
                executor_ref: step.executor_ref.clone(),
                outputs: step.outputs.clone(),
                config: step.config.clone(),
                attempt: run.attempts(&step_id),
            };

            match executor.rollback(&descriptor, backup_ref).await {
                Ok(()) => {
                    warn!(step_id = %step_id, backup_ref, "rolled back completed step");
                    run.mark_rolled_back(&step_id);
                }
                Err(err) => {
                    error!(step_id = %step_id, backup_ref, error = %err, "rollback failed");
                    errors.push(StepErrorDetail::new(
                        StepErrorKind::Rollback,
                        format!("step '{step_id}': {err}"),
                    ));
                }
            }
        }
        errors
    }
}

// ---------------------------------------------------------------------------
// Run bookkeeping
// ---------------------------------------------------------------------------

/// Mutable state of one run. Lives on the orchestrating task only; step tasks
/// get owned copies of what they need.
struct RunState {
    results: HashMap<String, StepResult>,
    outputs: HashMap<String, StepOutputs>,
    completion_order: Vec<String>,
    levels: Vec<LevelReport>,
}

impl RunState {
    fn new(def: &WorkflowDefinition) -> Self {
        Self {
            results: def
                .steps()
                .iter()
                .map(|s| (s.id.clone(), StepResult::pending(s.id.clone())))
                .collect(),
            outputs: HashMap::new(),
            completion_order: Vec::new(),
            levels: Vec::new(),
        }
    }

    fn status(&self, step_id: &str) -> Option<StepStatus> {
        self.results.get(step_id).map(|r| r.status)
    }

    fn attempts(&self, step_id: &str) -> u32 {
        self.results.get(step_id).map_or(0, |r| r.attempts)
    }

    fn prerequisites_completed(&self, def: &WorkflowDefinition, step_id: &str) -> bool {
        def.prerequisites(step_id)
            .into_iter()
            .all(|p| self.status(p) == Some(StepStatus::Completed))
    }

    /// Each declared input comes from the first completed prerequisite that
    /// produced an output of that name.
    fn resolve_inputs(&self, def: &WorkflowDefinition, step_id: &str) -> StepInputs {
        let mut inputs = StepInputs::new();
        let Some(step) = def.step(step_id) else { return inputs };
        let mut prereqs: Vec<&str> = def.prerequisites(step_id).into_iter().collect();
        prereqs.sort_by_key(|p| def.position(p).unwrap_or(usize::MAX));

        for name in &step.inputs {
            let value = prereqs
                .iter()
                .filter_map(|p| self.outputs.get(*p))
                .find_map(|outputs| outputs.get(name));
            match value {
                Some(value) => {
                    inputs.insert(name.clone(), value.clone());
                }
                None => debug!(step_id, input = %name, "input not produced by any prerequisite"),
            }
        }
        inputs
    }

    fn transition(&mut self, step_id: &str, next: StepStatus) -> Option<&mut StepResult> {
        let result = self.results.get_mut(step_id)?;
        if !result.status.can_transition_to(next) {
            warn!(step_id, from = %result.status, to = %next, "ignoring invalid step transition");
            return None;
        }
        result.status = next;
        Some(result)
    }

    fn mark_running(&mut self, step_id: &str) {
        if let Some(result) = self.transition(step_id, StepStatus::Running) {
            result.started_at = Some(Utc::now());
        }
    }

    fn record(&mut self, step_id: &str, outcome: StepRunOutcome) {
        let StepRunOutcome { status, attempts, outputs, error } = outcome;
        if let Some(result) = self.transition(step_id, status) {
            result.attempts = attempts;
            result.ended_at = Some(Utc::now());
            result.error = error;
        }
        if status == StepStatus::Completed {
            self.outputs.insert(step_id.to_owned(), outputs);
            self.completion_order.push(step_id.to_owned());
        }
    }

    fn skip(&mut self, step_id: &str, reason: &str) {
        if let Some(result) = self.transition(step_id, StepStatus::Cancelled) {
            result.error = Some(StepErrorDetail::new(StepErrorKind::Cancelled, reason));
        }
    }

    fn mark_rolled_back(&mut self, step_id: &str) {
        self.transition(step_id, StepStatus::RolledBack);
    }

    /// Cancel every step that has not reached a terminal state.
    fn abort(&mut self, status: WorkflowStatus, reason: &str) -> WorkflowStatus {
        let open: Vec<String> = self
            .results
            .values()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.step_id.clone())
            .collect();
        for step_id in open {
            self.skip(&step_id, reason);
        }
        status
    }

    fn any_failed(&self) -> bool {
        self.results
            .values()
            .any(|r| matches!(r.status, StepStatus::Failed | StepStatus::TimedOut))
    }

    fn into_parts(mut self, def: &WorkflowDefinition) -> (Vec<StepResult>, Vec<LevelReport>) {
        let results = def
            .steps()
            .iter()
            .filter_map(|s| self.results.remove(&s.id))
            .collect();
        (results, self.levels)
    }
}

// ---------------------------------------------------------------------------
// Step task
// ---------------------------------------------------------------------------

struct StepRunOutcome {
    status: StepStatus,
    attempts: u32,
    outputs: StepOutputs,
    error: Option<StepErrorDetail>,
}

impl StepRunOutcome {
    fn completed(attempts: u32, outputs: StepOutputs) -> Self {
        Self { status: StepStatus::Completed, attempts, outputs, error: None }
    }

    /// Terminal failure; a timeout error yields `TimedOut`, anything else `Failed`.
    fn finished(attempts: u32, error: StepErrorDetail) -> Self {
        let status = match error.kind {
            StepErrorKind::Timeout => StepStatus::TimedOut,
            _ => StepStatus::Failed,
        };
        Self { status, attempts, outputs: StepOutputs::new(), error: Some(error) }
    }

    fn cancelled(attempts: u32) -> Self {
        Self {
            status: StepStatus::Cancelled,
            attempts,
            outputs: StepOutputs::new(),
            error: Some(StepErrorDetail::new(
                StepErrorKind::Cancelled,
                "cancelled while running",
            )),
        }
    }
}

/// Everything one spawned step needs, owned.
struct StepTask {
    executor: Option<Arc<dyn StepExecutor>>,
    descriptor: StepDescriptor,
    inputs: StepInputs,
    max_attempts: u32,
    timeout: Duration,
    config: EngineConfig,
    cancel: CancellationToken,
}

impl StepTask {
    async fn run(mut self) -> StepRunOutcome {
        let step_id = self.descriptor.step_id.clone();

        let Some(executor) = self.executor.take() else {
            error!(step_id = %step_id, executor = %self.descriptor.executor_ref, "no executor registered");
            return StepRunOutcome::finished(
                0,
                StepErrorDetail::new(
                    StepErrorKind::Execution,
                    format!("no executor registered for '{}'", self.descriptor.executor_ref),
                ),
            );
        };

        // Non-idempotent executors are never invoked twice for the same step.
        let max_attempts = if executor.is_idempotent() { self.max_attempts } else { 1 };
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.descriptor.attempt = attempt;

            let call = tokio::time::timeout(
                self.timeout,
                executor.execute(&self.descriptor, &self.inputs),
            );
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return StepRunOutcome::cancelled(attempt),
                result = call => result,
            };

            let (error, retryable) = match result {
                Ok(Ok(outcome)) if outcome.success => {
                    debug!(step_id = %step_id, attempt, "step completed");
                    return StepRunOutcome::completed(attempt, outcome.outputs);
                }
                Ok(Ok(outcome)) => (
                    StepErrorDetail::new(
                        StepErrorKind::Execution,
                        outcome.error.unwrap_or_else(|| "executor reported failure".into()),
                    ),
                    true,
                ),
                Ok(Err(err)) => (
                    StepErrorDetail::new(StepErrorKind::Execution, err.message()),
                    err.is_retryable(),
                ),
                Err(_elapsed) => (
                    StepErrorDetail::new(
                        StepErrorKind::Timeout,
                        format!("timed out after {:?}", self.timeout),
                    ),
                    true,
                ),
            };

            if !retryable || attempt >= max_attempts {
                error!(
                    step_id = %step_id,
                    attempt,
                    kind = ?error.kind,
                    error = %error.message,
                    "step failed"
                );
                return StepRunOutcome::finished(attempt, error);
            }

            let delay = self.config.backoff_delay(attempt);
            warn!(
                step_id = %step_id,
                attempt,
                max_attempts,
                ?delay,
                kind = ?error.kind,
                error = %error.message,
                "step attempt failed; retrying"
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return StepRunOutcome::cancelled(attempt),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
