//! Resource allocation against a finite pool.
//!
//! Strategies are pure functions of `(requirement, available pool)`. The
//! [`ResourceAllocator`] is the only writer of the pool: it reserves a plan for
//! a run and releases it afterwards, serialising concurrent callers through a
//! mutex.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::{Resources, WorkflowDefinition};
use crate::EngineError;

/// Relative slack when comparing summed floating-point allocations.
const TOLERANCE: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// Requirement × 1.2, capped at availability.
    #[default]
    Balanced,
    /// Requirement × 2.0, capped at availability.
    Performance,
    /// Requirement × 0.8, capped at availability.
    Cost,
    /// Equal share of the available pool, ignoring the requirement. Small
    /// steps are over-provisioned and large ones may be starved.
    Fair,
}

impl AllocationStrategy {
    pub fn apply(&self, requirement: &Resources, available: &Resources, step_count: usize) -> Resources {
        match self {
            Self::Balanced => requirement.map(|v| v * 1.2).min(available),
            Self::Performance => requirement.map(|v| v * 2.0).min(available),
            Self::Cost => requirement.map(|v| v * 0.8).min(available),
            Self::Fair => available.map(|v| v / step_count.max(1) as f64),
        }
    }

    pub fn priority(&self) -> Priority {
        match self {
            Self::Performance => Priority::High,
            Self::Cost => Priority::Low,
            Self::Balanced | Self::Fair => Priority::Normal,
        }
    }
}

impl fmt::Display for AllocationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Balanced => "balanced",
            Self::Performance => "performance",
            Self::Cost => "cost",
            Self::Fair => "fair",
        };
        f.write_str(s)
    }
}

impl FromStr for AllocationStrategy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "balanced" => Ok(Self::Balanced),
            "performance" => Ok(Self::Performance),
            "cost" => Ok(Self::Cost),
            "fair" => Ok(Self::Fair),
            other => Err(format!("unknown allocation strategy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// What the allocator does when a strategy's plan does not fit the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceededPolicy {
    /// Replace the plan with the flat-floor minimal allocation.
    #[default]
    FallbackMinimal,
    Reject,
}

// ---------------------------------------------------------------------------
// Pool and allocations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcePool {
    pub capacity: Resources,
    pub allocated: Resources,
}

impl ResourcePool {
    pub fn new(capacity: Resources) -> Self {
        Self { capacity, allocated: Resources::default() }
    }

    pub fn available(&self) -> Resources {
        self.capacity.saturating_sub(&self.allocated)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAllocation {
    pub step_id: String,
    #[serde(flatten)]
    pub units: Resources,
    pub priority: Priority,
}

/// Allocate every step of `def` under `strategy` against what `pool` has left.
pub fn allocate(
    def: &WorkflowDefinition,
    pool: &ResourcePool,
    strategy: AllocationStrategy,
) -> BTreeMap<String, ResourceAllocation> {
    let available = pool.available();
    let step_count = def.steps().len();
    def.steps()
        .iter()
        .map(|step| {
            let units = strategy.apply(&step.resource_requirements, &available, step_count);
            (
                step.id.clone(),
                ResourceAllocation {
                    step_id: step.id.clone(),
                    units,
                    priority: strategy.priority(),
                },
            )
        })
        .collect()
}

/// Per-step `min(floor, available / step_count)`, which always fits.
pub fn minimal_allocation(
    def: &WorkflowDefinition,
    pool: &ResourcePool,
    floor: &Resources,
) -> BTreeMap<String, ResourceAllocation> {
    let share = pool.available().map(|v| v / def.steps().len().max(1) as f64);
    let units = floor.min(&share);
    def.steps()
        .iter()
        .map(|step| {
            (
                step.id.clone(),
                ResourceAllocation { step_id: step.id.clone(), units, priority: Priority::Low },
            )
        })
        .collect()
}

pub fn total(allocations: &BTreeMap<String, ResourceAllocation>) -> Resources {
    allocations
        .values()
        .fold(Resources::default(), |acc, a| acc.add(&a.units))
}

/// Check that no dimension's summed allocation exceeds what the pool has left.
///
/// # Errors
/// [`EngineError::ResourceExceeded`] naming the first offending dimension.
pub fn validate_allocations(
    allocations: &BTreeMap<String, ResourceAllocation>,
    pool: &ResourcePool,
) -> Result<(), EngineError> {
    let requested = total(allocations).values();
    let available = pool.available().values();
    for (i, dimension) in Resources::DIMENSIONS.iter().enumerate() {
        if requested[i] > available[i] + TOLERANCE * available[i].max(1.0) {
            return Err(EngineError::ResourceExceeded {
                dimension: *dimension,
                requested: requested[i],
                available: available[i],
            });
        }
    }
    Ok(())
}

/// Allocations reserved for one run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationPlan {
    pub workflow_id: String,
    pub strategy: AllocationStrategy,
    /// True when the strategy's plan did not fit and the minimal one was used.
    pub fell_back: bool,
    pub allocations: BTreeMap<String, ResourceAllocation>,
    pub total: Resources,
}

/// Fraction of capacity in use per dimension (0 when a dimension has no capacity).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Utilization {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
    pub network: f64,
}

impl Utilization {
    pub fn of(used: &Resources, capacity: &Resources) -> Self {
        let r = used.zip_with(capacity, |u, c| if c > 0.0 { (u / c).clamp(0.0, 1.0) } else { 0.0 });
        Self { cpu: r.cpu, memory: r.memory_gb, disk: r.disk_gb, network: r.network_mbps }
    }

    pub fn mean(&self) -> f64 {
        (self.cpu + self.memory + self.disk + self.network) / 4.0
    }
}

/// Hourly prices used for cost estimates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CostRates {
    pub cpu_core_hour: f64,
    pub memory_gb_hour: f64,
    pub disk_gb_hour: f64,
    pub network_mbps_hour: f64,
}

impl Default for CostRates {
    fn default() -> Self {
        Self {
            cpu_core_hour: 0.04,
            memory_gb_hour: 0.005,
            disk_gb_hour: 0.0001,
            network_mbps_hour: 0.001,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostEstimate {
    pub per_step: BTreeMap<String, f64>,
    pub total: f64,
}

/// Price a plan given estimated step durations in seconds. Informational only.
pub fn estimate_cost(
    plan: &AllocationPlan,
    durations: &HashMap<String, f64>,
    rates: &CostRates,
) -> CostEstimate {
    let per_step: BTreeMap<String, f64> = plan
        .allocations
        .iter()
        .map(|(id, alloc)| {
            let hours = durations.get(id).copied().unwrap_or(0.0) / 3600.0;
            let u = &alloc.units;
            let hourly = u.cpu * rates.cpu_core_hour
                + u.memory_gb * rates.memory_gb_hour
                + u.disk_gb * rates.disk_gb_hour
                + u.network_mbps * rates.network_mbps_hour;
            (id.clone(), hourly * hours)
        })
        .collect();
    let total = per_step.values().sum();
    CostEstimate { per_step, total }
}

// ---------------------------------------------------------------------------
// Allocator
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ResourceAllocator {
    pool: Mutex<ResourcePool>,
    policy: ExceededPolicy,
    floor: Resources,
}

impl ResourceAllocator {
    pub fn new(capacity: Resources, policy: ExceededPolicy, floor: Resources) -> Self {
        Self { pool: Mutex::new(ResourcePool::new(capacity)), policy, floor }
    }

    /// Compute, validate and reserve a plan for `def`.
    ///
    /// # Errors
    /// [`EngineError::ResourceExceeded`] when the strategy's plan does not fit
    /// and the policy is [`ExceededPolicy::Reject`].
    pub fn reserve(
        &self,
        def: &WorkflowDefinition,
        strategy: AllocationStrategy,
    ) -> Result<AllocationPlan, EngineError> {
        let mut pool = self.pool.lock();

        let mut allocations = allocate(def, &pool, strategy);
        let mut fell_back = false;
        if let Err(err) = validate_allocations(&allocations, &pool) {
            match self.policy {
                ExceededPolicy::Reject => return Err(err),
                ExceededPolicy::FallbackMinimal => {
                    warn!(
                        workflow_id = def.id(),
                        %strategy,
                        error = %err,
                        "allocation does not fit the pool; falling back to minimal allocation"
                    );
                    allocations = minimal_allocation(def, &pool, &self.floor);
                    validate_allocations(&allocations, &pool)?;
                    fell_back = true;
                }
            }
        }

        let total = total(&allocations);
        pool.allocated = pool.allocated.add(&total);
        debug!(workflow_id = def.id(), %strategy, fell_back, ?total, "reserved resources");

        Ok(AllocationPlan {
            workflow_id: def.id().to_owned(),
            strategy,
            fell_back,
            allocations,
            total,
        })
    }

    pub fn release(&self, plan: &AllocationPlan) {
        let mut pool = self.pool.lock();
        pool.allocated = pool.allocated.saturating_sub(&plan.total);
    }

    pub fn snapshot(&self) -> ResourcePool {
        *self.pool.lock()
    }

    pub fn utilization(&self) -> Utilization {
        let pool = self.snapshot();
        Utilization::of(&pool.allocated, &pool.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_raw;
    use serde_json::json;

    fn workflow(requirements: &[(f64, f64)]) -> WorkflowDefinition {
        let steps: Vec<_> = requirements
            .iter()
            .enumerate()
            .map(|(i, (cpu, mem))| {
                json!({
                    "id": format!("s{i}"),
                    "type": "mock",
                    "estimatedDurationSeconds": 3600,
                    "resourceRequirements": { "cpu": cpu, "memoryGb": mem }
                })
            })
            .collect();
        parse_raw(&json!({ "id": "wf", "name": "n", "steps": steps })).unwrap()
    }

    fn pool(cpu: f64, mem: f64) -> ResourcePool {
        ResourcePool::new(Resources::new(cpu, mem, 100.0, 1000.0))
    }

    #[test]
    fn strategies_scale_requirement_and_cap_at_availability() {
        let req = Resources::new(2.0, 4.0, 0.0, 0.0);
        let avail = Resources::new(3.0, 100.0, 10.0, 10.0);

        assert_eq!(AllocationStrategy::Balanced.apply(&req, &avail, 1).cpu, 2.4);
        assert_eq!(AllocationStrategy::Performance.apply(&req, &avail, 1).cpu, 3.0);
        assert_eq!(AllocationStrategy::Performance.apply(&req, &avail, 1).memory_gb, 8.0);
        assert_eq!(AllocationStrategy::Cost.apply(&req, &avail, 1).cpu, 1.6);
        assert_eq!(AllocationStrategy::Fair.apply(&req, &avail, 4).memory_gb, 25.0);
    }

    #[test]
    fn validate_rejects_oversubscribed_dimension() {
        let def = workflow(&[(4.0, 1.0), (4.0, 1.0)]);
        let p = pool(8.0, 64.0);
        let allocations = allocate(&def, &p, AllocationStrategy::Balanced);

        assert!(matches!(
            validate_allocations(&allocations, &p),
            Err(EngineError::ResourceExceeded { dimension: "cpu", .. })
        ));
        let cheap = allocate(&def, &p, AllocationStrategy::Cost);
        assert!(validate_allocations(&cheap, &p).is_ok());
    }

    #[test]
    fn reserved_plans_never_exceed_capacity_under_any_strategy() {
        let def = workflow(&[(6.0, 30.0), (6.0, 30.0), (1.0, 2.0), (0.5, 60.0)]);
        for strategy in [
            AllocationStrategy::Balanced,
            AllocationStrategy::Performance,
            AllocationStrategy::Cost,
            AllocationStrategy::Fair,
        ] {
            let allocator = ResourceAllocator::new(
                Resources::new(8.0, 64.0, 100.0, 1000.0),
                ExceededPolicy::FallbackMinimal,
                Resources::new(0.5, 1.0, 1.0, 10.0),
            );
            let plan = allocator.reserve(&def, strategy).expect("fallback always fits");
            let capacity = allocator.snapshot().capacity.values();
            for (used, cap) in plan.total.values().iter().zip(capacity) {
                assert!(*used <= cap + 1e-9, "{strategy}: {used} > {cap}");
            }
        }
    }

    #[test]
    fn fallback_uses_flat_floor() {
        let def = workflow(&[(10.0, 1.0), (10.0, 1.0)]);
        let allocator = ResourceAllocator::new(
            Resources::new(8.0, 64.0, 100.0, 1000.0),
            ExceededPolicy::FallbackMinimal,
            Resources::new(0.5, 1.0, 1.0, 10.0),
        );
        let plan = allocator.reserve(&def, AllocationStrategy::Performance).unwrap();

        assert!(plan.fell_back);
        assert_eq!(plan.allocations["s0"].units, Resources::new(0.5, 1.0, 1.0, 10.0));
        assert_eq!(plan.allocations["s0"].priority, Priority::Low);
    }

    #[test]
    fn reject_policy_surfaces_error_and_reserves_nothing() {
        let def = workflow(&[(10.0, 1.0), (10.0, 1.0)]);
        let allocator = ResourceAllocator::new(
            Resources::new(8.0, 64.0, 100.0, 1000.0),
            ExceededPolicy::Reject,
            Resources::default(),
        );
        assert!(allocator.reserve(&def, AllocationStrategy::Performance).is_err());
        assert_eq!(allocator.snapshot().allocated, Resources::default());
    }

    #[test]
    fn reserve_and_release_track_pool_usage() {
        let def = workflow(&[(2.0, 8.0)]);
        let allocator = ResourceAllocator::new(
            Resources::new(8.0, 64.0, 100.0, 1000.0),
            ExceededPolicy::Reject,
            Resources::default(),
        );
        let plan = allocator.reserve(&def, AllocationStrategy::Cost).unwrap();
        assert!((allocator.utilization().cpu - 0.2).abs() < 1e-9);

        // A second workflow only sees what is left.
        let second = allocator.reserve(&def, AllocationStrategy::Fair).unwrap();
        assert!((second.total.cpu - (8.0 - 1.6)).abs() < 1e-9);

        allocator.release(&second);
        allocator.release(&plan);
        assert!(allocator.snapshot().allocated.values().iter().all(|v| v.abs() < 1e-9));
    }

    #[test]
    fn cost_estimate_scales_with_duration() {
        let def = workflow(&[(1.0, 0.0)]);
        let allocator = ResourceAllocator::new(
            Resources::new(8.0, 64.0, 100.0, 1000.0),
            ExceededPolicy::Reject,
            Resources::default(),
        );
        let plan = allocator.reserve(&def, AllocationStrategy::Cost).unwrap();
        let estimate = estimate_cost(&plan, &def.durations(), &CostRates::default());
        assert!((estimate.total - 0.8 * 0.04).abs() < 1e-9);
    }
}
