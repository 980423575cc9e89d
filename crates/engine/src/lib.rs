//! `engine` crate: workflow models, parsing, DAG validation, resource
//! allocation, optimization and the execution engine.

pub mod models;
pub mod error;
pub mod parser;
pub mod dag;
pub mod cache;
pub mod resources;
pub mod optimizer;
pub mod config;
pub mod executor;

pub use models::{ExecutionResult, Resources, Step, StepResult, StepStatus, WorkflowDefinition, WorkflowStatus};
pub use error::EngineError;
pub use parser::{parse_raw, parse_str, Parser, ParserOptions};
pub use dag::{detect_cycles, get_execution_order, validate_dag, DagValidation, DagValidator, ValidationCache};
pub use cache::VersionCache;
pub use resources::{AllocationStrategy, ResourceAllocator};
pub use optimizer::{Optimizer, OptimizationPlan};
pub use self::config::Settings;
pub use executor::{EngineConfig, ExecutorRegistry, WorkflowEngine};
