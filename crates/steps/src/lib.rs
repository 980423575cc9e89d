//! `steps` crate: the `StepExecutor` contract and bundled executor implementations.
//!
//! The engine never interprets a step's work itself. Every executor, whether a
//! real integration or a test double, implements [`StepExecutor`] and the engine
//! dispatches through the trait object.

pub mod error;
pub mod traits;
pub mod mock;
pub mod dry_run;

pub use error::StepError;
pub use traits::{StepDescriptor, StepExecutor, StepInputs, StepOutcome, StepOutputs};
pub use mock::MockExecutor;
pub use dry_run::DryRunExecutor;
