//! Planning module.
//!
//! Compares the desired graph with recorded state, orders the resulting
//! provider calls into batches and executes them.

mod diff;
mod executor;
mod plan;

pub use diff::{AttributeChange, DiffAction, DiffEngine, DiffEntry, DiffResult};
pub use executor::{
    ExecutionReport, ExecutorOptions, NodeStatus, PlanExecutor, PlanStatus, StepOutcome,
};
pub use plan::{ExecutionPlan, PlanStep, Planner, StepAction, StepId, StepPhase};
