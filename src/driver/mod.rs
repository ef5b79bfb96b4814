//! Turns an operation graph into batches of tasks and runs them.
mod execute;
mod plan;
mod task;
mod trace;

pub use self::execute::{execute, ExecutionReport};
pub use self::plan::{ArrayRef, ExecutionPlan, PlannedNode};
pub use self::task::Task;
