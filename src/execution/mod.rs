//! Execution State
//!
//! Runtime records and the store that owns them:
//! - [`Status`] state machine
//! - [`NodeExecution`] and [`PlanExecution`] records
//! - [`Interrupt`] records
//! - [`Outcome`]s and [`SweepingOutput`]s
//! - [`NodeExecutionStore`] with an in-memory implementation
//! - [`ExecutionSnapshot`] files

pub mod node_execution;
pub mod outcome;
pub mod plan_execution;
pub mod state;
pub mod status;
pub mod store;

pub use node_execution::{
    AdviserResponse, ExecutableResponse, ExecutionMode, FailureInfo, NodeExecution,
};
pub use outcome::{ChildStatus, Outcome, OutputSpec, SweepingOutput, Visibility};
pub use plan_execution::{Interrupt, InterruptState, InterruptType, PlanExecution};
pub use state::ExecutionSnapshot;
pub use status::Status;
pub use store::{
    update_plan_execution_with, update_with, InMemoryStore, NodeExecutionQuery,
    NodeExecutionStore, Projection,
};
