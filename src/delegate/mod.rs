//! Delegate Tasks
//!
//! Work that leaves the engine: a step answers with a [`TaskSpec`], the
//! [`TaskDispatcher`] encodes it into an opaque [`TaskPayload`] and
//! submits it to an [`ExecutionPool`]. The pool reports completion through
//! a [`CallbackChannel`], which feeds the engine's message queue.

pub mod dispatcher;
pub mod payload;
pub mod pool;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::DispatchError;
use crate::orchestration::{Message, MessageQueue};
use crate::plan::FailureType;

pub use dispatcher::{DispatchOutcome, TaskDispatcher};
pub use payload::{PayloadKind, ShellTask, TaskParameters, TaskPayload};
pub use pool::LocalExecutionPool;

/// What a step wants executed remotely.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub parameters: TaskParameters,
    /// Capabilities the executor must offer, e.g. delegate selectors.
    pub capabilities: Vec<String>,
    /// Overrides the configured task timeout.
    pub timeout: Option<Duration>,
}

/// A task as submitted to the execution pool.
#[derive(Debug, Clone, PartialEq)]
pub struct DelegateTaskRequest {
    /// Correlation id; the callback carries it back.
    pub task_id: String,
    pub payload: TaskPayload,
    pub capabilities: Vec<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Success,
    Failure,
}

/// Result reported by an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: TaskStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub failure_types: Vec<FailureType>,
}

impl TaskResult {
    pub fn success(exit_code: i32, outputs: BTreeMap<String, String>) -> Self {
        Self {
            status: TaskStatus::Success,
            exit_code: Some(exit_code),
            outputs,
            error: None,
            failure_types: Vec::new(),
        }
    }

    pub fn failure(exit_code: Option<i32>, error: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failure,
            exit_code,
            outputs: BTreeMap::new(),
            error: Some(error.into()),
            failure_types: Vec::new(),
        }
    }

    pub fn with_failure_type(mut self, failure_type: FailureType) -> Self {
        self.failure_types.push(failure_type);
        self
    }
}

/// Immediate answer of a submission.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitAck {
    /// Accepted; the result arrives later through the callback channel.
    Submitted,
    /// The pool already has the result.
    Completed(TaskResult),
}

/// Handle an execution pool uses to report results.
#[derive(Clone)]
pub struct CallbackChannel {
    queue: Arc<dyn MessageQueue>,
}

impl CallbackChannel {
    pub fn new(queue: Arc<dyn MessageQueue>) -> Self {
        Self { queue }
    }

    /// Posts the result of `task_id`. Late and duplicate results are
    /// accepted here and ignored by the engine.
    pub fn complete(&self, task_id: &str, result: TaskResult) {
        debug!("Callback for task {}: {:?}", task_id, result.status);
        self.queue.publish(Message::TaskResponse {
            task_id: task_id.to_string(),
            result,
        });
    }
}

/// Remote executors, as seen by the engine.
pub trait ExecutionPool: Send + Sync {
    fn submit(
        &self,
        request: DelegateTaskRequest,
        callback: CallbackChannel,
    ) -> Result<SubmitAck, DispatchError>;
}
