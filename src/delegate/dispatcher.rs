//! Delegate Task Dispatcher
//!
//! Records the wait before anything leaves the process, then submits:
//! 1. Generate a correlation id (the task id)
//! 2. Write `TASK_WAITING` with the id and a deadline
//! 3. Submit the encoded payload, retrying transport errors with backoff
//!
//! Submission failures come back as [`DispatchOutcome::Failed`] so the
//! driver can finish the node like any other step failure.

use std::sync::Arc;
use std::thread;

use chrono::Utc;
use log::{debug, info, warn};

use super::{CallbackChannel, DelegateTaskRequest, ExecutionPool, SubmitAck, TaskPayload, TaskResult, TaskSpec};
use crate::config::EngineConfig;
use crate::error::{DispatchError, StoreError};
use crate::execution::{update_with, ExecutableResponse, FailureInfo, NodeExecutionStore, Status};
use crate::plan::FailureType;

/// What happened to a dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The pool accepted the task; its result arrives as a callback.
    Submitted { task_id: String },
    /// The pool answered synchronously.
    Completed { task_id: String, result: TaskResult },
    /// The task could not be handed over.
    Failed { task_id: String, failure: FailureInfo },
    /// The record left `RUNNING` before the wait could be recorded.
    Discarded,
}

/// Submits tasks to an execution pool on behalf of waiting nodes.
#[derive(Clone)]
pub struct TaskDispatcher {
    pool: Arc<dyn ExecutionPool>,
    store: Arc<dyn NodeExecutionStore>,
    callbacks: CallbackChannel,
    config: EngineConfig,
}

impl TaskDispatcher {
    pub fn new(
        pool: Arc<dyn ExecutionPool>,
        store: Arc<dyn NodeExecutionStore>,
        callbacks: CallbackChannel,
        config: EngineConfig,
    ) -> Self {
        Self {
            pool,
            store,
            callbacks,
            config,
        }
    }

    /// Dispatches `spec` for the running node execution `node_execution_id`.
    pub fn dispatch(
        &self,
        node_execution_id: &str,
        spec: TaskSpec,
    ) -> Result<DispatchOutcome, StoreError> {
        let task_id = uuid::Uuid::new_v4().to_string();

        let payload = match TaskPayload::encode(&spec.parameters) {
            Ok(payload) => payload,
            Err(e) => {
                return Ok(DispatchOutcome::Failed {
                    task_id,
                    failure: FailureInfo::of(FailureType::Application, e.to_string()),
                })
            }
        };

        let timeout = spec.timeout.unwrap_or_else(|| self.config.task_timeout());
        let deadline = Utc::now()
            + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(365));

        let recorded = update_with(
            self.store.as_ref(),
            node_execution_id,
            self.config.max_conflict_retries,
            |mut record| {
                if record.status != Status::Running {
                    return None;
                }
                record.status = Status::TaskWaiting;
                record.correlation_id = Some(task_id.clone());
                record.deadline = Some(deadline);
                record.executable_responses.push(ExecutableResponse::Task {
                    task_id: task_id.clone(),
                });
                Some(record)
            },
        )?;

        if recorded.is_none() {
            debug!("Node {} moved on before dispatch - dropping task", node_execution_id);
            return Ok(DispatchOutcome::Discarded);
        }

        let request = DelegateTaskRequest {
            task_id: task_id.clone(),
            payload,
            capabilities: spec.capabilities,
            timeout,
        };

        Ok(match self.submit_with_retry(request) {
            Ok(SubmitAck::Submitted) => {
                info!("Task {} submitted for node {}", task_id, node_execution_id);
                DispatchOutcome::Submitted { task_id }
            }
            Ok(SubmitAck::Completed(result)) => DispatchOutcome::Completed { task_id, result },
            Err(e) => {
                let failure_type = match e {
                    DispatchError::Transport(_) => FailureType::Connectivity,
                    DispatchError::NoEligibleExecutor(_) => FailureType::DelegateProvisioning,
                    DispatchError::Payload(_) => FailureType::Application,
                };
                warn!("Dispatch of task {} failed: {}", task_id, e);
                DispatchOutcome::Failed {
                    task_id,
                    failure: FailureInfo::of(failure_type, e.to_string()),
                }
            }
        })
    }

    fn submit_with_retry(&self, request: DelegateTaskRequest) -> Result<SubmitAck, DispatchError> {
        let max_attempts = self.config.dispatch_max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.pool.submit(request.clone(), self.callbacks.clone()) {
                Ok(ack) => return Ok(ack),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let backoff = self.config.dispatch_backoff(attempt);
                    warn!(
                        "Submitting task {} failed (attempt {}/{}): {} - retrying in {:?}",
                        request.task_id, attempt, max_attempts, e, backoff
                    );
                    thread::sleep(backoff);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
