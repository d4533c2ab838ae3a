//! Node Execution Records
//!
//! One [`NodeExecution`] per runtime attempt at a plan node. Records are
//! mutable until terminal; a retry creates a new record and never touches
//! the superseded one.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::outcome::Outcome;
use super::Status;
use crate::ambiance::Ambiance;
use crate::plan::{FacilitationStrategy, FailureAction, FailureType, PlanNode, StepParameters};

/// How a node execution runs. Mirrors the node's facilitation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    Sync,
    Async,
    Task,
    Child,
    Children,
    ChildChain,
}

impl From<FacilitationStrategy> for ExecutionMode {
    fn from(strategy: FacilitationStrategy) -> Self {
        match strategy {
            FacilitationStrategy::Sync => Self::Sync,
            FacilitationStrategy::Async => Self::Async,
            FacilitationStrategy::Task => Self::Task,
            FacilitationStrategy::Child => Self::Child,
            FacilitationStrategy::Children => Self::Children,
            FacilitationStrategy::ChildChain => Self::ChildChain,
        }
    }
}

impl ExecutionMode {
    pub fn is_parent(&self) -> bool {
        matches!(self, Self::Child | Self::Children | Self::ChildChain)
    }
}

/// History entry describing what facilitation produced for this attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutableResponse {
    Sync,
    Async {
        correlation_id: String,
    },
    Task {
        task_id: String,
    },
    /// Child executions created up front, as `(plan node id, execution id)`.
    Children {
        children: Vec<(String, String)>,
    },
}

/// Failure details captured on a record and routed to the adviser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub message: String,
    #[serde(default)]
    pub failure_types: Vec<FailureType>,
}

impl FailureInfo {
    pub fn new(message: impl Into<String>, failure_types: Vec<FailureType>) -> Self {
        Self {
            message: message.into(),
            failure_types,
        }
    }

    pub fn of(failure_type: FailureType, message: impl Into<String>) -> Self {
        Self::new(message, vec![failure_type])
    }
}

impl fmt::Display for FailureInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.failure_types.is_empty() {
            write!(f, "{}", self.message)
        } else {
            let types: Vec<String> = self.failure_types.iter().map(|t| t.to_string()).collect();
            write!(f, "[{}] {}", types.join(", "), self.message)
        }
    }
}

/// Control-flow decision taken after a node reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdviserResponse {
    NextStep,
    Retry {
        delay_secs: u64,
    },
    Ignore,
    MarkSuccess,
    FailPipeline,
    Rollback {
        rollback_node_id: String,
    },
    ManualIntervention {
        timeout_secs: Option<u64>,
        on_timeout: FailureAction,
    },
}

impl AdviserResponse {
    /// Status written together with this decision, given the status the
    /// node would otherwise finish with.
    pub fn final_status(&self, status: Status) -> Status {
        match self {
            Self::MarkSuccess => Status::Succeeded,
            Self::Ignore if !status.is_positive() => Status::IgnoreFailed,
            Self::ManualIntervention { .. } => Status::InterventionWaiting,
            _ => status,
        }
    }

    /// True if the parent should not be told about this node yet.
    pub fn defers_parent(&self) -> bool {
        matches!(
            self,
            Self::Retry { .. } | Self::Rollback { .. } | Self::ManualIntervention { .. }
        )
    }
}

/// One runtime attempt at a plan node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub uuid: String,
    pub plan_execution_id: String,
    pub node_id: String,
    pub identifier: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub previous_id: Option<String>,
    /// Pre-allocated id of the next sibling in a child chain.
    #[serde(default)]
    pub next_id: Option<String>,
    pub status: Status,
    pub version: u64,
    pub ambiance: Ambiance,
    #[serde(default)]
    pub mode: Option<ExecutionMode>,
    #[serde(default)]
    pub executable_responses: Vec<ExecutableResponse>,
    #[serde(default)]
    pub resolved_parameters: Option<StepParameters>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub start_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
    /// Ids of earlier attempts at this node, oldest first.
    #[serde(default)]
    pub retry_ids: Vec<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub adviser_response: Option<AdviserResponse>,
    #[serde(default)]
    pub outcomes: Vec<Outcome>,
    /// Set on rollback executions: the failed node they roll back.
    #[serde(default)]
    pub rollback_of: Option<String>,
    /// Set when a plan retry carried this node over: the source attempt.
    #[serde(default)]
    pub reused_from: Option<String>,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
}

impl NodeExecution {
    /// Creates a queued record for `node`. `ambiance` must already carry
    /// the level for this execution.
    pub fn new(
        uuid: impl Into<String>,
        node: &PlanNode,
        parent_id: Option<String>,
        ambiance: Ambiance,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            plan_execution_id: ambiance.plan_execution_id.clone(),
            node_id: node.uuid.clone(),
            identifier: node.identifier.clone(),
            parent_id,
            previous_id: None,
            next_id: None,
            status: Status::Queued,
            version: 0,
            ambiance,
            mode: None,
            executable_responses: Vec::new(),
            resolved_parameters: None,
            created_at: Utc::now(),
            start_ts: None,
            end_ts: None,
            failure_info: None,
            retry_ids: Vec::new(),
            correlation_id: None,
            deadline: None,
            adviser_response: None,
            outcomes: Vec::new(),
            rollback_of: None,
            reused_from: None,
            valid_until: None,
        }
    }

    pub fn with_previous(mut self, previous_id: impl Into<String>) -> Self {
        self.previous_id = Some(previous_id.into());
        self
    }

    pub fn with_rollback_of(mut self, failed_id: impl Into<String>) -> Self {
        self.rollback_of = Some(failed_id.into());
        self
    }

    /// Builds the next attempt after this one failed. The new record
    /// keeps its position in the graph and extends the retry lineage.
    pub fn next_attempt(&self, uuid: impl Into<String>) -> Self {
        let uuid = uuid.into();
        let mut retry_ids = self.retry_ids.clone();
        retry_ids.push(self.uuid.clone());

        Self {
            uuid: uuid.clone(),
            plan_execution_id: self.plan_execution_id.clone(),
            node_id: self.node_id.clone(),
            identifier: self.identifier.clone(),
            parent_id: self.parent_id.clone(),
            previous_id: self.previous_id.clone(),
            next_id: None,
            status: Status::Queued,
            version: 0,
            ambiance: self.ambiance.clone_for_retry(uuid),
            mode: None,
            executable_responses: Vec::new(),
            resolved_parameters: None,
            created_at: Utc::now(),
            start_ts: None,
            end_ts: None,
            failure_info: None,
            retry_ids,
            correlation_id: None,
            deadline: None,
            adviser_response: None,
            outcomes: Vec::new(),
            rollback_of: self.rollback_of.clone(),
            reused_from: None,
            valid_until: None,
        }
    }

    pub fn retry_count(&self) -> usize {
        self.retry_ids.len()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn depth(&self) -> usize {
        self.ambiance.depth()
    }

    /// Moves the record to `status` if the state machine allows it.
    pub fn with_status(mut self, status: Status) -> Option<Self> {
        if self.status == status || self.status.can_transition_to(status) {
            self.status = status;
            Some(self)
        } else {
            None
        }
    }

    /// Child executions this record created when it started.
    pub fn initial_children(&self) -> Vec<(String, String)> {
        self.executable_responses
            .iter()
            .filter_map(|r| match r {
                ExecutableResponse::Children { children } => Some(children.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambiance::{Level, TriggerInfo};

    fn record() -> NodeExecution {
        let node = PlanNode::new("n1", "build", "Noop", FacilitationStrategy::Sync);
        let ambiance = Ambiance::new("pe", "plan", Default::default(), TriggerInfo::default())
            .clone_for_child(Level::for_node(&node, "e1", 0));
        NodeExecution::new("e1", &node, Some("parent".into()), ambiance)
    }

    #[test]
    fn test_new_record_is_queued() {
        let record = record();
        assert_eq!(record.status, Status::Queued);
        assert_eq!(record.version, 0);
        assert_eq!(record.plan_execution_id, "pe");
        assert_eq!(record.node_id, "n1");
        assert_eq!(record.depth(), 1);
    }

    #[test]
    fn test_next_attempt_extends_lineage() {
        let mut first = record();
        first.status = Status::Failed;
        first.next_id = Some("sibling".into());

        let second = first.next_attempt("e2");
        assert_eq!(second.uuid, "e2");
        assert_eq!(second.retry_ids, vec!["e1"]);
        assert_eq!(second.status, Status::Queued);
        assert_eq!(second.parent_id.as_deref(), Some("parent"));
        assert!(second.next_id.is_none());
        assert_eq!(second.ambiance.current_runtime_id(), Some("e2"));
        assert_eq!(second.ambiance.retry_index(), 1);

        let third = second.next_attempt("e3");
        assert_eq!(third.retry_ids, vec!["e1", "e2"]);
        assert_eq!(third.retry_count(), 2);
        assert_eq!(first.status, Status::Failed);
    }

    #[test]
    fn test_with_status_respects_machine() {
        let queued = record();
        assert!(queued.clone().with_status(Status::Running).is_some());
        assert!(queued.with_status(Status::TaskWaiting).is_none());
    }

    #[test]
    fn test_adviser_final_status() {
        assert_eq!(
            AdviserResponse::MarkSuccess.final_status(Status::Failed),
            Status::Succeeded
        );
        assert_eq!(
            AdviserResponse::Ignore.final_status(Status::Expired),
            Status::IgnoreFailed
        );
        assert_eq!(
            AdviserResponse::FailPipeline.final_status(Status::Failed),
            Status::Failed
        );
        assert!(AdviserResponse::Retry { delay_secs: 0 }.defers_parent());
        assert!(!AdviserResponse::NextStep.defers_parent());
    }

    #[test]
    fn test_failure_info_display() {
        let info = FailureInfo::of(FailureType::Timeout, "deadline exceeded");
        assert_eq!(info.to_string(), "[Timeout] deadline exceeded");
    }
}
