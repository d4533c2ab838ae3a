//! Plan Execution and Interrupt Records

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Status;
use crate::ambiance::TriggerInfo;

/// One run of a compiled plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanExecution {
    pub uuid: String,
    pub plan_id: String,
    pub name: String,
    pub status: Status,
    pub version: u64,
    #[serde(default)]
    pub setup: BTreeMap<String, String>,
    #[serde(default)]
    pub trigger: TriggerInfo,
    pub start_ts: DateTime<Utc>,
    #[serde(default)]
    pub end_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
    /// The failed plan execution this one retries.
    #[serde(default)]
    pub retry_of: Option<String>,
    /// Plan node id to the source node execution carried over instead of
    /// running again.
    #[serde(default)]
    pub reused: BTreeMap<String, String>,
}

impl PlanExecution {
    pub fn new(
        uuid: impl Into<String>,
        plan_id: impl Into<String>,
        name: impl Into<String>,
        setup: BTreeMap<String, String>,
        trigger: TriggerInfo,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            plan_id: plan_id.into(),
            name: name.into(),
            status: Status::Running,
            version: 0,
            setup,
            trigger,
            start_ts: Utc::now(),
            end_ts: None,
            valid_until: None,
            retry_of: None,
            reused: BTreeMap::new(),
        }
    }

    /// Marks this run as a retry of `source`, reusing the given nodes.
    pub fn with_retry_of(
        mut self,
        source: impl Into<String>,
        reused: BTreeMap<String, String>,
    ) -> Self {
        self.retry_of = Some(source.into());
        self.reused = reused;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Kinds of externally triggered control signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptType {
    Abort,
    Pause,
    Resume,
    Retry,
    Expire,
    MarkSuccess,
    Ignore,
}

impl InterruptType {
    /// True for kinds that act on one node execution rather than a plan.
    pub fn targets_node(&self) -> bool {
        matches!(
            self,
            Self::Retry | Self::Expire | Self::MarkSuccess | Self::Ignore
        )
    }
}

impl fmt::Display for InterruptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Abort => "ABORT",
            Self::Pause => "PAUSE",
            Self::Resume => "RESUME",
            Self::Retry => "RETRY",
            Self::Expire => "EXPIRE",
            Self::MarkSuccess => "MARK_SUCCESS",
            Self::Ignore => "IGNORE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptState {
    Registered,
    Processing,
    Processed,
    /// Claimed but found nothing to act on.
    Discarded,
}

/// A persisted interrupt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    pub uuid: String,
    pub kind: InterruptType,
    pub plan_execution_id: String,
    #[serde(default)]
    pub node_execution_id: Option<String>,
    pub state: InterruptState,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
}

impl Interrupt {
    pub fn new(
        kind: InterruptType,
        plan_execution_id: impl Into<String>,
        node_execution_id: Option<String>,
    ) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            kind,
            plan_execution_id: plan_execution_id.into(),
            node_execution_id,
            state: InterruptState::Registered,
            created_at: Utc::now(),
            processed_at: None,
        }
    }

    /// True if this interrupt addresses the given plan or node.
    pub fn same_target(&self, plan_execution_id: &str, node_execution_id: Option<&str>) -> bool {
        self.plan_execution_id == plan_execution_id
            && self.node_execution_id.as_deref() == node_execution_id
    }
}
