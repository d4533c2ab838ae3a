//! Node Execution Status
//!
//! The status state machine shared by node executions and plan executions.
//!
//! ```text
//! QUEUED -> RUNNING -> { ASYNC_WAITING | TASK_WAITING } -> terminal
//!    |         |                 |
//!    |         |                 +-> INTERVENTION_WAITING -> terminal
//!    +-> PAUSED -> QUEUED
//!
//! any non-terminal -> DISCONTINUING -> { ABORTED | EXPIRED }
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Runtime status of a node or plan execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Queued,
    Running,
    AsyncWaiting,
    TaskWaiting,
    InterventionWaiting,
    Paused,
    Discontinuing,
    Succeeded,
    Failed,
    IgnoreFailed,
    Aborted,
    Expired,
    Skipped,
}

impl Status {
    pub const ALL: [Status; 13] = [
        Status::Queued,
        Status::Running,
        Status::AsyncWaiting,
        Status::TaskWaiting,
        Status::InterventionWaiting,
        Status::Paused,
        Status::Discontinuing,
        Status::Succeeded,
        Status::Failed,
        Status::IgnoreFailed,
        Status::Aborted,
        Status::Expired,
        Status::Skipped,
    ];

    /// Statuses a record can never leave.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded
                | Self::Failed
                | Self::IgnoreFailed
                | Self::Aborted
                | Self::Expired
                | Self::Skipped
        )
    }

    /// Terminal statuses that let the surrounding flow continue.
    pub fn is_positive(&self) -> bool {
        matches!(self, Self::Succeeded | Self::IgnoreFailed | Self::Skipped)
    }

    /// Terminal statuses that count as a failure for advising.
    pub fn is_broken(&self) -> bool {
        matches!(self, Self::Failed | Self::Expired)
    }

    /// Statuses waiting on something outside the engine.
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            Self::AsyncWaiting | Self::TaskWaiting | Self::InterventionWaiting
        )
    }

    pub fn non_terminal() -> Vec<Status> {
        Self::ALL.into_iter().filter(|s| !s.is_terminal()).collect()
    }

    /// True if a record may move from `self` to `to`.
    pub fn can_transition_to(&self, to: Status) -> bool {
        use Status::*;

        if self.is_terminal() {
            return false;
        }

        match (self, to) {
            (Queued, Running | Paused | Discontinuing | Aborted | Skipped | Failed) => true,
            (Running, Running | AsyncWaiting | TaskWaiting | InterventionWaiting) => true,
            (Running, Discontinuing) => true,
            (Running, t) => t.is_terminal(),
            (AsyncWaiting | TaskWaiting, InterventionWaiting | Discontinuing) => true,
            (AsyncWaiting | TaskWaiting, t) => t.is_terminal(),
            (InterventionWaiting, Discontinuing) => true,
            (InterventionWaiting, t) => t.is_terminal(),
            (Paused, Queued | Discontinuing | Aborted) => true,
            (Discontinuing, Aborted | Expired) => true,
            _ => false,
        }
    }

    /// Folds child statuses into a parent status.
    ///
    /// Priority: aborted, failed, expired, then success. A parent whose
    /// children were all skipped is skipped; no children counts as success.
    pub fn aggregate<I>(statuses: I) -> Status
    where
        I: IntoIterator<Item = Status>,
    {
        let statuses: Vec<Status> = statuses.into_iter().collect();

        if statuses.is_empty() {
            return Status::Succeeded;
        }
        if statuses.contains(&Status::Aborted) {
            return Status::Aborted;
        }
        if statuses.contains(&Status::Failed) {
            return Status::Failed;
        }
        if statuses.contains(&Status::Expired) {
            return Status::Expired;
        }
        if statuses.iter().all(|s| *s == Status::Skipped) {
            return Status::Skipped;
        }
        Status::Succeeded
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::AsyncWaiting => "ASYNC_WAITING",
            Self::TaskWaiting => "TASK_WAITING",
            Self::InterventionWaiting => "INTERVENTION_WAITING",
            Self::Paused => "PAUSED",
            Self::Discontinuing => "DISCONTINUING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::IgnoreFailed => "IGNORE_FAILED",
            Self::Aborted => "ABORTED",
            Self::Expired => "EXPIRED",
            Self::Skipped => "SKIPPED",
        };
        f.write_str(name)
    }
}
