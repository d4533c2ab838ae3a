//! Outcomes and Sweeping Outputs
//!
//! Outcomes are attached to the node execution that produced them and are
//! written together with its terminal status. Sweeping outputs are separate
//! immutable records that other nodes read by name, subject to a
//! visibility scope.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Status;
use crate::ambiance::Ambiance;

/// Result payload of a finished node, one variant per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Shell {
        exit_code: i32,
        #[serde(default)]
        outputs: BTreeMap<String, String>,
    },
    Approval {
        approved: bool,
        #[serde(default)]
        approver: Option<String>,
        #[serde(default)]
        comments: Option<String>,
    },
    /// Written by container nodes when their children finish.
    Aggregate { children: Vec<ChildStatus> },
    Json { value: Value },
}

impl Outcome {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Shell { .. } => "shell",
            Self::Approval { .. } => "approval",
            Self::Aggregate { .. } => "aggregate",
            Self::Json { .. } => "json",
        }
    }
}

/// One child's contribution to an [`Outcome::Aggregate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildStatus {
    pub node_execution_id: String,
    pub identifier: String,
    pub status: Status,
}

/// Who may read a sweeping output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Visibility {
    /// The producing node and its descendants.
    StepLocal,
    /// Everything under the enclosing stage.
    #[default]
    StageLocal,
    /// Every node of the plan execution.
    PipelineGlobal,
}

/// A named value published by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepingOutput {
    pub uuid: String,
    pub plan_execution_id: String,
    pub name: String,
    pub value: Value,
    pub visibility: Visibility,
    /// Runtime id of the level the output is scoped to; empty for
    /// pipeline-global outputs.
    pub scope_runtime_id: String,
    pub producer_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
}

impl SweepingOutput {
    /// Scopes a new output to the producer's `ambiance`.
    ///
    /// A stage-local output produced outside any stage falls back to
    /// pipeline scope.
    pub fn new(
        name: impl Into<String>,
        value: Value,
        visibility: Visibility,
        ambiance: &Ambiance,
    ) -> Self {
        let scope_runtime_id = match visibility {
            Visibility::StepLocal => ambiance.current_runtime_id().unwrap_or_default(),
            Visibility::StageLocal => ambiance
                .stage_level()
                .map(|l| l.runtime_id.as_str())
                .unwrap_or_default(),
            Visibility::PipelineGlobal => "",
        }
        .to_string();

        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            plan_execution_id: ambiance.plan_execution_id.clone(),
            name: name.into(),
            value,
            visibility,
            scope_runtime_id,
            producer_id: ambiance.current_runtime_id().unwrap_or_default().to_string(),
            created_at: Utc::now(),
            valid_until: None,
        }
    }

    /// True if a node running under `ambiance` may read this output.
    pub fn is_visible_to(&self, ambiance: &Ambiance) -> bool {
        if self.plan_execution_id != ambiance.plan_execution_id {
            return false;
        }
        self.scope_runtime_id.is_empty() || ambiance.contains_runtime_id(&self.scope_runtime_id)
    }
}

/// An output a step wants published when it finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSpec {
    pub name: String,
    pub value: Value,
    pub visibility: Visibility,
}

impl OutputSpec {
    pub fn new(name: impl Into<String>, value: Value, visibility: Visibility) -> Self {
        Self {
            name: name.into(),
            value,
            visibility,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambiance::{Level, TriggerInfo};
    use crate::plan::NodeGroup;
    use serde_json::json;

    fn level(id: &str, group: NodeGroup) -> Level {
        Level {
            runtime_id: id.to_string(),
            setup_id: format!("setup-{}", id),
            identifier: id.to_string(),
            step_type: "Noop".to_string(),
            group: Some(group),
            retry_index: 0,
            start_ts: Utc::now(),
        }
    }

    fn stage_ambiance(stage: &str, step: &str) -> Ambiance {
        Ambiance::new("pe", "plan", Default::default(), TriggerInfo::default())
            .clone_for_child(level("root", NodeGroup::Pipeline))
            .clone_for_child(level(stage, NodeGroup::Stage))
            .clone_for_child(level(step, NodeGroup::Step))
    }

    #[test]
    fn test_stage_local_visibility() {
        let producer = stage_ambiance("build", "compile");
        let output = SweepingOutput::new("version", json!("1.0"), Visibility::StageLocal, &producer);

        assert_eq!(output.scope_runtime_id, "build");
        assert!(output.is_visible_to(&stage_ambiance("build", "test")));
        assert!(!output.is_visible_to(&stage_ambiance("deploy", "push")));
    }

    #[test]
    fn test_step_local_visibility() {
        let producer = stage_ambiance("build", "compile");
        let output = SweepingOutput::new("tmp", json!(1), Visibility::StepLocal, &producer);

        assert!(output.is_visible_to(&producer));
        assert!(!output.is_visible_to(&stage_ambiance("build", "test")));
    }

    #[test]
    fn test_pipeline_global_visibility() {
        let producer = stage_ambiance("build", "compile");
        let output = SweepingOutput::new("sha", json!("abc"), Visibility::PipelineGlobal, &producer);

        assert!(output.scope_runtime_id.is_empty());
        assert!(output.is_visible_to(&stage_ambiance("deploy", "push")));

        let mut other = stage_ambiance("deploy", "push");
        other.plan_execution_id = "another".into();
        assert!(!output.is_visible_to(&other));
    }

    #[test]
    fn test_outcome_tagging() {
        let outcome = Outcome::Shell {
            exit_code: 0,
            outputs: BTreeMap::new(),
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["kind"], "shell");
        assert_eq!(outcome.kind(), "shell");
    }
}
