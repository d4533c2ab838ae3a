//! Ambiance
//!
//! The positional context of an execution: which plan execution it belongs
//! to, the scoping keys it runs under, and the stack of levels from the
//! pipeline root down to the current node.
//!
//! Ambiances are values. Deriving a child context appends a level to a
//! copy; the parent's ambiance is never touched.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plan::{NodeGroup, PlanNode};

pub const ACCOUNT_ID: &str = "accountId";
pub const ORG_IDENTIFIER: &str = "orgIdentifier";
pub const PROJECT_IDENTIFIER: &str = "projectIdentifier";

/// How a plan execution was started.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerInfo {
    pub trigger_type: TriggerType,
    pub triggered_by: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    #[default]
    Manual,
    Webhook,
    Scheduled,
}

/// One entry of the ambiance stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Level {
    /// Node execution id at this level.
    pub runtime_id: String,
    /// Plan node id at this level.
    pub setup_id: String,
    pub identifier: String,
    pub step_type: String,
    pub group: Option<NodeGroup>,
    pub retry_index: u32,
    pub start_ts: DateTime<Utc>,
}

impl Level {
    /// Builds the level for a fresh attempt at `node`.
    pub fn for_node(node: &PlanNode, runtime_id: impl Into<String>, retry_index: u32) -> Self {
        Self {
            runtime_id: runtime_id.into(),
            setup_id: node.uuid.clone(),
            identifier: node.identifier.clone(),
            step_type: node.step_type.clone(),
            group: node.group,
            retry_index,
            start_ts: Utc::now(),
        }
    }
}

/// Execution context carried with every node execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ambiance {
    pub plan_execution_id: String,
    pub plan_id: String,
    #[serde(default)]
    pub setup_abstractions: BTreeMap<String, String>,
    #[serde(default)]
    pub trigger: TriggerInfo,
    #[serde(default)]
    pub levels: Vec<Level>,
}

impl Ambiance {
    pub fn new(
        plan_execution_id: impl Into<String>,
        plan_id: impl Into<String>,
        setup_abstractions: BTreeMap<String, String>,
        trigger: TriggerInfo,
    ) -> Self {
        Self {
            plan_execution_id: plan_execution_id.into(),
            plan_id: plan_id.into(),
            setup_abstractions,
            trigger,
            levels: Vec::new(),
        }
    }

    /// Returns a copy with `level` appended.
    pub fn clone_for_child(&self, level: Level) -> Self {
        let mut ambiance = self.clone();
        ambiance.levels.push(level);
        ambiance
    }

    /// Returns a copy without the innermost level.
    pub fn clone_for_finish(&self) -> Self {
        let mut ambiance = self.clone();
        ambiance.levels.pop();
        ambiance
    }

    /// Returns a copy with only the first `depth` levels.
    pub fn clone_to_depth(&self, depth: usize) -> Self {
        let mut ambiance = self.clone();
        ambiance.levels.truncate(depth);
        ambiance
    }

    /// Returns a copy whose innermost level points at a new attempt.
    pub fn clone_for_retry(&self, runtime_id: impl Into<String>) -> Self {
        let mut ambiance = self.clone();
        if let Some(level) = ambiance.levels.last_mut() {
            level.runtime_id = runtime_id.into();
            level.retry_index += 1;
            level.start_ts = Utc::now();
        }
        ambiance
    }

    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    pub fn current_runtime_id(&self) -> Option<&str> {
        self.current_level().map(|l| l.runtime_id.as_str())
    }

    pub fn current_setup_id(&self) -> Option<&str> {
        self.current_level().map(|l| l.setup_id.as_str())
    }

    pub fn parent_runtime_id(&self) -> Option<&str> {
        let len = self.levels.len();
        if len < 2 {
            return None;
        }
        Some(self.levels[len - 2].runtime_id.as_str())
    }

    pub fn step_identifier(&self) -> Option<&str> {
        self.current_level().map(|l| l.identifier.as_str())
    }

    pub fn current_step_type(&self) -> Option<&str> {
        self.current_level().map(|l| l.step_type.as_str())
    }

    pub fn current_group(&self) -> Option<NodeGroup> {
        self.current_level().and_then(|l| l.group)
    }

    pub fn retry_index(&self) -> u32 {
        self.current_level().map(|l| l.retry_index).unwrap_or(0)
    }

    /// Innermost level belonging to a stage, if any.
    pub fn stage_level(&self) -> Option<&Level> {
        self.levels
            .iter()
            .rev()
            .find(|l| l.group == Some(NodeGroup::Stage))
    }

    /// Number of levels; the root node sits at depth 1.
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// True if some level of this ambiance ran as `runtime_id`.
    pub fn contains_runtime_id(&self, runtime_id: &str) -> bool {
        self.levels.iter().any(|l| l.runtime_id == runtime_id)
    }

    /// Dotted path of identifiers, e.g. `pipeline.stages.build.execution.compile`.
    pub fn fqn(&self) -> String {
        self.levels
            .iter()
            .map(|l| l.identifier.as_str())
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn account_id(&self) -> Option<&str> {
        self.setup_abstractions.get(ACCOUNT_ID).map(String::as_str)
    }

    pub fn org_identifier(&self) -> Option<&str> {
        self.setup_abstractions.get(ORG_IDENTIFIER).map(String::as_str)
    }

    pub fn project_identifier(&self) -> Option<&str> {
        self.setup_abstractions
            .get(PROJECT_IDENTIFIER)
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(id: &str, group: Option<NodeGroup>) -> Level {
        Level {
            runtime_id: format!("rt-{}", id),
            setup_id: format!("setup-{}", id),
            identifier: id.to_string(),
            step_type: "Noop".to_string(),
            group,
            retry_index: 0,
            start_ts: Utc::now(),
        }
    }

    fn ambiance() -> Ambiance {
        let mut setup = BTreeMap::new();
        setup.insert(ACCOUNT_ID.to_string(), "acc".to_string());
        setup.insert(ORG_IDENTIFIER.to_string(), "org".to_string());
        setup.insert(PROJECT_IDENTIFIER.to_string(), "proj".to_string());

        Ambiance::new("pe1", "plan1", setup, TriggerInfo::default())
            .clone_for_child(level("pipeline", Some(NodeGroup::Pipeline)))
            .clone_for_child(level("stages", Some(NodeGroup::Stages)))
            .clone_for_child(level("build", Some(NodeGroup::Stage)))
            .clone_for_child(level("compile", Some(NodeGroup::Step)))
    }

    #[test]
    fn test_clone_for_child_does_not_touch_parent() {
        let parent = ambiance();
        let child = parent.clone_for_child(level("extra", None));

        assert_eq!(parent.depth(), 4);
        assert_eq!(child.depth(), 5);
        assert_eq!(child.plan_execution_id, "pe1");
        assert_eq!(child.parent_runtime_id(), Some("rt-compile"));
    }

    #[test]
    fn test_clone_for_finish() {
        let finished = ambiance().clone_for_finish();
        assert_eq!(finished.depth(), 3);
        assert_eq!(finished.step_identifier(), Some("build"));
        assert_eq!(finished.plan_id, "plan1");
    }

    #[test]
    fn test_clone_to_depth() {
        let amb = ambiance();
        assert_eq!(amb.clone_to_depth(0).depth(), 0);
        assert_eq!(amb.clone_to_depth(2).depth(), 2);
        assert_eq!(amb.clone_to_depth(10).depth(), 4);
    }

    #[test]
    fn test_clone_for_retry_bumps_index() {
        let amb = ambiance();
        let retried = amb.clone_for_retry("rt-compile-2");

        assert_eq!(retried.current_runtime_id(), Some("rt-compile-2"));
        assert_eq!(retried.retry_index(), 1);
        assert_eq!(amb.retry_index(), 0);
        assert_eq!(retried.depth(), amb.depth());
    }

    #[test]
    fn test_property_getters() {
        let amb = ambiance();
        assert_eq!(amb.account_id(), Some("acc"));
        assert_eq!(amb.org_identifier(), Some("org"));
        assert_eq!(amb.project_identifier(), Some("proj"));
        assert_eq!(amb.current_runtime_id(), Some("rt-compile"));
        assert_eq!(amb.current_setup_id(), Some("setup-compile"));
        assert_eq!(amb.step_identifier(), Some("compile"));
        assert_eq!(amb.current_step_type(), Some("Noop"));
        assert_eq!(amb.current_group(), Some(NodeGroup::Step));
        assert_eq!(amb.fqn(), "pipeline.stages.build.compile");
    }

    #[test]
    fn test_empty_ambiance_getters() {
        let amb = Ambiance::new("pe", "plan", BTreeMap::new(), TriggerInfo::default());
        assert!(amb.current_runtime_id().is_none());
        assert!(amb.current_setup_id().is_none());
        assert!(amb.step_identifier().is_none());
        assert!(amb.current_group().is_none());
        assert!(amb.parent_runtime_id().is_none());
        assert!(amb.stage_level().is_none());
        assert_eq!(amb.retry_index(), 0);
    }

    #[test]
    fn test_stage_level() {
        let amb = ambiance();
        let stage = amb.stage_level().unwrap();
        assert_eq!(stage.identifier, "build");
        assert!(amb.contains_runtime_id("rt-build"));
        assert!(!amb.contains_runtime_id("rt-other"));
    }
}
