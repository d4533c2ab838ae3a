//! Plan Node Model
//!
//! The compiled, immutable graph of a pipeline. Nodes reference each other
//! by id only; the runtime resolves ids against the [`Plan`] when needed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::parameters::StepParameters;
use super::strategy::{AdviserObtainment, FailureAction};
use crate::error::CompileError;

/// How a node's work is carried out. Fixed at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FacilitationStrategy {
    /// Step logic runs inline on the current worker.
    Sync,
    /// Step logic starts inline, then waits for an external callback.
    Async,
    /// Work is shipped to a remote executor through the dispatcher.
    Task,
    /// Exactly one child node runs; its result becomes this node's result.
    Child,
    /// All children run in parallel.
    Children,
    /// Children run one after another.
    ChildChain,
}

impl FacilitationStrategy {
    pub fn spawns_children(&self) -> bool {
        matches!(self, Self::Child | Self::Children | Self::ChildChain)
    }
}

impl fmt::Display for FacilitationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sync => "SYNC",
            Self::Async => "ASYNC",
            Self::Task => "TASK",
            Self::Child => "CHILD",
            Self::Children => "CHILDREN",
            Self::ChildChain => "CHILD_CHAIN",
        };
        f.write_str(name)
    }
}

/// Structural role of a node, used for output scoping and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeGroup {
    Pipeline,
    Stages,
    Stage,
    Execution,
    StepGroup,
    Parallel,
    Step,
    Rollback,
}

/// A single node of a compiled plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    pub uuid: String,
    pub identifier: String,
    pub name: String,
    pub step_type: String,
    #[serde(default)]
    pub step_parameters: StepParameters,
    pub facilitation: FacilitationStrategy,
    #[serde(default)]
    pub group: Option<NodeGroup>,
    #[serde(default)]
    pub skip_expression_resolution: bool,
    #[serde(default)]
    pub advisers: Vec<AdviserObtainment>,
    /// Child node ids in sibling order.
    #[serde(default)]
    pub children: Vec<String>,
    /// Rollback section owned by this node (stages only).
    #[serde(default)]
    pub rollback_node_id: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl PlanNode {
    pub fn new(
        uuid: impl Into<String>,
        identifier: impl Into<String>,
        step_type: impl Into<String>,
        facilitation: FacilitationStrategy,
    ) -> Self {
        let identifier = identifier.into();
        Self {
            uuid: uuid.into(),
            name: identifier.clone(),
            identifier,
            step_type: step_type.into(),
            step_parameters: StepParameters::None,
            facilitation,
            group: None,
            skip_expression_resolution: false,
            advisers: Vec::new(),
            children: Vec::new(),
            rollback_node_id: None,
            timeout_secs: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_group(mut self, group: NodeGroup) -> Self {
        self.group = Some(group);
        self
    }

    pub fn with_parameters(mut self, parameters: StepParameters) -> Self {
        self.step_parameters = parameters;
        self
    }

    pub fn with_children(mut self, children: Vec<String>) -> Self {
        self.children = children;
        self
    }

    pub fn with_adviser(mut self, adviser: AdviserObtainment) -> Self {
        self.advisers.push(adviser);
        self
    }

    pub fn with_rollback(mut self, rollback_node_id: impl Into<String>) -> Self {
        self.rollback_node_id = Some(rollback_node_id.into());
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    pub fn skipping_expressions(mut self) -> Self {
        self.skip_expression_resolution = true;
        self
    }

    /// Every node id this node points at: children, its rollback section,
    /// and rollback targets named by its failure rules.
    pub fn referenced_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.children.iter().map(String::as_str).collect();
        if let Some(rollback) = &self.rollback_node_id {
            ids.push(rollback);
        }
        for adviser in &self.advisers {
            if let AdviserObtainment::FailureStrategy { rules } = adviser {
                for rule in rules {
                    collect_rollback_targets(&rule.action, &mut ids);
                }
            }
        }
        ids
    }
}

fn collect_rollback_targets<'a>(action: &'a FailureAction, ids: &mut Vec<&'a str>) {
    match action {
        FailureAction::StageRollback {
            rollback_node_id: Some(id),
        } => ids.push(id),
        FailureAction::Retry {
            on_retry_failure, ..
        } => collect_rollback_targets(on_retry_failure, ids),
        FailureAction::ManualIntervention { on_timeout, .. } => {
            collect_rollback_targets(on_timeout, ids)
        }
        _ => {}
    }
}

/// A compiled pipeline: node map plus the entry node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub uuid: String,
    pub name: String,
    pub nodes: HashMap<String, PlanNode>,
    pub start_node_id: String,
}

impl Plan {
    pub fn new(
        name: impl Into<String>,
        nodes: HashMap<String, PlanNode>,
        start_node_id: impl Into<String>,
    ) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            nodes,
            start_node_id: start_node_id.into(),
        }
    }

    /// Builds a plan from a node list; convenient for tests and embedders.
    pub fn from_nodes(
        name: impl Into<String>,
        nodes: Vec<PlanNode>,
        start_node_id: impl Into<String>,
    ) -> Self {
        let nodes = nodes.into_iter().map(|n| (n.uuid.clone(), n)).collect();
        Self::new(name, nodes, start_node_id)
    }

    pub fn node(&self, id: &str) -> Option<&PlanNode> {
        self.nodes.get(id)
    }

    pub fn start_node(&self) -> Option<&PlanNode> {
        self.nodes.get(&self.start_node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Finds a node by its human identifier. Identifiers are only unique
    /// among siblings, so the first match wins.
    pub fn find_by_identifier(&self, identifier: &str) -> Option<&PlanNode> {
        self.nodes.values().find(|n| n.identifier == identifier)
    }

    /// Checks the graph shape:
    /// 1. The start node exists
    /// 2. Every reference resolves
    /// 3. No node except the start lacks an incoming reference
    /// 4. Every node is reachable from the start
    pub fn validate(&self) -> Result<(), CompileError> {
        if !self.nodes.contains_key(&self.start_node_id) {
            return Err(CompileError::InvalidPlan(format!(
                "start node '{}' is not part of the plan",
                self.start_node_id
            )));
        }

        let mut referenced: HashSet<&str> = HashSet::new();
        for node in self.nodes.values() {
            for id in node.referenced_ids() {
                if !self.nodes.contains_key(id) {
                    return Err(CompileError::InvalidPlan(format!(
                        "node '{}' references unknown node '{}'",
                        node.identifier, id
                    )));
                }
                referenced.insert(id);
            }
        }

        if referenced.contains(self.start_node_id.as_str()) {
            return Err(CompileError::InvalidPlan(
                "start node is referenced by another node".to_string(),
            ));
        }

        let starts: Vec<&PlanNode> = self
            .nodes
            .values()
            .filter(|n| !referenced.contains(n.uuid.as_str()))
            .collect();
        if starts.len() != 1 {
            let names: Vec<&str> = starts.iter().map(|n| n.identifier.as_str()).collect();
            return Err(CompileError::InvalidPlan(format!(
                "expected exactly one start node, found {}: {:?}",
                starts.len(),
                names
            )));
        }

        let reachable = self.reachable_from_start();
        if reachable.len() != self.nodes.len() {
            return Err(CompileError::InvalidPlan(format!(
                "{} node(s) unreachable from the start node",
                self.nodes.len() - reachable.len()
            )));
        }

        Ok(())
    }

    fn reachable_from_start(&self) -> HashSet<&str> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(&self.start_node_id);

        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(id) {
                queue.extend(node.referenced_ids());
            }
        }
        seen
    }
}
