//! Plan Creator
//!
//! Compiles a [`Definition`] into a [`Plan`]. Compilation is a depth-first
//! worklist over [`Dependency`] placeholders:
//! 1. The definition root becomes the first dependency
//! 2. The highest-priority [`NodeCreator`] that supports the dependency's
//!    field builds its node and returns dependencies for the children
//!    (child ids are assigned up front so parents can list them)
//! 3. Repeat until the worklist is empty, then validate the graph
//!
//! The first error stops compilation; no partial plan is returned.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, info};
use serde_json::Value;

use super::creators;
use super::definition::{Definition, DefinitionField};
use super::node::{Plan, PlanNode};
use super::strategy::{FailureAction, FailureStrategyConfig, FailureStrategyRule};
use crate::error::CompileError;
use crate::step::StepRegistry;

/// Context a parent hands down to the nodes created below it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InheritedContext {
    /// Failure rules of all enclosing elements, innermost first.
    pub failure_rules: Vec<FailureStrategyRule>,
    /// Rollback section of the enclosing stage.
    pub rollback_node_id: Option<String>,
}

impl InheritedContext {
    /// Context for children of an element declaring `own` rules.
    pub fn with_rules(&self, own: Vec<FailureStrategyRule>) -> Self {
        let mut failure_rules = own;
        failure_rules.extend(self.failure_rules.iter().cloned());
        Self {
            failure_rules,
            rollback_node_id: self.rollback_node_id.clone(),
        }
    }

    pub fn with_rollback(mut self, rollback_node_id: Option<String>) -> Self {
        self.rollback_node_id = rollback_node_id;
        self
    }
}

/// A definition field waiting to become the node `node_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Dependency {
    pub node_id: String,
    pub field: DefinitionField,
    pub inherited: InheritedContext,
}

impl Dependency {
    pub fn new(field: DefinitionField, inherited: InheritedContext) -> Self {
        Self {
            node_id: new_node_id(),
            field,
            inherited,
        }
    }
}

/// What a creator produced for one dependency.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreationResponse {
    pub nodes: Vec<PlanNode>,
    pub dependencies: Vec<Dependency>,
}

impl CreationResponse {
    pub fn node(node: PlanNode) -> Self {
        Self {
            nodes: vec![node],
            dependencies: Vec::new(),
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<Dependency>) -> Self {
        self.dependencies.extend(dependencies);
        self
    }
}

/// Shared services available to creators.
#[derive(Debug, Clone, Copy)]
pub struct CreationContext<'a> {
    pub steps: &'a StepRegistry,
}

/// Builds plan nodes for one kind of definition field.
pub trait NodeCreator: Send + Sync {
    fn name(&self) -> &str;

    /// Higher priorities are asked first.
    fn priority(&self) -> i32 {
        0
    }

    fn supports(&self, field: &DefinitionField) -> bool;

    fn create(
        &self,
        ctx: &CreationContext<'_>,
        dependency: Dependency,
    ) -> Result<CreationResponse, CompileError>;
}

/// Registry of node creators plus the step catalog they consult.
#[derive(Clone)]
pub struct PlanCreator {
    creators: Vec<Arc<dyn NodeCreator>>,
    steps: StepRegistry,
}

impl PlanCreator {
    /// A creator with no handlers registered.
    pub fn new(steps: StepRegistry) -> Self {
        Self {
            creators: Vec::new(),
            steps,
        }
    }

    /// A creator with the pipeline / stage / step handlers.
    pub fn standard(steps: StepRegistry) -> Self {
        creators::standard()
            .into_iter()
            .fold(Self::new(steps), |creator, handler| creator.with_arc(handler))
    }

    pub fn with_creator(self, creator: impl NodeCreator + 'static) -> Self {
        self.with_arc(Arc::new(creator))
    }

    /// Registers a handler. Equal priorities keep registration order.
    pub fn with_arc(mut self, creator: Arc<dyn NodeCreator>) -> Self {
        self.creators.push(creator);
        self.creators.sort_by_key(|c| std::cmp::Reverse(c.priority()));
        self
    }

    /// Handler names in the order they are asked.
    pub fn creator_names(&self) -> Vec<&str> {
        self.creators.iter().map(|c| c.name()).collect()
    }

    fn creator_for(&self, field: &DefinitionField) -> Result<&Arc<dyn NodeCreator>, CompileError> {
        self.creators
            .iter()
            .find(|c| c.supports(field))
            .ok_or_else(|| CompileError::NoCreator {
                path: field.path.clone(),
                field: field.name.clone(),
            })
    }

    /// Compiles `definition` into a validated plan.
    pub fn compile(&self, definition: &Definition) -> Result<Plan, CompileError> {
        info!("Compiling plan '{}'", definition.name());

        let ctx = CreationContext { steps: &self.steps };
        let root = Dependency::new(definition.root.clone(), InheritedContext::default());
        let start_node_id = root.node_id.clone();

        let mut nodes: HashMap<String, PlanNode> = HashMap::new();
        let mut worklist = vec![root];

        while let Some(dependency) = worklist.pop() {
            let creator = self.creator_for(&dependency.field)?;
            debug!(
                "'{}' handles '{}' at {}",
                creator.name(),
                dependency.field.name,
                dependency.field.path
            );

            let response = creator.create(&ctx, dependency)?;

            for node in response.nodes {
                if nodes.contains_key(&node.uuid) {
                    return Err(CompileError::InvalidPlan(format!(
                        "node id '{}' created twice",
                        node.uuid
                    )));
                }
                nodes.insert(node.uuid.clone(), node);
            }
            worklist.extend(response.dependencies.into_iter().rev());
        }

        let plan = Plan::new(definition.name(), nodes, start_node_id);
        plan.validate()?;

        info!("Compiled plan '{}' with {} nodes", plan.name, plan.len());
        Ok(plan)
    }
}

pub(crate) fn new_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Parses the optional `failureStrategies` list of an element.
pub(crate) fn parse_failure_strategies(
    field: &DefinitionField,
) -> Result<Vec<FailureStrategyRule>, CompileError> {
    let Some(strategies) = field.child("failureStrategies") else {
        return Ok(Vec::new());
    };

    let configs: Vec<FailureStrategyConfig> = serde_json::from_value(strategies.value.clone())
        .map_err(|e| CompileError::InvalidField {
            path: field.path.clone(),
            field: "failureStrategies".to_string(),
            reason: e.to_string(),
        })?;

    Ok(configs.into_iter().map(FailureStrategyRule::from).collect())
}

/// Points every stage-rollback action at the enclosing rollback section.
pub(crate) fn resolve_rollback_targets(
    rules: Vec<FailureStrategyRule>,
    rollback_node_id: Option<&str>,
    path: &str,
) -> Result<Vec<FailureStrategyRule>, CompileError> {
    rules
        .into_iter()
        .map(|rule| {
            Ok(FailureStrategyRule {
                action: resolve_action(rule.action, rollback_node_id, path)?,
                errors: rule.errors,
            })
        })
        .collect()
}

fn resolve_action(
    action: FailureAction,
    rollback_node_id: Option<&str>,
    path: &str,
) -> Result<FailureAction, CompileError> {
    Ok(match action {
        FailureAction::StageRollback {
            rollback_node_id: None,
        } => {
            let target = rollback_node_id.ok_or_else(|| CompileError::RollbackNotDefined {
                path: path.to_string(),
            })?;
            FailureAction::StageRollback {
                rollback_node_id: Some(target.to_string()),
            }
        }
        FailureAction::Retry {
            retry_count,
            retry_intervals_secs,
            on_retry_failure,
        } => FailureAction::Retry {
            retry_count,
            retry_intervals_secs,
            on_retry_failure: Box::new(resolve_action(*on_retry_failure, rollback_node_id, path)?),
        },
        FailureAction::ManualIntervention {
            timeout_secs,
            on_timeout,
        } => FailureAction::ManualIntervention {
            timeout_secs,
            on_timeout: Box::new(resolve_action(*on_timeout, rollback_node_id, path)?),
        },
        other => other,
    })
}

/// Rejects sibling elements sharing an identifier.
pub(crate) fn check_unique_identifiers(
    parent: &DefinitionField,
    elements: &[DefinitionField],
) -> Result<(), CompileError> {
    let mut seen = HashSet::new();
    for element in elements {
        if let Some(identifier) = element.identifier() {
            if !seen.insert(identifier) {
                return Err(CompileError::DuplicateIdentifier {
                    path: parent.path.clone(),
                    identifier: identifier.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Reads the optional `timeout` of an element.
pub(crate) fn parse_timeout(field: &DefinitionField) -> Result<Option<u64>, CompileError> {
    match field.value.get("timeout") {
        None | Some(Value::Null) => Ok(None),
        Some(value) => super::definition::parse_timeout_secs(value)
            .map(Some)
            .ok_or_else(|| CompileError::InvalidField {
                path: field.path.clone(),
                field: "timeout".to_string(),
                reason: format!("cannot parse {} as a duration", value),
            }),
    }
}
