//! Built-in Node Creators
//!
//! One handler per definition element:
//! - `pipeline`: the root; runs its `stages` section (CHILD)
//! - `stages`: stages in order (CHILD_CHAIN)
//! - `parallel`: its elements side by side (CHILDREN)
//! - `stage`: its execution section (CHILD), owns `rollbackSteps`
//! - `execution` / `rollbackSteps`: steps in order (CHILD_CHAIN)
//! - `stepGroup`: nested steps in order (CHILD_CHAIN)
//! - `step`: a leaf whose facilitation comes from the step registry
//!
//! Failure strategies declared on any element flow down to the steps below
//! it and are compiled into each step's adviser list.

use std::sync::Arc;

use log::debug;
use serde_json::Value;

use super::creator::{
    check_unique_identifiers, parse_failure_strategies, parse_timeout, resolve_rollback_targets,
    CreationContext, CreationResponse, Dependency, InheritedContext, NodeCreator,
};
use super::definition::DefinitionField;
use super::node::{FacilitationStrategy, NodeGroup, PlanNode};
use super::strategy::AdviserObtainment;
use crate::error::CompileError;

/// The handlers registered by [`PlanCreator::standard`](super::PlanCreator::standard).
pub fn standard() -> Vec<Arc<dyn NodeCreator>> {
    vec![
        Arc::new(PipelineCreator),
        Arc::new(StagesCreator),
        Arc::new(ParallelCreator),
        Arc::new(StageCreator),
        Arc::new(ExecutionCreator),
        Arc::new(StepGroupCreator),
        Arc::new(StepCreator),
    ]
}

/// Builds a container node and one dependency per element of `elements`.
fn container(
    dependency: &Dependency,
    identifier: &str,
    step_type: &str,
    facilitation: FacilitationStrategy,
    group: NodeGroup,
    elements: Vec<DefinitionField>,
    inherited: &InheritedContext,
) -> (PlanNode, Vec<Dependency>) {
    let dependencies: Vec<Dependency> = elements
        .into_iter()
        .map(|element| Dependency::new(element, inherited.clone()))
        .collect();

    let mut node = PlanNode::new(&dependency.node_id, identifier, step_type, facilitation)
        .with_group(group)
        .with_children(dependencies.iter().map(|d| d.node_id.clone()).collect())
        .with_adviser(AdviserObtainment::NextStep);

    if let Some(name) = dependency.field.str_field("name") {
        node = node.with_name(name);
    }

    (node, dependencies)
}

/// Elements of a list field, with sibling identifiers checked.
fn sibling_elements(field: &DefinitionField) -> Result<Vec<DefinitionField>, CompileError> {
    let elements = field.elements()?;
    check_unique_identifiers(field, &elements)?;
    Ok(elements)
}

fn with_timeout(node: PlanNode, field: &DefinitionField) -> Result<PlanNode, CompileError> {
    Ok(match parse_timeout(field)? {
        Some(secs) => node.with_timeout_secs(secs),
        None => node,
    })
}

pub struct PipelineCreator;

impl NodeCreator for PipelineCreator {
    fn name(&self) -> &str {
        "pipeline"
    }

    fn supports(&self, field: &DefinitionField) -> bool {
        field.name == "pipeline"
    }

    fn create(
        &self,
        _ctx: &CreationContext<'_>,
        dependency: Dependency,
    ) -> Result<CreationResponse, CompileError> {
        let field = &dependency.field;
        let identifier = field.require_str("identifier")?;
        let stages = field.require_child("stages")?;
        let inherited = dependency
            .inherited
            .with_rules(parse_failure_strategies(field)?);

        let (node, children) = container(
            &dependency,
            identifier,
            "PIPELINE",
            FacilitationStrategy::Child,
            NodeGroup::Pipeline,
            vec![stages],
            &inherited,
        );
        let node = with_timeout(node, field)?;

        Ok(CreationResponse::node(node).with_dependencies(children))
    }
}

pub struct StagesCreator;

impl NodeCreator for StagesCreator {
    fn name(&self) -> &str {
        "stages"
    }

    fn supports(&self, field: &DefinitionField) -> bool {
        field.name == "stages"
    }

    fn create(
        &self,
        _ctx: &CreationContext<'_>,
        dependency: Dependency,
    ) -> Result<CreationResponse, CompileError> {
        let elements = sibling_elements(&dependency.field)?;
        let (node, children) = container(
            &dependency,
            "stages",
            "STAGES",
            FacilitationStrategy::ChildChain,
            NodeGroup::Stages,
            elements,
            &dependency.inherited,
        );
        Ok(CreationResponse::node(node).with_dependencies(children))
    }
}

pub struct ParallelCreator;

impl NodeCreator for ParallelCreator {
    fn name(&self) -> &str {
        "parallel"
    }

    fn supports(&self, field: &DefinitionField) -> bool {
        field.name == "parallel"
    }

    fn create(
        &self,
        _ctx: &CreationContext<'_>,
        dependency: Dependency,
    ) -> Result<CreationResponse, CompileError> {
        let elements = sibling_elements(&dependency.field)?;
        let (node, children) = container(
            &dependency,
            "parallel",
            "PARALLEL",
            FacilitationStrategy::Children,
            NodeGroup::Parallel,
            elements,
            &dependency.inherited,
        );
        Ok(CreationResponse::node(node).with_dependencies(children))
    }
}

pub struct StageCreator;

impl NodeCreator for StageCreator {
    fn name(&self) -> &str {
        "stage"
    }

    fn supports(&self, field: &DefinitionField) -> bool {
        field.name == "stage"
    }

    fn create(
        &self,
        _ctx: &CreationContext<'_>,
        dependency: Dependency,
    ) -> Result<CreationResponse, CompileError> {
        let field = &dependency.field;
        let identifier = field.require_str("identifier")?;
        let stage_type = field.str_field("type").unwrap_or("STAGE");
        let execution = field.require_child("spec")?.require_child("execution")?;

        let rollback = execution
            .child("rollbackSteps")
            .map(|steps| Dependency::new(steps, InheritedContext::default()));
        let rollback_node_id = rollback.as_ref().map(|d| d.node_id.clone());

        let inherited = dependency
            .inherited
            .with_rules(parse_failure_strategies(field)?)
            .with_rollback(rollback_node_id.clone());

        let (mut node, mut children) = container(
            &dependency,
            identifier,
            stage_type,
            FacilitationStrategy::Child,
            NodeGroup::Stage,
            vec![execution],
            &inherited,
        );
        node = with_timeout(node, field)?;

        if let Some(rollback) = rollback {
            debug!("Stage '{}' declares rollback steps", identifier);
            node = node.with_rollback(rollback.node_id.clone());
            children.push(rollback);
        }

        Ok(CreationResponse::node(node).with_dependencies(children))
    }
}

/// Handles both the `execution` block and a stage's `rollbackSteps` list.
pub struct ExecutionCreator;

impl NodeCreator for ExecutionCreator {
    fn name(&self) -> &str {
        "steps"
    }

    fn supports(&self, field: &DefinitionField) -> bool {
        field.name == "execution" || field.name == "rollbackSteps"
    }

    fn create(
        &self,
        _ctx: &CreationContext<'_>,
        dependency: Dependency,
    ) -> Result<CreationResponse, CompileError> {
        let field = &dependency.field;
        let (identifier, step_type, group, list) = if field.name == "rollbackSteps" {
            ("rollbackSteps", "ROLLBACK", NodeGroup::Rollback, field.clone())
        } else {
            (
                "execution",
                "EXECUTION",
                NodeGroup::Execution,
                field.require_child("steps")?,
            )
        };

        let elements = sibling_elements(&list)?;
        let (node, children) = container(
            &dependency,
            identifier,
            step_type,
            FacilitationStrategy::ChildChain,
            group,
            elements,
            &dependency.inherited,
        );
        Ok(CreationResponse::node(node).with_dependencies(children))
    }
}

pub struct StepGroupCreator;

impl NodeCreator for StepGroupCreator {
    fn name(&self) -> &str {
        "stepGroup"
    }

    fn supports(&self, field: &DefinitionField) -> bool {
        field.name == "stepGroup"
    }

    fn create(
        &self,
        _ctx: &CreationContext<'_>,
        dependency: Dependency,
    ) -> Result<CreationResponse, CompileError> {
        let field = &dependency.field;
        let identifier = field.require_str("identifier")?;
        let elements = sibling_elements(&field.require_child("steps")?)?;
        let inherited = dependency
            .inherited
            .with_rules(parse_failure_strategies(field)?);

        let (node, children) = container(
            &dependency,
            identifier,
            "STEP_GROUP",
            FacilitationStrategy::ChildChain,
            NodeGroup::StepGroup,
            elements,
            &inherited,
        );
        let node = with_timeout(node, field)?;

        Ok(CreationResponse::node(node).with_dependencies(children))
    }
}

pub struct StepCreator;

impl NodeCreator for StepCreator {
    fn name(&self) -> &str {
        "step"
    }

    fn supports(&self, field: &DefinitionField) -> bool {
        field.name == "step"
    }

    fn create(
        &self,
        ctx: &CreationContext<'_>,
        dependency: Dependency,
    ) -> Result<CreationResponse, CompileError> {
        let field = &dependency.field;
        let identifier = field.require_str("identifier")?;
        let step_type = field.require_str("type")?;

        let step = ctx
            .steps
            .get(step_type)
            .ok_or_else(|| CompileError::UnknownStepType {
                path: field.path.clone(),
                step_type: step_type.to_string(),
            })?;

        let spec = field.value.get("spec").cloned().unwrap_or(Value::Null);
        let parameters = step
            .parse_parameters(&spec)
            .map_err(|e| CompileError::InvalidField {
                path: field.path.clone(),
                field: "spec".to_string(),
                reason: e.to_string(),
            })?;

        let rules = dependency
            .inherited
            .with_rules(parse_failure_strategies(field)?)
            .failure_rules;
        let rules = resolve_rollback_targets(
            rules,
            dependency.inherited.rollback_node_id.as_deref(),
            &field.path,
        )?;

        let mut node = PlanNode::new(&dependency.node_id, identifier, step_type, step.facilitation())
            .with_group(NodeGroup::Step)
            .with_parameters(parameters);

        if let Some(name) = field.str_field("name") {
            node = node.with_name(name);
        }
        if field.bool_field("skipExpressionResolution") {
            node = node.skipping_expressions();
        }
        if !rules.is_empty() {
            node = node.with_adviser(AdviserObtainment::FailureStrategy { rules });
        }
        node = with_timeout(node.with_adviser(AdviserObtainment::NextStep), field)?;

        Ok(CreationResponse::node(node))
    }
}
