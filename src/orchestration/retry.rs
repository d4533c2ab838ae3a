//! Plan Retry
//!
//! Runs a failed plan execution again from a chosen stage. Stages before
//! it are carried over instead of running: the new run records them as
//! SUCCEEDED, pointing at the attempt they came from, and copies their
//! pipeline-wide outputs so later expressions still resolve.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::Utc;
use log::{debug, info};

use super::engine::{new_id, plan_node, Engine};
use super::events::EventKind;
use crate::error::{OrchestrationError, Result};
use crate::execution::{
    ExecutionMode, NodeExecution, NodeExecutionQuery, PlanExecution, Status, SweepingOutput,
    Visibility,
};
use crate::plan::{NodeGroup, Plan};
use crate::step::StepOutcome;

fn rejected(reason: impl Into<String>) -> OrchestrationError {
    OrchestrationError::RetryRejected(reason.into())
}

fn identifier<'p>(plan: &'p Plan, node_id: &str) -> &'p str {
    plan.node(node_id).map_or("", |n| n.identifier.as_str())
}

/// Stage node ids in run order. Stages of one parallel block share a group.
fn stage_groups(plan: &Plan) -> Vec<Vec<String>> {
    let is_stage = |id: &str| {
        plan.node(id)
            .map_or(false, |n| n.group == Some(NodeGroup::Stage))
    };
    let Some(stages) = plan
        .nodes
        .values()
        .find(|n| n.group == Some(NodeGroup::Stages))
    else {
        return Vec::new();
    };

    stages
        .children
        .iter()
        .filter_map(|id| plan.node(id))
        .map(|entry| match entry.group {
            Some(NodeGroup::Parallel) => entry
                .children
                .iter()
                .filter(|id| is_stage(id.as_str()))
                .cloned()
                .collect(),
            Some(NodeGroup::Stage) => vec![entry.uuid.clone()],
            _ => Vec::new(),
        })
        .filter(|group: &Vec<String>| !group.is_empty())
        .collect()
}

impl Engine {
    /// Starts a new run of a failed plan execution at `from_stage`.
    ///
    /// Every stage before the one named must have succeeded; those are
    /// carried over. The stage's parallel block runs again in full.
    pub fn retry_plan(&self, plan_execution_id: &str, from_stage: &str) -> Result<String> {
        self.retry_from(plan_execution_id, from_stage, false)
    }

    /// Like [`Engine::retry_plan`], but parallel siblings of `from_stage`
    /// that succeeded are carried over as well.
    pub fn retry_failed_stages(&self, plan_execution_id: &str, from_stage: &str) -> Result<String> {
        self.retry_from(plan_execution_id, from_stage, true)
    }

    fn retry_from(&self, source_id: &str, from_stage: &str, only_failed: bool) -> Result<String> {
        let source = self.store().plan_execution(source_id)?;
        if !source.is_terminal() {
            return Err(rejected(format!(
                "plan execution {} is still {}",
                source_id, source.status
            )));
        }
        if source.status.is_positive() {
            return Err(rejected(format!(
                "plan execution {} already {}",
                source_id, source.status
            )));
        }

        let plan = self.store().plan(&source.plan_id)?;
        let groups = stage_groups(&plan);
        let target = groups
            .iter()
            .position(|group| group.iter().any(|id| identifier(&plan, id) == from_stage))
            .ok_or_else(|| rejected(format!("no stage '{}' in plan '{}'", from_stage, plan.name)))?;

        let latest: HashMap<String, NodeExecution> = self
            .store()
            .find(&NodeExecutionQuery::for_plan(source_id).without_old_retries())
            .into_iter()
            .filter(|r| r.rollback_of.is_none())
            .map(|r| (r.node_id.clone(), r))
            .collect();
        let succeeded = |id: &str| latest.get(id).filter(|r| r.status.is_positive());

        let mut reused = BTreeMap::new();
        for (index, group) in groups.iter().enumerate().take(target + 1) {
            for node_id in group {
                let node_id = node_id.as_str();
                match succeeded(node_id) {
                    Some(record) if index < target => {
                        reused.insert(node_id.to_string(), record.uuid.clone());
                    }
                    Some(record) if only_failed && identifier(&plan, node_id) != from_stage => {
                        reused.insert(node_id.to_string(), record.uuid.clone());
                    }
                    None if index < target => {
                        return Err(rejected(format!(
                            "stage '{}' before '{}' did not succeed",
                            identifier(&plan, node_id),
                            from_stage
                        )));
                    }
                    _ => {}
                }
            }
        }

        let start = plan_node(&plan, &plan.start_node_id)?.clone();
        let execution = PlanExecution::new(
            new_id(),
            &plan.uuid,
            &source.name,
            source.setup.clone(),
            source.trigger.clone(),
        )
        .with_retry_of(source_id, reused);
        info!(
            "Retrying plan execution {} from stage '{}' ({} stage(s) carried over)",
            source_id,
            from_stage,
            execution.reused.len()
        );
        self.launch(execution, &start)
    }

    /// Finishes a carried-over stage from its source attempt.
    pub(super) fn reuse_node(&self, record: &NodeExecution, source_id: &str) -> Result<()> {
        let source = self.store().get(source_id)?;
        let running = self.update(&record.uuid, |mut r| {
            if r.status != Status::Queued {
                return None;
            }
            r.status = Status::Running;
            r.mode = Some(ExecutionMode::Sync);
            r.start_ts = Some(Utc::now());
            r.resolved_parameters = source.resolved_parameters.clone();
            r.reused_from = Some(source.uuid.clone());
            Some(r)
        })?;
        let Some(running) = running else {
            return Ok(());
        };
        self.emit_node(EventKind::NodeStart, &running);

        let copied = self.copy_outputs(&source, &running)?;
        debug!(
            "'{}' carried over from {} with {} output(s)",
            running.identifier, source.uuid, copied
        );

        let outcome = source
            .outcomes
            .iter()
            .cloned()
            .fold(StepOutcome::succeeded(), StepOutcome::with_outcome);
        self.conclude(&running.uuid, outcome)?;
        Ok(())
    }

    /// Copies the pipeline-wide outputs produced under `source` into the
    /// run of `target`.
    fn copy_outputs(&self, source: &NodeExecution, target: &NodeExecution) -> Result<usize> {
        let mut producers: HashSet<String> = self
            .store()
            .descendants(&source.uuid)
            .into_iter()
            .map(|r| r.uuid)
            .collect();
        producers.insert(source.uuid.clone());

        let mut copied = 0;
        for output in self.store().outputs(&source.plan_execution_id) {
            if output.visibility != Visibility::PipelineGlobal
                || !producers.contains(&output.producer_id)
            {
                continue;
            }
            let copy = SweepingOutput {
                uuid: new_id(),
                plan_execution_id: target.plan_execution_id.clone(),
                producer_id: target.uuid.clone(),
                created_at: Utc::now(),
                valid_until: None,
                ..output
            };
            if self.store().put_output(copy)? {
                copied += 1;
            }
        }
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambiance::TriggerInfo;
    use crate::plan::{FacilitationStrategy, PlanNode};

    fn group(id: &str, group: NodeGroup, strategy: FacilitationStrategy, children: &[&str]) -> PlanNode {
        let mut node = PlanNode::new(id, id, "Noop", strategy).with_group(group);
        node.children = children.iter().map(|c| c.to_string()).collect();
        node
    }

    fn stage(id: &str) -> PlanNode {
        group(id, NodeGroup::Stage, FacilitationStrategy::Sync, &[])
    }

    fn staged_plan() -> Plan {
        Plan::from_nodes(
            "staged",
            vec![
                group("pipeline", NodeGroup::Pipeline, FacilitationStrategy::Child, &["stages"]),
                group(
                    "stages",
                    NodeGroup::Stages,
                    FacilitationStrategy::ChildChain,
                    &["build", "par", "ship"],
                ),
                stage("build"),
                group("par", NodeGroup::Parallel, FacilitationStrategy::Children, &["qa", "perf"]),
                stage("qa"),
                stage("perf"),
                stage("ship"),
            ],
            "pipeline",
        )
    }

    fn engine() -> Engine {
        Engine::builder().build()
    }

    #[test]
    fn test_stage_groups_follow_run_order() {
        let groups = stage_groups(&staged_plan());
        assert_eq!(
            groups,
            vec![
                vec!["build".to_string()],
                vec!["qa".to_string(), "perf".to_string()],
                vec!["ship".to_string()],
            ]
        );
    }

    #[test]
    fn test_plan_without_stages_has_no_groups() {
        let plan = Plan::from_nodes(
            "flat",
            vec![PlanNode::new("only", "only", "Noop", FacilitationStrategy::Sync)],
            "only",
        );
        assert!(stage_groups(&plan).is_empty());
    }

    #[test]
    fn test_retry_of_running_plan_rejected() {
        let engine = engine();
        let plan = staged_plan();
        let plan_id = plan.uuid.clone();
        engine.store().save_plan(plan).unwrap();
        engine
            .store()
            .create_plan_execution(PlanExecution::new(
                "pe",
                &plan_id,
                "staged",
                BTreeMap::new(),
                TriggerInfo::default(),
            ))
            .unwrap();

        let err = engine.retry_plan("pe", "ship").unwrap_err();
        assert!(matches!(err, OrchestrationError::RetryRejected(_)), "{}", err);
    }
}
