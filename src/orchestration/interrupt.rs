//! Interrupts
//!
//! External control signals addressed to a plan execution or one of its
//! node executions. Registration persists the interrupt and queues it;
//! a worker claims and applies it later:
//! - ABORT: stop the whole plan execution
//! - PAUSE / RESUME: hold and release queued nodes
//! - EXPIRE: time out a waiting node
//! - RETRY / MARK_SUCCESS / IGNORE: resolve a manual intervention
//!
//! An interrupt that finds nothing to act on is recorded as discarded.

use std::cmp::Reverse;

use chrono::Utc;
use log::{debug, info, warn};

use super::adviser::timeout_response;
use super::engine::{new_id, Engine};
use super::events::EventKind;
use super::queue::Message;
use crate::error::{OrchestrationError, Result};
use crate::execution::{
    update_plan_execution_with, AdviserResponse, Interrupt, InterruptState, InterruptType,
    NodeExecutionQuery, Status,
};
use crate::plan::FailureType;
use crate::step::StepOutcome;

/// Abort re-scans for records created while a pass was running.
const ABORT_PASSES: usize = 3;

/// What a caller asks for.
#[derive(Debug, Clone, PartialEq)]
pub struct InterruptRequest {
    pub kind: InterruptType,
    pub plan_execution_id: String,
    pub node_execution_id: Option<String>,
}

impl InterruptRequest {
    pub fn plan(kind: InterruptType, plan_execution_id: impl Into<String>) -> Self {
        Self {
            kind,
            plan_execution_id: plan_execution_id.into(),
            node_execution_id: None,
        }
    }

    pub fn node(
        kind: InterruptType,
        plan_execution_id: impl Into<String>,
        node_execution_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            plan_execution_id: plan_execution_id.into(),
            node_execution_id: Some(node_execution_id.into()),
        }
    }
}

fn rejected(reason: String) -> OrchestrationError {
    OrchestrationError::InterruptRejected(reason)
}

impl Engine {
    /// Registers an interrupt and queues it. Returns the interrupt id.
    ///
    /// Repeating the latest interrupt for the same target while it is
    /// pending (or, for plan-level kinds, after it was applied) returns the
    /// existing interrupt instead of creating a new one.
    pub fn register_interrupt(&self, request: InterruptRequest) -> Result<String> {
        self.register(request).map(|(id, _)| id)
    }

    /// Like [`Engine::register_interrupt`], also telling whether a new
    /// interrupt was created.
    pub(super) fn register(&self, request: InterruptRequest) -> Result<(String, bool)> {
        let InterruptRequest {
            kind,
            plan_execution_id,
            node_execution_id,
        } = request;

        let execution = self.store().plan_execution(&plan_execution_id)?;
        if execution.is_terminal() {
            return Err(rejected(format!(
                "plan execution {} is already {}",
                plan_execution_id, execution.status
            )));
        }

        match (kind.targets_node(), &node_execution_id) {
            (true, None) => {
                return Err(rejected(format!("{} needs a node execution", kind)));
            }
            (false, Some(_)) => {
                return Err(rejected(format!(
                    "{} applies to a whole plan execution",
                    kind
                )));
            }
            (true, Some(node_id)) => {
                let record = self.store().get(node_id)?;
                if record.plan_execution_id != plan_execution_id {
                    return Err(rejected(format!(
                        "node execution {} is not part of plan execution {}",
                        node_id, plan_execution_id
                    )));
                }
            }
            (false, None) => {}
        }

        if let Some(latest) = self
            .store()
            .latest_interrupt(&plan_execution_id, node_execution_id.as_deref())
        {
            let pending = matches!(
                latest.state,
                InterruptState::Registered | InterruptState::Processing
            );
            let applied_to_plan = !kind.targets_node() && latest.state == InterruptState::Processed;
            if latest.kind == kind && (pending || applied_to_plan) {
                debug!("{} already registered as {}", kind, latest.uuid);
                return Ok((latest.uuid, false));
            }
        }

        let interrupt = Interrupt::new(kind, &plan_execution_id, node_execution_id);
        let id = interrupt.uuid.clone();
        info!(
            "Registered {} interrupt {} for plan execution {}",
            kind, id, plan_execution_id
        );
        self.store().save_interrupt(interrupt)?;
        self.publish(Message::ProcessInterrupt {
            interrupt_id: id.clone(),
        });
        Ok((id, true))
    }

    pub(super) fn process_interrupt(&self, id: &str) -> Result<()> {
        let Some(interrupt) = self.store().claim_interrupt(id)? else {
            debug!("Interrupt {} already claimed", id);
            return Ok(());
        };

        let applied = match self.apply_interrupt(&interrupt) {
            Ok(applied) => applied,
            Err(e) => {
                // Back to REGISTERED so the redelivery applies it again.
                self.store().release_interrupt(id)?;
                return Err(e);
            }
        };
        let state = if applied {
            InterruptState::Processed
        } else {
            InterruptState::Discarded
        };
        self.store().finish_interrupt(id, state)?;

        if applied {
            info!("{} interrupt {} processed", interrupt.kind, id);
        } else {
            info!(
                "{} interrupt {} discarded: nothing to act on",
                interrupt.kind, id
            );
        }
        Ok(())
    }

    fn apply_interrupt(&self, interrupt: &Interrupt) -> Result<bool> {
        let plan_execution_id = interrupt.plan_execution_id.as_str();
        let node_execution_id = interrupt.node_execution_id.as_deref();

        match (interrupt.kind, node_execution_id) {
            (InterruptType::Abort, _) => self.abort_plan(plan_execution_id),
            (InterruptType::Pause, _) => self.pause_plan(plan_execution_id),
            (InterruptType::Resume, _) => self.resume_plan(plan_execution_id),
            (InterruptType::Expire, Some(node_id)) => self.expire_node(node_id),
            (kind, Some(node_id)) => self.intervene(kind, node_id),
            (kind, None) => Err(rejected(format!("{} needs a node execution", kind))),
        }
    }

    fn abort_plan(&self, plan_execution_id: &str) -> Result<bool> {
        let aborted = update_plan_execution_with(
            self.store().as_ref(),
            plan_execution_id,
            self.config().max_conflict_retries,
            |mut execution| {
                if execution.is_terminal() {
                    return None;
                }
                execution.status = Status::Aborted;
                execution.end_ts = Some(Utc::now());
                Some(execution)
            },
        )?;
        let mut changed = aborted.is_some();
        let execution = match aborted {
            Some(execution) => {
                warn!("Aborting plan execution {}", plan_execution_id);
                execution
            }
            None => {
                // An earlier attempt may have aborted the plan but not its nodes.
                let current = self.store().plan_execution(plan_execution_id)?;
                if current.status != Status::Aborted {
                    return Ok(false);
                }
                current
            }
        };
        let active = NodeExecutionQuery::for_plan(plan_execution_id)
            .with_statuses(Status::non_terminal());
        for _ in 0..ABORT_PASSES {
            let mut records = self.store().find(&active);
            if records.is_empty() {
                break;
            }

            // Parents first, so nothing new starts underneath.
            records.sort_by_key(|r| r.depth());
            for record in &records {
                self.update(&record.uuid, |r| r.with_status(Status::Discontinuing))?;
            }

            records.sort_by_key(|r| Reverse(r.depth()));
            for record in &records {
                let saved = self.update(&record.uuid, |r| {
                    let mut r = r.with_status(Status::Aborted)?;
                    r.end_ts = Some(Utc::now());
                    r.deadline = None;
                    Some(r)
                })?;
                if let Some(saved) = saved {
                    self.emit_node(EventKind::NodeEnd, &saved);
                    changed = true;
                }
            }
        }

        if execution.valid_until.is_none() {
            self.finish_plan(&execution)?;
            changed = true;
        }
        Ok(changed)
    }

    fn pause_plan(&self, plan_execution_id: &str) -> Result<bool> {
        let paused = update_plan_execution_with(
            self.store().as_ref(),
            plan_execution_id,
            self.config().max_conflict_retries,
            |mut execution| {
                if execution.status != Status::Running {
                    return None;
                }
                execution.status = Status::Paused;
                Some(execution)
            },
        )?;
        if paused.is_none() {
            return Ok(false);
        }

        let queued = self.store().find(
            &NodeExecutionQuery::for_plan(plan_execution_id).with_statuses([Status::Queued]),
        );
        let mut held = 0;
        for record in queued {
            let saved = self.update(&record.uuid, |r| match r.status {
                Status::Queued => r.with_status(Status::Paused),
                _ => None,
            })?;
            if saved.is_some() {
                held += 1;
            }
        }
        info!(
            "Paused plan execution {} ({} queued node(s) held)",
            plan_execution_id, held
        );
        Ok(true)
    }

    fn resume_plan(&self, plan_execution_id: &str) -> Result<bool> {
        let resumed = update_plan_execution_with(
            self.store().as_ref(),
            plan_execution_id,
            self.config().max_conflict_retries,
            |mut execution| {
                if execution.status != Status::Paused {
                    return None;
                }
                execution.status = Status::Running;
                Some(execution)
            },
        )?;
        if resumed.is_none() {
            return Ok(false);
        }

        let paused = self.store().find(
            &NodeExecutionQuery::for_plan(plan_execution_id).with_statuses([Status::Paused]),
        );
        let mut released = 0;
        for record in paused {
            let saved = self.update(&record.uuid, |r| match r.status {
                Status::Paused => r.with_status(Status::Queued),
                _ => None,
            })?;
            if let Some(saved) = saved {
                self.publish(Message::StartNode {
                    node_execution_id: saved.uuid,
                });
                released += 1;
            }
        }
        info!(
            "Resumed plan execution {} ({} node(s) released)",
            plan_execution_id, released
        );
        Ok(true)
    }

    fn expire_node(&self, id: &str) -> Result<bool> {
        let record = self.store().get(id)?;
        match record.status {
            Status::AsyncWaiting | Status::TaskWaiting => {
                warn!("'{}' expired while {}", record.identifier, record.status);
                let message = match record.deadline {
                    Some(deadline) => format!("deadline {} passed", deadline.to_rfc3339()),
                    None => "expired".to_string(),
                };
                self.conclude(id, StepOutcome::expired(message))
            }
            Status::InterventionWaiting => {
                let Some(AdviserResponse::ManualIntervention { on_timeout, .. }) =
                    &record.adviser_response
                else {
                    return Ok(false);
                };
                warn!("Intervention on '{}' timed out", record.identifier);
                let response = timeout_response(on_timeout, record.retry_count());
                self.resolve_intervention(id, response)
            }
            _ => Ok(false),
        }
    }

    fn intervene(&self, kind: InterruptType, id: &str) -> Result<bool> {
        let response = match kind {
            InterruptType::Retry => AdviserResponse::Retry { delay_secs: 0 },
            InterruptType::MarkSuccess => AdviserResponse::MarkSuccess,
            InterruptType::Ignore => AdviserResponse::Ignore,
            other => return Err(rejected(format!("{} is not an intervention", other))),
        };
        self.resolve_intervention(id, response)
    }

    /// Finishes a node waiting for intervention with `response`.
    fn resolve_intervention(&self, id: &str, response: AdviserResponse) -> Result<bool> {
        let record = self.store().get(id)?;
        let plan = self.plan_for(&record)?;
        let chained = self.chain_successor(&record, &plan)?.is_some();
        let next_id = new_id();
        let now = Utc::now();

        let saved = self.update(id, |mut r| {
            if r.status != Status::InterventionWaiting {
                return None;
            }
            let timed_out = r
                .failure_info
                .as_ref()
                .map_or(false, |f| f.failure_types.contains(&FailureType::Timeout));
            let broken = if timed_out {
                Status::Expired
            } else {
                Status::Failed
            };
            r.status = response.final_status(broken);
            if chained && r.status.is_positive() {
                r.next_id = Some(next_id.clone());
            }
            r.adviser_response = Some(response.clone());
            r.deadline = None;
            r.end_ts = Some(now);
            Some(r)
        })?;
        let Some(saved) = saved else {
            return Ok(false);
        };

        info!(
            "Intervention on '{}' resolved as {}",
            saved.identifier, saved.status
        );
        self.emit_node(EventKind::NodeEnd, &saved);
        self.follow(&saved, &plan, response)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambiance::TriggerInfo;
    use crate::config::EngineConfig;
    use crate::error::StoreError;
    use crate::execution::{
        InMemoryStore, NodeExecution, NodeExecutionStore, PlanExecution, SweepingOutput,
    };
    use crate::plan::{AdviserObtainment, FacilitationStrategy, Plan, PlanNode};
    use chrono::DateTime;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Loses the race on the first `failures` attempts to abort `identifier`.
    struct ContendedStore {
        inner: InMemoryStore,
        identifier: &'static str,
        failures: AtomicU32,
    }

    impl NodeExecutionStore for ContendedStore {
        fn save_plan(&self, plan: Plan) -> std::result::Result<(), StoreError> {
            self.inner.save_plan(plan)
        }

        fn plan(&self, plan_id: &str) -> std::result::Result<Arc<Plan>, StoreError> {
            self.inner.plan(plan_id)
        }

        fn create_plan_execution(
            &self,
            execution: PlanExecution,
        ) -> std::result::Result<(), StoreError> {
            self.inner.create_plan_execution(execution)
        }

        fn plan_execution(&self, id: &str) -> std::result::Result<PlanExecution, StoreError> {
            self.inner.plan_execution(id)
        }

        fn update_plan_execution(
            &self,
            execution: &PlanExecution,
        ) -> std::result::Result<PlanExecution, StoreError> {
            self.inner.update_plan_execution(execution)
        }

        fn insert(&self, record: NodeExecution) -> std::result::Result<(), StoreError> {
            self.inner.insert(record)
        }

        fn get(&self, id: &str) -> std::result::Result<NodeExecution, StoreError> {
            self.inner.get(id)
        }

        fn update(&self, record: &NodeExecution) -> std::result::Result<NodeExecution, StoreError> {
            let contended = record.identifier == self.identifier
                && record.status == Status::Aborted
                && self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
            if contended {
                return Err(StoreError::VersionConflict {
                    id: record.uuid.clone(),
                    expected: record.version,
                    actual: record.version + 1,
                });
            }
            self.inner.update(record)
        }

        fn find(&self, query: &NodeExecutionQuery) -> Vec<NodeExecution> {
            self.inner.find(query)
        }

        fn find_by_correlation_id(&self, correlation_id: &str) -> Option<NodeExecution> {
            self.inner.find_by_correlation_id(correlation_id)
        }

        fn save_interrupt(&self, interrupt: Interrupt) -> std::result::Result<(), StoreError> {
            self.inner.save_interrupt(interrupt)
        }

        fn interrupt(&self, id: &str) -> std::result::Result<Interrupt, StoreError> {
            self.inner.interrupt(id)
        }

        fn interrupts(&self, plan_execution_id: &str) -> Vec<Interrupt> {
            self.inner.interrupts(plan_execution_id)
        }

        fn claim_interrupt(&self, id: &str) -> std::result::Result<Option<Interrupt>, StoreError> {
            self.inner.claim_interrupt(id)
        }

        fn finish_interrupt(
            &self,
            id: &str,
            state: InterruptState,
        ) -> std::result::Result<(), StoreError> {
            self.inner.finish_interrupt(id, state)
        }

        fn release_interrupt(&self, id: &str) -> std::result::Result<(), StoreError> {
            self.inner.release_interrupt(id)
        }

        fn put_output(&self, output: SweepingOutput) -> std::result::Result<bool, StoreError> {
            self.inner.put_output(output)
        }

        fn outputs(&self, plan_execution_id: &str) -> Vec<SweepingOutput> {
            self.inner.outputs(plan_execution_id)
        }

        fn set_valid_until(
            &self,
            plan_execution_id: &str,
            valid_until: DateTime<Utc>,
        ) -> std::result::Result<usize, StoreError> {
            self.inner.set_valid_until(plan_execution_id, valid_until)
        }

        fn purge_expired(&self, now: DateTime<Utc>) -> usize {
            self.inner.purge_expired(now)
        }
    }

    fn approval_plan() -> Plan {
        Plan::from_nodes(
            "gate",
            vec![
                PlanNode::new("root", "root", "CONTAINER", FacilitationStrategy::ChildChain)
                    .with_children(vec!["approve".into(), "after".into()])
                    .with_adviser(AdviserObtainment::NextStep),
                PlanNode::new("approve", "approve", "Approval", FacilitationStrategy::Async)
                    .with_adviser(AdviserObtainment::NextStep),
                PlanNode::new("after", "after", "Noop", FacilitationStrategy::Sync)
                    .with_adviser(AdviserObtainment::NextStep),
            ],
            "root",
        )
    }

    fn started() -> (Engine, String) {
        let engine = Engine::builder().build();
        let id = engine
            .start_plan(approval_plan(), BTreeMap::new(), TriggerInfo::default())
            .unwrap();
        engine.run_until_idle();
        (engine, id)
    }

    #[test]
    fn test_node_kind_requires_node() {
        let (engine, id) = started();
        let err = engine
            .register_interrupt(InterruptRequest::plan(InterruptType::Expire, &id))
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::InterruptRejected(_)));
    }

    #[test]
    fn test_abort_is_plan_level() {
        let (engine, id) = started();
        let waiting = engine
            .store()
            .find(&NodeExecutionQuery::for_plan(&id).with_statuses([Status::AsyncWaiting]))
            .remove(0);
        let err = engine
            .register_interrupt(InterruptRequest::node(InterruptType::Abort, &id, &waiting.uuid))
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::InterruptRejected(_)));
    }

    #[test]
    fn test_pending_repeat_is_noop() {
        let (engine, id) = started();
        let first = engine
            .register_interrupt(InterruptRequest::plan(InterruptType::Pause, &id))
            .unwrap();
        let second = engine
            .register_interrupt(InterruptRequest::plan(InterruptType::Pause, &id))
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(engine.store().interrupts(&id).len(), 1);
    }

    #[test]
    fn test_abort_stops_waiting_nodes() {
        let (engine, id) = started();
        engine
            .register_interrupt(InterruptRequest::plan(InterruptType::Abort, &id))
            .unwrap();
        engine.run_until_idle();

        assert_eq!(engine.plan_execution(&id).unwrap().status, Status::Aborted);
        let records = engine.store().find(&NodeExecutionQuery::for_plan(&id));
        assert!(records.iter().all(|r| r.status == Status::Aborted));
        assert_eq!(
            engine.store().interrupts(&id)[0].state,
            InterruptState::Processed
        );

        let err = engine
            .register_interrupt(InterruptRequest::plan(InterruptType::Pause, &id))
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::InterruptRejected(_)));
    }

    #[test]
    fn test_abort_mid_chain_never_creates_later_children() {
        let plan = Plan::from_nodes(
            "three",
            vec![
                PlanNode::new("root", "root", "CONTAINER", FacilitationStrategy::ChildChain)
                    .with_children(vec!["first".into(), "gate".into(), "last".into()])
                    .with_adviser(AdviserObtainment::NextStep),
                PlanNode::new("first", "first", "Noop", FacilitationStrategy::Sync)
                    .with_adviser(AdviserObtainment::NextStep),
                PlanNode::new("gate", "gate", "Approval", FacilitationStrategy::Async)
                    .with_adviser(AdviserObtainment::NextStep),
                PlanNode::new("last", "last", "Noop", FacilitationStrategy::Sync)
                    .with_adviser(AdviserObtainment::NextStep),
            ],
            "root",
        );
        let engine = Engine::builder().build();
        let id = engine
            .start_plan(plan, BTreeMap::new(), TriggerInfo::default())
            .unwrap();
        engine.run_until_idle();

        engine
            .register_interrupt(InterruptRequest::plan(InterruptType::Abort, &id))
            .unwrap();
        engine.run_until_idle();

        let statuses: BTreeMap<String, Status> = engine
            .store()
            .find(&NodeExecutionQuery::for_plan(&id))
            .into_iter()
            .map(|r| (r.identifier, r.status))
            .collect();
        assert_eq!(statuses["first"], Status::Succeeded);
        assert_eq!(statuses["gate"], Status::Aborted);
        assert_eq!(statuses["root"], Status::Aborted);
        assert!(!statuses.contains_key("last"));
        assert_eq!(engine.plan_execution(&id).unwrap().status, Status::Aborted);
    }

    #[test]
    fn test_abort_finishes_after_conflict() {
        let config = EngineConfig {
            max_conflict_retries: 2,
            ..EngineConfig::default()
        };
        let store = Arc::new(ContendedStore {
            inner: InMemoryStore::new(),
            identifier: "approve",
            failures: AtomicU32::new(config.max_conflict_retries),
        });
        let engine = Engine::builder().with_config(config).with_store(store).build();
        let id = engine
            .start_plan(approval_plan(), BTreeMap::new(), TriggerInfo::default())
            .unwrap();
        engine.run_until_idle();

        let interrupt_id = engine
            .register_interrupt(InterruptRequest::plan(InterruptType::Abort, &id))
            .unwrap();
        engine.run_until_idle();

        let execution = engine.plan_execution(&id).unwrap();
        assert_eq!(execution.status, Status::Aborted);
        assert!(execution.valid_until.is_some());
        let records = engine.store().find(&NodeExecutionQuery::for_plan(&id));
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.status == Status::Aborted));
        assert_eq!(
            engine.store().interrupt(&interrupt_id).unwrap().state,
            InterruptState::Processed
        );
    }

    #[test]
    fn test_expire_waiting_node() {
        let (engine, id) = started();
        let waiting = engine
            .store()
            .find(&NodeExecutionQuery::for_plan(&id).with_statuses([Status::AsyncWaiting]))
            .remove(0);

        engine
            .register_interrupt(InterruptRequest::node(InterruptType::Expire, &id, &waiting.uuid))
            .unwrap();
        engine.run_until_idle();

        let expired = engine.store().get(&waiting.uuid).unwrap();
        assert_eq!(expired.status, Status::Expired);
        assert_eq!(engine.plan_execution(&id).unwrap().status, Status::Expired);
    }

    #[test]
    fn test_intervention_on_running_node_is_discarded() {
        let (engine, id) = started();
        let waiting = engine
            .store()
            .find(&NodeExecutionQuery::for_plan(&id).with_statuses([Status::AsyncWaiting]))
            .remove(0);

        let interrupt_id = engine
            .register_interrupt(InterruptRequest::node(
                InterruptType::MarkSuccess,
                &id,
                &waiting.uuid,
            ))
            .unwrap();
        engine.run_until_idle();

        assert_eq!(
            engine.store().interrupt(&interrupt_id).unwrap().state,
            InterruptState::Discarded
        );
        assert_eq!(
            engine.store().get(&waiting.uuid).unwrap().status,
            Status::AsyncWaiting
        );
    }
}
