//! Node Execution Store
//!
//! The single source of truth for runtime state. Every status write is a
//! compare-and-swap on the record's `version`:
//! - a stale version fails with [`StoreError::VersionConflict`]
//! - a terminal record fails with [`StoreError::Immutable`]
//! - an edge the state machine forbids fails with
//!   [`StoreError::IllegalTransition`]
//!
//! Callers never re-apply a write blindly: [`update_with`] re-reads the
//! record and re-evaluates the caller's transition on every conflict.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde_json::{Map, Value};

use super::node_execution::NodeExecution;
use super::outcome::{SweepingOutput, Visibility};
use super::plan_execution::{Interrupt, InterruptState, PlanExecution};
use super::Status;
use crate::ambiance::Ambiance;
use crate::error::StoreError;
use crate::plan::Plan;

/// Filter for node execution lookups. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeExecutionQuery {
    pub plan_execution_id: Option<String>,
    pub node_id: Option<String>,
    pub parent_id: Option<String>,
    pub statuses: Vec<Status>,
    /// Drop attempts a later retry superseded.
    pub exclude_old_retries: bool,
}

impl NodeExecutionQuery {
    pub fn for_plan(plan_execution_id: impl Into<String>) -> Self {
        Self {
            plan_execution_id: Some(plan_execution_id.into()),
            ..Self::default()
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = Status>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    /// Keeps only the latest attempt of each retried node.
    pub fn without_old_retries(mut self) -> Self {
        self.exclude_old_retries = true;
        self
    }

    pub fn matches(&self, record: &NodeExecution) -> bool {
        self.plan_execution_id
            .as_ref()
            .map_or(true, |id| &record.plan_execution_id == id)
            && self.node_id.as_ref().map_or(true, |id| &record.node_id == id)
            && self
                .parent_id
                .as_ref()
                .map_or(true, |id| record.parent_id.as_ref() == Some(id))
            && (self.statuses.is_empty() || self.statuses.contains(&record.status))
    }
}

/// Field selection for query results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Projection {
    fields: Vec<String>,
}

impl Projection {
    /// Every field of the record.
    pub fn all() -> Self {
        Self { fields: Vec::new() }
    }

    pub fn fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Serializes `record`, keeping only the selected top-level fields.
    /// Unknown field names are ignored.
    pub fn apply(&self, record: &NodeExecution) -> Map<String, Value> {
        let object = match serde_json::to_value(record) {
            Ok(Value::Object(object)) => object,
            _ => return Map::new(),
        };

        if self.fields.is_empty() {
            return object;
        }

        object
            .into_iter()
            .filter(|(key, _)| self.fields.iter().any(|f| f == key))
            .collect()
    }
}

/// Persistence contract for plans, executions, interrupts and outputs.
pub trait NodeExecutionStore: Send + Sync {
    fn save_plan(&self, plan: Plan) -> Result<(), StoreError>;

    fn plan(&self, plan_id: &str) -> Result<Arc<Plan>, StoreError>;

    fn create_plan_execution(&self, execution: PlanExecution) -> Result<(), StoreError>;

    fn plan_execution(&self, id: &str) -> Result<PlanExecution, StoreError>;

    /// Compare-and-swap on the plan execution's version.
    fn update_plan_execution(&self, execution: &PlanExecution)
        -> Result<PlanExecution, StoreError>;

    /// Inserts a new record; fails with `AlreadyExists` on a duplicate id.
    fn insert(&self, record: NodeExecution) -> Result<(), StoreError>;

    fn get(&self, id: &str) -> Result<NodeExecution, StoreError>;

    /// Compare-and-swap on the record's version. Returns the stored copy.
    fn update(&self, record: &NodeExecution) -> Result<NodeExecution, StoreError>;

    fn find(&self, query: &NodeExecutionQuery) -> Vec<NodeExecution>;

    fn find_by_correlation_id(&self, correlation_id: &str) -> Option<NodeExecution>;

    fn save_interrupt(&self, interrupt: Interrupt) -> Result<(), StoreError>;

    fn interrupt(&self, id: &str) -> Result<Interrupt, StoreError>;

    /// Interrupts of a plan execution, oldest first.
    fn interrupts(&self, plan_execution_id: &str) -> Vec<Interrupt>;

    /// Moves an interrupt from `Registered` to `Processing`. Returns `None`
    /// if another consumer already claimed it.
    fn claim_interrupt(&self, id: &str) -> Result<Option<Interrupt>, StoreError>;

    fn finish_interrupt(&self, id: &str, state: InterruptState) -> Result<(), StoreError>;

    /// Hands a claimed interrupt back so the next delivery can claim it.
    fn release_interrupt(&self, id: &str) -> Result<(), StoreError>;

    /// Stores an output. Returns `false` if an output with the same name
    /// and scope already exists; the first writer wins.
    fn put_output(&self, output: SweepingOutput) -> Result<bool, StoreError>;

    fn outputs(&self, plan_execution_id: &str) -> Vec<SweepingOutput>;

    /// Stamps the retention deadline on everything owned by a plan execution.
    fn set_valid_until(
        &self,
        plan_execution_id: &str,
        valid_until: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    /// Removes plan executions whose retention deadline has passed, with
    /// their records, interrupts and outputs. Returns the number of plan
    /// executions removed.
    fn purge_expired(&self, now: DateTime<Utc>) -> usize;

    /// Runs `query` and projects each match.
    fn query(&self, query: &NodeExecutionQuery, projection: &Projection) -> Vec<Map<String, Value>> {
        self.find(query).iter().map(|r| projection.apply(r)).collect()
    }

    fn children(&self, parent_id: &str) -> Vec<NodeExecution> {
        self.find(&NodeExecutionQuery::default().with_parent(parent_id))
    }

    /// All records below `id`, breadth first.
    fn descendants(&self, id: &str) -> Vec<NodeExecution> {
        let mut result = Vec::new();
        let mut queue: VecDeque<String> = VecDeque::from([id.to_string()]);
        while let Some(parent) = queue.pop_front() {
            for child in self.children(&parent) {
                queue.push_back(child.uuid.clone());
                result.push(child);
            }
        }
        result
    }

    /// Most recent interrupt addressed to a plan or node.
    fn latest_interrupt(
        &self,
        plan_execution_id: &str,
        node_execution_id: Option<&str>,
    ) -> Option<Interrupt> {
        self.interrupts(plan_execution_id)
            .into_iter()
            .filter(|i| i.same_target(plan_execution_id, node_execution_id))
            .last()
    }

    /// The most specific output named `name` visible from `ambiance`.
    fn resolve_output(&self, name: &str, ambiance: &Ambiance) -> Option<SweepingOutput> {
        self.outputs(&ambiance.plan_execution_id)
            .into_iter()
            .filter(|o| o.name == name && o.is_visible_to(ambiance))
            .min_by_key(|o| match o.visibility {
                Visibility::StepLocal => 0,
                Visibility::StageLocal => 1,
                Visibility::PipelineGlobal => 2,
            })
    }
}

/// Re-reads `id` and applies `apply` until the write lands.
///
/// `apply` sees the freshest record each time and returns `None` to give
/// up, typically because another worker already moved the record on.
/// A terminal record is treated the same way. Returns the stored record
/// when the write succeeded.
pub fn update_with<F>(
    store: &dyn NodeExecutionStore,
    id: &str,
    max_attempts: u32,
    mut apply: F,
) -> Result<Option<NodeExecution>, StoreError>
where
    F: FnMut(NodeExecution) -> Option<NodeExecution>,
{
    let mut last_error = None;

    for attempt in 1..=max_attempts.max(1) {
        let current = store.get(id)?;
        if current.is_terminal() {
            debug!("Record {} is already {} - discarding write", id, current.status);
            return Ok(None);
        }

        let Some(next) = apply(current) else {
            return Ok(None);
        };

        match store.update(&next) {
            Ok(saved) => return Ok(Some(saved)),
            Err(StoreError::Immutable { .. }) => return Ok(None),
            Err(e) if e.is_conflict() => {
                debug!("Conflict writing {} (attempt {}): re-reading", id, attempt);
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    warn!("Giving up on {} after {} conflicting writes", id, max_attempts);
    Err(last_error.unwrap_or_else(|| StoreError::NotFound {
        kind: "node execution",
        id: id.to_string(),
    }))
}

/// [`update_with`] for plan executions.
pub fn update_plan_execution_with<F>(
    store: &dyn NodeExecutionStore,
    id: &str,
    max_attempts: u32,
    mut apply: F,
) -> Result<Option<PlanExecution>, StoreError>
where
    F: FnMut(PlanExecution) -> Option<PlanExecution>,
{
    let mut last_error = None;

    for _ in 0..max_attempts.max(1) {
        let current = store.plan_execution(id)?;
        let Some(next) = apply(current) else {
            return Ok(None);
        };

        match store.update_plan_execution(&next) {
            Ok(saved) => return Ok(Some(saved)),
            Err(e) if e.is_conflict() => last_error = Some(e),
            Err(e) => return Err(e),
        }
    }

    Err(last_error.unwrap_or_else(|| StoreError::NotFound {
        kind: "plan execution",
        id: id.to_string(),
    }))
}

#[derive(Default)]
struct StoreState {
    plans: HashMap<String, Arc<Plan>>,
    plan_executions: HashMap<String, PlanExecution>,
    nodes: HashMap<String, NodeExecution>,
    correlations: HashMap<String, String>,
    interrupts: HashMap<String, Interrupt>,
    outputs: Vec<SweepingOutput>,
}

/// Process-local store backed by a read-write lock.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of node execution records held.
    pub fn len(&self) -> usize {
        self.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NodeExecutionStore for InMemoryStore {
    fn save_plan(&self, plan: Plan) -> Result<(), StoreError> {
        self.write().plans.insert(plan.uuid.clone(), Arc::new(plan));
        Ok(())
    }

    fn plan(&self, plan_id: &str) -> Result<Arc<Plan>, StoreError> {
        self.read()
            .plans
            .get(plan_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "plan",
                id: plan_id.to_string(),
            })
    }

    fn create_plan_execution(&self, execution: PlanExecution) -> Result<(), StoreError> {
        let mut state = self.write();
        if state.plan_executions.contains_key(&execution.uuid) {
            return Err(StoreError::AlreadyExists {
                kind: "plan execution",
                id: execution.uuid,
            });
        }
        state.plan_executions.insert(execution.uuid.clone(), execution);
        Ok(())
    }

    fn plan_execution(&self, id: &str) -> Result<PlanExecution, StoreError> {
        self.read()
            .plan_executions
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "plan execution",
                id: id.to_string(),
            })
    }

    fn update_plan_execution(
        &self,
        execution: &PlanExecution,
    ) -> Result<PlanExecution, StoreError> {
        let mut state = self.write();
        let stored = state
            .plan_executions
            .get_mut(&execution.uuid)
            .ok_or_else(|| StoreError::NotFound {
                kind: "plan execution",
                id: execution.uuid.clone(),
            })?;

        if stored.version != execution.version {
            return Err(StoreError::VersionConflict {
                id: execution.uuid.clone(),
                expected: execution.version,
                actual: stored.version,
            });
        }
        if stored.status.is_terminal() && stored.status != execution.status {
            return Err(StoreError::Immutable {
                id: execution.uuid.clone(),
            });
        }

        let mut next = execution.clone();
        next.version += 1;
        *stored = next.clone();
        Ok(next)
    }

    fn insert(&self, record: NodeExecution) -> Result<(), StoreError> {
        let mut state = self.write();
        if state.nodes.contains_key(&record.uuid) {
            return Err(StoreError::AlreadyExists {
                kind: "node execution",
                id: record.uuid,
            });
        }
        if let Some(correlation_id) = &record.correlation_id {
            state
                .correlations
                .insert(correlation_id.clone(), record.uuid.clone());
        }
        state.nodes.insert(record.uuid.clone(), record);
        Ok(())
    }

    fn get(&self, id: &str) -> Result<NodeExecution, StoreError> {
        self.read()
            .nodes
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "node execution",
                id: id.to_string(),
            })
    }

    fn update(&self, record: &NodeExecution) -> Result<NodeExecution, StoreError> {
        let mut state = self.write();
        let stored = state
            .nodes
            .get_mut(&record.uuid)
            .ok_or_else(|| StoreError::NotFound {
                kind: "node execution",
                id: record.uuid.clone(),
            })?;

        if stored.version != record.version {
            return Err(StoreError::VersionConflict {
                id: record.uuid.clone(),
                expected: record.version,
                actual: stored.version,
            });
        }
        if stored.status.is_terminal() {
            return Err(StoreError::Immutable {
                id: record.uuid.clone(),
            });
        }
        if stored.status != record.status && !stored.status.can_transition_to(record.status) {
            return Err(StoreError::IllegalTransition {
                id: record.uuid.clone(),
                from: stored.status.to_string(),
                to: record.status.to_string(),
            });
        }

        let mut next = record.clone();
        next.version += 1;
        *stored = next.clone();

        if let Some(correlation_id) = &next.correlation_id {
            state
                .correlations
                .insert(correlation_id.clone(), next.uuid.clone());
        }
        Ok(next)
    }

    fn find(&self, query: &NodeExecutionQuery) -> Vec<NodeExecution> {
        let state = self.read();
        let superseded: HashSet<&str> = if query.exclude_old_retries {
            state
                .nodes
                .values()
                .flat_map(|r| r.retry_ids.iter().map(String::as_str))
                .collect()
        } else {
            HashSet::new()
        };

        let mut records: Vec<NodeExecution> = state
            .nodes
            .values()
            .filter(|r| query.matches(r) && !superseded.contains(r.uuid.as_str()))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.uuid.cmp(&b.uuid)));
        records
    }

    fn find_by_correlation_id(&self, correlation_id: &str) -> Option<NodeExecution> {
        let state = self.read();
        state
            .correlations
            .get(correlation_id)
            .and_then(|id| state.nodes.get(id))
            .cloned()
    }

    fn save_interrupt(&self, interrupt: Interrupt) -> Result<(), StoreError> {
        let mut state = self.write();
        if state.interrupts.contains_key(&interrupt.uuid) {
            return Err(StoreError::AlreadyExists {
                kind: "interrupt",
                id: interrupt.uuid,
            });
        }
        state.interrupts.insert(interrupt.uuid.clone(), interrupt);
        Ok(())
    }

    fn interrupt(&self, id: &str) -> Result<Interrupt, StoreError> {
        self.read()
            .interrupts
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "interrupt",
                id: id.to_string(),
            })
    }

    fn interrupts(&self, plan_execution_id: &str) -> Vec<Interrupt> {
        let mut interrupts: Vec<Interrupt> = self
            .read()
            .interrupts
            .values()
            .filter(|i| i.plan_execution_id == plan_execution_id)
            .cloned()
            .collect();
        interrupts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        interrupts
    }

    fn claim_interrupt(&self, id: &str) -> Result<Option<Interrupt>, StoreError> {
        let mut state = self.write();
        let interrupt = state
            .interrupts
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "interrupt",
                id: id.to_string(),
            })?;

        if interrupt.state != InterruptState::Registered {
            return Ok(None);
        }
        interrupt.state = InterruptState::Processing;
        Ok(Some(interrupt.clone()))
    }

    fn finish_interrupt(&self, id: &str, finished: InterruptState) -> Result<(), StoreError> {
        let mut state = self.write();
        let interrupt = state
            .interrupts
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "interrupt",
                id: id.to_string(),
            })?;
        interrupt.state = finished;
        interrupt.processed_at = Some(Utc::now());
        Ok(())
    }

    fn release_interrupt(&self, id: &str) -> Result<(), StoreError> {
        let mut state = self.write();
        let interrupt = state
            .interrupts
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "interrupt",
                id: id.to_string(),
            })?;
        if interrupt.state == InterruptState::Processing {
            interrupt.state = InterruptState::Registered;
        }
        Ok(())
    }

    fn put_output(&self, output: SweepingOutput) -> Result<bool, StoreError> {
        let mut state = self.write();
        let duplicate = state.outputs.iter().any(|o| {
            o.plan_execution_id == output.plan_execution_id
                && o.name == output.name
                && o.scope_runtime_id == output.scope_runtime_id
        });

        if duplicate {
            warn!(
                "Output '{}' already published in this scope - keeping the first value",
                output.name
            );
            return Ok(false);
        }
        state.outputs.push(output);
        Ok(true)
    }

    fn outputs(&self, plan_execution_id: &str) -> Vec<SweepingOutput> {
        self.read()
            .outputs
            .iter()
            .filter(|o| o.plan_execution_id == plan_execution_id)
            .cloned()
            .collect()
    }

    fn set_valid_until(
        &self,
        plan_execution_id: &str,
        valid_until: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut state = self.write();
        let execution = state
            .plan_executions
            .get_mut(plan_execution_id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "plan execution",
                id: plan_execution_id.to_string(),
            })?;
        execution.valid_until = Some(valid_until);

        let mut stamped = 0;
        for record in state
            .nodes
            .values_mut()
            .filter(|r| r.plan_execution_id == plan_execution_id)
        {
            record.valid_until = Some(valid_until);
            stamped += 1;
        }
        for output in state
            .outputs
            .iter_mut()
            .filter(|o| o.plan_execution_id == plan_execution_id)
        {
            output.valid_until = Some(valid_until);
        }
        Ok(stamped)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.write();
        let expired: HashSet<String> = state
            .plan_executions
            .values()
            .filter(|e| e.valid_until.map_or(false, |until| until <= now))
            .map(|e| e.uuid.clone())
            .collect();

        if expired.is_empty() {
            return 0;
        }

        state.plan_executions.retain(|id, _| !expired.contains(id));
        state
            .nodes
            .retain(|_, r| !expired.contains(&r.plan_execution_id));
        state
            .interrupts
            .retain(|_, i| !expired.contains(&i.plan_execution_id));
        state
            .outputs
            .retain(|o| !expired.contains(&o.plan_execution_id));

        let StoreState {
            nodes,
            correlations,
            plans,
            plan_executions,
            ..
        } = &mut *state;
        correlations.retain(|_, id| nodes.contains_key(id));

        let live_plans: HashSet<&String> = plan_executions.values().map(|e| &e.plan_id).collect();
        plans.retain(|id, _| live_plans.contains(id));

        debug!("Purged {} expired plan execution(s)", expired.len());
        expired.len()
    }
}
