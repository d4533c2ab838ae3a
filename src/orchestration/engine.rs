//! Orchestration Engine
//!
//! Drives plan executions through the message queue. Workers poll the
//! queue and hand each delivery to [`Engine::handle`]:
//! 1. `StartNode`: facilitate a queued node and invoke its step
//! 2. `TaskResponse` / `AsyncResponse`: resume a waiting step
//! 3. `ChildCompleted`: advance a chain or finish a parent
//! 4. `ProcessInterrupt`: abort, pause, resume or resolve an intervention
//!
//! Handlers always re-read the store and write through compare-and-swap,
//! so duplicate and concurrent deliveries leave the same end state.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde_json::{Map, Value};

use super::adviser::{AdviserRegistry, AdvisingContext};
use super::events::{EventBus, EventKind, EventListener, OrchestrationEvent};
use super::facilitator::FacilitatorRegistry;
use super::queue::{Delivery, InMemoryQueue, Message, MessageQueue};
use crate::ambiance::{Ambiance, Level, TriggerInfo};
use crate::config::EngineConfig;
use crate::delegate::{
    CallbackChannel, DispatchOutcome, ExecutionPool, LocalExecutionPool, TaskDispatcher,
    TaskResult, TaskSpec,
};
use crate::error::{OrchestrationError, Result, StepError, StoreError};
use crate::execution::{
    update_plan_execution_with, update_with, AdviserResponse, ChildStatus, ExecutableResponse,
    ExecutionMode, FailureInfo, InMemoryStore, NodeExecution, NodeExecutionQuery,
    NodeExecutionStore, Outcome, PlanExecution, Projection, Status, SweepingOutput,
};
use crate::expression;
use crate::plan::{FailureType, Plan, PlanNode, StepParameters};
use crate::step::{ResumeInput, StepContext, StepOutcome, StepRegistry, StepResponse};

/// How long blocking loops wait on the queue before re-checking.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Wall-clock instant `wait` from now.
pub(crate) fn deadline_after(wait: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::days(365))
}

pub(super) fn plan_node<'p>(plan: &'p Plan, node_id: &str) -> Result<&'p PlanNode> {
    plan.node(node_id)
        .ok_or_else(|| OrchestrationError::UnknownPlanNode {
            plan_id: plan.uuid.clone(),
            node_id: node_id.to_string(),
        })
}

/// Plan node id of the sibling after `node_id` under `parent`.
fn next_sibling(parent: &PlanNode, node_id: &str) -> Option<String> {
    let position = parent.children.iter().position(|c| c == node_id)?;
    parent.children.get(position + 1).cloned()
}

pub(super) struct EngineInner {
    pub(super) config: EngineConfig,
    pub(super) store: Arc<dyn NodeExecutionStore>,
    pub(super) queue: Arc<dyn MessageQueue>,
    pub(super) steps: StepRegistry,
    pub(super) facilitators: FacilitatorRegistry,
    pub(super) advisers: AdviserRegistry,
    pub(super) dispatcher: TaskDispatcher,
    pub(super) events: EventBus,
}

/// Orchestration engine.
///
/// Cheap to clone; clones share the store, queue and registries, so one
/// clone per worker thread is the usual setup.
///
/// # Example
///
/// ```rust,no_run
/// use std::time::Duration;
/// use planrunner::{load_definition, Engine, PlanCreator};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let engine = Engine::builder().build();
///     let definition = load_definition("pipeline.yaml")?;
///     let plan = PlanCreator::standard(engine.steps().clone()).compile(&definition)?;
///
///     let id = engine.start_plan(plan, Default::default(), Default::default())?;
///     let execution = engine.run_until_complete(&id, Duration::from_secs(600))?;
///     println!("{}", execution.status);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Engine {
    pub(super) inner: Arc<EngineInner>,
}

/// Assembles an [`Engine`]. Anything not supplied gets the in-process
/// default.
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn NodeExecutionStore>>,
    queue: Option<Arc<dyn MessageQueue>>,
    pool: Option<Arc<dyn ExecutionPool>>,
    steps: StepRegistry,
    facilitators: Option<FacilitatorRegistry>,
    advisers: Option<AdviserRegistry>,
    listeners: Vec<Arc<dyn EventListener>>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            store: None,
            queue: None,
            pool: None,
            steps: StepRegistry::with_builtins(),
            facilitators: None,
            advisers: None,
            listeners: Vec::new(),
        }
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn NodeExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn MessageQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_execution_pool(mut self, pool: Arc<dyn ExecutionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_steps(mut self, steps: StepRegistry) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_facilitators(mut self, facilitators: FacilitatorRegistry) -> Self {
        self.facilitators = Some(facilitators);
        self
    }

    pub fn with_advisers(mut self, advisers: AdviserRegistry) -> Self {
        self.advisers = Some(advisers);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> Engine {
        let config = self.config;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()));
        let queue = self
            .queue
            .unwrap_or_else(|| Arc::new(InMemoryQueue::new(config.queue_visibility_timeout())));
        let pool = self.pool.unwrap_or_else(|| {
            Arc::new(LocalExecutionPool::new().with_max_parallel(config.workers))
        });

        let dispatcher = TaskDispatcher::new(
            pool,
            Arc::clone(&store),
            CallbackChannel::new(Arc::clone(&queue)),
            config.clone(),
        );

        let mut events = EventBus::new(config.event_delivery_attempts);
        for listener in self.listeners {
            events.subscribe(listener);
        }

        Engine {
            inner: Arc::new(EngineInner {
                facilitators: self
                    .facilitators
                    .unwrap_or_else(|| FacilitatorRegistry::standard(&config)),
                advisers: self.advisers.unwrap_or_else(AdviserRegistry::standard),
                steps: self.steps,
                config,
                store,
                queue,
                dispatcher,
                events,
            }),
        }
    }
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn NodeExecutionStore> {
        &self.inner.store
    }

    pub fn queue(&self) -> &Arc<dyn MessageQueue> {
        &self.inner.queue
    }

    pub fn steps(&self) -> &StepRegistry {
        &self.inner.steps
    }

    /// Starts a run of `plan` and returns the plan execution id.
    ///
    /// Only the root record is created here; everything else happens as
    /// workers consume the queue.
    pub fn start_plan(
        &self,
        plan: Plan,
        setup: BTreeMap<String, String>,
        trigger: TriggerInfo,
    ) -> Result<String> {
        plan.validate()?;
        let start = plan_node(&plan, &plan.start_node_id)?.clone();
        let execution = PlanExecution::new(new_id(), &plan.uuid, &plan.name, setup, trigger);

        self.store().save_plan(plan)?;
        self.launch(execution, &start)
    }

    /// Persists `execution` and queues its root node.
    pub(super) fn launch(&self, execution: PlanExecution, start: &PlanNode) -> Result<String> {
        let plan_execution_id = execution.uuid.clone();
        let ambiance = Ambiance::new(
            &plan_execution_id,
            &execution.plan_id,
            execution.setup.clone(),
            execution.trigger.clone(),
        );

        self.store().create_plan_execution(execution.clone())?;
        info!(
            "Starting plan execution {} ({})",
            plan_execution_id, execution.name
        );
        self.emit(&OrchestrationEvent::for_plan(EventKind::PlanStart, &execution));

        let root_id = new_id();
        let root = NodeExecution::new(
            &root_id,
            start,
            None,
            ambiance.clone_for_child(Level::for_node(start, &root_id, 0)),
        );
        self.insert_and_start(root)?;

        Ok(plan_execution_id)
    }

    pub fn plan_execution(&self, id: &str) -> Result<PlanExecution> {
        Ok(self.store().plan_execution(id)?)
    }

    /// Node executions matching `query`, projected to the chosen fields.
    pub fn query(
        &self,
        query: &NodeExecutionQuery,
        projection: &Projection,
    ) -> Vec<Map<String, Value>> {
        self.store().query(query, projection)
    }

    /// Hands an external answer to the async step waiting on
    /// `correlation_id`.
    pub fn async_response(&self, correlation_id: impl Into<String>, payload: Value) {
        self.publish(Message::AsyncResponse {
            correlation_id: correlation_id.into(),
            payload,
        });
    }

    /// Handles one message.
    pub fn handle(&self, message: &Message) -> Result<()> {
        match message {
            Message::StartNode { node_execution_id } => self.start_node(node_execution_id),
            Message::TaskResponse { task_id, result } => self.on_task_response(task_id, result),
            Message::AsyncResponse {
                correlation_id,
                payload,
            } => self.on_async_response(correlation_id, payload),
            Message::ChildCompleted { parent_id, .. } => self.on_child_completed(parent_id),
            Message::ProcessInterrupt { interrupt_id } => self.process_interrupt(interrupt_id),
        }
    }

    /// Handles a delivery and acknowledges it. Failed deliveries go back
    /// to the queue until they reach the configured delivery limit.
    pub fn process(&self, delivery: Delivery) {
        match self.handle(&delivery.message) {
            Ok(()) => self.inner.queue.ack(delivery.id),
            Err(e) if delivery.attempt >= self.inner.config.max_message_deliveries => {
                error!(
                    "Dropping {:?} after {} deliveries: {}",
                    delivery.message, delivery.attempt, e
                );
                self.inner.queue.ack(delivery.id);
            }
            Err(e) => {
                warn!(
                    "Delivery {} failed (attempt {}): {}",
                    delivery.id, delivery.attempt, e
                );
                self.inner.queue.nack(delivery.id);
            }
        }
    }

    /// Consumes messages until the queue has nothing ready, delayed or in
    /// flight. Work running inside an execution pool is not waited for.
    /// Returns the number of deliveries handled.
    pub fn run_until_idle(&self) -> usize {
        let mut handled = 0;
        loop {
            match self.inner.queue.poll(POLL_INTERVAL) {
                Some(delivery) => {
                    self.process(delivery);
                    handled += 1;
                }
                None if self.inner.queue.is_idle() => return handled,
                None => {}
            }
        }
    }

    /// Consumes messages until the plan execution is terminal or `timeout`
    /// passes, and returns its latest state either way.
    pub fn run_until_complete(
        &self,
        plan_execution_id: &str,
        timeout: Duration,
    ) -> Result<PlanExecution> {
        let deadline = Instant::now() + timeout;
        loop {
            let execution = self.plan_execution(plan_execution_id)?;
            if execution.is_terminal() {
                return Ok(execution);
            }
            if Instant::now() >= deadline {
                warn!(
                    "Plan execution {} still {} after {:?}",
                    plan_execution_id, execution.status, timeout
                );
                return Ok(execution);
            }
            if let Some(delivery) = self.inner.queue.poll(POLL_INTERVAL) {
                self.process(delivery);
            }
        }
    }

    /// Worker loop: consumes messages until `stop` is set.
    pub fn consume(&self, stop: &AtomicBool) -> usize {
        let mut handled = 0;
        while !stop.load(Ordering::SeqCst) {
            if let Some(delivery) = self.inner.queue.poll(POLL_INTERVAL) {
                self.process(delivery);
                handled += 1;
            }
        }
        handled
    }

    fn start_node(&self, id: &str) -> Result<()> {
        let record = self.store().get(id)?;
        let plan = self.plan_for(&record)?;
        let node = plan_node(&plan, &record.node_id)?;

        match record.status {
            Status::Queued => {}
            Status::Running if record.mode.map_or(false, |m| m.is_parent()) => {
                // Redelivered after the parent started.
                return self.spawn_children(&record, &plan);
            }
            status => {
                debug!("Node {} is {} - ignoring start", id, status);
                return Ok(());
            }
        }

        let execution = self.store().plan_execution(&record.plan_execution_id)?;
        match execution.status {
            Status::Running => {}
            Status::Paused => {
                let held = self.update(id, |r| match r.status {
                    Status::Queued => r.with_status(Status::Paused),
                    _ => None,
                })?;
                if held.is_some() {
                    info!("Node '{}' held: plan execution is paused", record.identifier);
                }
                return Ok(());
            }
            _ => {
                let aborted = self.update(id, |r| {
                    if r.status != Status::Queued {
                        return None;
                    }
                    let mut r = r.with_status(Status::Aborted)?;
                    r.end_ts = Some(Utc::now());
                    Some(r)
                })?;
                if let Some(aborted) = aborted {
                    self.emit_node(EventKind::NodeEnd, &aborted);
                }
                return Ok(());
            }
        }

        if let Some(source_id) = execution.reused.get(&record.node_id) {
            return self.reuse_node(&record, source_id);
        }

        let decision = self
            .inner
            .facilitators
            .get(node.facilitation)?
            .decide(node, &record.ambiance);
        let resolved = self.resolve_parameters(node, &record.ambiance);
        let parameters = resolved
            .as_ref()
            .cloned()
            .unwrap_or_else(|_| node.step_parameters.clone());
        let children: Vec<(String, String)> = decision
            .children
            .iter()
            .map(|node_id| (node_id.clone(), new_id()))
            .collect();
        let mode = decision.mode;

        let running = self.update(id, |mut r| {
            if r.status != Status::Queued {
                return None;
            }
            r.status = Status::Running;
            r.mode = Some(mode);
            r.start_ts = Some(Utc::now());
            r.resolved_parameters = Some(parameters.clone());
            if mode.is_parent() {
                r.executable_responses.push(ExecutableResponse::Children {
                    children: children.clone(),
                });
            } else if mode == ExecutionMode::Sync {
                r.executable_responses.push(ExecutableResponse::Sync);
            }
            Some(r)
        })?;
        let Some(running) = running else {
            return Ok(());
        };

        debug!("Started '{}' ({}) as {:?}", running.identifier, id, mode);
        self.emit_node(EventKind::NodeStart, &running);

        if let Err(e) = resolved {
            warn!("'{}': {}", running.identifier, e);
            self.conclude(id, StepOutcome::failed(e.into()))?;
            return Ok(());
        }
        if mode.is_parent() {
            return self.spawn_children(&running, &plan);
        }
        self.invoke_step(&running, node, &parameters, decision.wait_duration_hint)
    }

    fn resolve_parameters(
        &self,
        node: &PlanNode,
        ambiance: &Ambiance,
    ) -> std::result::Result<StepParameters, StepError> {
        if node.skip_expression_resolution {
            return Ok(node.step_parameters.clone());
        }
        let store = self.store();
        expression::resolve_parameters(&node.step_parameters, |name| {
            store.resolve_output(name, ambiance).map(|o| o.value)
        })
    }

    fn invoke_step(
        &self,
        running: &NodeExecution,
        node: &PlanNode,
        parameters: &StepParameters,
        wait: Option<Duration>,
    ) -> Result<()> {
        let step = match self.inner.steps.require(&node.step_type) {
            Ok(step) => step,
            Err(e) => {
                self.conclude(&running.uuid, StepOutcome::failed(e.into()))?;
                return Ok(());
            }
        };

        let ctx = StepContext {
            ambiance: &running.ambiance,
            node,
            parameters,
        };
        match step.invoke(&ctx) {
            Ok(StepResponse::Completed(outcome)) => {
                self.conclude(&running.uuid, outcome)?;
            }
            Ok(StepResponse::Async) => {
                let wait = wait.unwrap_or_else(|| self.config().async_timeout());
                self.await_async(running, wait)?;
            }
            Ok(StepResponse::Task(spec)) => self.dispatch_task(running, spec)?,
            Err(e) => {
                warn!("Step '{}' failed to start: {}", running.identifier, e);
                self.conclude(&running.uuid, StepOutcome::failed(e.into()))?;
            }
        }
        Ok(())
    }

    fn await_async(&self, running: &NodeExecution, wait: Duration) -> Result<()> {
        let correlation_id = new_id();
        let deadline = deadline_after(wait);

        let waiting = self.update(&running.uuid, |mut r| {
            if r.status != Status::Running {
                return None;
            }
            r.status = Status::AsyncWaiting;
            r.correlation_id = Some(correlation_id.clone());
            r.deadline = Some(deadline);
            r.executable_responses.push(ExecutableResponse::Async {
                correlation_id: correlation_id.clone(),
            });
            Some(r)
        })?;

        if let Some(waiting) = waiting {
            info!(
                "'{}' waiting for async response {}",
                waiting.identifier, correlation_id
            );
            self.emit_node(EventKind::NodeStatusUpdate, &waiting);
        }
        Ok(())
    }

    fn dispatch_task(&self, running: &NodeExecution, spec: TaskSpec) -> Result<()> {
        match self.inner.dispatcher.dispatch(&running.uuid, spec)? {
            DispatchOutcome::Submitted { .. } => {
                let waiting = self.store().get(&running.uuid)?;
                if waiting.status == Status::TaskWaiting {
                    self.emit_node(EventKind::NodeStatusUpdate, &waiting);
                }
            }
            DispatchOutcome::Completed { task_id, result } => {
                self.publish(Message::TaskResponse { task_id, result });
            }
            DispatchOutcome::Failed { failure, .. } => {
                self.conclude(&running.uuid, StepOutcome::failed(failure))?;
            }
            DispatchOutcome::Discarded => {}
        }
        Ok(())
    }

    /// Creates the children a running parent allocated when it started.
    fn spawn_children(&self, parent: &NodeExecution, plan: &Plan) -> Result<()> {
        let children = parent.initial_children();
        if children.is_empty() {
            debug!("'{}' has no children", parent.identifier);
            let outcome = StepOutcome::succeeded().with_outcome(Outcome::Aggregate {
                children: Vec::new(),
            });
            self.conclude(&parent.uuid, outcome)?;
            return Ok(());
        }

        for (node_id, execution_id) in children {
            let node = plan_node(plan, &node_id)?;
            let child = NodeExecution::new(
                &execution_id,
                node,
                Some(parent.uuid.clone()),
                parent
                    .ambiance
                    .clone_for_child(Level::for_node(node, &execution_id, 0)),
            );
            self.insert_and_start(child)?;
        }
        Ok(())
    }

    /// Inserts `record` and queues its start. An existing record is only
    /// re-queued while it is still queued.
    fn insert_and_start(&self, record: NodeExecution) -> Result<()> {
        let id = record.uuid.clone();
        match self.store().insert(record) {
            Ok(()) => {}
            Err(StoreError::AlreadyExists { .. }) => {
                if self.store().get(&id)?.status != Status::Queued {
                    return Ok(());
                }
            }
            Err(e) => return Err(e.into()),
        }
        self.publish(Message::StartNode {
            node_execution_id: id,
        });
        Ok(())
    }

    fn on_task_response(&self, task_id: &str, result: &TaskResult) -> Result<()> {
        let Some(record) = self.store().find_by_correlation_id(task_id) else {
            warn!("No node execution waits for task {}", task_id);
            return Ok(());
        };
        if record.status != Status::TaskWaiting || record.correlation_id.as_deref() != Some(task_id)
        {
            debug!(
                "Late response for task {}: '{}' is {}",
                task_id, record.identifier, record.status
            );
            return Ok(());
        }
        self.resume(&record, ResumeInput::Task(result))
    }

    fn on_async_response(&self, correlation_id: &str, payload: &Value) -> Result<()> {
        let Some(record) = self.store().find_by_correlation_id(correlation_id) else {
            warn!("No node execution waits for {}", correlation_id);
            return Ok(());
        };
        if record.status != Status::AsyncWaiting
            || record.correlation_id.as_deref() != Some(correlation_id)
        {
            debug!(
                "Late async response {}: '{}' is {}",
                correlation_id, record.identifier, record.status
            );
            return Ok(());
        }
        self.resume(&record, ResumeInput::Async(payload))
    }

    fn resume(&self, record: &NodeExecution, input: ResumeInput<'_>) -> Result<()> {
        let plan = self.plan_for(record)?;
        let node = plan_node(&plan, &record.node_id)?;
        let parameters = record
            .resolved_parameters
            .clone()
            .unwrap_or_else(|| node.step_parameters.clone());

        let ctx = StepContext {
            ambiance: &record.ambiance,
            node,
            parameters: &parameters,
        };
        let outcome = self
            .inner
            .steps
            .require(&node.step_type)
            .and_then(|step| step.resume(&ctx, input))
            .unwrap_or_else(|e| StepOutcome::failed(e.into()));

        self.conclude(&record.uuid, outcome)?;
        Ok(())
    }

    /// Writes a step's final status together with the adviser's decision,
    /// then acts on the decision. Returns `false` if the record had
    /// already moved on.
    pub(super) fn conclude(&self, id: &str, outcome: StepOutcome) -> Result<bool> {
        let outcome = if outcome.status.is_terminal() {
            outcome
        } else {
            StepOutcome::failed(FailureInfo::of(
                FailureType::Unknown,
                format!("step finished with non-final status {}", outcome.status),
            ))
        };

        let record = self.store().get(id)?;
        let plan = self.plan_for(&record)?;
        let node = plan_node(&plan, &record.node_id)?;
        let chained = self.chain_successor(&record, &plan)?.is_some();
        let next_id = new_id();
        let now = Utc::now();
        let mut decision = None;

        let saved = self.update(id, |current| {
            if !matches!(
                current.status,
                Status::Running | Status::AsyncWaiting | Status::TaskWaiting
            ) {
                return None;
            }

            let mut next = current;
            next.status = outcome.status;
            next.failure_info = outcome.failure.clone();
            next.outcomes.extend(outcome.outcomes.iter().cloned());

            let response = self.inner.advisers.advise(&AdvisingContext {
                record: &next,
                node,
            });
            next.status = response.final_status(outcome.status);

            if let AdviserResponse::ManualIntervention { timeout_secs, .. } = &response {
                let wait = timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| self.config().intervention_timeout());
                next.deadline = Some(deadline_after(wait));
            } else {
                next.deadline = None;
                next.end_ts = Some(now);
            }
            if chained && next.status.is_positive() {
                next.next_id = Some(next_id.clone());
            }

            next.adviser_response = Some(response.clone());
            decision = Some(response);
            Some(next)
        })?;

        let (Some(saved), Some(decision)) = (saved, decision) else {
            debug!("Node {} already moved on - dropping outcome", id);
            return Ok(false);
        };

        for output in outcome.outputs {
            self.store().put_output(SweepingOutput::new(
                output.name,
                output.value,
                output.visibility,
                &saved.ambiance,
            ))?;
        }

        match (&saved.failure_info, saved.status.is_positive()) {
            (Some(failure), false) => warn!("'{}' {}: {}", saved.identifier, saved.status, failure),
            _ => info!("'{}' {}", saved.identifier, saved.status),
        }
        let kind = if saved.is_terminal() {
            EventKind::NodeEnd
        } else {
            EventKind::NodeStatusUpdate
        };
        self.emit_node(kind, &saved);

        self.follow(&saved, &plan, decision)?;
        Ok(true)
    }

    /// Plan node id of the next chain sibling, if `record` sits in a chain.
    pub(super) fn chain_successor(
        &self,
        record: &NodeExecution,
        plan: &Plan,
    ) -> Result<Option<String>> {
        if record.rollback_of.is_some() {
            return Ok(None);
        }
        let Some(parent_id) = &record.parent_id else {
            return Ok(None);
        };
        let parent = self.store().get(parent_id)?;
        if parent.mode != Some(ExecutionMode::ChildChain) {
            return Ok(None);
        }
        Ok(next_sibling(plan_node(plan, &parent.node_id)?, &record.node_id))
    }

    /// Carries out an adviser decision for a freshly written record.
    pub(super) fn follow(
        &self,
        record: &NodeExecution,
        plan: &Plan,
        decision: AdviserResponse,
    ) -> Result<()> {
        match decision {
            AdviserResponse::Retry { delay_secs } => {
                let retry = record.next_attempt(new_id());
                info!(
                    "Retrying '{}' in {}s (attempt {})",
                    record.identifier,
                    delay_secs,
                    retry.retry_count() + 1
                );
                let retry_id = retry.uuid.clone();
                match self.store().insert(retry) {
                    Ok(()) | Err(StoreError::AlreadyExists { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
                self.inner.queue.publish_delayed(
                    Message::StartNode {
                        node_execution_id: retry_id,
                    },
                    Duration::from_secs(delay_secs),
                );
            }
            AdviserResponse::Rollback { rollback_node_id } => {
                self.start_rollback(record, plan, &rollback_node_id)?;
            }
            AdviserResponse::ManualIntervention { .. } => {
                info!("'{}' waiting for manual intervention", record.identifier);
            }
            _ => self.notify_parent(record)?,
        }
        Ok(())
    }

    fn start_rollback(
        &self,
        failed: &NodeExecution,
        plan: &Plan,
        rollback_node_id: &str,
    ) -> Result<()> {
        let node = plan_node(plan, rollback_node_id)?;
        let id = new_id();
        let ambiance = failed
            .ambiance
            .clone_for_finish()
            .clone_for_child(Level::for_node(node, &id, 0));
        let rollback = NodeExecution::new(&id, node, failed.parent_id.clone(), ambiance)
            .with_rollback_of(&failed.uuid);

        warn!(
            "'{}' failed - rolling back with '{}'",
            failed.identifier, node.identifier
        );
        self.insert_and_start(rollback)
    }

    fn notify_parent(&self, record: &NodeExecution) -> Result<()> {
        match &record.parent_id {
            Some(parent_id) => {
                self.publish(Message::ChildCompleted {
                    parent_id: parent_id.clone(),
                    child_id: record.uuid.clone(),
                });
                Ok(())
            }
            None => self.end_plan(record),
        }
    }

    fn on_child_completed(&self, parent_id: &str) -> Result<()> {
        let parent = self.store().get(parent_id)?;
        if parent.status != Status::Running {
            debug!("Parent {} is {} - nothing to do", parent_id, parent.status);
            return Ok(());
        }
        let plan = self.plan_for(&parent)?;
        let node = plan_node(&plan, &parent.node_id)?;
        let records = self.store().children(parent_id);
        let family = ChildSet::new(&records);
        let mut finished = Vec::new();

        if parent.mode == Some(ExecutionMode::ChildChain) {
            let mut current = parent.initial_children().into_iter().next().map(|(_, id)| id);
            while let Some(current_id) = current.take() {
                let Some(latest) = family.latest(&current_id) else {
                    return Ok(());
                };
                if !family.is_finished(latest) {
                    return Ok(());
                }
                finished.push(latest);

                let successor = if latest.status.is_positive() {
                    next_sibling(node, &latest.node_id)
                } else {
                    None
                };
                let (Some(next_node_id), Some(next_id)) = (successor, &latest.next_id) else {
                    break;
                };

                if family.latest(next_id).is_none() {
                    let next_node = plan_node(&plan, &next_node_id)?;
                    let next = NodeExecution::new(
                        next_id,
                        next_node,
                        Some(parent.uuid.clone()),
                        parent
                            .ambiance
                            .clone_for_child(Level::for_node(next_node, next_id, 0)),
                    )
                    .with_previous(&latest.uuid);
                    debug!("'{}' -> '{}'", latest.identifier, next_node.identifier);
                    return self.insert_and_start(next);
                }
                current = Some(next_id.clone());
            }
        } else {
            for (_, execution_id) in parent.initial_children() {
                match family.latest(&execution_id) {
                    Some(latest) if family.is_finished(latest) => finished.push(latest),
                    _ => return Ok(()),
                }
            }
        }

        if !family.rollbacks_finished() {
            return Ok(());
        }
        self.complete_parent(&parent, &finished)
    }

    fn complete_parent(&self, parent: &NodeExecution, children: &[&NodeExecution]) -> Result<()> {
        let status = Status::aggregate(children.iter().map(|c| c.status));
        let summary = children
            .iter()
            .map(|c| ChildStatus {
                node_execution_id: c.uuid.clone(),
                identifier: c.identifier.clone(),
                status: c.status,
            })
            .collect();

        let mut outcome = StepOutcome {
            status,
            failure: None,
            outcomes: vec![Outcome::Aggregate { children: summary }],
            outputs: Vec::new(),
        };

        if !status.is_positive() {
            let broken: Vec<&NodeExecution> = children
                .iter()
                .copied()
                .filter(|c| !c.status.is_positive())
                .collect();
            let mut failure_types: Vec<FailureType> = Vec::new();
            for failure in broken.iter().filter_map(|c| c.failure_info.as_ref()) {
                for failure_type in &failure.failure_types {
                    if !failure_types.contains(failure_type) {
                        failure_types.push(*failure_type);
                    }
                }
            }
            let names: Vec<&str> = broken.iter().map(|c| c.identifier.as_str()).collect();
            outcome.failure = Some(FailureInfo::new(
                format!("{}: {}", status, names.join(", ")),
                failure_types,
            ));
        }

        self.conclude(&parent.uuid, outcome)?;
        Ok(())
    }

    fn end_plan(&self, root: &NodeExecution) -> Result<()> {
        let status = match root.status {
            Status::IgnoreFailed => Status::Succeeded,
            status => status,
        };
        let ended = update_plan_execution_with(
            self.store().as_ref(),
            &root.plan_execution_id,
            self.inner.config.max_conflict_retries,
            |mut execution| {
                if execution.is_terminal() {
                    return None;
                }
                execution.status = status;
                execution.end_ts = Some(Utc::now());
                Some(execution)
            },
        )?;

        if let Some(execution) = ended {
            self.finish_plan(&execution)?;
        }
        Ok(())
    }

    /// Starts the retention clock and announces the end of a run.
    pub(super) fn finish_plan(&self, execution: &PlanExecution) -> Result<()> {
        self.store().set_valid_until(
            &execution.uuid,
            deadline_after(self.inner.config.retention_ttl()),
        )?;
        if execution.status == Status::Succeeded {
            info!("Plan execution {} SUCCEEDED", execution.uuid);
        } else {
            warn!("Plan execution {} {}", execution.uuid, execution.status);
        }
        self.emit(&OrchestrationEvent::for_plan(EventKind::PlanEnd, execution));
        Ok(())
    }

    pub(super) fn plan_for(&self, record: &NodeExecution) -> Result<Arc<Plan>> {
        Ok(self.store().plan(&record.ambiance.plan_id)?)
    }

    pub(super) fn update<F>(&self, id: &str, apply: F) -> Result<Option<NodeExecution>>
    where
        F: FnMut(NodeExecution) -> Option<NodeExecution>,
    {
        Ok(update_with(
            self.store().as_ref(),
            id,
            self.inner.config.max_conflict_retries,
            apply,
        )?)
    }

    pub(super) fn publish(&self, message: Message) {
        self.inner.queue.publish(message);
    }

    pub(super) fn emit(&self, event: &OrchestrationEvent) {
        self.inner.events.emit(event);
    }

    pub(super) fn emit_node(&self, kind: EventKind, record: &NodeExecution) {
        self.emit(&OrchestrationEvent::for_node(kind, record));
    }
}

/// The children of one parent, grouped into retry lineages.
struct ChildSet<'a> {
    records: &'a [NodeExecution],
    superseded: HashSet<&'a str>,
}

impl<'a> ChildSet<'a> {
    fn new(records: &'a [NodeExecution]) -> Self {
        let superseded = records
            .iter()
            .flat_map(|r| r.retry_ids.iter().map(String::as_str))
            .collect();
        Self {
            records,
            superseded,
        }
    }

    /// Latest attempt of the lineage whose first attempt is `first_id`.
    fn latest(&self, first_id: &str) -> Option<&'a NodeExecution> {
        self.records
            .iter()
            .filter(|r| r.uuid == first_id || r.retry_ids.iter().any(|id| id == first_id))
            .find(|r| !self.superseded.contains(r.uuid.as_str()))
    }

    /// Terminal, not about to be retried, and any rollback it asked for
    /// has finished.
    fn is_finished(&self, record: &NodeExecution) -> bool {
        if !record.is_terminal() {
            return false;
        }
        match &record.adviser_response {
            Some(AdviserResponse::Retry { .. }) => false,
            Some(AdviserResponse::Rollback { .. }) => self
                .records
                .iter()
                .find(|r| r.rollback_of.as_deref() == Some(record.uuid.as_str()))
                .map_or(false, NodeExecution::is_terminal),
            _ => true,
        }
    }

    fn rollbacks_finished(&self) -> bool {
        self.records
            .iter()
            .filter(|r| r.rollback_of.is_some())
            .all(NodeExecution::is_terminal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::Visibility;
    use crate::orchestration::EventCollector;
    use crate::plan::{AdviserObtainment, FacilitationStrategy, FailureAction, FailureStrategyRule};
    use crate::step::Step;
    use serde_json::json;

    /// Sync step whose behaviour is picked by its custom spec.
    struct Scripted;

    impl Step for Scripted {
        fn step_type(&self) -> &str {
            "Scripted"
        }

        fn facilitation(&self) -> FacilitationStrategy {
            FacilitationStrategy::Sync
        }

        fn invoke(&self, ctx: &StepContext<'_>) -> std::result::Result<StepResponse, StepError> {
            let spec = match ctx.parameters {
                StepParameters::Custom(custom) => custom.spec.clone(),
                _ => Value::Null,
            };
            let outcome = match spec["result"].as_str() {
                Some("fail") => StepOutcome::failed(FailureInfo::of(
                    FailureType::Application,
                    "scripted failure",
                )),
                Some("publish") => StepOutcome::succeeded().with_output(
                    crate::execution::OutputSpec::new(
                        "VERSION",
                        json!("1.2.3"),
                        Visibility::PipelineGlobal,
                    ),
                ),
                _ => StepOutcome::succeeded(),
            };
            Ok(StepResponse::Completed(outcome))
        }
    }

    fn scripted(id: &str, result: &str) -> PlanNode {
        PlanNode::new(id, id, "Scripted", FacilitationStrategy::Sync).with_parameters(
            StepParameters::Custom(crate::plan::CustomParameters {
                spec: json!({ "result": result }),
            }),
        )
    }

    fn step(id: &str, result: &str) -> PlanNode {
        scripted(id, result).with_adviser(AdviserObtainment::NextStep)
    }

    fn parent(id: &str, strategy: FacilitationStrategy, children: &[&str]) -> PlanNode {
        PlanNode::new(id, id, "CONTAINER", strategy)
            .with_children(children.iter().map(|c| c.to_string()).collect())
            .with_adviser(AdviserObtainment::NextStep)
    }

    fn engine() -> (Engine, Arc<EventCollector>) {
        let collector = Arc::new(EventCollector::new());
        let engine = Engine::builder()
            .with_steps(StepRegistry::with_builtins().with_step(Scripted))
            .with_listener(collector.clone())
            .build();
        (engine, collector)
    }

    fn statuses(engine: &Engine, id: &str) -> BTreeMap<String, Status> {
        engine
            .store()
            .find(&NodeExecutionQuery::for_plan(id))
            .into_iter()
            .map(|r| (r.identifier, r.status))
            .collect()
    }

    #[test]
    fn test_chain_runs_in_order() {
        let (engine, collector) = engine();
        let plan = Plan::from_nodes(
            "chain",
            vec![
                parent("root", FacilitationStrategy::ChildChain, &["a", "b", "c"]),
                step("a", "ok"),
                step("b", "ok"),
                step("c", "ok"),
            ],
            "root",
        );

        let id = engine.start_plan(plan, BTreeMap::new(), TriggerInfo::default()).unwrap();
        engine.run_until_idle();

        assert_eq!(engine.plan_execution(&id).unwrap().status, Status::Succeeded);
        let records = engine.store().find(&NodeExecutionQuery::for_plan(&id));
        let b = records.iter().find(|r| r.identifier == "b").unwrap();
        let a = records.iter().find(|r| r.identifier == "a").unwrap();
        assert_eq!(b.previous_id.as_deref(), Some(a.uuid.as_str()));
        assert_eq!(a.next_id.as_deref(), Some(b.uuid.as_str()));

        let kinds = collector.kinds();
        assert_eq!(kinds.first(), Some(&EventKind::PlanStart));
        assert_eq!(kinds.last(), Some(&EventKind::PlanEnd));
    }

    #[test]
    fn test_single_sync_root() {
        let (engine, collector) = engine();
        let plan = Plan::from_nodes("single", vec![step("only", "ok")], "only");

        let id = engine.start_plan(plan, BTreeMap::new(), TriggerInfo::default()).unwrap();
        engine.run_until_idle();

        assert_eq!(engine.plan_execution(&id).unwrap().status, Status::Succeeded);
        let records = engine.store().find(&NodeExecutionQuery::for_plan(&id));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, Status::Succeeded);
        assert_eq!(records[0].mode, Some(ExecutionMode::Sync));
        assert!(records[0].parent_id.is_none());
        assert_eq!(
            collector.kinds(),
            vec![
                EventKind::PlanStart,
                EventKind::NodeStart,
                EventKind::NodeEnd,
                EventKind::PlanEnd
            ]
        );
    }

    #[test]
    fn test_chain_stops_after_failure() {
        let (engine, _) = engine();
        let plan = Plan::from_nodes(
            "chain",
            vec![
                parent("root", FacilitationStrategy::ChildChain, &["a", "b"]),
                step("a", "fail"),
                step("b", "ok"),
            ],
            "root",
        );

        let id = engine.start_plan(plan, BTreeMap::new(), TriggerInfo::default()).unwrap();
        engine.run_until_idle();

        let statuses = statuses(&engine, &id);
        assert_eq!(statuses["a"], Status::Failed);
        assert!(!statuses.contains_key("b"));
        assert_eq!(statuses["root"], Status::Failed);
        assert_eq!(engine.plan_execution(&id).unwrap().status, Status::Failed);
    }

    #[test]
    fn test_children_aggregate() {
        let (engine, _) = engine();
        let plan = Plan::from_nodes(
            "fan-out",
            vec![
                parent("root", FacilitationStrategy::Children, &["a", "b", "c"]),
                step("a", "ok"),
                step("b", "fail"),
                step("c", "ok"),
            ],
            "root",
        );

        let id = engine.start_plan(plan, BTreeMap::new(), TriggerInfo::default()).unwrap();
        engine.run_until_idle();

        let root = engine
            .store()
            .find(&NodeExecutionQuery::for_plan(&id))
            .into_iter()
            .find(|r| r.parent_id.is_none())
            .unwrap();
        assert_eq!(root.status, Status::Failed);
        let Some(Outcome::Aggregate { children }) = root.outcomes.first() else {
            panic!("expected an aggregate outcome");
        };
        assert_eq!(children.len(), 3);
        assert_eq!(
            root.failure_info.unwrap().failure_types,
            vec![FailureType::Application]
        );
    }

    #[test]
    fn test_ignore_failure_lets_chain_continue() {
        let (engine, _) = engine();
        let flaky = scripted("a", "fail")
            .with_adviser(AdviserObtainment::FailureStrategy {
                rules: vec![FailureStrategyRule::all_errors(FailureAction::Ignore)],
            })
            .with_adviser(AdviserObtainment::NextStep);
        let plan = Plan::from_nodes(
            "ignore",
            vec![
                parent("root", FacilitationStrategy::ChildChain, &["a", "b"]),
                flaky,
                step("b", "ok"),
            ],
            "root",
        );

        let id = engine.start_plan(plan, BTreeMap::new(), TriggerInfo::default()).unwrap();
        engine.run_until_idle();

        let statuses = statuses(&engine, &id);
        assert_eq!(statuses["a"], Status::IgnoreFailed);
        assert_eq!(statuses["b"], Status::Succeeded);
        assert_eq!(engine.plan_execution(&id).unwrap().status, Status::Succeeded);
    }

    #[test]
    fn test_outputs_feed_later_steps() {
        let (engine, _) = engine();
        let consumer = step("b", "ok").with_parameters(StepParameters::Custom(
            crate::plan::CustomParameters {
                spec: json!({ "result": "ok", "version": "<+outputs.VERSION>" }),
            },
        ));
        let plan = Plan::from_nodes(
            "outputs",
            vec![
                parent("root", FacilitationStrategy::ChildChain, &["a", "b"]),
                step("a", "publish"),
                consumer,
            ],
            "root",
        );

        let id = engine.start_plan(plan, BTreeMap::new(), TriggerInfo::default()).unwrap();
        engine.run_until_idle();

        let b = engine
            .store()
            .find(&NodeExecutionQuery::for_plan(&id).with_node("b"))
            .remove(0);
        let Some(StepParameters::Custom(custom)) = b.resolved_parameters else {
            panic!("expected resolved custom parameters");
        };
        assert_eq!(custom.spec["version"], json!("1.2.3"));
    }

    #[test]
    fn test_unresolved_expression_fails_step() {
        let (engine, _) = engine();
        let consumer = step("a", "ok").with_parameters(StepParameters::Custom(
            crate::plan::CustomParameters {
                spec: json!({ "version": "<+outputs.MISSING>" }),
            },
        ));
        let plan = Plan::from_nodes(
            "unresolved",
            vec![parent("root", FacilitationStrategy::Child, &["a"]), consumer],
            "root",
        );

        let id = engine.start_plan(plan, BTreeMap::new(), TriggerInfo::default()).unwrap();
        engine.run_until_idle();

        assert_eq!(statuses(&engine, &id)["a"], Status::Failed);
    }

    #[test]
    fn test_empty_parent_succeeds() {
        let (engine, _) = engine();
        let plan = Plan::from_nodes(
            "empty",
            vec![parent("root", FacilitationStrategy::ChildChain, &[])],
            "root",
        );

        let id = engine.start_plan(plan, BTreeMap::new(), TriggerInfo::default()).unwrap();
        engine.run_until_idle();
        assert_eq!(engine.plan_execution(&id).unwrap().status, Status::Succeeded);
    }

    #[test]
    fn test_duplicate_start_is_harmless() {
        let (engine, collector) = engine();
        let plan = Plan::from_nodes(
            "dup",
            vec![parent("root", FacilitationStrategy::Child, &["a"]), step("a", "ok")],
            "root",
        );

        let id = engine.start_plan(plan, BTreeMap::new(), TriggerInfo::default()).unwrap();
        let root_id = engine
            .store()
            .find(&NodeExecutionQuery::for_plan(&id))
            .remove(0)
            .uuid;
        let start = Message::StartNode {
            node_execution_id: root_id,
        };
        engine.handle(&start).unwrap();
        engine.handle(&start).unwrap();
        engine.run_until_idle();

        assert_eq!(engine.store().find(&NodeExecutionQuery::for_plan(&id)).len(), 2);
        let ends = collector
            .kinds()
            .into_iter()
            .filter(|k| *k == EventKind::PlanEnd)
            .count();
        assert_eq!(ends, 1);
    }

    #[test]
    fn test_unknown_step_type_fails_node() {
        let (engine, _) = engine();
        let plan = Plan::from_nodes(
            "unknown",
            vec![
                parent("root", FacilitationStrategy::Child, &["a"]),
                PlanNode::new("a", "a", "Missing", FacilitationStrategy::Sync),
            ],
            "root",
        );

        let id = engine.start_plan(plan, BTreeMap::new(), TriggerInfo::default()).unwrap();
        engine.run_until_idle();
        assert_eq!(statuses(&engine, &id)["a"], Status::Failed);
    }
}
