//! Shared helpers for the scenario tests.
//!
//! [`ScriptedPool`] stands in for the remote executors: it answers shell
//! tasks from the script text instead of running bash, so scenarios are
//! deterministic and finish inside `run_until_idle`.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use planrunner::ambiance::TriggerInfo;
use planrunner::delegate::{
    CallbackChannel, DelegateTaskRequest, ExecutionPool, SubmitAck, TaskParameters, TaskResult,
};
use planrunner::error::DispatchError;
use planrunner::execution::{NodeExecution, PlanExecution};
use planrunner::orchestration::EventCollector;
use planrunner::plan::Definition;
use planrunner::{Engine, EngineConfig, NodeExecutionQuery, PlanCreator, StepRegistry};

/// Answers shell tasks by script:
/// - `succeed`: exit 0, exporting each output variable from `env`
/// - `fail`: exit 1
/// - `fail-then-succeed:N`: the first N submissions fail
/// - `hold`: accepted; the result comes from [`ScriptedPool::release`]
/// - `unreachable`: transport error on every submission
#[derive(Default)]
pub struct ScriptedPool {
    attempts: Mutex<HashMap<String, usize>>,
    held: Mutex<Vec<(String, CallbackChannel)>>,
    submissions: AtomicUsize,
    capabilities: Vec<String>,
}

impl ScriptedPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    pub fn held(&self) -> usize {
        self.held.lock().unwrap().len()
    }

    /// Completes every held task with `result`.
    pub fn release(&self, result: TaskResult) -> usize {
        let held: Vec<_> = self.held.lock().unwrap().drain(..).collect();
        for (task_id, callback) in &held {
            callback.complete(task_id, result.clone());
        }
        held.len()
    }
}

impl ExecutionPool for ScriptedPool {
    fn submit(
        &self,
        request: DelegateTaskRequest,
        callback: CallbackChannel,
    ) -> Result<SubmitAck, DispatchError> {
        self.submissions.fetch_add(1, Ordering::SeqCst);

        let missing: Vec<&String> = request
            .capabilities
            .iter()
            .filter(|c| !self.capabilities.contains(c))
            .collect();
        if !missing.is_empty() {
            return Err(DispatchError::NoEligibleExecutor(format!("{:?}", missing)));
        }

        let task = match request.payload.decode()? {
            TaskParameters::Shell(task) => task,
            TaskParameters::Json(_) => {
                return Ok(SubmitAck::Completed(TaskResult::success(0, BTreeMap::new())));
            }
        };
        let script = task.script.trim().to_string();

        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let count = attempts.entry(script.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let outputs: BTreeMap<String, String> = task
            .output_variables
            .iter()
            .filter_map(|name| task.env.get(name).map(|v| (name.clone(), v.clone())))
            .collect();
        let success = TaskResult::success(0, outputs);
        let failure = TaskResult::failure(Some(1), format!("'{}' exited with code 1", script));

        let result = match script.as_str() {
            "succeed" => success,
            "fail" => failure,
            "hold" => {
                self.held
                    .lock()
                    .unwrap()
                    .push((request.task_id.clone(), callback));
                return Ok(SubmitAck::Submitted);
            }
            "unreachable" => {
                return Err(DispatchError::Transport("connection refused".to_string()));
            }
            other => match other.strip_prefix("fail-then-succeed:") {
                Some(n) if attempt <= n.parse().unwrap_or(0) => failure,
                _ => success,
            },
        };
        Ok(SubmitAck::Completed(result))
    }
}

pub struct Harness {
    pub engine: Engine,
    pub pool: Arc<ScriptedPool>,
    pub events: Arc<EventCollector>,
}

pub fn config() -> EngineConfig {
    EngineConfig {
        dispatch_max_attempts: 3,
        dispatch_backoff_ms: 1,
        ..EngineConfig::default()
    }
}

pub fn harness() -> Harness {
    harness_with(ScriptedPool::new(), config())
}

pub fn harness_with(pool: ScriptedPool, config: EngineConfig) -> Harness {
    let pool = Arc::new(pool);
    let events = Arc::new(EventCollector::new());
    let engine = Engine::builder()
        .with_config(config)
        .with_execution_pool(pool.clone())
        .with_listener(events.clone())
        .build();
    Harness {
        engine,
        pool,
        events,
    }
}

impl Harness {
    /// Compiles `yaml`, starts it and drains the queue.
    pub fn run(&self, yaml: &str) -> String {
        let definition = Definition::from_yaml_str(yaml).unwrap();
        let plan = PlanCreator::standard(StepRegistry::with_builtins())
            .compile(&definition)
            .unwrap();
        let id = self
            .engine
            .start_plan(plan, BTreeMap::new(), TriggerInfo::default())
            .unwrap();
        self.engine.run_until_idle();
        id
    }

    pub fn plan_execution(&self, id: &str) -> PlanExecution {
        self.engine.plan_execution(id).unwrap()
    }

    /// Every attempt at the node named `identifier`, oldest first.
    pub fn attempts(&self, id: &str, identifier: &str) -> Vec<NodeExecution> {
        let mut records: Vec<NodeExecution> = self
            .engine
            .store()
            .find(&NodeExecutionQuery::for_plan(id))
            .into_iter()
            .filter(|r| r.identifier == identifier)
            .collect();
        records.sort_by_key(|r| r.retry_ids.len());
        records
    }

    /// The latest attempt at `identifier`.
    pub fn node(&self, id: &str, identifier: &str) -> NodeExecution {
        self.engine
            .store()
            .find(&NodeExecutionQuery::for_plan(id).without_old_retries())
            .into_iter()
            .find(|r| r.identifier == identifier)
            .unwrap_or_else(|| panic!("no execution of '{}'", identifier))
    }

    pub fn has_node(&self, id: &str, identifier: &str) -> bool {
        !self.attempts(id, identifier).is_empty()
    }
}
