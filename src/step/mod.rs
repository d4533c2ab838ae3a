//! Step Dispatch
//!
//! Concrete step logic lives behind the [`Step`] trait. The composition
//! root registers implementations by type tag in a [`StepRegistry`]; the
//! plan compiler asks the registry how a step type is facilitated and how
//! its parameters parse, and the driver asks it to run the step.
//!
//! A step answers an invocation in one of three ways:
//! - [`StepResponse::Completed`]: the outcome is known now
//! - [`StepResponse::Async`]: wait for an external callback
//! - [`StepResponse::Task`]: ship the work to the execution pool

pub mod builtin;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::ambiance::Ambiance;
use crate::delegate::{TaskResult, TaskSpec};
use crate::error::StepError;
use crate::execution::{FailureInfo, Outcome, OutputSpec, Status};
use crate::plan::{CustomParameters, FacilitationStrategy, FailureType, PlanNode, StepParameters};

pub use builtin::{ApprovalStep, NoopStep, ShellScriptStep};

/// Everything a step sees when it runs.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub ambiance: &'a Ambiance,
    pub node: &'a PlanNode,
    /// Parameters after expression resolution.
    pub parameters: &'a StepParameters,
}

/// Final result of a step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub status: Status,
    pub failure: Option<FailureInfo>,
    pub outcomes: Vec<Outcome>,
    pub outputs: Vec<OutputSpec>,
}

impl StepOutcome {
    fn with_status(status: Status) -> Self {
        Self {
            status,
            failure: None,
            outcomes: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn succeeded() -> Self {
        Self::with_status(Status::Succeeded)
    }

    pub fn skipped() -> Self {
        Self::with_status(Status::Skipped)
    }

    pub fn failed(failure: FailureInfo) -> Self {
        Self {
            failure: Some(failure),
            ..Self::with_status(Status::Failed)
        }
    }

    /// A deadline passed before the step finished.
    pub fn expired(message: impl Into<String>) -> Self {
        Self {
            failure: Some(FailureInfo::of(FailureType::Timeout, message)),
            ..Self::with_status(Status::Expired)
        }
    }

    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcomes.push(outcome);
        self
    }

    pub fn with_output(mut self, output: OutputSpec) -> Self {
        self.outputs.push(output);
        self
    }
}

/// Answer to a step invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum StepResponse {
    Completed(StepOutcome),
    Async,
    Task(TaskSpec),
}

/// Data that continues a waiting step.
#[derive(Debug, Clone, Copy)]
pub enum ResumeInput<'a> {
    Task(&'a TaskResult),
    Async(&'a Value),
}

/// Step logic registered for one step type.
pub trait Step: Send + Sync {
    /// Type tag used in definitions, e.g. `ShellScript`.
    fn step_type(&self) -> &str;

    fn facilitation(&self) -> FacilitationStrategy;

    /// Parses the `spec` block of a step definition.
    fn parse_parameters(&self, spec: &Value) -> Result<StepParameters, StepError> {
        Ok(StepParameters::Custom(CustomParameters { spec: spec.clone() }))
    }

    fn invoke(&self, ctx: &StepContext<'_>) -> Result<StepResponse, StepError>;

    /// Finishes a step that answered `Async` or `Task`.
    fn resume(&self, ctx: &StepContext<'_>, input: ResumeInput<'_>) -> Result<StepOutcome, StepError> {
        let _ = (ctx, input);
        Err(StepError::Failed(format!(
            "step type '{}' cannot be resumed",
            self.step_type()
        )))
    }
}

impl From<StepError> for FailureInfo {
    fn from(err: StepError) -> Self {
        let failure_type = match &err {
            StepError::Unregistered(_) => FailureType::Unknown,
            StepError::ParameterMismatch(_)
            | StepError::UnresolvedExpression(_)
            | StepError::Failed(_) => FailureType::Application,
        };
        FailureInfo::of(failure_type, err.to_string())
    }
}

/// Step implementations keyed by type tag.
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn Step>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in step types.
    pub fn with_builtins() -> Self {
        Self::new()
            .with_step(NoopStep)
            .with_step(ShellScriptStep)
            .with_step(ApprovalStep)
    }

    /// Registers `step`, replacing any earlier step with the same tag.
    pub fn with_step(mut self, step: impl Step + 'static) -> Self {
        self.register(Arc::new(step));
        self
    }

    pub fn register(&mut self, step: Arc<dyn Step>) {
        self.steps.insert(step.step_type().to_string(), step);
    }

    pub fn get(&self, step_type: &str) -> Option<Arc<dyn Step>> {
        self.steps.get(step_type).cloned()
    }

    pub fn require(&self, step_type: &str) -> Result<Arc<dyn Step>, StepError> {
        self.get(step_type)
            .ok_or_else(|| StepError::Unregistered(step_type.to_string()))
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.steps.contains_key(step_type)
    }

    /// Registered type tags, sorted.
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.steps.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepRegistry")
            .field("types", &self.types())
            .finish()
    }
}
