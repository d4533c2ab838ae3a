//! Error Types
//!
//! One enum per failure domain, plus [`OrchestrationError`] which the
//! driver and interrupt handler return. Step failures never appear here:
//! they are captured as [`FailureInfo`](crate::execution::FailureInfo)
//! on the node execution and routed to the adviser.

use std::path::PathBuf;

use thiserror::Error;

/// Structural problems found while compiling a definition into a plan.
///
/// Compilation stops at the first error; no partial plan is produced.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CompileError {
    #[error("no node creator accepts field '{field}' at '{path}'")]
    NoCreator { path: String, field: String },

    #[error("'{path}' is missing required field '{field}'")]
    MissingField { path: String, field: String },

    #[error("'{path}': invalid value for '{field}': {reason}")]
    InvalidField {
        path: String,
        field: String,
        reason: String,
    },

    #[error("duplicate identifier '{identifier}' under '{path}'")]
    DuplicateIdentifier { path: String, identifier: String },

    #[error("'{path}': unknown step type '{step_type}'")]
    UnknownStepType { path: String, step_type: String },

    #[error("'{path}': rollback failure action used but no rollbackSteps are defined")]
    RollbackNotDefined { path: String },

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("failed to read definition: {0}")]
    Parse(String),
}

/// Errors raised by a [`NodeExecutionStore`](crate::execution::NodeExecutionStore).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} '{id}' already exists")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("version conflict on '{id}': expected {expected}, found {actual}")]
    VersionConflict {
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("illegal status transition on '{id}': {from} -> {to}")]
    IllegalTransition { id: String, from: String, to: String },

    #[error("node execution '{id}' is terminal and can no longer change")]
    Immutable { id: String },

    #[error("snapshot error: {0}")]
    Snapshot(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

/// Errors submitting a task to the remote execution pool.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DispatchError {
    /// The pool could not be reached. Retried with backoff.
    #[error("execution pool unreachable: {0}")]
    Transport(String),

    /// No executor offers the requested capabilities. Not retried.
    #[error("no executor satisfies capabilities: {0}")]
    NoEligibleExecutor(String),

    #[error("payload encoding failed: {0}")]
    Payload(String),
}

impl DispatchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Failure raised by step logic. Converted into `FailureInfo`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StepError {
    #[error("no step registered for type '{0}'")]
    Unregistered(String),

    #[error("step parameters do not match step type '{0}'")]
    ParameterMismatch(String),

    #[error("expression '{0}' could not be resolved")]
    UnresolvedExpression(String),

    #[error("{0}")]
    Failed(String),
}

/// Errors loading [`EngineConfig`](crate::config::EngineConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Errors surfaced by the orchestration driver.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OrchestrationError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("plan node '{node_id}' not found in plan '{plan_id}'")]
    UnknownPlanNode { plan_id: String, node_id: String },

    #[error("no facilitator registered for strategy {0}")]
    NoFacilitator(String),

    #[error("interrupt rejected: {0}")]
    InterruptRejected(String),

    #[error("retry rejected: {0}")]
    RetryRejected(String),

    #[error("queue error: {0}")]
    Queue(String),
}

pub type Result<T, E = OrchestrationError> = std::result::Result<T, E>;
