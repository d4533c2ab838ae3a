//! Failure Strategies and Adviser Obtainments
//!
//! Declared on pipeline, stage, step group and step elements; compiled
//! into the adviser list of every step so the runtime never has to walk
//! back up the definition.
//!
//! # Example YAML Format
//!
//! ```yaml
//! failureStrategies:
//!   - onFailure:
//!       errors: [Timeout, Connectivity]
//!       action:
//!         type: Retry
//!         retryCount: 2
//!         retryIntervals: [1, 5]
//!         onRetryFailure:
//!           type: MarkAsSuccess
//!   - onFailure:
//!       errors: [AllErrors]
//!       action:
//!         type: Abort
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Classification of a failure, used to select a failure strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureType {
    /// Matches every failure. Only meaningful inside a rule.
    AllErrors,
    Application,
    Connectivity,
    Authentication,
    Authorization,
    Verification,
    DelegateProvisioning,
    Timeout,
    Unknown,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What to do when a rule matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FailureAction {
    Retry {
        #[serde(rename = "retryCount", default)]
        retry_count: u32,
        #[serde(rename = "retryIntervals", default)]
        retry_intervals_secs: Vec<u64>,
        #[serde(rename = "onRetryFailure", default = "default_exhausted_action")]
        on_retry_failure: Box<FailureAction>,
    },
    Ignore,
    MarkAsSuccess,
    /// Fails the enclosing pipeline.
    Abort,
    /// Runs the enclosing stage's rollback section. The target is filled in
    /// by the compiler.
    StageRollback {
        #[serde(rename = "rollbackNodeId", default)]
        rollback_node_id: Option<String>,
    },
    ManualIntervention {
        #[serde(rename = "timeout", default)]
        timeout_secs: Option<u64>,
        #[serde(rename = "onTimeout", default = "default_exhausted_action")]
        on_timeout: Box<FailureAction>,
    },
}

fn default_exhausted_action() -> Box<FailureAction> {
    Box::new(FailureAction::Abort)
}

/// An ordered failure-strategy rule: `errors` → `action`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureStrategyRule {
    pub errors: Vec<FailureType>,
    pub action: FailureAction,
}

impl FailureStrategyRule {
    pub fn new(errors: Vec<FailureType>, action: FailureAction) -> Self {
        Self { errors, action }
    }

    /// A rule matching every failure.
    pub fn all_errors(action: FailureAction) -> Self {
        Self::new(vec![FailureType::AllErrors], action)
    }

    /// True if this rule applies to a failure classified as `types`.
    ///
    /// An unclassified failure counts as `Unknown`.
    pub fn matches(&self, types: &[FailureType]) -> bool {
        if self.errors.contains(&FailureType::AllErrors) {
            return true;
        }
        if types.is_empty() {
            return self.errors.contains(&FailureType::Unknown);
        }
        types.iter().any(|t| self.errors.contains(t))
    }
}

/// The `failureStrategies` list element as written in a definition.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct FailureStrategyConfig {
    #[serde(rename = "onFailure")]
    pub on_failure: OnFailureConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct OnFailureConfig {
    #[serde(default)]
    pub errors: Vec<FailureType>,
    pub action: FailureAction,
}

impl From<FailureStrategyConfig> for FailureStrategyRule {
    fn from(config: FailureStrategyConfig) -> Self {
        let errors = if config.on_failure.errors.is_empty() {
            vec![FailureType::AllErrors]
        } else {
            config.on_failure.errors
        };
        Self::new(errors, config.on_failure.action)
    }
}

/// Kinds of advisers a node can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdviserType {
    NextStep,
    FailureStrategy,
}

/// One entry of a node's adviser list, with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdviserObtainment {
    NextStep,
    FailureStrategy { rules: Vec<FailureStrategyRule> },
}

impl AdviserObtainment {
    pub fn adviser_type(&self) -> AdviserType {
        match self {
            Self::NextStep => AdviserType::NextStep,
            Self::FailureStrategy { .. } => AdviserType::FailureStrategy,
        }
    }
}
