//! Advisers
//!
//! Decide what happens after a node reaches a final status. The node's
//! adviser obtainments are asked in order and the first answer wins; if
//! none answers, a positive status moves on and anything else fails the
//! pipeline.
//!
//! Advice is computed from the would-be terminal record before it is
//! written, so the decision lands in the same write as the status.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use crate::execution::{AdviserResponse, NodeExecution};
use crate::plan::{AdviserObtainment, AdviserType, FailureAction, PlanNode};

/// What an adviser looks at.
#[derive(Debug, Clone, Copy)]
pub struct AdvisingContext<'a> {
    /// The record as it would be stored, carrying the final status and
    /// failure.
    pub record: &'a NodeExecution,
    pub node: &'a PlanNode,
}

pub trait Adviser: Send + Sync {
    fn adviser_type(&self) -> AdviserType;

    /// Returns `None` to let the next adviser decide.
    fn advise(
        &self,
        obtainment: &AdviserObtainment,
        ctx: &AdvisingContext<'_>,
    ) -> Option<AdviserResponse>;
}

/// Moves on after a positive status.
pub struct NextStepAdviser;

impl Adviser for NextStepAdviser {
    fn adviser_type(&self) -> AdviserType {
        AdviserType::NextStep
    }

    fn advise(
        &self,
        _obtainment: &AdviserObtainment,
        ctx: &AdvisingContext<'_>,
    ) -> Option<AdviserResponse> {
        ctx.record
            .status
            .is_positive()
            .then_some(AdviserResponse::NextStep)
    }
}

/// Applies the first failure-strategy rule matching a broken status.
pub struct FailureStrategyAdviser;

impl Adviser for FailureStrategyAdviser {
    fn adviser_type(&self) -> AdviserType {
        AdviserType::FailureStrategy
    }

    fn advise(
        &self,
        obtainment: &AdviserObtainment,
        ctx: &AdvisingContext<'_>,
    ) -> Option<AdviserResponse> {
        let AdviserObtainment::FailureStrategy { rules } = obtainment else {
            return None;
        };
        if !ctx.record.status.is_broken() {
            return None;
        }

        let failure_types = ctx
            .record
            .failure_info
            .as_ref()
            .map(|f| f.failure_types.as_slice())
            .unwrap_or_default();

        let rule = rules.iter().find(|rule| rule.matches(failure_types))?;
        debug!(
            "Node '{}' failed with {:?}: applying {:?}",
            ctx.node.identifier, failure_types, rule.action
        );
        Some(action_response(&rule.action, ctx.record.retry_count()))
    }
}

/// Translates a failure action for an attempt that has been retried
/// `retries` times.
pub fn action_response(action: &FailureAction, retries: usize) -> AdviserResponse {
    match action {
        FailureAction::Retry {
            retry_count,
            retry_intervals_secs,
            on_retry_failure,
        } => {
            if retries < *retry_count as usize {
                let delay_secs = retry_intervals_secs
                    .get(retries.min(retry_intervals_secs.len().saturating_sub(1)))
                    .copied()
                    .unwrap_or(0);
                AdviserResponse::Retry { delay_secs }
            } else {
                match on_retry_failure.as_ref() {
                    FailureAction::Retry { .. } => AdviserResponse::FailPipeline,
                    other => action_response(other, retries),
                }
            }
        }
        FailureAction::Ignore => AdviserResponse::Ignore,
        FailureAction::MarkAsSuccess => AdviserResponse::MarkSuccess,
        FailureAction::Abort => AdviserResponse::FailPipeline,
        FailureAction::StageRollback {
            rollback_node_id: Some(id),
        } => AdviserResponse::Rollback {
            rollback_node_id: id.clone(),
        },
        FailureAction::StageRollback {
            rollback_node_id: None,
        } => AdviserResponse::FailPipeline,
        FailureAction::ManualIntervention {
            timeout_secs,
            on_timeout,
        } => AdviserResponse::ManualIntervention {
            timeout_secs: *timeout_secs,
            on_timeout: on_timeout.as_ref().clone(),
        },
    }
}

/// Response for an intervention that timed out. A nested intervention
/// would wait forever, so it fails the pipeline instead.
pub fn timeout_response(on_timeout: &FailureAction, retries: usize) -> AdviserResponse {
    match action_response(on_timeout, retries) {
        AdviserResponse::ManualIntervention { .. } => AdviserResponse::FailPipeline,
        other => other,
    }
}

/// Advisers keyed by type.
#[derive(Clone, Default)]
pub struct AdviserRegistry {
    advisers: HashMap<AdviserType, Arc<dyn Adviser>>,
}

impl AdviserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(NextStepAdviser));
        registry.register(Arc::new(FailureStrategyAdviser));
        registry
    }

    pub fn register(&mut self, adviser: Arc<dyn Adviser>) {
        self.advisers.insert(adviser.adviser_type(), adviser);
    }

    /// Asks the node's obtainments in order; falls back to the default.
    pub fn advise(&self, ctx: &AdvisingContext<'_>) -> AdviserResponse {
        for obtainment in &ctx.node.advisers {
            let Some(adviser) = self.advisers.get(&obtainment.adviser_type()) else {
                debug!("No adviser registered for {:?}", obtainment.adviser_type());
                continue;
            };
            if let Some(response) = adviser.advise(obtainment, ctx) {
                return response;
            }
        }

        if ctx.record.status.is_positive() {
            AdviserResponse::NextStep
        } else {
            AdviserResponse::FailPipeline
        }
    }
}
