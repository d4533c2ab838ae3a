//! Facilitators
//!
//! A facilitator decides how a node starts, from the node's compiled
//! facilitation strategy:
//! - SYNC / ASYNC / TASK: the step itself runs (ASYNC and TASK get a
//!   wait hint that becomes the record's deadline)
//! - CHILD / CHILD_CHAIN: only the first child starts
//! - CHILDREN: every child starts at once

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::ambiance::Ambiance;
use crate::config::EngineConfig;
use crate::error::OrchestrationError;
use crate::execution::ExecutionMode;
use crate::plan::{FacilitationStrategy, PlanNode};

#[derive(Debug, Clone, PartialEq)]
pub struct FacilitationDecision {
    pub mode: ExecutionMode,
    /// How long the node may wait on something external.
    pub wait_duration_hint: Option<Duration>,
    /// Plan node ids of the children to start now.
    pub children: Vec<String>,
}

impl FacilitationDecision {
    fn run(mode: ExecutionMode) -> Self {
        Self {
            mode,
            wait_duration_hint: None,
            children: Vec::new(),
        }
    }
}

pub trait Facilitator: Send + Sync {
    fn strategy(&self) -> FacilitationStrategy;

    fn decide(&self, node: &PlanNode, ambiance: &Ambiance) -> FacilitationDecision;
}

pub struct SyncFacilitator;

impl Facilitator for SyncFacilitator {
    fn strategy(&self) -> FacilitationStrategy {
        FacilitationStrategy::Sync
    }

    fn decide(&self, _node: &PlanNode, _ambiance: &Ambiance) -> FacilitationDecision {
        FacilitationDecision::run(ExecutionMode::Sync)
    }
}

/// ASYNC and TASK nodes: run the step, then wait until a deadline.
pub struct WaitingFacilitator {
    strategy: FacilitationStrategy,
    default_timeout: Duration,
}

impl WaitingFacilitator {
    pub fn new(strategy: FacilitationStrategy, default_timeout: Duration) -> Self {
        Self {
            strategy,
            default_timeout,
        }
    }
}

impl Facilitator for WaitingFacilitator {
    fn strategy(&self) -> FacilitationStrategy {
        self.strategy
    }

    fn decide(&self, node: &PlanNode, _ambiance: &Ambiance) -> FacilitationDecision {
        FacilitationDecision {
            wait_duration_hint: Some(
                node.timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(self.default_timeout),
            ),
            ..FacilitationDecision::run(self.strategy.into())
        }
    }
}

/// Parents: pick the children to start.
pub struct ParentFacilitator {
    strategy: FacilitationStrategy,
}

impl ParentFacilitator {
    pub fn new(strategy: FacilitationStrategy) -> Self {
        Self { strategy }
    }
}

impl Facilitator for ParentFacilitator {
    fn strategy(&self) -> FacilitationStrategy {
        self.strategy
    }

    fn decide(&self, node: &PlanNode, _ambiance: &Ambiance) -> FacilitationDecision {
        let children = match self.strategy {
            FacilitationStrategy::Children => node.children.clone(),
            _ => node.children.iter().take(1).cloned().collect(),
        };
        FacilitationDecision {
            children,
            ..FacilitationDecision::run(self.strategy.into())
        }
    }
}

/// Facilitators keyed by strategy.
#[derive(Clone, Default)]
pub struct FacilitatorRegistry {
    facilitators: HashMap<FacilitationStrategy, Arc<dyn Facilitator>>,
}

impl FacilitatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One facilitator per strategy, with waits bounded by `config`.
    pub fn standard(config: &EngineConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SyncFacilitator));
        registry.register(Arc::new(WaitingFacilitator::new(
            FacilitationStrategy::Async,
            config.async_timeout(),
        )));
        registry.register(Arc::new(WaitingFacilitator::new(
            FacilitationStrategy::Task,
            config.task_timeout(),
        )));
        for strategy in [
            FacilitationStrategy::Child,
            FacilitationStrategy::Children,
            FacilitationStrategy::ChildChain,
        ] {
            registry.register(Arc::new(ParentFacilitator::new(strategy)));
        }
        registry
    }

    pub fn register(&mut self, facilitator: Arc<dyn Facilitator>) {
        self.facilitators.insert(facilitator.strategy(), facilitator);
    }

    pub fn get(
        &self,
        strategy: FacilitationStrategy,
    ) -> Result<Arc<dyn Facilitator>, OrchestrationError> {
        self.facilitators
            .get(&strategy)
            .cloned()
            .ok_or_else(|| OrchestrationError::NoFacilitator(strategy.to_string()))
    }
}
