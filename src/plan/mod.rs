//! Plan Module
//!
//! Everything that exists before a plan runs:
//! - Definition documents (the compilation input)
//! - The compiled node graph
//! - Step parameters, failure strategies and adviser obtainments
//! - The plan creator and its node-creator handlers

pub mod creator;
pub mod creators;
pub mod definition;
pub mod node;
pub mod parameters;
pub mod strategy;

pub use creator::{
    CreationContext, CreationResponse, Dependency, InheritedContext, NodeCreator, PlanCreator,
};
pub use definition::{load_definition, parse_timeout_secs, Definition, DefinitionField};
pub use node::{FacilitationStrategy, NodeGroup, Plan, PlanNode};
pub use parameters::{ApprovalParameters, CustomParameters, ShellParameters, StepParameters};
pub use strategy::{
    AdviserObtainment, AdviserType, FailureAction, FailureStrategyRule, FailureType,
};
