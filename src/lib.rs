//! PlanRunner - Pipeline Orchestration Engine
//!
//! Compiles declarative pipeline definitions into plan graphs and drives
//! them node by node through a persisted state machine, delegating work
//! to an execution pool and reacting to interrupts and failure policy.
//!
//! # Architecture
//!
//! - [`plan`]: definition documents, the node graph and the plan creator
//! - [`execution`]: status machine, runtime records and their store
//! - [`step`]: step logic behind a type-tagged registry
//! - [`delegate`]: task payloads, dispatch and the execution pool
//! - [`orchestration`]: the engine, advisers, interrupts and events
//! - [`ambiance`], [`expression`], [`config`], [`error`]: shared context
//!
//! # Example
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use std::time::Duration;
//!
//! use planrunner::ambiance::TriggerInfo;
//! use planrunner::{load_definition, Engine, PlanCreator, StepRegistry};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Compile the definition into a plan
//!     let definition = load_definition("pipeline.yaml")?;
//!     let plan = PlanCreator::standard(StepRegistry::with_builtins()).compile(&definition)?;
//!
//!     // Start it and drive it to completion
//!     let engine = Engine::builder().build();
//!     let id = engine.start_plan(plan, BTreeMap::new(), TriggerInfo::default())?;
//!     let execution = engine.run_until_complete(&id, Duration::from_secs(60))?;
//!     println!("{}", execution.status);
//!     Ok(())
//! }
//! ```

pub mod ambiance;
pub mod config;
pub mod delegate;
pub mod error;
pub mod execution;
pub mod expression;
pub mod orchestration;
pub mod plan;
pub mod step;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{CompileError, OrchestrationError};
pub use execution::{ExecutionSnapshot, NodeExecutionQuery, Projection, Status};
pub use orchestration::{Engine, EngineBuilder, InterruptRequest};
pub use plan::{load_definition, Plan, PlanCreator};
pub use step::StepRegistry;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "PlanRunner";
