//! Orchestration
//!
//! The engine that moves plan executions forward:
//! - [`Engine`]: message handlers, node lifecycle, parents and chains
//! - [`facilitator`]: how a node starts
//! - [`adviser`]: what follows a finished node
//! - [`interrupt`]: abort, pause, resume, expire and interventions
//! - [`sweeper`]: deadlines and retention
//! - retry: rerunning a failed plan execution from a stage
//! - [`queue`] and [`events`]: the message queue and event bus
//! - [`timeline`]: per-node spans rebuilt from events

pub mod adviser;
pub mod engine;
pub mod events;
pub mod facilitator;
pub mod interrupt;
pub mod queue;
mod retry;
pub mod sweeper;
pub mod timeline;

pub use adviser::{Adviser, AdviserRegistry, AdvisingContext};
pub use engine::{Engine, EngineBuilder};
pub use events::{
    DeduplicatingListener, EventBus, EventCollector, EventKind, EventListener, OrchestrationEvent,
};
pub use facilitator::{FacilitationDecision, Facilitator, FacilitatorRegistry};
pub use interrupt::InterruptRequest;
pub use queue::{Delivery, InMemoryQueue, Message, MessageQueue};
pub use sweeper::SweepReport;
pub use timeline::{NodeSpan, TimelineListener};
