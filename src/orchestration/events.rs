//! Orchestration Event Bus
//!
//! Observers learn about plan and node lifecycle changes through
//! [`OrchestrationEvent`]s. Delivery is at-least-once:
//! - a listener returning an error is retried up to the configured count
//! - a listener that still fails is logged and skipped
//! - wrap a listener in [`DeduplicatingListener`] to drop repeated events

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::execution::{NodeExecution, PlanExecution, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    PlanStart,
    PlanEnd,
    NodeStart,
    NodeEnd,
    NodeStatusUpdate,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PlanStart => "PLAN_START",
            Self::PlanEnd => "PLAN_END",
            Self::NodeStart => "NODE_START",
            Self::NodeEnd => "NODE_END",
            Self::NodeStatusUpdate => "NODE_STATUS_UPDATE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationEvent {
    pub event_id: String,
    pub kind: EventKind,
    pub plan_execution_id: String,
    #[serde(default)]
    pub node_execution_id: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub identifier: Option<String>,
    pub status: Status,
    pub timestamp: DateTime<Utc>,
}

impl OrchestrationEvent {
    pub fn for_plan(kind: EventKind, execution: &PlanExecution) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            kind,
            plan_execution_id: execution.uuid.clone(),
            node_execution_id: None,
            node_id: None,
            identifier: Some(execution.name.clone()),
            status: execution.status,
            timestamp: Utc::now(),
        }
    }

    pub fn for_node(kind: EventKind, record: &NodeExecution) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            kind,
            plan_execution_id: record.plan_execution_id.clone(),
            node_execution_id: Some(record.uuid.clone()),
            node_id: Some(record.node_id.clone()),
            identifier: Some(record.identifier.clone()),
            status: record.status,
            timestamp: Utc::now(),
        }
    }
}

pub trait EventListener: Send + Sync {
    fn name(&self) -> &str;

    fn on_event(&self, event: &OrchestrationEvent) -> Result<(), String>;
}

/// Fans events out to every subscribed listener.
#[derive(Clone)]
pub struct EventBus {
    listeners: Vec<Arc<dyn EventListener>>,
    attempts: u32,
}

impl EventBus {
    pub fn new(attempts: u32) -> Self {
        Self {
            listeners: Vec::new(),
            attempts: attempts.max(1),
        }
    }

    pub fn subscribe(&mut self, listener: Arc<dyn EventListener>) {
        debug!("Subscribing event listener '{}'", listener.name());
        self.listeners.push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Delivers `event` to every listener. Returns how many accepted it.
    pub fn emit(&self, event: &OrchestrationEvent) -> usize {
        self.listeners
            .iter()
            .filter(|listener| self.deliver(listener.as_ref(), event))
            .count()
    }

    fn deliver(&self, listener: &dyn EventListener, event: &OrchestrationEvent) -> bool {
        for attempt in 1..=self.attempts {
            match listener.on_event(event) {
                Ok(()) => return true,
                Err(e) => warn!(
                    "Listener '{}' rejected {} (attempt {}/{}): {}",
                    listener.name(),
                    event.kind,
                    attempt,
                    self.attempts,
                    e
                ),
            }
        }
        warn!(
            "Dropping {} event {} for listener '{}'",
            event.kind,
            event.event_id,
            listener.name()
        );
        false
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.listeners.iter().map(|l| l.name()).collect();
        f.debug_struct("EventBus")
            .field("listeners", &names)
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// Forwards each event id to the inner listener at most once.
pub struct DeduplicatingListener<L> {
    inner: L,
    seen: Mutex<HashSet<String>>,
}

impl<L: EventListener> DeduplicatingListener<L> {
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            seen: Mutex::new(HashSet::new()),
        }
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }
}

impl<L: EventListener> EventListener for DeduplicatingListener<L> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn on_event(&self, event: &OrchestrationEvent) -> Result<(), String> {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        if seen.contains(&event.event_id) {
            debug!("Duplicate event {} ignored", event.event_id);
            return Ok(());
        }
        self.inner.on_event(event)?;
        seen.insert(event.event_id.clone());
        Ok(())
    }
}

/// Keeps every event it receives; handy for embedders and tests.
#[derive(Default)]
pub struct EventCollector {
    events: Mutex<Vec<OrchestrationEvent>>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OrchestrationEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().iter().map(|e| e.kind).collect()
    }
}

impl EventListener for EventCollector {
    fn name(&self) -> &str {
        "collector"
    }

    fn on_event(&self, event: &OrchestrationEvent) -> Result<(), String> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambiance::TriggerInfo;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    impl EventListener for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn on_event(&self, _event: &OrchestrationEvent) -> Result<(), String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err("not now".to_string())
            } else {
                Ok(())
            }
        }
    }

    fn plan_event() -> OrchestrationEvent {
        let pe = PlanExecution::new("pe", "plan", "demo", BTreeMap::new(), TriggerInfo::default());
        OrchestrationEvent::for_plan(EventKind::PlanStart, &pe)
    }

    #[test]
    fn test_failed_delivery_is_retried() {
        let flaky = Arc::new(Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let mut bus = EventBus::new(3);
        bus.subscribe(flaky.clone());

        assert_eq!(bus.emit(&plan_event()), 1);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_exhausted_delivery_is_dropped() {
        let flaky = Arc::new(Flaky {
            failures: 10,
            calls: AtomicU32::new(0),
        });
        let collector = Arc::new(EventCollector::new());
        let mut bus = EventBus::new(2);
        bus.subscribe(flaky.clone());
        bus.subscribe(collector.clone());

        assert_eq!(bus.emit(&plan_event()), 1);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
        assert_eq!(collector.kinds(), vec![EventKind::PlanStart]);
    }

    #[test]
    fn test_deduplicating_listener() {
        let listener = DeduplicatingListener::new(EventCollector::new());
        let event = plan_event();

        listener.on_event(&event).unwrap();
        listener.on_event(&event).unwrap();
        listener.on_event(&plan_event()).unwrap();

        assert_eq!(listener.inner().events().len(), 2);
    }

    #[test]
    fn test_event_kind_serialization() {
        let json = serde_json::to_string(&EventKind::NodeStatusUpdate).unwrap();
        assert_eq!(json, "\"NODE_STATUS_UPDATE\"");
        assert_eq!(EventKind::PlanEnd.to_string(), "PLAN_END");
    }
}
