//! Execution Timeline
//!
//! An event listener that tracks node start/end times for execution
//! reports and Gantt charts.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};

use super::events::{EventKind, EventListener, OrchestrationEvent};
use crate::execution::Status;

/// Start and end of one node execution.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpan {
    pub identifier: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub status: Status,
}

impl NodeSpan {
    pub fn duration_ms(&self) -> Option<i64> {
        self.end.map(|end| (end - self.start).num_milliseconds().max(0))
    }
}

#[derive(Debug, Default)]
struct TimelineState {
    started: Option<DateTime<Utc>>,
    finished: Option<DateTime<Utc>>,
    /// Spans in start order, keyed by node execution id.
    order: Vec<String>,
    spans: HashMap<String, NodeSpan>,
}

/// Records node spans from `NODE_START` / `NODE_END` events.
#[derive(Debug, Default)]
pub struct TimelineListener {
    state: Mutex<TimelineState>,
}

impl TimelineListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spans(&self) -> Vec<NodeSpan> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .order
            .iter()
            .filter_map(|id| state.spans.get(id).cloned())
            .collect()
    }

    /// Finished spans' durations in milliseconds, by identifier.
    pub fn durations(&self) -> HashMap<String, i64> {
        self.spans()
            .into_iter()
            .filter_map(|span| span.duration_ms().map(|ms| (span.identifier, ms)))
            .collect()
    }

    /// Renders an ASCII Gantt chart.
    ///
    /// Each finished node is shown as a bar indicating when it ran
    /// relative to the whole plan execution.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let spans = self.spans();
        let (origin, last) = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let origin = state
                .started
                .or_else(|| spans.iter().map(|s| s.start).min());
            let last = state
                .finished
                .or_else(|| spans.iter().filter_map(|s| s.end).max());
            (origin, last)
        };

        let (Some(origin), Some(last)) = (origin, last) else {
            return output;
        };

        let total_ms = (last - origin).num_milliseconds();
        if total_ms <= 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_ms as f64;

        for span in spans {
            let Some(end) = span.end else { continue };
            let start_ms = (span.start - origin).num_milliseconds().max(0);
            let duration_ms = (end - span.start).num_milliseconds().max(0);

            let start_pos = (start_ms as f64 * scale) as usize;
            let width = (duration_ms as f64 * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&"#".repeat(width));

            output.push_str(&format!(
                "{:12} |{:50}| {:>13} ({} ms)\n",
                truncate(&span.identifier, 12),
                bar,
                span.status,
                duration_ms
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_ms));
        output
    }
}

impl EventListener for TimelineListener {
    fn name(&self) -> &str {
        "timeline"
    }

    fn on_event(&self, event: &OrchestrationEvent) -> Result<(), String> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        match event.kind {
            EventKind::PlanStart => {
                state.started.get_or_insert(event.timestamp);
            }
            EventKind::PlanEnd => state.finished = Some(event.timestamp),
            EventKind::NodeStart => {
                let Some(id) = event.node_execution_id.clone() else {
                    return Ok(());
                };
                if !state.spans.contains_key(&id) {
                    state.order.push(id.clone());
                    state.spans.insert(
                        id,
                        NodeSpan {
                            identifier: event.identifier.clone().unwrap_or_default(),
                            start: event.timestamp,
                            end: None,
                            status: event.status,
                        },
                    );
                }
            }
            EventKind::NodeEnd | EventKind::NodeStatusUpdate => {
                let Some(id) = event.node_execution_id.as_ref() else {
                    return Ok(());
                };
                if let Some(span) = state.spans.get_mut(id) {
                    span.status = event.status;
                    if event.kind == EventKind::NodeEnd {
                        span.end = Some(event.timestamp);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Truncates a string to a maximum length.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn node_event(kind: EventKind, id: &str, at: DateTime<Utc>, status: Status) -> OrchestrationEvent {
        OrchestrationEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            kind,
            plan_execution_id: "pe".into(),
            node_execution_id: Some(id.into()),
            node_id: Some(format!("node-{}", id)),
            identifier: Some(id.into()),
            status,
            timestamp: at,
        }
    }

    fn plan_event(kind: EventKind, at: DateTime<Utc>) -> OrchestrationEvent {
        OrchestrationEvent {
            node_execution_id: None,
            node_id: None,
            ..node_event(kind, "plan", at, Status::Running)
        }
    }

    #[test]
    fn test_durations_from_events() {
        let t0 = Utc::now();
        let timeline = TimelineListener::new();

        timeline.on_event(&node_event(EventKind::NodeStart, "build", t0, Status::Running)).unwrap();
        timeline
            .on_event(&node_event(
                EventKind::NodeEnd,
                "build",
                t0 + Duration::milliseconds(120),
                Status::Succeeded,
            ))
            .unwrap();

        let durations = timeline.durations();
        assert_eq!(durations.get("build"), Some(&120));
        assert_eq!(timeline.spans()[0].status, Status::Succeeded);
    }

    #[test]
    fn test_unfinished_span_has_no_duration() {
        let timeline = TimelineListener::new();
        timeline
            .on_event(&node_event(EventKind::NodeStart, "wait", Utc::now(), Status::Running))
            .unwrap();
        assert!(timeline.durations().is_empty());
    }

    #[test]
    fn test_gantt_chart_generation() {
        let t0 = Utc::now();
        let timeline = TimelineListener::new();

        timeline.on_event(&plan_event(EventKind::PlanStart, t0)).unwrap();
        timeline.on_event(&node_event(EventKind::NodeStart, "step1", t0, Status::Running)).unwrap();
        timeline
            .on_event(&node_event(
                EventKind::NodeEnd,
                "step1",
                t0 + Duration::milliseconds(50),
                Status::Succeeded,
            ))
            .unwrap();
        timeline
            .on_event(&node_event(
                EventKind::NodeStart,
                "step2",
                t0 + Duration::milliseconds(50),
                Status::Running,
            ))
            .unwrap();
        timeline
            .on_event(&node_event(
                EventKind::NodeEnd,
                "step2",
                t0 + Duration::milliseconds(100),
                Status::Failed,
            ))
            .unwrap();
        timeline
            .on_event(&plan_event(EventKind::PlanEnd, t0 + Duration::milliseconds(100)))
            .unwrap();

        let chart = timeline.gantt_chart();
        assert!(chart.contains("step1"));
        assert!(chart.contains("step2"));
        assert!(chart.contains("FAILED"));
        assert!(chart.contains("Total: 100 ms"));
    }

    #[test]
    fn test_gantt_chart_empty() {
        let chart = TimelineListener::new().gantt_chart();
        assert!(chart.contains("Timeline"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 8), "short   ");
        assert_eq!(truncate("a-very-long-identifier", 8), "a-ver...");
    }
}
