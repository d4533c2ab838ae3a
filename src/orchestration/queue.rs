//! Message Queue
//!
//! At-least-once delivery between the engine's workers:
//! - `poll` hands out a message and hides it for the visibility timeout
//! - `ack` removes it for good, `nack` makes it visible again
//! - a message neither acked nor nacked in time is redelivered
//!
//! Handlers therefore see duplicates and must be idempotent.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::delegate::TaskResult;

/// Work items consumed by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Facilitate and invoke a queued node execution.
    StartNode { node_execution_id: String },
    /// An execution pool finished a task.
    TaskResponse { task_id: String, result: TaskResult },
    /// An external system answered an async step.
    AsyncResponse { correlation_id: String, payload: Value },
    /// A child reached a final state; the parent may be able to finish.
    ChildCompleted { parent_id: String, child_id: String },
    ProcessInterrupt { interrupt_id: String },
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub id: u64,
    pub message: Message,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
}

pub trait MessageQueue: Send + Sync {
    fn publish(&self, message: Message);

    /// Publishes `message` once `delay` has passed.
    fn publish_delayed(&self, message: Message, delay: Duration);

    /// Waits up to `wait` for a visible message.
    fn poll(&self, wait: Duration) -> Option<Delivery>;

    fn ack(&self, delivery_id: u64);

    /// Returns the message to the queue for immediate redelivery.
    fn nack(&self, delivery_id: u64);

    /// Messages ready, delayed or in flight.
    fn pending(&self) -> usize;

    fn is_idle(&self) -> bool {
        self.pending() == 0
    }
}

#[derive(Debug, Clone)]
struct Envelope {
    id: u64,
    message: Message,
    deliveries: u32,
}

#[derive(Default)]
struct QueueState {
    next_id: u64,
    ready: VecDeque<Envelope>,
    delayed: Vec<(Instant, Envelope)>,
    in_flight: HashMap<u64, (Instant, Envelope)>,
}

impl QueueState {
    fn envelope(&mut self, message: Message) -> Envelope {
        self.next_id += 1;
        Envelope {
            id: self.next_id,
            message,
            deliveries: 0,
        }
    }

    /// Moves due delayed messages and timed-out deliveries to `ready`.
    fn promote(&mut self, now: Instant) {
        let mut due = Vec::new();
        self.delayed.retain(|(at, envelope)| {
            if *at <= now {
                due.push(envelope.clone());
                false
            } else {
                true
            }
        });
        self.ready.extend(due);

        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some((_, envelope)) = self.in_flight.remove(&id) {
                debug!("Delivery {} timed out - redelivering", id);
                self.ready.push_back(envelope);
            }
        }
    }

    /// Earliest instant at which something becomes visible.
    fn next_wakeup(&self) -> Option<Instant> {
        let delayed = self.delayed.iter().map(|(at, _)| *at);
        let in_flight = self.in_flight.values().map(|(deadline, _)| *deadline);
        delayed.chain(in_flight).min()
    }
}

/// Process-local queue guarded by a mutex and a condition variable.
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    visibility_timeout: Duration,
}

impl InMemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            visibility_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl MessageQueue for InMemoryQueue {
    fn publish(&self, message: Message) {
        let mut state = self.lock();
        let envelope = state.envelope(message);
        state.ready.push_back(envelope);
        drop(state);
        self.available.notify_one();
    }

    fn publish_delayed(&self, message: Message, delay: Duration) {
        if delay.is_zero() {
            return self.publish(message);
        }
        let mut state = self.lock();
        let envelope = state.envelope(message);
        state.delayed.push((Instant::now() + delay, envelope));
        drop(state);
        self.available.notify_all();
    }

    fn poll(&self, wait: Duration) -> Option<Delivery> {
        let deadline = Instant::now() + wait;
        let mut state = self.lock();

        loop {
            let now = Instant::now();
            state.promote(now);

            if let Some(mut envelope) = state.ready.pop_front() {
                envelope.deliveries += 1;
                let delivery = Delivery {
                    id: envelope.id,
                    message: envelope.message.clone(),
                    attempt: envelope.deliveries,
                };
                state
                    .in_flight
                    .insert(envelope.id, (now + self.visibility_timeout, envelope));
                return Some(delivery);
            }

            if now >= deadline {
                return None;
            }

            let wake_at = state
                .next_wakeup()
                .map_or(deadline, |at| at.min(deadline));
            let timeout = wake_at.saturating_duration_since(now);
            state = self
                .available
                .wait_timeout(state, timeout)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn ack(&self, delivery_id: u64) {
        self.lock().in_flight.remove(&delivery_id);
    }

    fn nack(&self, delivery_id: u64) {
        let mut state = self.lock();
        if let Some((_, envelope)) = state.in_flight.remove(&delivery_id) {
            state.ready.push_back(envelope);
            drop(state);
            self.available.notify_one();
        }
    }

    fn pending(&self) -> usize {
        let state = self.lock();
        state.ready.len() + state.delayed.len() + state.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn start(id: &str) -> Message {
        Message::StartNode {
            node_execution_id: id.to_string(),
        }
    }

    #[test]
    fn test_fifo_and_ack() {
        let queue = InMemoryQueue::default();
        queue.publish(start("a"));
        queue.publish(start("b"));

        let first = queue.poll(Duration::ZERO).unwrap();
        assert_eq!(first.message, start("a"));
        assert_eq!(first.attempt, 1);
        queue.ack(first.id);

        let second = queue.poll(Duration::ZERO).unwrap();
        assert_eq!(second.message, start("b"));
        queue.ack(second.id);

        assert!(queue.poll(Duration::ZERO).is_none());
        assert!(queue.is_idle());
    }

    #[test]
    fn test_nack_redelivers() {
        let queue = InMemoryQueue::default();
        queue.publish(start("a"));

        let first = queue.poll(Duration::ZERO).unwrap();
        queue.nack(first.id);

        let again = queue.poll(Duration::ZERO).unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.attempt, 2);
    }

    #[test]
    fn test_visibility_timeout_redelivers() {
        let queue = InMemoryQueue::new(Duration::from_millis(20));
        queue.publish(start("a"));

        let first = queue.poll(Duration::ZERO).unwrap();
        assert!(queue.poll(Duration::ZERO).is_none());
        assert_eq!(queue.pending(), 1);

        let again = queue.poll(Duration::from_millis(500)).unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.attempt, 2);
    }

    #[test]
    fn test_delayed_publish() {
        let queue = InMemoryQueue::default();
        queue.publish_delayed(start("later"), Duration::from_millis(30));

        assert!(queue.poll(Duration::ZERO).is_none());
        assert_eq!(queue.pending(), 1);

        let delivery = queue.poll(Duration::from_millis(500)).unwrap();
        assert_eq!(delivery.message, start("later"));
    }

    #[test]
    fn test_poll_wakes_on_publish() {
        let queue = Arc::new(InMemoryQueue::default());
        let producer = Arc::clone(&queue);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.publish(start("x"));
        });

        let delivery = queue.poll(Duration::from_secs(5));
        handle.join().unwrap();
        assert_eq!(delivery.unwrap().message, start("x"));
    }

    #[test]
    fn test_message_json_tag() {
        let value = serde_json::to_value(start("n1")).unwrap();
        assert_eq!(value["type"], "start_node");
        assert_eq!(value["node_execution_id"], "n1");
    }
}
