//! Deadline and Retention Sweeper
//!
//! Periodic housekeeping:
//! - waiting nodes past their deadline get an EXPIRE interrupt
//! - plan executions past their retention deadline are purged

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use super::engine::Engine;
use super::interrupt::InterruptRequest;
use crate::error::{OrchestrationError, Result};
use crate::execution::{InterruptType, NodeExecutionQuery, Status};

/// Granularity at which the sweeper loop notices `stop`.
const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// EXPIRE interrupts registered.
    pub expired: usize,
    /// Plan executions removed.
    pub purged: usize,
}

impl Engine {
    /// Runs one sweep as of `now`.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let waiting = self.store().find(&NodeExecutionQuery::default().with_statuses([
            Status::AsyncWaiting,
            Status::TaskWaiting,
            Status::InterventionWaiting,
        ]));

        let mut report = SweepReport::default();
        for record in waiting
            .iter()
            .filter(|r| r.deadline.map_or(false, |deadline| deadline <= now))
        {
            let request =
                InterruptRequest::node(InterruptType::Expire, &record.plan_execution_id, &record.uuid);
            match self.register(request) {
                Ok((_, true)) => report.expired += 1,
                Ok((_, false)) => {}
                Err(OrchestrationError::InterruptRejected(reason)) => {
                    debug!("Not expiring '{}': {}", record.identifier, reason);
                }
                Err(e) => warn!("Could not expire '{}': {}", record.identifier, e),
            }
        }

        report.purged = self.store().purge_expired(now);
        if report != SweepReport::default() {
            info!(
                "Sweep: {} node(s) expired, {} plan execution(s) purged",
                report.expired, report.purged
            );
        }
        Ok(report)
    }

    /// Sweeps every configured interval until `stop` is set.
    pub fn run_sweeper(&self, stop: &AtomicBool) {
        let interval = self.config().sweep_interval();
        while !stop.load(Ordering::SeqCst) {
            if let Err(e) = self.sweep(Utc::now()) {
                warn!("Sweep failed: {}", e);
            }

            let next = Instant::now() + interval;
            while !stop.load(Ordering::SeqCst) {
                let remaining = next.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                thread::sleep(remaining.min(STOP_CHECK_INTERVAL));
            }
        }
    }
}
