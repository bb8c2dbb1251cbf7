use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{clock::Clock, error::CronError, registry::Job};

/// Outcome of one [`SchedulingLoop::tick`].
#[derive(Debug, Default)]
pub struct TickReport {
    /// Jobs whose action completed successfully, in dispatch order.
    pub dispatched: Vec<String>,
    /// One `CronError::JobDispatch` per failed or panicked action.
    pub failures: Vec<CronError>,
}

impl TickReport {
    pub fn fired(&self) -> usize {
        self.dispatched.len() + self.failures.len()
    }
}

/// Fires registered jobs at their trigger instants while the lease is held.
///
/// Entries are keyed by `(next_fire, registration index)` so jobs sharing an instant
/// are dispatched in registration order. Interval jobs fire on a grid anchored at the
/// loop's start, so late wake-ups never shift later fires.
pub struct SchedulingLoop<C: Clock> {
    clock: C,
    anchor: DateTime<Utc>,
    queue: BTreeMap<(DateTime<Utc>, usize), Job>,
}

impl<C: Clock> SchedulingLoop<C> {
    /// Seed every job's first fire instant strictly after the clock's current time.
    /// Instants missed before this run started are not replayed.
    pub fn new(jobs: &[Job], clock: C) -> Self {
        let now = clock.now();
        let mut queue = BTreeMap::new();
        for (seq, job) in jobs.iter().enumerate() {
            match job.trigger().next_fire_from(now, now) {
                Some(at) => {
                    queue.insert((at, seq), job.clone());
                }
                None => warn!(job = %job.name(), "Schedule has no upcoming fire time, skipping"),
            }
        }
        Self {
            clock,
            anchor: now,
            queue,
        }
    }

    /// Earliest pending fire instant across all jobs.
    pub fn next_wake(&self) -> Option<DateTime<Utc>> {
        self.queue.keys().next().map(|(at, _)| *at)
    }

    /// Pending `(job, next_fire)` pairs in dispatch order.
    pub fn upcoming(&self) -> Vec<(&str, DateTime<Utc>)> {
        self.queue
            .iter()
            .map(|((at, _), job)| (job.name(), *at))
            .collect()
    }

    /// Dispatch every job due at `now` exactly once, then reschedule it strictly after `now`.
    ///
    /// A failing or panicking action is reported in the returned [`TickReport`]; it never
    /// stops the tick or changes other jobs' schedules.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        while let Some(entry) = self.queue.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((fire_at, seq), job) = entry.remove_entry();
            debug!(job = %job.name(), %fire_at, "Dispatching job");

            let outcome = AssertUnwindSafe(async { job.dispatch().await })
                .catch_unwind()
                .await;
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(panic) => Some(panic_message(panic.as_ref())),
            };
            match failure {
                None => report.dispatched.push(job.name().to_string()),
                Some(reason) => {
                    warn!(job = %job.name(), error = %reason, "Job dispatch failed");
                    report.failures.push(CronError::JobDispatch {
                        job: job.name().to_string(),
                        reason,
                    });
                }
            }

            match job.trigger().next_fire_from(self.anchor, now) {
                Some(next) => {
                    self.queue.insert((next, seq), job);
                }
                None => debug!(job = %job.name(), "Schedule exhausted"),
            }
        }

        report
    }

    /// Tick and sleep until `cancel` fires. Cancellation interrupts the sleep immediately.
    pub async fn run(&mut self, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            let now = self.clock.now();
            let report = self.tick(now).await;
            if report.fired() > 0 {
                debug!(
                    dispatched = report.dispatched.len(),
                    failed = report.failures.len(),
                    "Tick complete"
                );
            }

            let wait = self
                .next_wake()
                .map(|at| (at - self.clock.now()).to_std().unwrap_or(Duration::ZERO));
            let sleep = async {
                match wait {
                    Some(wait) => tokio::time::sleep(wait).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep => {}
            }
        }
        debug!("Scheduling loop stopped");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
