use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    clock::{Clock, SystemClock},
    config::Settings,
    error::CronError,
    lease::Lease,
    registry::{Job, JobRegistry},
    scheduler::SchedulingLoop,
};

/// Where one supervisor currently is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Acquiring,
    /// Lease held, scheduling loop active.
    Leading,
    RenewFailed,
    Stopped,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Acquiring => "acquiring",
            Self::Leading => "leading",
            Self::RenewFailed => "renew-failed",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Runs the scheduling loop only while this process holds the lease.
///
/// Per run: acquire (retrying on contention if allowed), lead with a concurrent
/// renewal task, and on renewal failure stop the loop immediately and re-enter
/// acquisition or surface `LockLost`. The lease is released on every exit path.
pub struct Supervisor<L: Lease, C: Clock = SystemClock> {
    lease: L,
    jobs: Vec<Job>,
    settings: Settings,
    clock: C,
    state: watch::Sender<RunState>,
}

impl<L: Lease> Supervisor<L> {
    pub fn new(lease: L, registry: JobRegistry, settings: Settings) -> Self {
        Self::with_clock(lease, registry, settings, SystemClock)
    }
}

impl<L: Lease, C: Clock> Supervisor<L, C> {
    pub fn with_clock(lease: L, registry: JobRegistry, settings: Settings, clock: C) -> Self {
        let (state, _) = watch::channel(RunState::Stopped);
        Self {
            lease,
            jobs: registry.all().to_vec(),
            settings: settings.normalized(),
            clock,
            state,
        }
    }

    pub fn lease(&self) -> &L {
        &self.lease
    }

    /// Observe state transitions.
    pub fn state(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: RunState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(resource = %self.lease.resource(), from = %previous, to = %state, "Scheduler state changed");
        }
    }

    /// Run until `cancel` fires (returns `Ok`) or a lock failure exhausts the retry policy.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), CronError> {
        let mut contended = 0u32;
        let mut lost = 0u32;

        let result = loop {
            self.set_state(RunState::Acquiring);
            let acquired = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                res = self.lease.acquire(self.settings.acquisition_timeout) => res,
            };

            if let Err(e) = acquired {
                contended += 1;
                if !self.settings.retry.allows(contended) {
                    break Err(e);
                }
                let retry_in_secs = self.settings.renewal_interval.as_secs_f64();
                if e.is_lock_failure() {
                    info!(
                        resource = %self.lease.resource(),
                        attempt = contended,
                        retry_in_secs,
                        "Lease held by another scheduler, retrying"
                    );
                } else {
                    warn!(
                        resource = %self.lease.resource(),
                        attempt = contended,
                        retry_in_secs,
                        error = %e,
                        "Lease store unavailable, retrying"
                    );
                }
                if !self.pause(&cancel).await {
                    break Ok(());
                }
                continue;
            }
            contended = 0;

            match self.lead(&cancel).await {
                Ok(()) => break Ok(()),
                Err(e) => {
                    self.set_state(RunState::RenewFailed);
                    lost += 1;
                    if !self.settings.retry.allows(lost) || cancel.is_cancelled() {
                        break Err(e);
                    }
                    warn!(resource = %self.lease.resource(), error = %e, attempt = lost, "Lease lost, re-acquiring");
                }
            }
        };

        self.lease.release().await;
        self.set_state(RunState::Stopped);
        if let Err(e) = &result {
            error!(resource = %self.lease.resource(), error = %e, "Scheduler stopped on lock failure");
        }
        result
    }

    /// One leading run. Returns `Err(LockLost)` if renewal failed.
    async fn lead(&self, cancel: &CancellationToken) -> Result<(), CronError> {
        self.set_state(RunState::Leading);
        info!(resource = %self.lease.resource(), jobs = self.jobs.len(), "Leading, starting scheduling loop");

        let run = cancel.child_token();
        let renewal = tokio::spawn(renew_until_stopped(
            self.lease.clone(),
            self.settings.lease_ttl,
            self.settings.renewal_interval,
            run.clone(),
        ));

        let mut scheduling = SchedulingLoop::new(&self.jobs, self.clock.clone());
        scheduling.run(run.clone()).await;
        run.cancel();

        let outcome = match renewal.await {
            Ok(outcome) => outcome,
            Err(e) => Err(CronError::LockLost {
                resource: self.lease.resource().to_string(),
                reason: format!("renewal task failed: {e}"),
            }),
        };
        self.lease.release().await;
        outcome
    }

    /// Wait one renewal interval. `false` if cancelled first.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.settings.renewal_interval) => true,
        }
    }
}

/// Renew every `every` until `stop` fires. On failure, cancel `stop` so the
/// scheduling loop wakes immediately, and return the error.
async fn renew_until_stopped<L: Lease>(
    lease: L,
    ttl: Duration,
    every: Duration,
    stop: CancellationToken,
) -> Result<(), CronError> {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        if let Err(e) = lease.renew(ttl).await {
            error!(resource = %lease.resource(), error = %e, "Lease renewal failed, stopping scheduling loop");
            stop.cancel();
            return Err(e);
        }
    }
}
