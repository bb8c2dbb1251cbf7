use std::future::Future;
use std::sync::Arc;

use chrono_tz::Tz;
use futures::FutureExt;
use futures::future::BoxFuture;

use crate::error::{CronError, DispatchError};
use crate::schedule::{ScheduleSpec, Trigger};

/// Zero-argument dispatch action. The scheduler only observes success or failure.
pub type JobAction = Arc<dyn Fn() -> BoxFuture<'static, Result<(), DispatchError>> + Send + Sync>;

/// A named job with exactly one schedule. Never mutated after registration.
#[derive(Clone)]
pub struct Job {
    name: String,
    schedule: ScheduleSpec,
    trigger: Trigger,
    action: JobAction,
}

impl Job {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schedule(&self) -> &ScheduleSpec {
        &self.schedule
    }

    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    pub fn dispatch(&self) -> BoxFuture<'static, Result<(), DispatchError>> {
        (self.action)()
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}

/// Jobs known to the scheduler, in registration order.
///
/// Populated by application setup code before the scheduler starts and handed to
/// [`Supervisor::new`](crate::Supervisor::new). Registering an existing name replaces
/// that job in place, so re-registration on restart is idempotent.
#[derive(Debug)]
pub struct JobRegistry {
    timezone: Tz,
    jobs: Vec<Job>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    /// Cron fields are evaluated in UTC.
    pub fn new() -> Self {
        Self::with_timezone(chrono_tz::UTC)
    }

    pub fn with_timezone(timezone: Tz) -> Self {
        Self {
            timezone,
            jobs: Vec::new(),
        }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Validate `schedule` and record the job. Invalid schedules are rejected here,
    /// not at fire time.
    pub fn register<F, Fut>(
        &mut self,
        name: impl Into<String>,
        schedule: ScheduleSpec,
        action: F,
    ) -> Result<&Job, CronError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DispatchError>> + Send + 'static,
    {
        let name = name.into();
        let trigger = Trigger::new(&schedule, self.timezone)?;
        let job = Job {
            name,
            schedule,
            trigger,
            action: Arc::new(move || action().boxed()),
        };

        let index = match self.jobs.iter().position(|j| j.name == job.name) {
            Some(index) => {
                tracing::info!(job = %job.name, schedule = %job.schedule, "Job replaced");
                self.jobs[index] = job;
                index
            }
            None => {
                tracing::info!(job = %job.name, schedule = %job.schedule, "Job registered");
                self.jobs.push(job);
                self.jobs.len() - 1
            }
        };
        Ok(&self.jobs[index])
    }

    /// Remove a job by name. Returns `false` if it was not registered.
    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.jobs.len();
        self.jobs.retain(|j| j.name != name);
        self.jobs.len() != before
    }

    pub fn clear(&mut self) {
        self.jobs.clear();
    }

    pub fn get(&self, name: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn all(&self) -> &[Job] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn noop() -> Result<(), DispatchError> {
        Ok(())
    }

    #[test]
    fn register_keeps_registration_order() {
        let mut registry = JobRegistry::new();
        registry.register("b", ScheduleSpec::every(10), noop).unwrap();
        registry.register("a", ScheduleSpec::cron("* * * * *"), noop).unwrap();

        let names: Vec<_> = registry.all().iter().map(Job::name).collect();
        assert_eq!(names, ["b", "a"]);
    }

    #[test]
    fn re_registering_replaces_schedule_without_duplicates() {
        let mut registry = JobRegistry::new();
        registry.register("report", ScheduleSpec::every(10), noop).unwrap();
        registry.register("other", ScheduleSpec::every(5), noop).unwrap();
        registry
            .register("report", ScheduleSpec::cron("0 8 * * Mon-Fri"), noop)
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.all()[0].name(), "report");
        assert_eq!(
            registry.get("report").unwrap().schedule(),
            &ScheduleSpec::cron("0 8 * * Mon-Fri")
        );
    }

    #[test]
    fn invalid_schedule_is_not_recorded() {
        let mut registry = JobRegistry::new();
        let err = registry
            .register("numeric", ScheduleSpec::cron("* * * * 1"), noop)
            .unwrap_err();

        assert!(matches!(err, CronError::InvalidSchedule { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn invalid_replacement_keeps_previous_job() {
        let mut registry = JobRegistry::new();
        registry.register("job", ScheduleSpec::every(10), noop).unwrap();
        assert!(registry.register("job", ScheduleSpec::every(0), noop).is_err());
        assert_eq!(registry.get("job").unwrap().schedule(), &ScheduleSpec::every(10));
    }

    #[test]
    fn unregister_and_clear() {
        let mut registry = JobRegistry::new();
        registry.register("a", ScheduleSpec::every(1), noop).unwrap();
        registry.register("b", ScheduleSpec::every(1), noop).unwrap();

        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert_eq!(registry.len(), 1);

        registry.clear();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn dispatch_runs_the_stored_action() {
        let mut registry = JobRegistry::new();
        registry
            .register("fails", ScheduleSpec::every(1), || async {
                Err::<(), DispatchError>("nope".into())
            })
            .unwrap();

        let err = registry.get("fails").unwrap().dispatch().await.unwrap_err();
        assert_eq!(err.to_string(), "nope");
    }
}
