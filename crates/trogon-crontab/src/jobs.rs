//! Job definitions loaded from disk, and the NATS publish action they dispatch.
//!
//! A job file is a JSON array:
//!
//! ```json
//! [
//!   {
//!     "id": "backup",
//!     "schedule": { "type": "cron", "expr": "0 3 * * Sun" },
//!     "subject": "cron.backup",
//!     "payload": { "db": "main" }
//!   },
//!   {
//!     "id": "health",
//!     "schedule": { "type": "interval", "interval_sec": 30 },
//!     "subject": "cron.health",
//!     "enabled": false
//!   }
//! ]
//! ```

use std::future::Future;
use std::path::Path;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::{CronError, DispatchError},
    registry::JobRegistry,
    schedule::ScheduleSpec,
};

/// Name of the built-in job that logs once a minute while this process leads.
pub const HEARTBEAT_JOB: &str = "crontab.heartbeat";

const SUBJECT_PREFIX: &str = "cron.";

/// Publish a tick notification to a NATS subject.
///
/// One trait, one operation. Implement this to replace the publish step in tests.
pub trait TickPublisher: Send + Sync + Clone + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn publish_tick(
        &self,
        subject: String,
        headers: async_nats::HeaderMap,
        payload: Bytes,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

impl TickPublisher for async_nats::Client {
    type Error = async_nats::client::PublishError;

    async fn publish_tick(
        &self,
        subject: String,
        headers: async_nats::HeaderMap,
        payload: Bytes,
    ) -> Result<(), Self::Error> {
        self.publish_with_headers(subject, headers, payload).await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub id: String,
    pub schedule: ScheduleSpec,
    pub subject: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

fn default_enabled() -> bool {
    true
}

impl JobConfig {
    fn validate(&self) -> Result<(), CronError> {
        if self.id.trim().is_empty() {
            return Err(CronError::InvalidJobConfig {
                reason: "id must not be empty".into(),
            });
        }
        if !self.subject.starts_with(SUBJECT_PREFIX) {
            return Err(CronError::InvalidJobConfig {
                reason: format!(
                    "subject for '{}' must start with '{SUBJECT_PREFIX}', got: {}",
                    self.id, self.subject
                ),
            });
        }
        if self
            .subject
            .chars()
            .any(|c| c.is_whitespace() || c == '*' || c == '>')
        {
            return Err(CronError::InvalidJobConfig {
                reason: format!("subject for '{}' must be a literal subject: {}", self.id, self.subject),
            });
        }
        Ok(())
    }
}

/// Message body published on every fire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickPayload {
    pub job_id: String,
    pub fired_at: DateTime<Utc>,
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Read and parse a job file. Does not validate entries; see [`register_jobs`].
pub fn load_job_file(path: &Path) -> Result<Vec<JobConfig>, CronError> {
    let raw = std::fs::read_to_string(path)?;
    let configs: Vec<JobConfig> = serde_json::from_str(&raw)?;
    debug!(path = %path.display(), count = configs.len(), "Loaded job file");
    Ok(configs)
}

/// Register every enabled entry as a job that publishes a [`TickPayload`] to its subject.
///
/// Fails on the first invalid entry, leaving earlier entries registered.
/// Returns the number of jobs registered.
pub fn register_jobs<P: TickPublisher>(
    registry: &mut JobRegistry,
    configs: Vec<JobConfig>,
    publisher: P,
) -> Result<usize, CronError> {
    let mut registered = 0;
    for config in configs {
        if !config.enabled {
            info!(job = %config.id, "Job disabled, skipping");
            continue;
        }
        config.validate()?;

        let JobConfig {
            id,
            schedule,
            subject,
            payload,
            ..
        } = config;
        let publisher = publisher.clone();
        let job_id = id.clone();
        registry.register(id, schedule, move || {
            publish_tick(publisher.clone(), subject.clone(), job_id.clone(), payload.clone())
        })?;
        registered += 1;
    }
    Ok(registered)
}

async fn publish_tick<P: TickPublisher>(
    publisher: P,
    subject: String,
    job_id: String,
    payload: Option<serde_json::Value>,
) -> Result<(), DispatchError> {
    let tick = TickPayload {
        job_id,
        fired_at: Utc::now(),
        execution_id: Uuid::new_v4().to_string(),
        payload,
    };
    let body = serde_json::to_vec(&tick)?;

    let mut headers = async_nats::HeaderMap::new();
    // JetStream uses this for duplicate detection if the subject is captured by a stream.
    headers.insert("Nats-Msg-Id", tick.execution_id.as_str());

    publisher
        .publish_tick(subject.clone(), headers, body.into())
        .await?;
    debug!(job = %tick.job_id, subject, execution_id = %tick.execution_id, "Published tick");
    Ok(())
}

/// Register [`HEARTBEAT_JOB`], logging one line per minute.
pub fn register_heartbeat(registry: &mut JobRegistry) -> Result<(), CronError> {
    registry.register(HEARTBEAT_JOB, ScheduleSpec::cron("* * * * *"), || async {
        info!("Scheduler heartbeat");
        Ok::<(), DispatchError>(())
    })?;
    Ok(())
}
