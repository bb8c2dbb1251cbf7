//! # trogon-crontab
//!
//! Cron scheduler for a fleet of identical processes where at most one of them
//! dispatches jobs at any instant.
//!
//! ## Features
//!
//! - Five-field crontab schedules (literal day-of-week names only) or fixed intervals,
//!   evaluated in a configurable timezone.
//! - Leader lease over a NATS KV bucket with TTL expiry: acquired at start, renewed on
//!   a fixed cadence, released on every exit path. Without NATS a no-op lease is used.
//! - Renewal failure stops the scheduling loop immediately; optional auto-retry
//!   re-enters acquisition.
//! - One cancellation token drives shutdown on SIGHUP / SIGTERM / SIGINT.
//! - Missed fire instants are skipped, never replayed.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use trogon_crontab::{JobRegistry, ScheduleSpec, Settings, ShutdownController, Supervisor, lease};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), trogon_crontab::CronError> {
//!     let settings = Settings::default();
//!     let mut registry = JobRegistry::with_timezone(settings.timezone);
//!     registry.register("report", ScheduleSpec::cron("0 8 * * Mon-Fri"), || async {
//!         Ok::<(), trogon_crontab::DispatchError>(())
//!     })?;
//!
//!     let lease = lease::from_settings(&settings).await?;
//!     let shutdown = ShutdownController::new();
//!     let _signals = shutdown.listen();
//!     Supervisor::new(lease, registry, settings).run(shutdown.token()).await
//! }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod jobs;
pub mod lease;
pub mod registry;
pub mod schedule;
pub mod scheduler;
pub mod shutdown;
pub mod supervisor;

#[cfg(any(test, feature = "test-support"))]
pub mod mocks;

pub use clock::{Clock, SystemClock};
pub use config::{RetryPolicy, Settings};
pub use error::{CronError, DispatchError};
pub use lease::{Lease, LeaseBackend};
pub use registry::{Job, JobRegistry};
pub use schedule::ScheduleSpec;
pub use scheduler::{SchedulingLoop, TickReport};
pub use shutdown::ShutdownController;
pub use supervisor::{RunState, Supervisor};
