use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, warn};
use trogon_crontab::{
    CronError, JobRegistry, Settings, ShutdownController, Supervisor,
    config::SystemEnv,
    jobs, lease,
    shutdown::{diagnostic, exit_code},
};

#[derive(Parser, Debug)]
#[command(name = "trogon-crontab", about = "Run scheduled jobs from a single elected leader")]
struct Args {
    /// JSON file with job definitions; each job publishes a tick to its NATS subject.
    #[arg(long, env = "CRONTAB_JOBS_FILE")]
    jobs: Option<PathBuf>,

    /// Do not register the built-in once-a-minute heartbeat job.
    #[arg(long)]
    no_heartbeat: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let result = run(args).await;

    if let Err(e) = &result {
        match diagnostic(e) {
            Some(line) => eprintln!("{line}"),
            None => error!(error = %e, "Scheduler exited with error"),
        }
    }
    exit_code(&result)
}

async fn run(args: Args) -> Result<(), CronError> {
    let settings = Settings::from_env(&SystemEnv);
    info!(
        lease_ttl_secs = settings.lease_ttl.as_secs(),
        renewal_interval_secs = settings.renewal_interval.as_secs(),
        acquisition_timeout_secs = settings.acquisition_timeout.as_secs(),
        max_retries = ?settings.retry.max_retries,
        timezone = %settings.timezone,
        "Loaded scheduler settings"
    );

    let client = match &settings.nats {
        Some(nats) => Some(lease::connect(nats).await?),
        None => None,
    };

    let mut registry = JobRegistry::with_timezone(settings.timezone);
    if !args.no_heartbeat {
        jobs::register_heartbeat(&mut registry)?;
    }
    if let Some(path) = &args.jobs {
        let configs = jobs::load_job_file(path)?;
        match &client {
            Some(client) => {
                let n = jobs::register_jobs(&mut registry, configs, client.clone())?;
                info!(path = %path.display(), jobs = n, "Registered jobs from file");
            }
            None if configs.iter().any(|c| c.enabled) => {
                return Err(CronError::InvalidJobConfig {
                    reason: format!(
                        "{} defines publish jobs but NATS_URL is not set",
                        path.display()
                    ),
                });
            }
            None => warn!(path = %path.display(), "Job file has no enabled jobs"),
        }
    }
    if registry.is_empty() {
        warn!("No jobs registered; the scheduler will only hold the lease");
    }

    let lease = lease::from_client(client, &settings).await?;
    let shutdown = ShutdownController::new();
    let signals = shutdown.listen();

    info!(jobs = registry.len(), "Starting scheduler");
    let result = Supervisor::new(lease, registry, settings)
        .run(shutdown.token())
        .await;
    signals.abort();

    if result.is_ok() {
        info!("Scheduler stopped");
    }
    result
}
