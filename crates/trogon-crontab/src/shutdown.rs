use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::CronError;

/// Turns termination signals into one cancellation shared by the supervisor and
/// the scheduling loop. Only the first trigger has an effect.
#[derive(Clone, Default)]
pub struct ShutdownController {
    token: CancellationToken,
    triggered: Arc<AtomicBool>,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Cancel on the first call. Returns `false` for every later call.
    pub fn trigger(&self, reason: &str) -> bool {
        if self.triggered.swap(true, Ordering::SeqCst) {
            info!(reason, "Shutdown already in progress, ignoring");
            return false;
        }
        info!(reason, "Shutting down");
        self.token.cancel();
        true
    }

    /// Install handlers for SIGHUP, SIGTERM and SIGINT, then spawn a task that
    /// triggers on each of them. Handlers are in place when this returns. The task
    /// keeps listening after the first signal so repeats are absorbed; abort it on exit.
    #[cfg(unix)]
    pub fn listen(&self) -> JoinHandle<()> {
        use tokio::signal::unix::{SignalKind, signal};

        let kinds = [
            (SignalKind::hangup(), "SIGHUP"),
            (SignalKind::terminate(), "SIGTERM"),
            (SignalKind::interrupt(), "SIGINT"),
        ];
        let mut streams = Vec::with_capacity(kinds.len());
        for (kind, name) in kinds {
            match signal(kind) {
                Ok(stream) => streams.push((stream, name)),
                Err(error) => warn!(signal = name, error = %error, "Failed to install signal handler"),
            }
        }

        let controller = self.clone();
        tokio::spawn(async move {
            if streams.is_empty() {
                return;
            }
            loop {
                let received = futures::future::select_all(
                    streams
                        .iter_mut()
                        .map(|(stream, name)| Box::pin(async move { stream.recv().await.map(|_| *name) })),
                )
                .await
                .0;
                match received {
                    Some(name) => {
                        controller.trigger(name);
                    }
                    None => return,
                }
            }
        })
    }

    /// Spawn a task that triggers on every Ctrl+C; abort it on exit.
    #[cfg(not(unix))]
    pub fn listen(&self) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            loop {
                if let Err(error) = tokio::signal::ctrl_c().await {
                    warn!(error = %error, "Failed to install Ctrl+C handler");
                    return;
                }
                controller.trigger("Ctrl+C");
            }
        })
    }
}

/// One-line stderr message for lock failures that end the process.
pub fn diagnostic(error: &CronError) -> Option<&'static str> {
    match error {
        CronError::LockUnavailable { .. } => Some("Another scheduler is already running."),
        CronError::LockLost { .. } => Some("Lock lost, shutting down."),
        _ => None,
    }
}

/// 0 on graceful shutdown, 1 on any error.
pub fn exit_code(result: &Result<(), CronError>) -> ExitCode {
    ExitCode::from(exit_status(result))
}

fn exit_status(result: &Result<(), CronError>) -> u8 {
    match result {
        Ok(()) => 0,
        Err(_) => 1,
    }
}
