/// Boxed error returned by a job's dispatch action.
pub type DispatchError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug)]
pub enum CronError {
    /// Rejected at registration time. Never retried.
    InvalidSchedule { expr: String, reason: String },
    /// Another process holds the lease and the acquisition timeout elapsed.
    LockUnavailable { resource: String },
    /// The lease could not be renewed: it expired or is owned by someone else.
    LockLost { resource: String, reason: String },
    /// A single job's action failed. Reported, never propagated out of a run.
    JobDispatch { job: String, reason: String },
    InvalidJobConfig { reason: String },
    Store(String),
    Serde(serde_json::Error),
    Io(std::io::Error),
}

impl CronError {
    pub fn is_lock_failure(&self) -> bool {
        matches!(self, Self::LockUnavailable { .. } | Self::LockLost { .. })
    }
}

impl std::fmt::Display for CronError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSchedule { expr, reason } => {
                write!(f, "Invalid schedule '{expr}': {reason}")
            }
            Self::LockUnavailable { resource } => {
                write!(f, "another scheduler is already running (lock '{resource}' is held)")
            }
            Self::LockLost { resource, reason } => {
                write!(f, "lock lost, shutting down (lock '{resource}': {reason})")
            }
            Self::JobDispatch { job, reason } => write!(f, "Job '{job}' failed: {reason}"),
            Self::InvalidJobConfig { reason } => write!(f, "Invalid job config: {reason}"),
            Self::Store(msg) => write!(f, "Lock store error: {msg}"),
            Self::Serde(e) => write!(f, "Serialization error: {e}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for CronError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Serde(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CronError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serde(e)
    }
}

impl From<std::io::Error> for CronError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
