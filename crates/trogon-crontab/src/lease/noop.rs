use std::time::Duration;

use super::Lease;
use crate::error::CronError;

/// Lease for single-instance deployments with no shared store.
///
/// `acquire` always succeeds immediately; `renew` and `release` do nothing.
#[derive(Debug, Clone)]
pub struct NoopLease {
    resource: String,
}

impl NoopLease {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
        }
    }
}

impl Lease for NoopLease {
    fn resource(&self) -> &str {
        &self.resource
    }

    async fn acquire(&self, _timeout: Duration) -> Result<(), CronError> {
        Ok(())
    }

    async fn renew(&self, _ttl: Duration) -> Result<(), CronError> {
        Ok(())
    }

    async fn release(&self) {}

    fn is_held(&self) -> bool {
        false
    }
}
