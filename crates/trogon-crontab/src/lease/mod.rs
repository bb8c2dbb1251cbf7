//! Time-bounded ownership of the scheduler-leader resource.
//!
//! [`from_settings`] picks the implementation once at startup: a [`NoopLease`] when
//! no NATS server is configured, a [`KvLease`] over NATS KV otherwise.

mod kv;
mod nats;
mod noop;

use std::future::Future;
use std::time::Duration;

pub use kv::{ACQUIRE_POLL_INTERVAL, KvLease, LockStore, LockStoreError};
pub use nats::{LEASE_BUCKET, NatsLockStore, connect};
pub use noop::NoopLease;

use crate::{config::Settings, error::CronError};

/// Name every scheduler process races for.
pub const LEASE_RESOURCE: &str = "scheduler-leader";

/// Acquire, renew, or release exclusive ownership of a named resource.
///
/// Three operations of one lifecycle, kept in one trait since they share
/// ownership state.
pub trait Lease: Send + Sync + Clone + 'static {
    fn resource(&self) -> &str;

    /// Wait up to `timeout` for ownership. Fails with `CronError::LockUnavailable`.
    fn acquire(&self, timeout: Duration) -> impl Future<Output = Result<(), CronError>> + Send;

    /// Extend the expiry. Fails with `CronError::LockLost` if ownership is gone.
    fn renew(&self, ttl: Duration) -> impl Future<Output = Result<(), CronError>> + Send;

    /// Give up ownership. Idempotent and best-effort: failures are logged, the TTL
    /// guarantees eventual release.
    fn release(&self) -> impl Future<Output = ()> + Send;

    /// Whether this process currently believes it owns the resource.
    fn is_held(&self) -> bool;
}

/// The lease selected from configuration.
#[derive(Clone)]
pub enum LeaseBackend {
    Noop(NoopLease),
    Nats(KvLease<NatsLockStore>),
}

impl Lease for LeaseBackend {
    fn resource(&self) -> &str {
        match self {
            Self::Noop(lease) => lease.resource(),
            Self::Nats(lease) => lease.resource(),
        }
    }

    async fn acquire(&self, timeout: Duration) -> Result<(), CronError> {
        match self {
            Self::Noop(lease) => lease.acquire(timeout).await,
            Self::Nats(lease) => lease.acquire(timeout).await,
        }
    }

    async fn renew(&self, ttl: Duration) -> Result<(), CronError> {
        match self {
            Self::Noop(lease) => lease.renew(ttl).await,
            Self::Nats(lease) => lease.renew(ttl).await,
        }
    }

    async fn release(&self) {
        match self {
            Self::Noop(lease) => lease.release().await,
            Self::Nats(lease) => lease.release().await,
        }
    }

    fn is_held(&self) -> bool {
        match self {
            Self::Noop(lease) => lease.is_held(),
            Self::Nats(lease) => lease.is_held(),
        }
    }
}

/// Build the lease for this deployment. Connects to NATS when it is configured.
pub async fn from_settings(settings: &Settings) -> Result<LeaseBackend, CronError> {
    let client = match &settings.nats {
        Some(nats) => Some(connect(nats).await?),
        None => None,
    };
    from_client(client, settings).await
}

/// Like [`from_settings`], reusing an existing connection so the same client can
/// also publish job ticks.
pub async fn from_client(
    client: Option<async_nats::Client>,
    settings: &Settings,
) -> Result<LeaseBackend, CronError> {
    let Some(client) = client else {
        tracing::info!("No NATS server configured, running without a leader lock");
        return Ok(LeaseBackend::Noop(NoopLease::new(LEASE_RESOURCE)));
    };

    let store = NatsLockStore::open(client, settings.lease_ttl).await?;
    let owner = uuid::Uuid::new_v4().to_string();
    tracing::info!(resource = LEASE_RESOURCE, %owner, bucket = LEASE_BUCKET, "Using NATS KV leader lock");
    Ok(LeaseBackend::Nats(KvLease::new(store, LEASE_RESOURCE, owner)))
}
