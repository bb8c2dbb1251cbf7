use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::Lease;
use crate::error::CronError;

/// How often `acquire` retries `create` while another owner holds the key.
pub const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum LockStoreError {
    /// The key is held by someone else, or its revision moved on.
    Conflict,
    Backend(String),
}

impl std::fmt::Display for LockStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conflict => write!(f, "held by another owner"),
            Self::Backend(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for LockStoreError {}

/// Atomic key operations a lease needs from its backing store.
///
/// Entries expire on their own after the store's TTL unless updated.
pub trait LockStore: Send + Sync + Clone + 'static {
    /// Set `key` only if no live entry exists. Returns the new revision.
    fn create(
        &self,
        key: &str,
        owner: Bytes,
    ) -> impl Future<Output = Result<u64, LockStoreError>> + Send;

    /// Compare-and-set on `revision`; refreshes the entry's TTL. Returns the new revision.
    fn update(
        &self,
        key: &str,
        owner: Bytes,
        revision: u64,
    ) -> impl Future<Output = Result<u64, LockStoreError>> + Send;

    /// Delete `key` only if it is still at `revision`.
    fn delete(
        &self,
        key: &str,
        revision: u64,
    ) -> impl Future<Output = Result<(), LockStoreError>> + Send;
}

#[derive(Debug, Default)]
struct Ownership {
    /// Last revision this process wrote. Kept after a lost renewal so `release`
    /// can still remove our own entry if nobody replaced it.
    revision: Option<u64>,
    held: bool,
}

/// Lease over a [`LockStore`] key, owned by a per-process identity.
#[derive(Clone)]
pub struct KvLease<S: LockStore> {
    store: S,
    resource: String,
    owner: String,
    ownership: Arc<Mutex<Ownership>>,
}

impl<S: LockStore> KvLease<S> {
    pub fn new(store: S, resource: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            store,
            resource: resource.into(),
            owner: owner.into(),
            ownership: Arc::new(Mutex::new(Ownership::default())),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn ownership(&self) -> std::sync::MutexGuard<'_, Ownership> {
        self.ownership
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn owner_bytes(&self) -> Bytes {
        Bytes::from(self.owner.clone())
    }
}

impl<S: LockStore> Lease for KvLease<S> {
    fn resource(&self) -> &str {
        &self.resource
    }

    async fn acquire(&self, timeout: Duration) -> Result<(), CronError> {
        if self.is_held() {
            return Ok(());
        }
        let deadline = Instant::now() + timeout;

        loop {
            // Only the last attempt decides how a timeout is reported.
            let backend_error = match self.store.create(&self.resource, self.owner_bytes()).await {
                Ok(revision) => {
                    *self.ownership() = Ownership {
                        revision: Some(revision),
                        held: true,
                    };
                    info!(resource = %self.resource, owner = %self.owner, "Acquired lease");
                    return Ok(());
                }
                // Another process holds the lease; expected while contending.
                Err(LockStoreError::Conflict) => None,
                Err(LockStoreError::Backend(reason)) => {
                    warn!(resource = %self.resource, error = %reason, "Lease acquisition attempt failed");
                    Some(reason)
                }
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(match backend_error {
                    Some(reason) => CronError::Store(format!(
                        "lease '{}' could not be acquired: {reason}",
                        self.resource
                    )),
                    None => CronError::LockUnavailable {
                        resource: self.resource.clone(),
                    },
                });
            }
            tokio::time::sleep(ACQUIRE_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// The TTL itself is a property of the store; a successful update restarts it.
    async fn renew(&self, ttl: Duration) -> Result<(), CronError> {
        let revision = {
            let ownership = self.ownership();
            match ownership.revision {
                Some(revision) if ownership.held => revision,
                _ => {
                    return Err(CronError::LockLost {
                        resource: self.resource.clone(),
                        reason: "lease is not held".into(),
                    });
                }
            }
        };

        match self
            .store
            .update(&self.resource, self.owner_bytes(), revision)
            .await
        {
            Ok(new_revision) => {
                let mut ownership = self.ownership();
                if ownership.held {
                    ownership.revision = Some(new_revision);
                }
                debug!(resource = %self.resource, revision = new_revision, ttl_secs = ttl.as_secs(), "Renewed lease");
                Ok(())
            }
            Err(e) => {
                self.ownership().held = false;
                warn!(resource = %self.resource, owner = %self.owner, error = %e, "Lost lease (renewal failed)");
                Err(CronError::LockLost {
                    resource: self.resource.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn release(&self) {
        let revision = {
            let mut ownership = self.ownership();
            ownership.held = false;
            ownership.revision.take()
        };
        let Some(revision) = revision else {
            return;
        };

        match self.store.delete(&self.resource, revision).await {
            Ok(()) => info!(resource = %self.resource, owner = %self.owner, "Released lease"),
            Err(LockStoreError::Conflict) => {
                debug!(resource = %self.resource, "Lease already expired or taken over, nothing to release");
            }
            Err(e) => warn!(resource = %self.resource, error = %e, "Failed to release lease"),
        }
    }

    fn is_held(&self) -> bool {
        self.ownership().held
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockLockStore;

    const TTL: Duration = Duration::from_secs(10);

    fn lease(store: &MockLockStore, owner: &str) -> KvLease<MockLockStore> {
        KvLease::new(store.clone(), "scheduler-leader", owner)
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_marks_store_with_owner() {
        let store = MockLockStore::new(TTL);
        let a = lease(&store, "a");

        a.acquire(Duration::from_secs(1)).await.unwrap();

        assert!(a.is_held());
        assert_eq!(store.holder("scheduler-leader").as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn contended_acquire_times_out_with_lock_unavailable() {
        let store = MockLockStore::new(TTL);
        lease(&store, "a").acquire(Duration::ZERO).await.unwrap();
        let b = lease(&store, "b");

        let started = Instant::now();
        let err = b.acquire(Duration::from_secs(2)).await.unwrap_err();

        assert!(matches!(err, CronError::LockUnavailable { .. }));
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(!b.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_store_times_out_with_store_error() {
        let store = MockLockStore::new(TTL);
        store.deny_creates();
        let a = lease(&store, "a");

        let err = a.acquire(Duration::from_secs(1)).await.unwrap_err();

        assert!(matches!(err, CronError::Store(_)), "{err:?}");
        assert!(!err.is_lock_failure());
        assert!(err.to_string().contains("connection refused"));
        assert!(!a.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn store_recovering_into_contention_reports_lock_unavailable() {
        let store = MockLockStore::new(TTL);
        lease(&store, "a").acquire(Duration::ZERO).await.unwrap();
        store.deny_creates();
        let b = lease(&store, "b");

        let contender = tokio::spawn(async move { b.acquire(Duration::from_secs(2)).await });
        tokio::time::sleep(Duration::from_millis(500)).await;
        store.allow_creates();

        let err = contender.await.unwrap().unwrap_err();
        assert!(matches!(err, CronError::LockUnavailable { .. }), "{err:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_succeeds_once_holder_expires() {
        let store = MockLockStore::new(TTL);
        lease(&store, "a").acquire(Duration::ZERO).await.unwrap();
        let b = lease(&store, "b");

        b.acquire(Duration::from_secs(15)).await.unwrap();

        assert_eq!(store.holder("scheduler-leader").as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn renew_keeps_lease_alive_past_ttl() {
        let store = MockLockStore::new(TTL);
        let a = lease(&store, "a");
        a.acquire(Duration::ZERO).await.unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(5)).await;
            a.renew(TTL).await.unwrap();
        }

        assert_eq!(store.holder("scheduler-leader").as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn renew_after_takeover_fails_with_lock_lost() {
        let store = MockLockStore::new(TTL);
        let a = lease(&store, "a");
        a.acquire(Duration::ZERO).await.unwrap();

        tokio::time::sleep(TTL).await;
        lease(&store, "b").acquire(Duration::ZERO).await.unwrap();

        let err = a.renew(TTL).await.unwrap_err();
        assert!(matches!(err, CronError::LockLost { .. }));
        assert!(!a.is_held());

        a.release().await;
        assert_eq!(store.holder("scheduler-leader").as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn release_after_failed_renewal_clears_own_entry() {
        let store = MockLockStore::new(TTL);
        let a = lease(&store, "a");
        a.acquire(Duration::ZERO).await.unwrap();

        store.deny_updates();
        assert!(a.renew(TTL).await.is_err());
        a.release().await;

        assert_eq!(store.holder("scheduler-leader"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn release_is_idempotent_and_safe_after_failed_acquire() {
        let store = MockLockStore::new(TTL);
        let a = lease(&store, "a");
        a.acquire(Duration::ZERO).await.unwrap();
        let b = lease(&store, "b");

        assert!(b.acquire(Duration::ZERO).await.is_err());
        b.release().await;
        b.release().await;
        assert_eq!(store.holder("scheduler-leader").as_deref(), Some("a"));

        a.release().await;
        a.release().await;
        assert_eq!(store.holder("scheduler-leader"), None);
        assert!(!a.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn renew_without_acquire_is_lock_lost() {
        let store = MockLockStore::new(TTL);
        let err = lease(&store, "a").renew(TTL).await.unwrap_err();
        assert!(matches!(err, CronError::LockLost { .. }));
    }
}
