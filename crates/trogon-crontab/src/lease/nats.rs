use std::time::Duration;

use async_nats::jetstream::{self, kv};
use async_nats::{Client, ConnectOptions, Event};
use bytes::Bytes;
use tracing::{info, instrument, warn};

use super::kv::{LockStore, LockStoreError};
use crate::config::{NatsAuth, NatsConfig};
use crate::error::CronError;

/// KV bucket holding the leader key. Its `max_age` is the lease TTL.
pub const LEASE_BUCKET: &str = "crontab_leader";

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

async fn handle_event(event: Event) {
    match event {
        Event::Connected => info!("NATS connected"),
        Event::Disconnected => warn!("NATS disconnected - lease renewals will fail until reconnected"),
        Event::ServerError(err) => warn!(error = %err, "NATS server error"),
        Event::ClientError(err) => warn!(error = %err, "NATS client error"),
        Event::SlowConsumer(sid) => warn!(sid, "NATS slow consumer detected"),
        Event::LameDuckMode => warn!("NATS server entering lame duck mode"),
        Event::Closed => info!("NATS connection closed"),
        Event::Draining => info!("NATS connection draining"),
    }
}

/// Connect to the servers in `config`. Fails fast instead of retrying the initial
/// connection, so a misconfigured deployment exits instead of never leading.
#[instrument(name = "nats.connect", skip(config), fields(servers = ?config.servers, auth = %config.auth.description()))]
pub async fn connect(config: &NatsConfig) -> Result<Client, CronError> {
    let opts = match &config.auth {
        NatsAuth::Credentials(path) => ConnectOptions::with_credentials_file(path.clone())
            .await
            .map_err(|e| {
                CronError::Store(format!(
                    "Failed to load credentials file {}: {e}",
                    path.display()
                ))
            })?,
        NatsAuth::UserPassword { user, password } => {
            ConnectOptions::with_user_and_password(user.clone(), password.clone())
        }
        NatsAuth::Token(token) => ConnectOptions::with_token(token.clone()),
        NatsAuth::None => ConnectOptions::new(),
    };

    let client = opts
        .connection_timeout(CONNECTION_TIMEOUT)
        .event_callback(|event| async move { handle_event(event).await })
        .connect(&config.servers)
        .await
        .map_err(|e| {
            warn!(error = %e, "Failed to connect to NATS");
            CronError::Store(format!(
                "Failed to connect to NATS servers {:?}: {e}",
                config.servers
            ))
        })?;

    info!("Connected to NATS");
    Ok(client)
}

/// [`LockStore`] backed by a NATS JetStream KV bucket.
#[derive(Clone)]
pub struct NatsLockStore {
    store: kv::Store,
}

impl NatsLockStore {
    pub fn new(store: kv::Store) -> Self {
        Self { store }
    }

    /// Get or create [`LEASE_BUCKET`] with entries expiring after `ttl`.
    pub async fn open(client: Client, ttl: Duration) -> Result<Self, CronError> {
        let js = jetstream::new(client);
        let config = kv::Config {
            bucket: LEASE_BUCKET.to_string(),
            history: 1,
            max_age: ttl,
            ..Default::default()
        };
        let store = match js.create_key_value(config).await {
            Ok(store) => Self::new(store),
            Err(_) => {
                let store = js
                    .get_key_value(LEASE_BUCKET)
                    .await
                    .map_err(|e| CronError::Store(e.to_string()))?;
                let store = Self::new(store);
                check_bucket_ttl(store.ttl().await?, ttl);
                store
            }
        };
        Ok(store)
    }

    /// Effective lease TTL: the bucket's `max_age`.
    pub async fn ttl(&self) -> Result<Duration, CronError> {
        let status = self
            .store
            .status()
            .await
            .map_err(|e| CronError::Store(e.to_string()))?;
        Ok(status.max_age())
    }
}

/// An existing bucket keeps its own `max_age`; warn when it is not the configured TTL.
fn check_bucket_ttl(existing: Duration, configured: Duration) -> bool {
    if existing == configured {
        return true;
    }
    warn!(
        bucket = LEASE_BUCKET,
        bucket_ttl_secs = existing.as_secs_f64(),
        configured_ttl_secs = configured.as_secs_f64(),
        "Lease bucket already exists with a different TTL; the bucket's TTL applies"
    );
    false
}

impl LockStore for NatsLockStore {
    async fn create(&self, key: &str, owner: Bytes) -> Result<u64, LockStoreError> {
        self.store.create(key, owner).await.map_err(|e| match e.kind() {
            kv::CreateErrorKind::AlreadyExists => LockStoreError::Conflict,
            _ => LockStoreError::Backend(e.to_string()),
        })
    }

    async fn update(&self, key: &str, owner: Bytes, revision: u64) -> Result<u64, LockStoreError> {
        self.store
            .update(key, owner, revision)
            .await
            .map_err(|e| LockStoreError::Backend(e.to_string()))
    }

    async fn delete(&self, key: &str, revision: u64) -> Result<(), LockStoreError> {
        self.store
            .delete_expect_revision(key, Some(revision))
            .await
            .map_err(|e| LockStoreError::Backend(e.to_string()))
    }
}
