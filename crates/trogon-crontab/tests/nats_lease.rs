//! Leader lease against a real NATS JetStream KV bucket.
//!
//! Requires Docker (uses testcontainers to spin up a NATS server with JetStream).
//!
//! Run with:
//!   cargo test -p trogon-crontab --test nats_lease -- --ignored

use std::time::Duration;

use futures::StreamExt as _;
use testcontainers_modules::nats::Nats;
use testcontainers_modules::testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use trogon_crontab::config::NatsConfig;
use trogon_crontab::jobs::{self, JobConfig, TickPayload};
use trogon_crontab::lease::{self, KvLease, LEASE_RESOURCE, Lease, NatsLockStore};
use trogon_crontab::{
    CronError, JobRegistry, LeaseBackend, RetryPolicy, RunState, ScheduleSpec, Settings,
    Supervisor,
};

// ── Helpers ───────────────────────────────────────────────────────────────────

async fn start_nats() -> (ContainerAsync<Nats>, u16) {
    let container: ContainerAsync<Nats> = Nats::default()
        .with_cmd(["--jetstream"])
        .start()
        .await
        .expect("Failed to start NATS container (is Docker running?)");
    let port = container.get_host_port_ipv4(4222).await.unwrap();
    (container, port)
}

fn settings(port: u16, ttl_secs: u64) -> Settings {
    Settings {
        lease_ttl: Duration::from_secs(ttl_secs),
        renewal_interval: Duration::from_secs(1),
        acquisition_timeout: Duration::from_secs(1),
        retry: RetryPolicy::disabled(),
        nats: Some(NatsConfig::from_url(format!("localhost:{port}"))),
        ..Settings::default()
    }
}

async fn nats_lease(port: u16, ttl_secs: u64, owner: &str) -> KvLease<NatsLockStore> {
    let client = lease::connect(&NatsConfig::from_url(format!("localhost:{port}")))
        .await
        .unwrap();
    let store = NatsLockStore::open(client, Duration::from_secs(ttl_secs))
        .await
        .unwrap();
    KvLease::new(store, LEASE_RESOURCE, owner)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
#[ignore = "requires Docker"]
async fn configured_nats_selects_kv_lease() {
    let (_container, port) = start_nats().await;

    let backend = lease::from_settings(&settings(port, 10)).await.unwrap();

    assert!(matches!(backend, LeaseBackend::Nats(_)));
    backend.acquire(Duration::from_secs(1)).await.unwrap();
    assert!(backend.is_held());
    backend.release().await;
    assert!(!backend.is_held());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn second_owner_is_refused_until_release() {
    let (_container, port) = start_nats().await;
    let a = nats_lease(port, 10, "a").await;
    let b = nats_lease(port, 10, "b").await;

    a.acquire(Duration::from_secs(1)).await.unwrap();
    let err = b.acquire(Duration::from_millis(500)).await.unwrap_err();
    assert!(matches!(err, CronError::LockUnavailable { .. }));

    a.renew(Duration::from_secs(10)).await.unwrap();
    a.release().await;

    b.acquire(Duration::from_secs(1)).await.unwrap();
    assert!(b.is_held());
    b.release().await;
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn unrenewed_lease_expires_and_old_owner_loses_it() {
    let (_container, port) = start_nats().await;
    let a = nats_lease(port, 2, "a").await;
    let b = nats_lease(port, 2, "b").await;

    a.acquire(Duration::from_secs(1)).await.unwrap();
    b.acquire(Duration::from_secs(5)).await.unwrap();

    let err = a.renew(Duration::from_secs(2)).await.unwrap_err();
    assert!(matches!(err, CronError::LockLost { .. }));
    a.release().await;

    b.renew(Duration::from_secs(2)).await.unwrap();
    assert!(b.is_held());
    b.release().await;
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn existing_bucket_keeps_its_own_ttl() {
    let (_container, port) = start_nats().await;
    let client = lease::connect(&NatsConfig::from_url(format!("localhost:{port}")))
        .await
        .unwrap();

    let first = NatsLockStore::open(client.clone(), Duration::from_secs(10))
        .await
        .unwrap();
    let second = NatsLockStore::open(client, Duration::from_secs(20))
        .await
        .unwrap();

    assert_eq!(first.ttl().await.unwrap(), Duration::from_secs(10));
    assert_eq!(second.ttl().await.unwrap(), Duration::from_secs(10));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn leader_publishes_ticks_and_contender_exits() {
    let (_container, port) = start_nats().await;
    let client = lease::connect(&NatsConfig::from_url(format!("localhost:{port}")))
        .await
        .unwrap();
    let mut ticks = client.subscribe("cron.health").await.unwrap();

    let mut registry = JobRegistry::new();
    jobs::register_jobs(
        &mut registry,
        vec![JobConfig {
            id: "health".into(),
            schedule: ScheduleSpec::every(1),
            subject: "cron.health".into(),
            enabled: true,
            payload: None,
        }],
        client.clone(),
    )
    .unwrap();

    let leader_lease = lease::from_client(Some(client.clone()), &settings(port, 10))
        .await
        .unwrap();
    let leader = Supervisor::new(leader_lease, registry, settings(port, 10));
    let mut state = leader.state();
    let cancel = tokio_util::sync::CancellationToken::new();
    let token = cancel.clone();
    let handle = tokio::spawn(async move { leader.run(token).await });
    state.wait_for(|s| *s == RunState::Leading).await.unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(5), ticks.next())
        .await
        .expect("no tick within 5s")
        .unwrap();
    let tick: TickPayload = serde_json::from_slice(&msg.payload).unwrap();
    assert_eq!(tick.job_id, "health");

    let contender = Supervisor::new(
        lease::from_settings(&settings(port, 10)).await.unwrap(),
        JobRegistry::new(),
        settings(port, 10),
    );
    let err = contender
        .run(tokio_util::sync::CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CronError::LockUnavailable { .. }));

    cancel.cancel();
    handle.await.unwrap().unwrap();
}
