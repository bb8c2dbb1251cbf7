//! Test doubles for running the scheduler without NATS or wall-clock time.
//!
//! Enabled with the `test-support` feature:
//!
//! ```toml
//! [dev-dependencies]
//! trogon-crontab = { path = "...", features = ["test-support"] }
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::env;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::clock::Clock;
use crate::config::ReadEnv;
use crate::jobs::TickPublisher;
use crate::lease::{LockStore, LockStoreError};

// ── MockClock ─────────────────────────────────────────────────────────────────

/// Wall clock driven by tokio's clock, so `start_paused` tests control it with
/// `tokio::time::advance` / `sleep`.
#[derive(Debug, Clone, Copy)]
pub struct MockClock {
    origin: DateTime<Utc>,
    started: Instant,
}

impl MockClock {
    /// `now()` returns `origin` plus the tokio time elapsed since this call.
    pub fn starting_at(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            started: Instant::now(),
        }
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.started.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.origin + elapsed
    }
}

// ── MockLockStore ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Entry {
    owner: String,
    revision: u64,
    written_at: Instant,
}

#[derive(Debug, Default)]
struct StoreState {
    entries: HashMap<String, Entry>,
    next_revision: u64,
    deny_updates: bool,
    deny_creates: bool,
    acquisitions: usize,
}

/// In-memory [`LockStore`] with TTL expiry measured on tokio's clock.
///
/// Clones share state, so several leases can contend for the same key.
#[derive(Clone)]
pub struct MockLockStore {
    ttl: Duration,
    state: Arc<Mutex<StoreState>>,
}

impl MockLockStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Arc::new(Mutex::new(StoreState {
                next_revision: 1,
                ..StoreState::default()
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live<'a>(&self, state: &'a StoreState, key: &str) -> Option<&'a Entry> {
        state
            .entries
            .get(key)
            .filter(|e| e.written_at.elapsed() < self.ttl)
    }

    /// Owner of the live entry under `key`, if any.
    pub fn holder(&self, key: &str) -> Option<String> {
        let state = self.state();
        self.live(&state, key).map(|e| e.owner.clone())
    }

    /// Number of successful `create` calls so far.
    pub fn acquisitions(&self) -> usize {
        self.state().acquisitions
    }

    /// Make every `update` fail, as if the store became unreachable.
    pub fn deny_updates(&self) {
        self.state().deny_updates = true;
    }

    pub fn allow_updates(&self) {
        self.state().deny_updates = false;
    }

    /// Make every `create` fail with a backend error, as if the store were unreachable.
    pub fn deny_creates(&self) {
        self.state().deny_creates = true;
    }

    pub fn allow_creates(&self) {
        self.state().deny_creates = false;
    }

    /// Drop the entry under `key` regardless of owner.
    pub fn expire(&self, key: &str) {
        self.state().entries.remove(key);
    }
}

impl LockStore for MockLockStore {
    async fn create(&self, key: &str, owner: Bytes) -> Result<u64, LockStoreError> {
        let mut state = self.state();
        if state.deny_creates {
            return Err(LockStoreError::Backend("connection refused".into()));
        }
        if self.live(&state, key).is_some() {
            return Err(LockStoreError::Conflict);
        }
        let revision = state.next_revision;
        state.next_revision += 1;
        state.acquisitions += 1;
        state.entries.insert(
            key.to_string(),
            Entry {
                owner: String::from_utf8_lossy(&owner).into_owned(),
                revision,
                written_at: Instant::now(),
            },
        );
        Ok(revision)
    }

    async fn update(&self, key: &str, owner: Bytes, revision: u64) -> Result<u64, LockStoreError> {
        let mut state = self.state();
        if state.deny_updates {
            return Err(LockStoreError::Backend("store unavailable".into()));
        }
        let next = state.next_revision;
        let ttl = self.ttl;
        let entry = match state.entries.get_mut(key) {
            Some(e) if e.revision == revision && e.written_at.elapsed() < ttl => e,
            _ => return Err(LockStoreError::Conflict),
        };
        entry.owner = String::from_utf8_lossy(&owner).into_owned();
        entry.revision = next;
        entry.written_at = Instant::now();
        state.next_revision += 1;
        Ok(next)
    }

    async fn delete(&self, key: &str, revision: u64) -> Result<(), LockStoreError> {
        let mut state = self.state();
        match state.entries.get(key) {
            Some(e) if e.revision == revision => {
                state.entries.remove(key);
                Ok(())
            }
            _ => Err(LockStoreError::Conflict),
        }
    }
}

// ── InMemoryEnv ───────────────────────────────────────────────────────────────

/// [`ReadEnv`] backed by a map, for configuration tests.
#[derive(Debug, Default)]
pub struct InMemoryEnv {
    vars: RefCell<HashMap<String, String>>,
}

impl InMemoryEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.borrow_mut().insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) {
        self.vars.borrow_mut().remove(key);
    }
}

impl ReadEnv for InMemoryEnv {
    fn var(&self, key: &str) -> Result<String, env::VarError> {
        self.vars
            .borrow()
            .get(key)
            .cloned()
            .ok_or(env::VarError::NotPresent)
    }
}

// ── MockTickPublisher ─────────────────────────────────────────────────────────

/// Records every tick published during a test run.
#[derive(Clone, Default)]
pub struct MockTickPublisher {
    records: Arc<Mutex<Vec<PublishedTick>>>,
    fail: bool,
}

#[derive(Debug, Clone)]
pub struct PublishedTick {
    pub subject: String,
    pub headers: async_nats::HeaderMap,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub struct MockPublishError;

impl std::fmt::Display for MockPublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "publish rejected")
    }
}

impl std::error::Error for MockPublishError {}

impl MockTickPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publisher whose every publish fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn records(&self) -> MutexGuard<'_, Vec<PublishedTick>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ticks(&self) -> Vec<PublishedTick> {
        self.records().clone()
    }

    pub fn tick_count(&self) -> usize {
        self.records().len()
    }
}

impl TickPublisher for MockTickPublisher {
    type Error = MockPublishError;

    async fn publish_tick(
        &self,
        subject: String,
        headers: async_nats::HeaderMap,
        payload: Bytes,
    ) -> Result<(), Self::Error> {
        if self.fail {
            return Err(MockPublishError);
        }
        self.records().push(PublishedTick {
            subject,
            headers,
            payload: payload.to_vec(),
        });
        Ok(())
    }
}
