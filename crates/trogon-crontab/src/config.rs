//! Scheduler settings read from the environment.
//!
//! Every value has a default, so a process with no configuration runs a single
//! instance with the no-op lease.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use chrono_tz::Tz;
use tracing::warn;

const ENV_LOCK_TIMEOUT: &str = "CRONTAB_LOCK_TIMEOUT";
const ENV_LOCK_REFRESH_INTERVAL: &str = "CRONTAB_LOCK_REFRESH_INTERVAL";
const ENV_LOCK_BLOCKING_TIMEOUT: &str = "CRONTAB_LOCK_BLOCKING_TIMEOUT";
const ENV_AUTO_RETRY: &str = "CRONTAB_AUTO_RETRY";
const ENV_MAX_RETRIES: &str = "CRONTAB_MAX_RETRIES";
const ENV_TIMEZONE: &str = "CRONTAB_TIMEZONE";

const ENV_NATS_URL: &str = "NATS_URL";
const ENV_NATS_CREDS: &str = "NATS_CREDS";
const ENV_NATS_USER: &str = "NATS_USER";
const ENV_NATS_PASSWORD: &str = "NATS_PASSWORD";
const ENV_NATS_TOKEN: &str = "NATS_TOKEN";

pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(10);
pub const DEFAULT_RENEWAL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_ACQUISITION_TIMEOUT: Duration = Duration::from_secs(15);

/// Read access to environment variables. Does **not** require `Send + Sync`.
pub trait ReadEnv {
    fn var(&self, key: &str) -> Result<String, env::VarError>;
}

/// Zero-sized type, delegates to `std::env`.
pub struct SystemEnv;

impl ReadEnv for SystemEnv {
    #[inline]
    fn var(&self, key: &str) -> Result<String, env::VarError> {
        env::var(key)
    }
}

/// NATS authentication method.
///
/// Resolved from the environment in priority order: `NATS_CREDS`,
/// `NATS_USER` + `NATS_PASSWORD`, `NATS_TOKEN`, none.
#[derive(Debug, Clone)]
pub enum NatsAuth {
    Credentials(PathBuf),
    UserPassword { user: String, password: String },
    Token(String),
    None,
}

impl NatsAuth {
    pub fn description(&self) -> &'static str {
        match self {
            Self::Credentials(_) => "credentials file",
            Self::UserPassword { .. } => "user/password",
            Self::Token(_) => "token",
            Self::None => "none",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NatsConfig {
    pub servers: Vec<String>,
    pub auth: NatsAuth,
}

impl NatsConfig {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            servers: vec![url.into()],
            auth: NatsAuth::None,
        }
    }

    /// `None` unless `NATS_URL` names at least one server.
    pub fn from_env<E: ReadEnv>(env: &E) -> Option<Self> {
        let servers: Vec<String> = env
            .var(ENV_NATS_URL)
            .ok()?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if servers.is_empty() {
            return None;
        }
        Some(Self {
            servers,
            auth: auth_from_env(env),
        })
    }
}

fn auth_from_env<E: ReadEnv>(env: &E) -> NatsAuth {
    if let Ok(path) = env.var(ENV_NATS_CREDS) {
        return NatsAuth::Credentials(PathBuf::from(path));
    }
    if let (Ok(user), Ok(password)) = (env.var(ENV_NATS_USER), env.var(ENV_NATS_PASSWORD)) {
        return NatsAuth::UserPassword { user, password };
    }
    if let Ok(token) = env.var(ENV_NATS_TOKEN) {
        return NatsAuth::Token(token);
    }
    NatsAuth::None
}

/// How many lock failures the supervisor absorbs before giving up.
///
/// "No retry" is `max_retries == Some(0)`, not a separate code path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: Option<u32>,
}

impl RetryPolicy {
    pub const fn disabled() -> Self {
        Self {
            max_retries: Some(0),
        }
    }

    pub const fn unlimited() -> Self {
        Self { max_retries: None }
    }

    pub const fn bounded(max_retries: u32) -> Self {
        Self {
            max_retries: Some(max_retries),
        }
    }

    /// Whether a failure may be retried after `failures` consecutive ones (1-based).
    pub fn allows(&self, failures: u32) -> bool {
        self.max_retries.is_none_or(|max| failures <= max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Time after which an unrenewed lease is released by the store.
    pub lease_ttl: Duration,
    /// Renewal cadence; always shorter than `lease_ttl`.
    pub renewal_interval: Duration,
    /// How long one acquisition attempt may block.
    pub acquisition_timeout: Duration,
    pub retry: RetryPolicy,
    /// Timezone cron fields are evaluated in.
    pub timezone: Tz,
    /// `None` selects the no-op lease.
    pub nats: Option<NatsConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            lease_ttl: DEFAULT_LEASE_TTL,
            renewal_interval: DEFAULT_RENEWAL_INTERVAL,
            acquisition_timeout: DEFAULT_ACQUISITION_TIMEOUT,
            retry: RetryPolicy::default(),
            timezone: chrono_tz::UTC,
            nats: None,
        }
    }
}

impl Settings {
    /// Build settings from environment variables, warning about and ignoring invalid values.
    ///
    /// - `CRONTAB_LOCK_TIMEOUT`: lease TTL in seconds (default 10)
    /// - `CRONTAB_LOCK_REFRESH_INTERVAL`: renewal interval in seconds (default 5)
    /// - `CRONTAB_LOCK_BLOCKING_TIMEOUT`: acquisition timeout in seconds (default 15)
    /// - `CRONTAB_AUTO_RETRY`: retry lock failures instead of exiting (default false)
    /// - `CRONTAB_MAX_RETRIES`: bound on retries when auto-retry is on (default unlimited)
    /// - `CRONTAB_TIMEZONE`: IANA timezone for cron fields (default UTC)
    /// - `NATS_URL` and auth variables: see [`NatsConfig::from_env`]
    pub fn from_env<E: ReadEnv>(env: &E) -> Self {
        let defaults = Self::default();
        let lease_ttl = secs_from_env(env, ENV_LOCK_TIMEOUT, 1).unwrap_or(defaults.lease_ttl);
        let renewal_interval = secs_from_env(env, ENV_LOCK_REFRESH_INTERVAL, 1)
            .unwrap_or(defaults.renewal_interval);
        let acquisition_timeout = secs_from_env(env, ENV_LOCK_BLOCKING_TIMEOUT, 0)
            .unwrap_or(defaults.acquisition_timeout);

        let retry = if bool_from_env(env, ENV_AUTO_RETRY) {
            match env.var(ENV_MAX_RETRIES) {
                Ok(raw) => match raw.parse::<u32>() {
                    Ok(max) => RetryPolicy::bounded(max),
                    Err(_) => {
                        warn!("{ENV_MAX_RETRIES}={raw:?} is not a valid integer, retrying without limit");
                        RetryPolicy::unlimited()
                    }
                },
                Err(_) => RetryPolicy::unlimited(),
            }
        } else {
            RetryPolicy::disabled()
        };

        let timezone = match env.var(ENV_TIMEZONE) {
            Ok(raw) => raw.parse::<Tz>().unwrap_or_else(|_| {
                warn!("{ENV_TIMEZONE}={raw:?} is not a known timezone, using UTC");
                chrono_tz::UTC
            }),
            Err(_) => chrono_tz::UTC,
        };

        Self {
            lease_ttl,
            renewal_interval,
            acquisition_timeout,
            retry,
            timezone,
            nats: NatsConfig::from_env(env),
        }
        .normalized()
    }

    /// Enforce `renewal_interval < lease_ttl` so at least one renewal can fail
    /// before the lease expires on its own.
    pub fn normalized(mut self) -> Self {
        if self.renewal_interval >= self.lease_ttl {
            let fallback = if DEFAULT_RENEWAL_INTERVAL < self.lease_ttl {
                DEFAULT_RENEWAL_INTERVAL
            } else {
                self.lease_ttl / 2
            };
            warn!(
                renewal_secs = self.renewal_interval.as_secs_f64(),
                ttl_secs = self.lease_ttl.as_secs_f64(),
                fallback_secs = fallback.as_secs_f64(),
                "Lease renewal interval must be shorter than the lease TTL"
            );
            self.renewal_interval = fallback;
        }
        self
    }
}

fn secs_from_env<E: ReadEnv>(env: &E, key: &str, min: u64) -> Option<Duration> {
    let raw = env.var(key).ok()?;
    match raw.parse::<u64>() {
        Ok(secs) if secs >= min => Some(Duration::from_secs(secs)),
        Ok(secs) => {
            warn!("{key}={secs} is below minimum ({min}), using default");
            None
        }
        Err(_) => {
            warn!("{key}={raw:?} is not a valid integer, using default");
            None
        }
    }
}

fn bool_from_env<E: ReadEnv>(env: &E, key: &str) -> bool {
    match env.var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" | "" => false,
            _ => {
                warn!("{key}={raw:?} is not a boolean, using false");
                false
            }
        },
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::InMemoryEnv;

    #[test]
    fn defaults_without_environment() {
        let settings = Settings::from_env(&InMemoryEnv::new());

        assert_eq!(settings.lease_ttl, Duration::from_secs(10));
        assert_eq!(settings.renewal_interval, Duration::from_secs(5));
        assert_eq!(settings.acquisition_timeout, Duration::from_secs(15));
        assert_eq!(settings.retry, RetryPolicy::disabled());
        assert_eq!(settings.timezone, chrono_tz::UTC);
        assert!(settings.nats.is_none());
    }

    #[test]
    fn lock_timings_from_env() {
        let env = InMemoryEnv::new();
        env.set("CRONTAB_LOCK_TIMEOUT", "30");
        env.set("CRONTAB_LOCK_REFRESH_INTERVAL", "10");
        env.set("CRONTAB_LOCK_BLOCKING_TIMEOUT", "0");

        let settings = Settings::from_env(&env);

        assert_eq!(settings.lease_ttl, Duration::from_secs(30));
        assert_eq!(settings.renewal_interval, Duration::from_secs(10));
        assert_eq!(settings.acquisition_timeout, Duration::ZERO);
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let env = InMemoryEnv::new();
        env.set("CRONTAB_LOCK_TIMEOUT", "ten");
        env.set("CRONTAB_LOCK_REFRESH_INTERVAL", "0");
        env.set("CRONTAB_TIMEZONE", "Mars/Olympus");

        let settings = Settings::from_env(&env);

        assert_eq!(settings.lease_ttl, DEFAULT_LEASE_TTL);
        assert_eq!(settings.renewal_interval, DEFAULT_RENEWAL_INTERVAL);
        assert_eq!(settings.timezone, chrono_tz::UTC);
    }

    #[test]
    fn renewal_interval_is_kept_below_ttl() {
        let env = InMemoryEnv::new();
        env.set("CRONTAB_LOCK_TIMEOUT", "4");
        env.set("CRONTAB_LOCK_REFRESH_INTERVAL", "8");
        let settings = Settings::from_env(&env);
        assert_eq!(settings.renewal_interval, Duration::from_secs(2));

        env.set("CRONTAB_LOCK_TIMEOUT", "20");
        env.set("CRONTAB_LOCK_REFRESH_INTERVAL", "20");
        let settings = Settings::from_env(&env);
        assert_eq!(settings.renewal_interval, DEFAULT_RENEWAL_INTERVAL);
    }

    #[test]
    fn auto_retry_is_unlimited_unless_bounded() {
        let env = InMemoryEnv::new();
        env.set("CRONTAB_AUTO_RETRY", "true");
        assert_eq!(Settings::from_env(&env).retry, RetryPolicy::unlimited());

        env.set("CRONTAB_MAX_RETRIES", "3");
        assert_eq!(Settings::from_env(&env).retry, RetryPolicy::bounded(3));

        env.set("CRONTAB_AUTO_RETRY", "0");
        assert_eq!(Settings::from_env(&env).retry, RetryPolicy::disabled());
    }

    #[test]
    fn retry_policy_allows() {
        assert!(!RetryPolicy::disabled().allows(1));
        assert!(RetryPolicy::bounded(2).allows(2));
        assert!(!RetryPolicy::bounded(2).allows(3));
        assert!(RetryPolicy::unlimited().allows(u32::MAX));
    }

    #[test]
    fn timezone_from_env() {
        let env = InMemoryEnv::new();
        env.set("CRONTAB_TIMEZONE", "Europe/Berlin");
        assert_eq!(Settings::from_env(&env).timezone, chrono_tz::Europe::Berlin);
    }

    #[test]
    fn nats_url_selects_network_lease() {
        let env = InMemoryEnv::new();
        env.set("NATS_URL", "host1:4222 , host2:4222");
        env.set("NATS_TOKEN", "secret");

        let nats = Settings::from_env(&env).nats.expect("nats configured");

        assert_eq!(nats.servers, vec!["host1:4222", "host2:4222"]);
        assert!(matches!(nats.auth, NatsAuth::Token(ref t) if t == "secret"));
    }

    #[test]
    fn blank_nats_url_means_no_nats() {
        let env = InMemoryEnv::new();
        env.set("NATS_URL", " , ");
        assert!(NatsConfig::from_env(&env).is_none());
    }

    #[test]
    fn nats_credentials_take_priority() {
        let env = InMemoryEnv::new();
        env.set("NATS_URL", "localhost:4222");
        env.set("NATS_CREDS", "/etc/nats/user.creds");
        env.set("NATS_USER", "u");
        env.set("NATS_PASSWORD", "p");

        let nats = NatsConfig::from_env(&env).unwrap();
        assert!(matches!(nats.auth, NatsAuth::Credentials(_)));
        assert_eq!(nats.auth.description(), "credentials file");
    }
}
