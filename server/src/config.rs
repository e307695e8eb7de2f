//! Configuration management for the server.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use innsync_engine::{RateLimitPolicy, RetrySchedule};

/// Which persistence backend to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Postgres,
    /// Process-local state, lost on restart
    Memory,
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    pub store: StoreKind,
    /// PostgreSQL connection URL (required unless `STORE=memory`)
    pub database_url: Option<String>,
    /// Bearer token required on operator routes when set
    pub auth_secret: Option<String>,
    /// Channel REST API base URL
    pub channel_base_url: String,
    /// Token exchange path, relative to the base URL
    pub channel_auth_path: String,
    pub rate_limit_low_water: u32,
    pub rate_limit_min_backoff: Duration,
    pub channel_max_attempts: u32,
    pub publish_max_attempts: u32,
    pub publish_backoff_base: Duration,
    pub publish_backoff_cap: Duration,
    /// Tokens are refreshed this long before their recorded expiry
    pub token_expiry_skew: Duration,
    pub worker_poll_interval: Duration,
    /// Bookings poll interval; `None` disables polling
    pub booking_poll_interval: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            store: StoreKind::Postgres,
            database_url: None,
            auth_secret: None,
            channel_base_url: "http://localhost:8080".to_string(),
            channel_auth_path: "/auth/token".to_string(),
            rate_limit_low_water: 10,
            rate_limit_min_backoff: Duration::from_secs(1),
            channel_max_attempts: 3,
            publish_max_attempts: 3,
            publish_backoff_base: Duration::from_secs(30),
            publish_backoff_cap: Duration::from_secs(900),
            token_expiry_skew: Duration::from_secs(60),
            worker_poll_interval: Duration::from_millis(2000),
            booking_poll_interval: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let host = env::var("HOST").unwrap_or(defaults.host);

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let store = match env::var("STORE").as_deref() {
            Err(_) | Ok("postgres") => StoreKind::Postgres,
            Ok("memory") => StoreKind::Memory,
            Ok(other) => return Err(ConfigError::InvalidStore(other.to_string())),
        };

        let database_url = env::var("DATABASE_URL").ok();
        if store == StoreKind::Postgres && database_url.is_none() {
            return Err(ConfigError::MissingDatabaseUrl);
        }

        let auth_secret = env::var("AUTH_SECRET").ok().filter(|s| !s.is_empty());

        let channel_base_url =
            env::var("CHANNEL_BASE_URL").map_err(|_| ConfigError::MissingChannelBaseUrl)?;
        let channel_auth_path =
            env::var("CHANNEL_AUTH_PATH").unwrap_or(defaults.channel_auth_path);

        let booking_poll_secs: u64 = number("BOOKING_POLL_INTERVAL_SECS", 0)?;

        Ok(Self {
            host,
            port,
            store,
            database_url,
            auth_secret,
            channel_base_url: channel_base_url.trim_end_matches('/').to_string(),
            channel_auth_path,
            rate_limit_low_water: number("RATE_LIMIT_LOW_WATER", defaults.rate_limit_low_water)?,
            rate_limit_min_backoff: Duration::from_secs(number(
                "RATE_LIMIT_MIN_BACKOFF_SECS",
                defaults.rate_limit_min_backoff.as_secs(),
            )?),
            channel_max_attempts: number("CHANNEL_MAX_ATTEMPTS", defaults.channel_max_attempts)?,
            publish_max_attempts: number("PUBLISH_MAX_ATTEMPTS", defaults.publish_max_attempts)?,
            publish_backoff_base: Duration::from_secs(number(
                "PUBLISH_BACKOFF_BASE_SECS",
                defaults.publish_backoff_base.as_secs(),
            )?),
            publish_backoff_cap: Duration::from_secs(number(
                "PUBLISH_BACKOFF_CAP_SECS",
                defaults.publish_backoff_cap.as_secs(),
            )?),
            token_expiry_skew: Duration::from_secs(number(
                "TOKEN_EXPIRY_SKEW_SECS",
                defaults.token_expiry_skew.as_secs(),
            )?),
            worker_poll_interval: Duration::from_millis(number(
                "WORKER_POLL_INTERVAL_MS",
                defaults.worker_poll_interval.as_millis() as u64,
            )?),
            booking_poll_interval: (booking_poll_secs > 0)
                .then(|| Duration::from_secs(booking_poll_secs)),
        })
    }

    pub fn rate_limit_policy(&self) -> RateLimitPolicy {
        RateLimitPolicy {
            low_water: self.rate_limit_low_water,
            min_backoff: self.rate_limit_min_backoff,
            max_attempts: self.channel_max_attempts.max(1),
        }
    }

    pub fn retry_schedule(&self) -> RetrySchedule {
        RetrySchedule {
            max_attempts: self.publish_max_attempts.max(1),
            base: chrono_duration(self.publish_backoff_base),
            cap: chrono_duration(self.publish_backoff_cap),
        }
    }

    pub fn token_skew(&self) -> chrono::Duration {
        chrono_duration(self.token_expiry_skew)
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Read a numeric variable, falling back to `default` when unset.
fn number<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { name, value }),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required")]
    MissingDatabaseUrl,

    #[error("CHANNEL_BASE_URL environment variable is required")]
    MissingChannelBaseUrl,

    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid STORE value: {0} (expected postgres or memory)")]
    InvalidStore(String),

    #[error("Invalid {name} value: {value}")]
    InvalidNumber { name: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_channel_policy() {
        let config = Config::default();
        let policy = config.rate_limit_policy();
        assert_eq!(policy, RateLimitPolicy::default());

        let schedule = config.retry_schedule();
        assert_eq!(schedule, RetrySchedule::default());
    }
}
