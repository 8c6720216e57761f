use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Upper bound for every seconds setting (one year).
pub const MAX_SECS: f64 = 365.0 * 24.0 * 3600.0;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Like `env_or`, but values outside `0..=MAX_SECS` (or NaN) fall back too.
fn env_secs(key: &str, default: f64) -> f64 {
    let value = env_or(key, default);
    if in_range(value) { value } else { default }
}

fn in_range(secs: f64) -> bool {
    (0.0..=MAX_SECS).contains(&secs)
}

fn to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.clamp(0.0, MAX_SECS)).unwrap_or(Duration::ZERO)
}

/// Tuning for one process manager loop.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProcessManagerConfig {
    /// Delay between cycles that found no full batch (fractional seconds allowed)
    pub poll_interval_secs: f64,

    /// Maximum entities claimed per cycle
    pub batch_size: usize,

    /// Lease TTL granted on claim. Handlers running longer than this may see
    /// their entity processed again by another instance.
    pub lease_duration_secs: f64,

    /// Retries allowed before a retryable failure becomes fatal
    pub max_retries: u32,

    /// Claimed entities processed in parallel
    pub max_concurrent_handlers: usize,

    /// Upper bound for the back-off after storage failures
    pub max_backoff_secs: f64,
}

impl Default for ProcessManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: env_secs("IDHUB_POLL_INTERVAL_SECS", 1.0),
            batch_size: env_or("IDHUB_BATCH_SIZE", 20),
            lease_duration_secs: env_secs("IDHUB_LEASE_DURATION_SECS", 60.0),
            max_retries: env_or("IDHUB_MAX_RETRIES", 5),
            max_concurrent_handlers: env_or("IDHUB_MAX_CONCURRENT_HANDLERS", 8),
            max_backoff_secs: env_secs("IDHUB_MAX_BACKOFF_SECS", 60.0),
        }
    }
}

impl ProcessManagerConfig {
    /// Quick pickup of new work, small batches.
    pub fn low_latency() -> Self {
        Self {
            poll_interval_secs: 0.25,
            batch_size: 5,
            lease_duration_secs: 30.0,
            max_retries: 5,
            max_concurrent_handlers: 5,
            max_backoff_secs: 10.0,
        }
    }

    pub fn high_throughput() -> Self {
        Self {
            poll_interval_secs: 2.0,
            batch_size: 200,
            lease_duration_secs: 120.0,
            max_retries: 5,
            max_concurrent_handlers: 50,
            max_backoff_secs: 60.0,
        }
    }

    /// Rejects seconds settings that are negative, NaN, infinite or beyond
    /// `MAX_SECS`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("poll_interval_secs", self.poll_interval_secs),
            ("lease_duration_secs", self.lease_duration_secs),
            ("max_backoff_secs", self.max_backoff_secs),
        ] {
            if !in_range(value) {
                return Err(ConfigError::InvalidSeconds {
                    field,
                    value,
                    max: MAX_SECS,
                });
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        to_duration(self.poll_interval_secs)
    }

    pub fn lease_duration(&self) -> Duration {
        to_duration(self.lease_duration_secs)
    }

    /// Delay after `failures` consecutive storage failures: the poll interval
    /// doubled per failure, capped at `max_backoff_secs`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let base = to_duration(self.poll_interval_secs)
            .as_secs_f64()
            .max(0.001);
        let cap = to_duration(self.max_backoff_secs).as_secs_f64().max(base);
        let factor = 2f64.powi(failures.saturating_sub(1).min(30) as i32);
        to_duration((base * factor).min(cap))
    }
}

/// Everything `idhub serve` needs besides the database URL.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Prefix of the lease owner tokens this instance uses.
    pub runtime_id: String,
    pub holder_requests: ProcessManagerConfig,
    pub issuance: ProcessManagerConfig,
    /// How long a holder request may wait in `REQUESTED` for the issuer.
    pub requested_time_limit_secs: u64,
    pub issuer_endpoint: String,
    pub delivery_endpoint: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            runtime_id: std::env::var("IDHUB_RUNTIME_ID")
                .unwrap_or_else(|_| format!("idhub-{}", uuid::Uuid::new_v4().simple())),
            holder_requests: ProcessManagerConfig::default(),
            issuance: ProcessManagerConfig::default(),
            requested_time_limit_secs: env_or("IDHUB_REQUESTED_TIME_LIMIT_SECS", 3600),
            issuer_endpoint: env_or(
                "IDHUB_ISSUER_ENDPOINT",
                "http://localhost:8181/api/issuance".to_string(),
            ),
            delivery_endpoint: env_or(
                "IDHUB_DELIVERY_ENDPOINT",
                "http://localhost:8182/api/storage".to_string(),
            ),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&raw).map_err(|source| ConfigError::YamlParse {
            path: path.to_path_buf(),
            source,
        })?;
        config.holder_requests.validate()?;
        config.issuance.validate()?;
        Ok(config)
    }

    pub fn requested_time_limit(&self) -> Duration {
        Duration::from_secs(self.requested_time_limit_secs)
    }

    /// Lease owner token for one workflow loop of this instance.
    pub fn owner_token(&self, workflow: &str) -> String {
        format!("{}/{}", self.runtime_id, workflow)
    }
}
