use garde::Validate;
use serde::Deserialize;
use std::time::Duration;
use strum::{Display, EnumString};

use crate::services::backoff::RetryPolicy;
use crate::services::dispatcher::{DispatchSettings, PushSettings, WakeStrategyKind};
use crate::services::delivery::{AuthStyle, SenderSettings};

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AppConfig {
    /// Server bind address for the operational API.
    #[serde(default = "default_bind_addr")]
    #[garde(length(min = 1))]
    pub bind_addr: String,

    /// Prometheus scrape address for the worker process.
    #[serde(default = "default_metrics_addr")]
    #[garde(length(min = 1))]
    pub metrics_addr: String,

    /// PostgreSQL connection string
    #[garde(length(min = 1))]
    pub database_url: String,

    /// S3-compatible bucket holding vehicle and plate images
    #[serde(default = "default_s3_bucket")]
    #[garde(length(min = 1))]
    pub s3_bucket: String,

    /// S3 endpoint URL (e.g. "https://s3.wasabisys.com")
    #[garde(length(min = 1))]
    pub s3_endpoint: String,

    #[serde(default = "default_s3_region")]
    #[garde(length(min = 1))]
    pub s3_region: String,

    #[garde(length(min = 1))]
    pub s3_access_key: String,

    #[garde(length(min = 1))]
    pub s3_secret_key: String,

    /// Endpoint receiving plate-hit notifications
    #[garde(length(min = 1))]
    pub alert_url: String,

    /// Credential attached to every notification
    #[garde(length(min = 1))]
    pub alert_auth_token: String,

    #[serde(default)]
    #[garde(skip)]
    pub alert_auth_style: AuthStyle,

    /// Header carrying the token when `alert_auth_style` is `header`
    #[serde(default = "default_auth_header")]
    #[garde(length(min = 1))]
    pub alert_auth_header: String,

    #[serde(default)]
    #[garde(skip)]
    pub alert_accept_invalid_certs: bool,

    /// Use the simulated vendor instead of the real endpoint.
    #[serde(default)]
    #[garde(skip)]
    pub alert_simulate: bool,

    /// With `alert_simulate`, refuse reads whose ID ends in an odd digit.
    #[serde(default)]
    #[garde(skip)]
    pub alert_simulate_fail_odd: bool,

    #[serde(default = "default_poll_interval_ms")]
    #[garde(range(min = 10))]
    pub poll_interval_ms: u64,

    #[serde(default = "default_send_timeout_ms")]
    #[garde(range(min = 100))]
    pub send_timeout_ms: u64,

    #[serde(default = "default_batch_size")]
    #[garde(range(min = 1, max = 1000))]
    pub batch_size: u32,

    #[serde(default = "default_max_attempts")]
    #[garde(range(min = 1, max = 100))]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    #[garde(range(min = 1))]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_cap_ms")]
    #[garde(range(min = 1))]
    pub backoff_cap_ms: u64,

    #[serde(default = "default_lease_ms")]
    #[garde(range(min = 1000))]
    pub lease_ms: u64,

    /// Lease owner recorded on claimed rows
    #[serde(default = "default_worker_id")]
    #[garde(length(min = 1, max = 128))]
    pub worker_id: String,

    #[serde(default)]
    #[garde(skip)]
    pub wake_strategy: WakeStrategyConfig,

    #[serde(default = "default_min_sleep_ms")]
    #[garde(range(min = 1))]
    pub min_sleep_ms: u64,

    #[serde(default = "default_fallback_delay_ms")]
    #[garde(range(min = 1))]
    pub fallback_delay_ms: u64,

    #[serde(default = "default_heartbeat_ms")]
    #[garde(range(min = 10))]
    pub heartbeat_ms: u64,

    #[serde(default = "default_miss_factor")]
    #[garde(range(min = 2, max = 20))]
    pub miss_factor: u32,

    #[serde(default = "default_resubscribe_base_ms")]
    #[garde(range(min = 1))]
    pub resubscribe_base_ms: u64,

    #[serde(default = "default_resubscribe_cap_ms")]
    #[garde(range(min = 1))]
    pub resubscribe_cap_ms: u64,

    #[serde(default = "default_resubscribe_attempts")]
    #[garde(range(min = 1, max = 50))]
    pub resubscribe_attempts: u32,
}

/// Wake strategy as spelled in the environment (`interval` or `push`).
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum WakeStrategyConfig {
    #[default]
    Interval,
    Push,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9100".to_string()
}

fn default_s3_bucket() -> String {
    "njsnap".to_string()
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

fn default_auth_header() -> String {
    "AuthToken".to_string()
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_send_timeout_ms() -> u64 {
    60_000
}

fn default_batch_size() -> u32 {
    10
}

fn default_max_attempts() -> u32 {
    8
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    3_600_000
}

fn default_lease_ms() -> u64 {
    900_000
}

fn default_worker_id() -> String {
    format!("worker-{}", uuid::Uuid::new_v4())
}

fn default_min_sleep_ms() -> u64 {
    250
}

fn default_fallback_delay_ms() -> u64 {
    500
}

fn default_heartbeat_ms() -> u64 {
    30_000
}

fn default_miss_factor() -> u32 {
    3
}

fn default_resubscribe_base_ms() -> u64 {
    500
}

fn default_resubscribe_cap_ms() -> u64 {
    30_000
}

fn default_resubscribe_attempts() -> u32 {
    6
}

impl AppConfig {
    /// Load from the environment (and `.env` if present) and validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.check()?;
        Ok(config)
    }

    /// Field rules plus the constraints that span several fields.
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()
            .map_err(|report| ConfigError::Invalid(report.to_string()))?;

        // One lease covers a whole batch, sent one job after another.
        let batch_send_ms = self.send_timeout_ms.saturating_mul(u64::from(self.batch_size));
        if self.lease_ms <= batch_send_ms {
            return Err(ConfigError::Invalid(format!(
                "lease_ms ({}) must exceed batch_size ({}) x send_timeout_ms ({})",
                self.lease_ms, self.batch_size, self.send_timeout_ms
            )));
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff_cap_ms ({}) is below backoff_base_ms ({})",
                self.backoff_cap_ms, self.backoff_base_ms
            )));
        }
        if self.resubscribe_cap_ms < self.resubscribe_base_ms {
            return Err(ConfigError::Invalid(format!(
                "resubscribe_cap_ms ({}) is below resubscribe_base_ms ({})",
                self.resubscribe_cap_ms, self.resubscribe_base_ms
            )));
        }
        if self.heartbeat_ms < self.min_sleep_ms || self.poll_interval_ms < self.min_sleep_ms {
            return Err(ConfigError::Invalid(
                "heartbeat_ms and poll_interval_ms must not be below min_sleep_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_cap_ms),
        )
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    pub fn sender_settings(&self) -> SenderSettings {
        SenderSettings {
            url: self.alert_url.clone(),
            auth_token: self.alert_auth_token.clone(),
            auth_style: self.alert_auth_style,
            auth_header: self.alert_auth_header.clone(),
            accept_invalid_certs: self.alert_accept_invalid_certs,
        }
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            worker_id: self.worker_id.clone(),
            batch_size: self.batch_size,
            send_timeout: Duration::from_millis(self.send_timeout_ms),
            min_sleep: Duration::from_millis(self.min_sleep_ms),
            fallback_delay: Duration::from_millis(self.fallback_delay_ms),
        }
    }

    pub fn wake_strategy_kind(&self) -> WakeStrategyKind {
        match self.wake_strategy {
            WakeStrategyConfig::Interval => WakeStrategyKind::Interval {
                poll_interval: Duration::from_millis(self.poll_interval_ms),
            },
            WakeStrategyConfig::Push => WakeStrategyKind::Push(PushSettings {
                heartbeat: Duration::from_millis(self.heartbeat_ms),
                miss_factor: self.miss_factor,
                resubscribe_base: Duration::from_millis(self.resubscribe_base_ms),
                resubscribe_cap: Duration::from_millis(self.resubscribe_cap_ms),
                resubscribe_attempts: self.resubscribe_attempts,
            }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
