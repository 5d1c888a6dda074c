use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use validator::{Validate, ValidationError};

use crate::error::{Result, ThrottlerError};
use crate::policy::ExecutionPolicy;

const ENV_PREFIX: &str = "TRAFFICCTL_";

/// Runtime settings shared by every component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Settings {
    /// How often idle registry entries are swept.
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_non_zero_duration"))]
    pub sweep_interval: Duration,

    /// Untouched, fully refilled token buckets older than this are dropped.
    #[serde(with = "humantime_serde")]
    pub rate_limit_idle_ttl: Duration,

    /// Default timeout armed by the operation tracker.
    #[serde(with = "humantime_serde")]
    pub loading_timeout: Duration,

    pub default_policy: ExecutionPolicy,

    #[validate(length(min = 1))]
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            rate_limit_idle_ttl: Duration::from_secs(300),
            loading_timeout: Duration::from_secs(30),
            default_policy: ExecutionPolicy::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from `TRAFFICCTL_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load settings from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&raw)?;
        settings.validate()?;
        Ok(settings)
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        let mut settings = Settings::default();

        if let Some(value) = var("SWEEP_INTERVAL") {
            settings.sweep_interval = parse_duration("SWEEP_INTERVAL", &value)?;
        }
        if let Some(value) = var("RATE_LIMIT_IDLE_TTL") {
            settings.rate_limit_idle_ttl = parse_duration("RATE_LIMIT_IDLE_TTL", &value)?;
        }
        if let Some(value) = var("LOADING_TIMEOUT") {
            settings.loading_timeout = parse_duration("LOADING_TIMEOUT", &value)?;
        }
        if let Some(value) = var("CACHE_TTL") {
            settings.default_policy.cache_ttl = parse_duration("CACHE_TTL", &value)?;
        }
        if let Some(value) = var("THROTTLE") {
            settings.default_policy.throttle = parse_duration("THROTTLE", &value)?;
        }
        if let Some(value) = var("RETRY_BASE_DELAY") {
            settings.default_policy.retry_base_delay = parse_duration("RETRY_BASE_DELAY", &value)?;
        }
        if let Some(value) = var("MAX_RETRIES") {
            settings.default_policy.max_retries = value.parse().map_err(|_| {
                ThrottlerError::Config(format!("{}MAX_RETRIES must be an integer, got '{}'", ENV_PREFIX, value))
            })?;
        }
        if let Some(value) = var("DEDUPLICATE") {
            settings.default_policy.deduplicate = value.parse().map_err(|_| {
                ThrottlerError::Config(format!("{}DEDUPLICATE must be true or false, got '{}'", ENV_PREFIX, value))
            })?;
        }
        if let Some(value) = var("LOG_LEVEL") {
            settings.log_level = value;
        }

        settings.validate()?;
        Ok(settings)
    }
}

fn parse_duration(name: &str, value: &str) -> Result<Duration> {
    humantime_serde::re::humantime::parse_duration(value).map_err(|e| {
        ThrottlerError::Config(format!("{}{} is not a valid duration: {}", ENV_PREFIX, name, e))
    })
}

pub(crate) fn validate_non_zero_duration(value: &Duration) -> std::result::Result<(), ValidationError> {
    if value.is_zero() {
        return Err(ValidationError::new("non_zero_duration"));
    }
    Ok(())
}
