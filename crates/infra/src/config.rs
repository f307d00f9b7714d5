//! Environment-driven consumer configuration.
//!
//! Every knob has a default matching the production deployment; only the
//! signing secret is required (and only by callers that decode events).

use std::time::Duration;

use crate::broker::StartPosition;
use crate::consumer::ConsumerSettings;

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("missing required setting {key} ({hint})")]
    MissingRequired { key: String, hint: String },
}

/// Full process configuration.
#[derive(Clone, PartialEq)]
pub struct ConsumerConfig {
    pub redis_url: String,
    pub dlq_key: String,
    pub secret: Option<String>,
    pub settings: ConsumerSettings,
}

impl core::fmt::Debug for ConsumerConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConsumerConfig")
            .field("redis_url", &self.redis_url)
            .field("dlq_key", &self.dlq_key)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("settings", &self.settings)
            .finish()
    }
}

impl ConsumerConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary lookup (tests, config files).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let defaults = ConsumerSettings::default();
        let stream = get("EVENT_BUS_STREAM").unwrap_or(defaults.stream.clone());
        let group = get("EVENT_BUS_GROUP").unwrap_or(defaults.group.clone());

        let batch_size = parse_or(&get, "EVENT_BUS_BATCH_SIZE", defaults.batch_size)?;
        if batch_size == 0 {
            return Err(invalid("EVENT_BUS_BATCH_SIZE", "0", "must be at least 1"));
        }
        let max_retries = parse_or(&get, "EVENT_BUS_MAX_RETRIES", defaults.max_retries)?;
        if max_retries == 0 {
            return Err(invalid("EVENT_BUS_MAX_RETRIES", "0", "must be at least 1"));
        }

        let retry_delay = millis_or(&get, "EVENT_BUS_RETRY_DELAY_MS", defaults.retry_delay)?;
        let processing_lease = millis_or(&get, "EVENT_BUS_PROCESSING_LEASE_MS", retry_delay)?;
        let reclaim_batch_size =
            parse_or(&get, "EVENT_BUS_RECLAIM_BATCH_SIZE", batch_size.saturating_mul(10))?;

        let start = match get("EVENT_BUS_START") {
            Some(raw) => raw
                .parse::<StartPosition>()
                .map_err(|e| invalid("EVENT_BUS_START", &raw, &e.to_string()))?,
            None => defaults.start,
        };

        let settings = ConsumerSettings {
            stream: stream.clone(),
            group,
            consumer_suffix: get("EVENT_BUS_CONSUMER_SUFFIX"),
            start,
            batch_size,
            block: millis_or(&get, "EVENT_BUS_BLOCK_MS", defaults.block)?,
            max_retries,
            retry_delay,
            processing_lease,
            reclaim_interval: millis_or(&get, "EVENT_BUS_RECLAIM_INTERVAL_MS", defaults.reclaim_interval)?,
            reclaim_batch_size: reclaim_batch_size.max(1),
            dedup_ttl: Duration::from_secs(parse_or(
                &get,
                "EVENT_BUS_DEDUP_TTL_SECS",
                defaults.dedup_ttl.as_secs(),
            )?),
            error_pause: millis_or(&get, "EVENT_BUS_ERROR_PAUSE_MS", defaults.error_pause)?,
            restart: defaults.restart,
        };

        Ok(Self {
            redis_url: get("REDIS_URL").unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
            dlq_key: get("EVENT_BUS_DLQ_KEY").unwrap_or_else(|| format!("{}.dlq", stream)),
            secret: get("EVENT_BUS_SECRET"),
            settings,
        })
    }

    /// The event signing secret, which decoding consumers cannot run without.
    pub fn require_secret(&self) -> Result<&str, ConfigError> {
        self.secret.as_deref().filter(|s| !s.is_empty()).ok_or_else(|| ConfigError::MissingRequired {
            key: "EVENT_BUS_SECRET".to_string(),
            hint: "shared HMAC key used by event producers".to_string(),
        })
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_or<G, T>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    match get(key) {
        Some(raw) => raw.parse::<T>().map_err(|e| invalid(key, &raw, &e.to_string())),
        None => Ok(default),
    }
}

fn millis_or<G>(get: &G, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, key, default.as_millis() as u64).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<ConsumerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ConsumerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_match_production_deployment() {
        let cfg = config(&[]).unwrap();
        let s = &cfg.settings;

        assert_eq!(cfg.redis_url, DEFAULT_REDIS_URL);
        assert_eq!(cfg.dlq_key, "finbot.events.dlq");
        assert_eq!(cfg.secret, None);
        assert_eq!(s.stream, "finbot.events");
        assert_eq!(s.group, "finbot-consumers");
        assert_eq!(s.batch_size, 10);
        assert_eq!(s.block, Duration::from_millis(1000));
        assert_eq!(s.max_retries, 3);
        assert_eq!(s.retry_delay, Duration::from_secs(300));
        assert_eq!(s.processing_lease, s.retry_delay);
        assert_eq!(s.reclaim_interval, Duration::from_secs(5));
        assert_eq!(s.reclaim_batch_size, 100);
        assert_eq!(s.dedup_ttl, Duration::from_secs(86_400));
        assert_eq!(s.start, StartPosition::Beginning);
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = config(&[
            ("EVENT_BUS_STREAM", "payments"),
            ("EVENT_BUS_BATCH_SIZE", "25"),
            ("EVENT_BUS_RETRY_DELAY_MS", "1500"),
            ("EVENT_BUS_CONSUMER_SUFFIX", "blue"),
            ("EVENT_BUS_START", "$"),
            ("EVENT_BUS_SECRET", "s3cret"),
        ])
        .unwrap();

        assert_eq!(cfg.dlq_key, "payments.dlq");
        assert_eq!(cfg.settings.batch_size, 25);
        assert_eq!(cfg.settings.reclaim_batch_size, 250);
        assert_eq!(cfg.settings.retry_delay, Duration::from_millis(1500));
        assert_eq!(cfg.settings.processing_lease, Duration::from_millis(1500));
        assert_eq!(cfg.settings.consumer_suffix.as_deref(), Some("blue"));
        assert_eq!(cfg.settings.start, StartPosition::NewOnly);
        assert_eq!(cfg.require_secret().unwrap(), "s3cret");
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let err = config(&[("EVENT_BUS_BLOCK_MS", "soon")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "EVENT_BUS_BLOCK_MS"));

        assert!(config(&[("EVENT_BUS_MAX_RETRIES", "0")]).is_err());
        assert!(config(&[("EVENT_BUS_BATCH_SIZE", "0")]).is_err());
    }

    #[test]
    fn missing_secret_is_reported_and_redacted_otherwise() {
        let cfg = config(&[]).unwrap();
        assert!(matches!(
            cfg.require_secret(),
            Err(ConfigError::MissingRequired { .. })
        ));

        let cfg = config(&[("EVENT_BUS_SECRET", "")]).unwrap();
        assert!(cfg.require_secret().is_err());

        let cfg = config(&[("EVENT_BUS_SECRET", "hunter2")]).unwrap();
        assert!(!format!("{:?}", cfg).contains("hunter2"));
    }
}
