//! Middleware options.

use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

const fn default_cpu_threshold() -> u32 {
    80
}

const fn default_memory_threshold() -> u32 {
    90
}

pub(crate) const fn default_true() -> bool {
    true
}

const fn default_max_queue_size() -> usize {
    100
}

const fn default_max_concurrent_requests() -> usize {
    100
}

const fn default_max_wait_seconds() -> u64 {
    30
}

const fn default_reject_status() -> u16 {
    503
}

fn default_reject_body() -> String {
    "Server is under high load. Please try again later.".into()
}

/// Invalid option detected at construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be between 0 and 100, got {value}")]
    ThresholdOutOfRange { field: &'static str, value: u32 },

    #[error("{field} must be at least 1")]
    ZeroSize { field: &'static str },

    #[error("reject_status {0} is not a valid HTTP status code")]
    InvalidRejectStatus(u16),
}

/// Options for the admission controller. Immutable once the layer is built.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// CPU utilisation (percent) at or above which requests are queued.
    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold: u32,

    /// Memory utilisation (percent) at or above which requests are queued.
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold: u32,

    /// When false, the memory probe is ignored by the admission decision.
    #[serde(default = "default_true")]
    pub use_memory_monitoring: bool,

    /// Capacity of the wait queue. Requests arriving while the queue is
    /// full are rejected.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Number of handlers allowed to execute downstream at once.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// How long a queued request may wait before it is answered with 503.
    #[serde(default = "default_max_wait_seconds")]
    pub max_wait_seconds: u64,

    /// Status code returned when the wait queue is full.
    #[serde(default = "default_reject_status")]
    pub reject_status: u16,

    /// Body returned when the wait queue is full.
    #[serde(default = "default_reject_body")]
    pub reject_body: String,

    #[serde(default = "default_true")]
    pub enable_logs: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cpu_threshold: default_cpu_threshold(),
            memory_threshold: default_memory_threshold(),
            use_memory_monitoring: default_true(),
            max_queue_size: default_max_queue_size(),
            max_concurrent_requests: default_max_concurrent_requests(),
            max_wait_seconds: default_max_wait_seconds(),
            reject_status: default_reject_status(),
            reject_body: default_reject_body(),
            enable_logs: default_true(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cpu_threshold > 100 {
            return Err(ConfigError::ThresholdOutOfRange {
                field: "cpu_threshold",
                value: self.cpu_threshold,
            });
        }

        if self.memory_threshold > 100 {
            return Err(ConfigError::ThresholdOutOfRange {
                field: "memory_threshold",
                value: self.memory_threshold,
            });
        }

        if self.max_queue_size == 0 {
            return Err(ConfigError::ZeroSize {
                field: "max_queue_size",
            });
        }

        if self.max_concurrent_requests == 0 {
            return Err(ConfigError::ZeroSize {
                field: "max_concurrent_requests",
            });
        }

        if StatusCode::from_u16(self.reject_status).is_err() {
            return Err(ConfigError::InvalidRejectStatus(self.reject_status));
        }

        Ok(())
    }

    pub(crate) fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_seconds)
    }

    pub(crate) fn reject_status(&self) -> StatusCode {
        StatusCode::from_u16(self.reject_status).expect("reject_status validated at construction")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();

        assert_eq!(config.cpu_threshold, 80);
        assert_eq!(config.memory_threshold, 90);
        assert!(config.use_memory_monitoring);
        assert_eq!(config.max_queue_size, 100);
        assert_eq!(config.max_concurrent_requests, 100);
        assert_eq!(config.max_wait_seconds, 30);
        assert_eq!(config.reject_status, 503);
        assert_eq!(
            config.reject_body,
            "Server is under high load. Please try again later."
        );
        assert!(config.enable_logs);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn explicit_values_round_trip() {
        let config: Config = serde_yaml::from_str(
            r#"
cpu_threshold: 70
memory_threshold: 85
use_memory_monitoring: false
max_queue_size: 10
max_concurrent_requests: 4
max_wait_seconds: 5
reject_status: 429
reject_body: busy
enable_logs: false
"#,
        )
        .unwrap();

        assert_eq!(config.cpu_threshold, 70);
        assert_eq!(config.memory_threshold, 85);
        assert!(!config.use_memory_monitoring);
        assert_eq!(config.max_queue_size, 10);
        assert_eq!(config.max_concurrent_requests, 4);
        assert_eq!(config.max_wait_seconds, 5);
        assert_eq!(config.reject_status, 429);
        assert_eq!(config.reject_body, "busy");
        assert!(!config.enable_logs);

        let echoed: Config = serde_yaml::from_str(&serde_yaml::to_string(&config).unwrap()).unwrap();
        assert_eq!(echoed.cpu_threshold, config.cpu_threshold);
        assert_eq!(echoed.reject_status, config.reject_status);
        assert_eq!(echoed.reject_body, config.reject_body);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let config: Config = serde_yaml::from_str("cpu_threshold: 50").unwrap();

        assert_eq!(config.cpu_threshold, 50);
        assert_eq!(config.memory_threshold, 90);
        assert_eq!(config.max_queue_size, 100);
    }

    #[test]
    fn rejects_invalid_values() {
        let config = Config {
            cpu_threshold: 101,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ThresholdOutOfRange {
                field: "cpu_threshold",
                value: 101
            })
        );

        let config = Config {
            memory_threshold: 200,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            max_queue_size: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroSize {
                field: "max_queue_size"
            })
        );

        let config = Config {
            max_concurrent_requests: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            reject_status: 99,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidRejectStatus(99)));
    }

    #[test]
    fn zero_wait_is_allowed() {
        let config = Config {
            max_wait_seconds: 0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.max_wait(), Duration::ZERO);
    }
}
