//! # Engine Configuration
//!
//! Retransmission, acknowledgement and housekeeping parameters.
//!
//! Defaults follow the usual WS-RM policy values (6 s retransmission with
//! exponential backoff, 10 retransmissions, 3 s acknowledgement interval,
//! inactivity timeout disabled). Every field can be overridden from `RM_*`
//! environment variables through [`RmConfig::from_env`].

use crate::domain::MessageType;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },

    #[error("Invalid value for {var}: {value}")]
    InvalidEnvValue { var: String, value: String },
}

#[derive(Clone, Debug)]
pub struct RmConfig {
    /// Base delay between retransmissions of an unacknowledged message.
    pub retransmission_interval: Duration,
    /// Double the delay after every attempt.
    pub exponential_backoff: bool,
    /// Attempts allowed before the sequence times out (`None` = unbounded).
    pub max_retransmission_count: Option<u32>,
    /// Delay before a queued acknowledgement is sent on its own.
    pub acknowledgement_interval: Duration,
    /// Idle time after which a sequence is given up (`None` = never).
    pub inactivity_timeout: Option<Duration>,
    /// Delay between termination/time-out and record removal (`None` = keep).
    pub sequence_removal_timeout: Option<Duration>,
    /// Upper bound on the sender's sleep between scans.
    pub sender_sleep_time: Duration,
    /// Upper bound on the invoker's sleep between scans.
    pub invoker_sleep_time: Duration,
    /// Minimum gap between two polls of one sequence.
    pub polling_wait_time: Duration,
    /// How often the sender runs removal / inactivity / orphan checks.
    pub housekeeping_interval: Duration,
    /// Age after which a message still waiting for a back-channel is reported.
    pub transport_wait_time: Duration,
    /// Deliver strictly by message number.
    pub invoke_in_order: bool,
    /// Run the polling manager.
    pub enable_make_connection: bool,
    /// Outbound message types silently dropped (fault-injection in tests).
    pub message_types_to_drop: Vec<MessageType>,
}

impl Default for RmConfig {
    fn default() -> Self {
        Self {
            retransmission_interval: Duration::from_millis(6000),
            exponential_backoff: true,
            max_retransmission_count: Some(10),
            acknowledgement_interval: Duration::from_millis(3000),
            inactivity_timeout: None,
            sequence_removal_timeout: Some(Duration::from_secs(60)),
            sender_sleep_time: Duration::from_millis(500),
            invoker_sleep_time: Duration::from_millis(1000),
            polling_wait_time: Duration::from_millis(3000),
            housekeeping_interval: Duration::from_secs(20),
            transport_wait_time: Duration::from_secs(300),
            invoke_in_order: true,
            enable_make_connection: true,
            message_types_to_drop: Vec::new(),
        }
    }
}

impl RmConfig {
    /// Short intervals for tests.
    pub fn for_testing() -> Self {
        Self {
            retransmission_interval: Duration::from_millis(100),
            exponential_backoff: false,
            max_retransmission_count: Some(3),
            acknowledgement_interval: Duration::from_millis(50),
            sequence_removal_timeout: Some(Duration::from_millis(500)),
            sender_sleep_time: Duration::from_millis(20),
            invoker_sleep_time: Duration::from_millis(20),
            polling_wait_time: Duration::from_millis(100),
            housekeeping_interval: Duration::from_millis(200),
            transport_wait_time: Duration::from_secs(2),
            ..Self::default()
        }
    }

    /// Delay before attempt `sent_count + 1`, given `sent_count` attempts so far.
    pub fn retransmission_delay(&self, sent_count: u32) -> Duration {
        if !self.exponential_backoff || sent_count <= 1 {
            return self.retransmission_interval;
        }
        let factor = 1u32.checked_shl(sent_count - 1).unwrap_or(u32::MAX);
        self.retransmission_interval.saturating_mul(factor)
    }

    pub fn drops(&self, message_type: MessageType) -> bool {
        self.message_types_to_drop.contains(&message_type)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retransmission_interval.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "retransmission_interval",
            });
        }
        if self.polling_wait_time.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "polling_wait_time",
            });
        }
        Ok(())
    }

    /// Defaults overridden from `RM_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64, _>(&lookup, "RM_RETRANSMISSION_INTERVAL_MS")? {
            config.retransmission_interval = Duration::from_millis(ms);
        }
        if let Some(flag) = parse_var::<bool, _>(&lookup, "RM_EXPONENTIAL_BACKOFF")? {
            config.exponential_backoff = flag;
        }
        if let Some(count) = parse_var::<i64, _>(&lookup, "RM_MAX_RETRANSMISSION_COUNT")? {
            config.max_retransmission_count = u32::try_from(count).ok();
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "RM_ACK_INTERVAL_MS")? {
            config.acknowledgement_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<i64, _>(&lookup, "RM_INACTIVITY_TIMEOUT_MS")? {
            config.inactivity_timeout = u64::try_from(ms).ok().map(Duration::from_millis);
        }
        if let Some(ms) = parse_var::<i64, _>(&lookup, "RM_SEQUENCE_REMOVAL_TIMEOUT_MS")? {
            config.sequence_removal_timeout = u64::try_from(ms).ok().map(Duration::from_millis);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "RM_POLLING_WAIT_MS")? {
            config.polling_wait_time = Duration::from_millis(ms);
        }
        if let Some(flag) = parse_var::<bool, _>(&lookup, "RM_INVOKE_IN_ORDER")? {
            config.invoke_in_order = flag;
        }
        if let Some(flag) = parse_var::<bool, _>(&lookup, "RM_ENABLE_MAKE_CONNECTION")? {
            config.enable_make_connection = flag;
        }
        if let Some(list) = lookup("RM_DROP_MESSAGE_TYPES") {
            config.message_types_to_drop = list
                .split(',')
                .filter(|name| !name.trim().is_empty())
                .filter_map(|name| {
                    let parsed = MessageType::from_config_name(name);
                    if parsed.is_none() {
                        warn!(
                            "[rm-engine] Ignoring unknown message type '{}' in RM_DROP_MESSAGE_TYPES",
                            name
                        );
                    }
                    parsed
                })
                .collect();
        }

        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnvValue {
                var: var.to_string(),
                value: raw,
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = RmConfig::default();
        assert_eq!(config.retransmission_interval, Duration::from_millis(6000));
        assert_eq!(config.acknowledgement_interval, Duration::from_millis(3000));
        assert_eq!(config.max_retransmission_count, Some(10));
        assert!(config.exponential_backoff);
        assert!(config.inactivity_timeout.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_doubles() {
        let config = RmConfig {
            retransmission_interval: Duration::from_millis(100),
            exponential_backoff: true,
            ..RmConfig::default()
        };
        assert_eq!(config.retransmission_delay(1), Duration::from_millis(100));
        assert_eq!(config.retransmission_delay(2), Duration::from_millis(200));
        assert_eq!(config.retransmission_delay(4), Duration::from_millis(800));
        // Saturates instead of overflowing
        assert!(config.retransmission_delay(80) >= Duration::from_millis(100));
    }

    #[test]
    fn test_fixed_interval() {
        let config = RmConfig::for_testing();
        assert_eq!(config.retransmission_delay(5), config.retransmission_interval);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("RM_RETRANSMISSION_INTERVAL_MS", "250"),
            ("RM_MAX_RETRANSMISSION_COUNT", "-1"),
            ("RM_INACTIVITY_TIMEOUT_MS", "60000"),
            ("RM_EXPONENTIAL_BACKOFF", "false"),
            ("RM_DROP_MESSAGE_TYPES", "Ack, Nonsense,Application"),
        ]
        .into_iter()
        .collect();

        let config = RmConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.retransmission_interval, Duration::from_millis(250));
        assert_eq!(config.max_retransmission_count, None);
        assert_eq!(config.inactivity_timeout, Some(Duration::from_secs(60)));
        assert!(!config.exponential_backoff);
        assert_eq!(
            config.message_types_to_drop,
            vec![MessageType::Acknowledgement, MessageType::Application]
        );
    }

    #[test]
    fn test_env_rejects_garbage() {
        let err = RmConfig::from_lookup(|k| {
            (k == "RM_ACK_INTERVAL_MS").then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnvValue { .. }));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = RmConfig {
            retransmission_interval: Duration::ZERO,
            ..RmConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroDuration {
                field: "retransmission_interval"
            })
        );
    }
}
