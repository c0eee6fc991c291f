//! Recognised queue configuration keys, defaults and value parsing.
//!
//! Values are stored as strings and parsed on every read; nothing here caches.

use core::str::FromStr;
use std::time::Duration;

use crate::error::{QueueError, QueueResult};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    /// Default retry ceiling applied to jobs at enqueue time.
    MaxRetries,
    /// Exponent base for retry delays.
    BackoffBase,
    /// Idle poll period of workers, in seconds (fractions allowed).
    PollIntervalSec,
    /// Cooperative shutdown flag, `"0"` or `"1"`.
    GracefulStop,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 4] = [
        ConfigKey::MaxRetries,
        ConfigKey::BackoffBase,
        ConfigKey::PollIntervalSec,
        ConfigKey::GracefulStop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKey::MaxRetries => "max_retries",
            ConfigKey::BackoffBase => "backoff_base",
            ConfigKey::PollIntervalSec => "poll_interval_sec",
            ConfigKey::GracefulStop => "graceful_stop",
        }
    }

    pub fn default_value(&self) -> &'static str {
        match self {
            ConfigKey::MaxRetries => "3",
            ConfigKey::BackoffBase => "2",
            ConfigKey::PollIntervalSec => "1",
            ConfigKey::GracefulStop => "0",
        }
    }

    /// Check that `value` parses for this key.
    pub fn validate(&self, value: &str) -> QueueResult<()> {
        match self {
            ConfigKey::MaxRetries => parse_max_retries(value).map(|_| ()),
            ConfigKey::BackoffBase => parse_backoff_base(value).map(|_| ()),
            ConfigKey::PollIntervalSec => parse_poll_interval(value).map(|_| ()),
            ConfigKey::GracefulStop => parse_flag(value).map(|_| ()),
        }
    }
}

impl core::fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ConfigKey {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConfigKey::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| QueueError::not_found(format!("config key {s}")))
    }
}

pub fn parse_max_retries(value: &str) -> QueueResult<u32> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|e| QueueError::config(format!("max_retries={value:?}: {e}")))
}

pub fn parse_backoff_base(value: &str) -> QueueResult<u32> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|e| QueueError::config(format!("backoff_base={value:?}: {e}")))
}

pub fn parse_poll_interval(value: &str) -> QueueResult<Duration> {
    let secs = value
        .trim()
        .parse::<f64>()
        .map_err(|e| QueueError::config(format!("poll_interval_sec={value:?}: {e}")))?;
    let interval = Duration::try_from_secs_f64(secs)
        .map_err(|e| QueueError::config(format!("poll_interval_sec={value:?}: {e}")))?;
    // Zero would turn an idle worker into a busy loop against the database.
    if interval.is_zero() {
        return Err(QueueError::config(format!(
            "poll_interval_sec={value:?}: must be greater than zero"
        )));
    }
    Ok(interval)
}

pub fn parse_flag(value: &str) -> QueueResult<bool> {
    match value.trim() {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(QueueError::config(format!(
            "graceful_stop must be \"0\" or \"1\", got {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        for key in ConfigKey::ALL {
            key.validate(key.default_value()).unwrap();
            assert_eq!(key.as_str().parse::<ConfigKey>().unwrap(), key);
        }
    }

    #[test]
    fn unknown_key_is_not_found() {
        assert!(matches!(
            "retry_limit".parse::<ConfigKey>(),
            Err(QueueError::NotFound(_))
        ));
    }

    #[test]
    fn typed_parsers_reject_garbage() {
        assert!(parse_max_retries("-1").is_err());
        assert!(parse_backoff_base("two").is_err());
        assert!(parse_poll_interval("-0.5").is_err());
        assert!(parse_poll_interval("0").is_err());
        assert!(parse_poll_interval("0.0").is_err());
        assert!(parse_flag("yes").is_err());
        assert_eq!(parse_poll_interval("0.25").unwrap(), Duration::from_millis(250));
        assert!(parse_flag("1").unwrap());
    }
}
