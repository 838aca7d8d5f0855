//! Quota configuration.
//!
//! Defaults match a small public demo deployment. Override per limit from
//! the environment:
//!
//! ```text
//! CHAT_GATE_SEND_MESSAGE_RATE=2
//! CHAT_GATE_SEND_MESSAGE_PERIOD_MS=5000
//! CHAT_GATE_TOKEN_USAGE_PER_USER_CAPACITY=20000
//! ```
//!
//! or load a JSON file with the same shape as [`LimitsConfig`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ratelimit::LimitPolicy;

pub const SEND_MESSAGE: &str = "send_message";
pub const GLOBAL_SEND_MESSAGE: &str = "global_send_message";
pub const TOKEN_USAGE_PER_USER: &str = "token_usage_per_user";
pub const GLOBAL_TOKEN_USAGE: &str = "global_token_usage";

const ENV_PREFIX: &str = "CHAT_GATE_";

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Per user: one message per 5s, accruing up to two.
    pub send_message: LimitPolicy,
    pub global_send_message: LimitPolicy,
    pub token_usage_per_user: LimitPolicy,
    pub global_token_usage: LimitPolicy,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            send_message: LimitPolicy::fixed_window(1.0, 5 * SECOND).with_capacity(2.0),
            global_send_message: LimitPolicy::token_bucket(1_000.0, MINUTE),
            token_usage_per_user: LimitPolicy::token_bucket(2_000.0, MINUTE)
                .with_capacity(10_000.0),
            global_token_usage: LimitPolicy::token_bucket(100_000.0, MINUTE),
        }
    }
}

impl LimitsConfig {
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env(self) -> ConfigResult<Self> {
        self.from_vars(|name| std::env::var(name).ok())
    }

    /// Applies overrides from an arbitrary variable source.
    pub fn from_vars(mut self, lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<Self> {
        for (name, policy) in self.entries_mut() {
            let prefix = format!("{}{}", ENV_PREFIX, name.to_uppercase());

            if let Some(rate) = parse_var::<f64>(&lookup, &format!("{}_RATE", prefix))? {
                policy.rate = rate;
            }
            if let Some(period) = parse_var::<u64>(&lookup, &format!("{}_PERIOD_MS", prefix))? {
                policy.period_ms = period;
            }
            if let Some(capacity) = parse_var::<f64>(&lookup, &format!("{}_CAPACITY", prefix))? {
                policy.capacity = Some(capacity);
            }
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        for (name, policy) in self.entries() {
            let invalid = |message: &str| ConfigError::InvalidValue {
                key: name.to_string(),
                message: message.to_string(),
            };
            if policy.rate.is_nan() || policy.rate <= 0.0 {
                return Err(invalid("rate must be positive"));
            }
            if policy.period_ms == 0 {
                return Err(invalid("period must be positive"));
            }
            let capacity = policy.effective_capacity();
            if capacity.is_nan() || capacity <= 0.0 {
                return Err(invalid("capacity must be positive"));
            }
        }
        Ok(())
    }

    pub fn entries(&self) -> [(&'static str, LimitPolicy); 4] {
        [
            (SEND_MESSAGE, self.send_message),
            (GLOBAL_SEND_MESSAGE, self.global_send_message),
            (TOKEN_USAGE_PER_USER, self.token_usage_per_user),
            (GLOBAL_TOKEN_USAGE, self.global_token_usage),
        ]
    }

    fn entries_mut(&mut self) -> [(&'static str, &mut LimitPolicy); 4] {
        [
            (SEND_MESSAGE, &mut self.send_message),
            (GLOBAL_SEND_MESSAGE, &mut self.global_send_message),
            (TOKEN_USAGE_PER_USER, &mut self.token_usage_per_user),
            (GLOBAL_TOKEN_USAGE, &mut self.global_token_usage),
        ]
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> ConfigResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: name.to_string(),
                message: e.to_string(),
            }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;
    use crate::ratelimit::PolicyKind;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = LimitsConfig::default();
        assert_eq!(config.send_message.kind, PolicyKind::FixedWindow);
        assert_eq!(config.send_message.period_ms, 5_000);
        assert_eq!(config.send_message.effective_capacity(), 2.0);
        assert_eq!(config.token_usage_per_user.effective_capacity(), 10_000.0);
        assert_eq!(config.global_send_message.effective_capacity(), 1_000.0);
        assert_eq!(config.global_token_usage.rate, 100_000.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = LimitsConfig::default()
            .from_vars(vars(&[
                ("CHAT_GATE_SEND_MESSAGE_RATE", "3"),
                ("CHAT_GATE_TOKEN_USAGE_PER_USER_CAPACITY", "20000"),
                ("CHAT_GATE_GLOBAL_TOKEN_USAGE_PERIOD_MS", "1000"),
            ]))
            .unwrap();

        assert_eq!(config.send_message.rate, 3.0);
        assert_eq!(config.token_usage_per_user.capacity, Some(20_000.0));
        assert_eq!(config.global_token_usage.period_ms, 1_000);
        assert_eq!(config.global_send_message, LimitsConfig::default().global_send_message);
    }

    #[test]
    fn test_env_invalid_number() {
        let err = LimitsConfig::default()
            .from_vars(vars(&[("CHAT_GATE_SEND_MESSAGE_RATE", "fast")]))
            .unwrap_err();
        assert!(err.to_string().contains("CHAT_GATE_SEND_MESSAGE_RATE"));
    }

    #[test]
    fn test_validation_rejects_zero_rate() {
        let err = LimitsConfig::default()
            .from_vars(vars(&[("CHAT_GATE_GLOBAL_SEND_MESSAGE_RATE", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == GLOBAL_SEND_MESSAGE));
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"send_message": {{"kind": "fixed_window", "rate": 5, "period_ms": 1000}}}}"#
        )
        .unwrap();

        let config = LimitsConfig::from_file(file.path()).unwrap();
        assert_eq!(config.send_message.rate, 5.0);
        assert_eq!(config.send_message.capacity, None);
        assert_eq!(config.global_token_usage, LimitsConfig::default().global_token_usage);
    }
}
