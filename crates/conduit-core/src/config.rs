//! Engine configuration values.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::registry::DEFAULT_PRIORITY;
use crate::topic::DEFAULT_DELIMITER;

/// Reply timeout used by the correlation layer unless configured.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(2000);

/// Settings for a bus instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Topic segment delimiter.
    pub delimiter: String,
    /// Priority of registrations that do not specify one.
    pub default_priority: i64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            delimiter: DEFAULT_DELIMITER.to_string(),
            default_priority: DEFAULT_PRIORITY,
        }
    }
}

/// Settings for the request/reply correlation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// How long `send` waits for a reply, in milliseconds.
    pub reply_timeout_ms: u64,
}

impl CorrelationConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            reply_timeout_ms: DEFAULT_REPLY_TIMEOUT.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let bus = BusConfig::default();
        assert_eq!(bus.delimiter, ".");
        assert_eq!(bus.default_priority, 1);
        assert_eq!(
            CorrelationConfig::default().reply_timeout(),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_partial_deserialize() {
        let bus: BusConfig = serde_json::from_str(r#"{"delimiter":":"}"#).unwrap();
        assert_eq!(bus.delimiter, ":");
        assert_eq!(bus.default_priority, DEFAULT_PRIORITY);
    }
}
