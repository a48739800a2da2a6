//! Checks on values that deserialize fine but cannot be used.

use conduit_core::TopicKey;

use super::error::{ConfigError, ConfigResult};
use super::schema::{ConduitConfig, LogOutput, LoggingConfig};

/// Validates the entire configuration.
pub fn validate_config(config: &ConduitConfig) -> ConfigResult<()> {
    validate_delimiter(&config.bus.delimiter)?;

    if config.transport.reply_timeout_ms == 0 {
        return Err(ConfigError::invalid(
            "transport.reply_timeout_ms",
            "must be greater than 0",
        ));
    }

    let namespace = &config.service.namespace;
    if !namespace.is_empty() {
        TopicKey::parse_with(namespace, &config.bus.delimiter).map_err(|e| {
            ConfigError::invalid("service.namespace", format!("not a valid topic: {e}"))
        })?;
    }

    validate_logging(&config.logging)
}

/// The delimiter separates alphanumeric segments, so it must contain
/// something that is not alphanumeric.
fn validate_delimiter(delimiter: &str) -> ConfigResult<()> {
    if delimiter.is_empty() {
        return Err(ConfigError::invalid("bus.delimiter", "must not be empty"));
    }
    if delimiter.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ConfigError::invalid(
            "bus.delimiter",
            format!("{delimiter:?} must not be alphanumeric"),
        ));
    }
    if delimiter.chars().any(char::is_whitespace) {
        return Err(ConfigError::invalid(
            "bus.delimiter",
            "must not contain whitespace",
        ));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> ConfigResult<()> {
    if logging.output == LogOutput::File && logging.file_path.is_none() {
        return Err(ConfigError::invalid(
            "logging.file_path",
            "required when logging.output is \"file\"",
        ));
    }
    if logging.filters.keys().any(|module| module.trim().is_empty()) {
        return Err(ConfigError::invalid(
            "logging.filters",
            "keys must name a module",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_default_config() {
        assert!(validate_config(&ConduitConfig::default()).is_ok());
    }

    #[test]
    fn test_validate_delimiter() {
        let mut config = ConduitConfig::default();
        for bad in ["", "x", "a1", " "] {
            config.bus.delimiter = bad.to_string();
            assert!(validate_config(&config).is_err(), "accepted {bad:?}");
        }
        for good in ["/", "::", "-"] {
            config.bus.delimiter = good.to_string();
            assert!(validate_config(&config).is_ok(), "rejected {good:?}");
        }
    }

    #[test]
    fn test_validate_timeout() {
        let mut config = ConduitConfig::default();
        config.transport.reply_timeout_ms = 0;
        let err = validate_config(&config).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid transport.reply_timeout_ms: must be greater than 0"
        );
    }

    #[test]
    fn test_validate_namespace() {
        let mut config = ConduitConfig::default();
        config.service.namespace = "billing.v2".to_string();
        assert!(validate_config(&config).is_ok());
        config.service.namespace = "billing service".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_file_output_needs_path() {
        let mut config = ConduitConfig::default();
        config.logging.output = LogOutput::File;
        assert!(validate_config(&config).is_err());
        config.logging.file_path = Some("conduit.log".into());
        assert!(validate_config(&config).is_ok());
    }
}
