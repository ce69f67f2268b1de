//! Configuration validation.

use super::error::{ConfigError, ConfigResult};
use super::schema::{GramflowConfig, LogOutput, LoggingConfig, RateLimitSection};

/// Validates the entire configuration.
///
/// Runs the dispatcher's own checks on the derived
/// [`DispatcherConfig`](gramflow_framework::DispatcherConfig), then the
/// sections it does not cover.
pub fn validate_config(config: &GramflowConfig) -> ConfigResult<()> {
    config.dispatcher_config().validate()?;
    validate_rate_limit(&config.rate_limit)?;
    validate_logging(&config.logging)?;
    Ok(())
}

fn validate_rate_limit(section: &RateLimitSection) -> ConfigResult<()> {
    for (key, limit) in &section.overrides {
        if key.is_empty() {
            return Err(ConfigError::invalid_override(key, "key must not be empty"));
        }
        if !(limit.rate.is_finite() && limit.rate > 0.0) {
            return Err(ConfigError::invalid_override(
                key,
                format!("rate must be positive, got {}", limit.rate),
            ));
        }
        if !(limit.capacity.is_finite() && limit.capacity >= 1.0) {
            return Err(ConfigError::invalid_override(
                key,
                format!("capacity must be at least 1, got {}", limit.capacity),
            ));
        }
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> ConfigResult<()> {
    if logging.output == LogOutput::File && logging.file_path.is_none() {
        return Err(ConfigError::validation(
            "logging.file_path is required when logging.output = \"file\"",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitOverride;

    #[test]
    fn test_defaults_are_valid() {
        assert!(validate_config(&GramflowConfig::default()).is_ok());
    }

    #[test]
    fn test_rejects_zero_workers_and_capacity() {
        let mut config = GramflowConfig::default();
        config.dispatcher.worker_count = 0;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::ValidationError { .. })
        ));

        let mut config = GramflowConfig::default();
        config.dispatcher.queue_capacity = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_rejects_non_positive_rates() {
        let mut config = GramflowConfig::default();
        config.rate_limit.rate = 0.0;
        assert!(validate_config(&config).is_err());

        let mut config = GramflowConfig::default();
        config.rate_limit.capacity = -1.0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_rejects_bad_override() {
        let mut config = GramflowConfig::default();
        config.rate_limit.overrides.insert(
            "42".into(),
            LimitOverride {
                rate: 1.0,
                capacity: 0.0,
            },
        );
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::InvalidOverride { key, .. }) if key == "42"
        ));
    }

    #[test]
    fn test_rejects_fractional_override_capacity() {
        let mut config = GramflowConfig::default();
        config.rate_limit.overrides.insert(
            "7".into(),
            LimitOverride {
                rate: 1.0,
                capacity: 0.5,
            },
        );
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::InvalidOverride { key, .. }) if key == "7"
        ));

        config.rate_limit.overrides.get_mut("7").unwrap().capacity = 1.0;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_file_output_needs_path() {
        let mut config = GramflowConfig::default();
        config.logging.output = LogOutput::File;
        assert!(validate_config(&config).is_err());

        config.logging.file_path = Some("gramflow.log".into());
        assert!(validate_config(&config).is_ok());
    }
}
