//! Configuration validation traits and utilities

use crate::error::{ConfigError, ConfigResult};
use std::time::Duration;

/// Trait for validatable configuration
pub trait Validatable {
    /// Validate the configuration
    fn validate(&self) -> ConfigResult<()>;

    /// Get the domain name for error reporting
    fn domain_name(&self) -> &'static str;

    /// Helper to create a domain-specific validation error
    fn validation_error(&self, message: impl Into<String>) -> ConfigError {
        ConfigError::DomainError {
            domain: self.domain_name().to_string(),
            message: message.into(),
        }
    }
}

/// Validate a required string field
pub fn validate_required_string(value: &str, field_name: &str, domain: &str) -> ConfigResult<()> {
    if value.trim().is_empty() {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} cannot be empty", field_name),
        });
    }
    Ok(())
}

/// Validate a positive duration
pub fn validate_positive_duration(
    value: Duration,
    field_name: &str,
    domain: &str,
) -> ConfigResult<()> {
    if value.is_zero() {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} must be greater than 0ms", field_name),
        });
    }
    Ok(())
}

/// Validate a fraction in the half-open range (0, 1]
pub fn validate_fraction(value: f64, field_name: &str, domain: &str) -> ConfigResult<()> {
    if !(value > 0.0 && value <= 1.0) {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} must be within (0, 1], got {}", field_name, value),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_fraction() {
        assert!(validate_fraction(0.1, "thread_usage", "runtime").is_ok());
        assert!(validate_fraction(1.0, "thread_usage", "runtime").is_ok());
        assert!(validate_fraction(0.0, "thread_usage", "runtime").is_err());
        assert!(validate_fraction(1.5, "thread_usage", "runtime").is_err());
        assert!(validate_fraction(f64::NAN, "thread_usage", "runtime").is_err());
    }

    #[test]
    fn test_validate_positive_duration() {
        assert!(validate_positive_duration(Duration::from_millis(1), "kill_timeout", "runtime").is_ok());
        let err = validate_positive_duration(Duration::ZERO, "kill_timeout", "runtime").unwrap_err();
        assert!(err.to_string().contains("kill_timeout must be greater than 0ms"));
    }
}
