use crate::ConfigResult;

/// Trait for configuration validation
pub trait ConfigValidator {
    fn validate(&self) -> ConfigResult<()>;
}

/// General validation utilities
pub struct ValidationUtils;

impl ValidationUtils {
    /// Validate that a string is not empty
    pub fn validate_not_empty(value: &str, field_name: &str) -> ConfigResult<()> {
        if value.trim().is_empty() {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} cannot be empty"
            )));
        }
        Ok(())
    }

    /// Validate that a count is within `1..=max`
    pub fn validate_count(count: usize, field_name: &str, max: usize) -> ConfigResult<()> {
        if count == 0 {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be greater than 0"
            )));
        }
        if count > max {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be less than or equal to {max}"
            )));
        }
        Ok(())
    }

    /// Validate that an interval is positive
    pub fn validate_positive(value: u64, field_name: &str) -> ConfigResult<()> {
        if value == 0 {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be greater than 0"
            )));
        }
        Ok(())
    }

    /// Validate a backoff multiplier (must not shrink delays)
    pub fn validate_backoff(backoff: f64, field_name: &str) -> ConfigResult<()> {
        if !backoff.is_finite() || backoff < 1.0 {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be a finite number >= 1.0, got {backoff}"
            )));
        }
        Ok(())
    }

    /// Validate a ratio in [0, 1]
    pub fn validate_ratio(ratio: f64, field_name: &str) -> ConfigResult<()> {
        if !(0.0..=1.0).contains(&ratio) {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be within [0, 1], got {ratio}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_not_empty() {
        assert!(ValidationUtils::validate_not_empty("test", "field").is_ok());
        assert!(ValidationUtils::validate_not_empty("  test  ", "field").is_ok());
        assert!(ValidationUtils::validate_not_empty("", "field").is_err());
        assert!(ValidationUtils::validate_not_empty("   ", "field").is_err());
    }

    #[test]
    fn test_validate_count() {
        assert!(ValidationUtils::validate_count(10, "test", 100).is_ok());
        assert!(ValidationUtils::validate_count(100, "test", 100).is_ok());
        assert!(ValidationUtils::validate_count(0, "test", 100).is_err());
        assert!(ValidationUtils::validate_count(101, "test", 100).is_err());
    }

    #[test]
    fn test_validate_backoff() {
        assert!(ValidationUtils::validate_backoff(1.0, "b").is_ok());
        assert!(ValidationUtils::validate_backoff(2.5, "b").is_ok());
        assert!(ValidationUtils::validate_backoff(0.5, "b").is_err());
        assert!(ValidationUtils::validate_backoff(f64::NAN, "b").is_err());
    }

    #[test]
    fn test_validate_ratio() {
        assert!(ValidationUtils::validate_ratio(0.0, "r").is_ok());
        assert!(ValidationUtils::validate_ratio(1.0, "r").is_ok());
        assert!(ValidationUtils::validate_ratio(1.5, "r").is_err());
        assert!(ValidationUtils::validate_ratio(-0.1, "r").is_err());
    }
}
