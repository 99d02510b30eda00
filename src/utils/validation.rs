use crate::core::delay::{DelayRange, MAX_DELAY_SECS};
use crate::utils::error::{AcquireError, Result};
use url::Url;

pub trait Validate {
    fn validate(&self) -> Result<()>;
}

/// 解析 `url_str` 並檢查 scheme 是否在 `schemes` 中
pub fn validate_url(field_name: &str, url_str: &str, schemes: &[&str]) -> Result<()> {
    if url_str.is_empty() {
        return Err(AcquireError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: url_str.to_string(),
            reason: "URL cannot be empty".to_string(),
        });
    }

    match Url::parse(url_str) {
        Ok(url) => {
            if schemes.contains(&url.scheme()) {
                Ok(())
            } else {
                Err(AcquireError::InvalidConfigValueError {
                    field: field_name.to_string(),
                    value: url_str.to_string(),
                    reason: format!(
                        "Unsupported URL scheme: {}. Allowed: {}",
                        url.scheme(),
                        schemes.join(", ")
                    ),
                })
            }
        }
        Err(e) => Err(AcquireError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: url_str.to_string(),
            reason: format!("Invalid URL format: {}", e),
        }),
    }
}

pub fn validate_path(field_name: &str, path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(AcquireError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: path.to_string(),
            reason: "Path cannot be empty".to_string(),
        });
    }

    if path.contains('\0') {
        return Err(AcquireError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: path.to_string(),
            reason: "Path contains null bytes".to_string(),
        });
    }

    Ok(())
}

pub fn validate_positive_number(field_name: &str, value: u64, min_value: u64) -> Result<()> {
    if value < min_value {
        return Err(AcquireError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: value.to_string(),
            reason: format!("Value must be at least {}", min_value),
        });
    }
    Ok(())
}

pub fn validate_non_empty_string(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(AcquireError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: value.to_string(),
            reason: "Value cannot be empty or whitespace-only".to_string(),
        });
    }
    Ok(())
}

pub fn validate_non_empty_list<T>(field_name: &str, values: &[T]) -> Result<()> {
    if values.is_empty() {
        return Err(AcquireError::MissingConfigError {
            field: field_name.to_string(),
        });
    }
    Ok(())
}

pub fn validate_range<T: PartialOrd + std::fmt::Display + Copy>(
    field_name: &str,
    value: T,
    min: T,
    max: T,
) -> Result<()> {
    if value < min || value > max {
        return Err(AcquireError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: value.to_string(),
            reason: format!("Value must be between {} and {}", min, max),
        });
    }
    Ok(())
}

pub fn validate_delay_range(field_name: &str, range: &DelayRange) -> Result<()> {
    if !range.is_valid() {
        return Err(AcquireError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: format!("{}..={}", range.min_secs, range.max_secs),
            reason: format!(
                "Delay bounds must be finite, non-negative, min <= max and at most {} seconds",
                MAX_DELAY_SECS
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROXY_SCHEMES: [&str; 3] = ["http", "https", "socks5"];

    #[test]
    fn test_validate_url() {
        assert!(validate_url("download.proxy", "http://127.0.0.1:8080", &PROXY_SCHEMES).is_ok());
        assert!(validate_url("download.proxy", "socks5://proxy:1080", &PROXY_SCHEMES).is_ok());
        assert!(validate_url("download.proxy", "", &PROXY_SCHEMES).is_err());
        assert!(validate_url("download.proxy", "invalid-url", &PROXY_SCHEMES).is_err());
        assert!(validate_url("download.proxy", "ftp://example.com", &PROXY_SCHEMES).is_err());
    }

    #[test]
    fn test_validate_positive_number() {
        assert!(validate_positive_number("retry.max_attempts", 3, 1).is_ok());
        assert!(validate_positive_number("retry.max_attempts", 0, 1).is_err());
    }

    #[test]
    fn test_validate_delay_range() {
        assert!(validate_delay_range("retry.backoff", &DelayRange::new(5.0, 10.0)).is_ok());
        assert!(validate_delay_range("retry.backoff", &DelayRange::new(10.0, 5.0)).is_err());
        assert!(validate_delay_range("retry.backoff", &DelayRange::new(1e20, 1e20)).is_err());
    }

    #[test]
    fn test_validate_non_empty_list_reports_missing_field() {
        let err = validate_non_empty_list::<String>("identity.user_agents", &[]).unwrap_err();
        assert!(matches!(err, AcquireError::MissingConfigError { field } if field == "identity.user_agents"));
    }
}
