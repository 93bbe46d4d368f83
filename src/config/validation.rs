use once_cell::sync::Lazy;
use regex::Regex;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::config::models::{AcmeConfig, AppConfig, ProxyConfig, RateLimitConfig, RenewalConfig};
use crate::core::hostname::Hostname;

static EMAIL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("email pattern compiles")
});

// RFC 1123 host name; single-label names such as container service names are allowed.
static BACKEND_HOST_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$")
        .expect("backend host pattern compiles")
});

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Configuration validation failed: {message}")]
    ValidationFailed { message: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid URL in field '{field}': {url} - {reason}")]
    InvalidUrl {
        field: String,
        url: String,
        reason: String,
    },

    #[error("Invalid listen address: {address} - {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Invalid rate limit configuration: {message}")]
    InvalidRateLimit { message: String },

    #[error("Invalid ACME configuration: {message}")]
    InvalidAcme { message: String },
}

pub type ValidationResult<T> = Result<T, ValidationError>;

/// Configuration validator with detailed error reporting
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate a complete configuration, reporting every problem at once
    pub fn validate(config: &AppConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if config.hostname.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "hostname".to_string(),
            });
        } else if let Err(e) = Hostname::parse(&config.hostname) {
            errors.push(ValidationError::InvalidField {
                field: "hostname".to_string(),
                message: e.to_string(),
            });
        }

        if config.email.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "email".to_string(),
            });
        } else if !is_valid_email(&config.email) {
            errors.push(ValidationError::InvalidField {
                field: "email".to_string(),
                message: format!("Invalid email address: {}", config.email),
            });
        }

        if let Err(message) = validate_backend_target(&config.backend) {
            errors.push(ValidationError::InvalidField {
                field: "backend".to_string(),
                message,
            });
        }

        if config.upstream_timeout.is_zero() {
            errors.push(ValidationError::InvalidField {
                field: "upstream_timeout".to_string(),
                message: "Must be greater than zero".to_string(),
            });
        }

        errors.extend(Self::validate_proxy_config(&config.proxy));
        errors.extend(Self::validate_acme_config(&config.acme));
        errors.extend(Self::validate_renewal_config(&config.renewal));

        if let Err(e) = Self::validate_rate_limit(&config.rate_limit) {
            errors.push(e);
        }

        if let Some(address) = &config.admin.listen_addr {
            if let Err(e) = Self::validate_listen_address(address) {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:9090')".to_string(),
            });
        }
        Ok(())
    }

    fn validate_proxy_config(config: &ProxyConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if config.http_port == 0 || config.https_port == 0 {
            errors.push(ValidationError::InvalidField {
                field: "proxy.http_port/https_port".to_string(),
                message: "Ports must be non-zero".to_string(),
            });
        } else if config.http_port == config.https_port {
            errors.push(ValidationError::InvalidField {
                field: "proxy.https_port".to_string(),
                message: format!("Must differ from http_port ({})", config.http_port),
            });
        }

        if config.binary.as_os_str().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "proxy.binary".to_string(),
            });
        }

        if config.config_path.file_name().is_none() {
            errors.push(ValidationError::InvalidField {
                field: "proxy.config_path".to_string(),
                message: "Must name a file".to_string(),
            });
        }

        if config.startup_probe_attempts == 0 {
            errors.push(ValidationError::InvalidField {
                field: "proxy.startup_probe_attempts".to_string(),
                message: "At least one reachability probe is required".to_string(),
            });
        }

        errors
    }

    /// Validate ACME configuration
    fn validate_acme_config(config: &AcmeConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Some(directory_url) = &config.directory_url {
            if let Err(e) = Self::validate_url(directory_url, "acme.directory_url") {
                errors.push(e);
            }
        }

        if config.storage_path.as_os_str().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "acme.storage_path".to_string(),
            });
        }

        if config.challenge_dir.as_os_str().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "acme.challenge_dir".to_string(),
            });
        }

        if let Some(days) = config.renew_before_days {
            if days == 0 || days > 89 {
                errors.push(ValidationError::InvalidAcme {
                    message: format!("renew_before_days must be between 1 and 89, got: {days}"),
                });
            }
        }

        if config.unavailable_backoff_base > config.unavailable_backoff_ceiling {
            errors.push(ValidationError::InvalidAcme {
                message: "unavailable_backoff_base must not exceed unavailable_backoff_ceiling"
                    .to_string(),
            });
        }

        if config.poll_attempts == 0 || config.poll_interval.is_zero() {
            errors.push(ValidationError::InvalidAcme {
                message: "poll_attempts and poll_interval must be greater than zero".to_string(),
            });
        }

        errors
    }

    fn validate_renewal_config(config: &RenewalConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if config.period < Duration::from_secs(60) {
            errors.push(ValidationError::InvalidField {
                field: "renewal.period".to_string(),
                message: "Must be at least one minute".to_string(),
            });
        }

        if config.failure_backoff.is_zero() {
            errors.push(ValidationError::InvalidField {
                field: "renewal.failure_backoff".to_string(),
                message: "Must be greater than zero".to_string(),
            });
        }

        if !(0.0..=0.5).contains(&config.jitter) {
            errors.push(ValidationError::InvalidField {
                field: "renewal.jitter".to_string(),
                message: format!("Must be between 0.0 and 0.5, got: {}", config.jitter),
            });
        }

        errors
    }

    /// Validate rate limit configuration
    fn validate_rate_limit(config: &RateLimitConfig) -> ValidationResult<()> {
        if config.requests_per_second == 0 {
            return Err(ValidationError::InvalidRateLimit {
                message: "requests_per_second must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    /// Validate URL format
    fn validate_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::InvalidUrl {
                        field: context.to_string(),
                        url: url_str.to_string(),
                        reason: "URL must use http:// or https:// scheme".to_string(),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidUrl {
                        field: context.to_string(),
                        url: url_str.to_string(),
                        reason: "URL must have a valid host".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidUrl {
                field: context.to_string(),
                url: url_str.to_string(),
                reason: format!("Invalid URL format: {e}"),
            }),
        }
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        let mut message = format!("Found {} validation error(s):\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}

/// Basic email validation
pub fn is_valid_email(email: &str) -> bool {
    EMAIL_REGEX.is_match(email)
}

/// Backend targets are `host:port` where host is an IP address or a DNS name. Unlike the
/// public hostname, a single-label name (`backend:8080`) is accepted.
pub fn validate_backend_target(target: &str) -> Result<(), String> {
    if let Ok(addr) = target.parse::<SocketAddr>() {
        if addr.port() == 0 {
            return Err(format!("'{target}' has an invalid port '0'"));
        }
        return Ok(());
    }

    let Some((host, port)) = target.rsplit_once(':') else {
        return Err(format!("'{target}' must be in host:port form"));
    };

    match port.parse::<u16>() {
        Ok(0) | Err(_) => return Err(format!("'{target}' has an invalid port '{port}'")),
        Ok(_) => {}
    }

    if host.parse::<IpAddr>().is_ok() || is_backend_host(host) {
        Ok(())
    } else {
        Err(format!("'{target}' has an invalid host '{host}'"))
    }
}

fn is_backend_host(host: &str) -> bool {
    host.len() <= 253 && BACKEND_HOST_REGEX.is_match(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_valid_config() -> AppConfig {
        AppConfig::builder()
            .hostname("api.example.com")
            .email("ops@example.com")
            .build()
    }

    #[test]
    fn test_valid_config() {
        let config = create_valid_config();
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn test_missing_hostname_and_email_reported_together() {
        let config = AppConfig::default();
        let message = ConfigValidator::validate(&config).unwrap_err().to_string();
        assert!(message.contains("Found 2 validation error(s)"));
        assert!(message.contains("Missing required field: hostname"));
        assert!(message.contains("Missing required field: email"));
    }

    #[test]
    fn test_invalid_hostname() {
        let mut config = create_valid_config();
        config.hostname = "api_example".to_string();
        let message = ConfigValidator::validate(&config).unwrap_err().to_string();
        assert!(message.contains("Invalid field 'hostname'"));
    }

    #[test]
    fn test_invalid_admin_listen_address() {
        let mut config = create_valid_config();
        config.admin.listen_addr = Some("invalid_address".to_string());

        let result = ConfigValidator::validate(&config);
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Invalid listen address")
        );
    }

    #[test]
    fn test_invalid_directory_url() {
        let mut config = create_valid_config();
        config.acme.directory_url = Some("ftp://acme.example.com/directory".to_string());
        let message = ConfigValidator::validate(&config).unwrap_err().to_string();
        assert!(message.contains("Invalid URL"));
    }

    #[test]
    fn test_renew_before_days_bounds() {
        let mut config = create_valid_config();
        config.acme.renew_before_days = Some(90);
        assert!(ConfigValidator::validate(&config).is_err());
        config.acme.renew_before_days = Some(30);
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn test_port_and_rate_limit_checks() {
        let mut config = create_valid_config();
        config.proxy.https_port = config.proxy.http_port;
        config.rate_limit.requests_per_second = 0;
        config.renewal.jitter = 0.9;

        let message = ConfigValidator::validate(&config).unwrap_err().to_string();
        assert!(message.contains("Found 3 validation error(s)"));
        assert!(message.contains("requests_per_second"));
        assert!(message.contains("renewal.jitter"));
    }

    #[test]
    fn test_email_validation() {
        assert!(is_valid_email("test@example.com"));
        assert!(is_valid_email("user.name@domain.co.uk"));
        assert!(!is_valid_email("invalid_email"));
        assert!(!is_valid_email("@domain.com"));
    }

    #[test]
    fn test_backend_target_validation() {
        assert!(validate_backend_target("127.0.0.1:8080").is_ok());
        assert!(validate_backend_target("[::1]:8080").is_ok());
        assert!(validate_backend_target("localhost:8080").is_ok());
        assert!(validate_backend_target("api-backend.internal:9000").is_ok());
        assert!(validate_backend_target("127.0.0.1").is_err());
        assert!(validate_backend_target("127.0.0.1:0").is_err());
        assert!(validate_backend_target("127.0.0.1:http").is_err());
        assert!(validate_backend_target("bad host:80").is_err());
    }

    #[test]
    fn test_backend_accepts_single_label_service_names() {
        assert!(validate_backend_target("backend:8080").is_ok());
        assert!(validate_backend_target("webfleet-api:8080").is_ok());
        assert!(validate_backend_target("-api:8080").is_err());
        assert!(validate_backend_target("api-:8080").is_err());
        assert!(validate_backend_target("api..internal:8080").is_err());
        assert!(validate_backend_target("backend:0").is_err());
        assert!(validate_backend_target("[::1]:0").is_err());

        // The public hostname keeps requiring a registrable name.
        assert!(Hostname::parse("backend").is_err());
    }
}
