use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration, read from YAML and overridden from the command line.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    /// Public DNS name the certificate is issued for
    pub hostname: String,
    /// ACME account contact
    pub email: String,
    /// Backend `host:port` the proxy forwards to
    pub backend: String,
    pub proxy: ProxyConfig,
    pub acme: AcmeConfig,
    pub renewal: RenewalConfig,
    pub rate_limit: RateLimitConfig,
    #[serde(with = "humantime_duration")]
    pub upstream_timeout: Duration,
    pub admin: AdminConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            email: String::new(),
            backend: "127.0.0.1:8080".to_string(),
            proxy: ProxyConfig::default(),
            acme: AcmeConfig::default(),
            renewal: RenewalConfig::default(),
            rate_limit: RateLimitConfig::default(),
            upstream_timeout: Duration::from_secs(30),
            admin: AdminConfig::default(),
        }
    }
}

impl AppConfig {
    /// Create a new configuration builder
    pub fn builder() -> AppConfigBuilder {
        AppConfigBuilder::default()
    }
}

/// Builder for AppConfig, used for command-line overrides and tests
#[derive(Default)]
pub struct AppConfigBuilder {
    base: Option<AppConfig>,
    hostname: Option<String>,
    email: Option<String>,
    backend: Option<String>,
    staging: Option<bool>,
}

impl AppConfigBuilder {
    /// Start from an existing configuration instead of the defaults
    pub fn base(mut self, config: AppConfig) -> Self {
        self.base = Some(config);
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn staging(mut self, staging: bool) -> Self {
        self.staging = Some(staging);
        self
    }

    /// Build the final AppConfig
    pub fn build(self) -> AppConfig {
        let mut config = self.base.unwrap_or_default();
        if let Some(hostname) = self.hostname {
            config.hostname = hostname;
        }
        if let Some(email) = self.email {
            config.email = email;
        }
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(staging) = self.staging {
            config.acme.staging = staging;
        }
        config
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProxyConfig {
    /// nginx executable
    pub binary: PathBuf,
    /// Live configuration file nginx is started with
    pub config_path: PathBuf,
    pub pid_path: PathBuf,
    pub http_port: u16,
    pub https_port: u16,
    pub startup_probe_attempts: u32,
    #[serde(with = "humantime_duration")]
    pub startup_probe_interval: Duration,
    /// How long nginx must stay up after spawn to count as started
    #[serde(with = "humantime_duration")]
    pub startup_grace: Duration,
    #[serde(with = "humantime_duration")]
    pub shutdown_grace_period: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("nginx"),
            config_path: PathBuf::from("/etc/nginx/nginx.conf"),
            pid_path: PathBuf::from("/run/nginx.pid"),
            http_port: 80,
            https_port: 443,
            startup_probe_attempts: 10,
            startup_probe_interval: Duration::from_millis(500),
            startup_grace: Duration::from_secs(1),
            shutdown_grace_period: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AcmeConfig {
    /// Use the Let's Encrypt staging directory
    pub staging: bool,
    /// Custom ACME directory; overrides `staging`
    pub directory_url: Option<String>,
    pub storage_path: PathBuf,
    pub challenge_dir: PathBuf,
    /// Fixed renewal window; the final third of the validity period when unset
    pub renew_before_days: Option<u32>,
    pub validation_retries: u32,
    #[serde(with = "humantime_duration")]
    pub validation_retry_delay: Duration,
    pub unavailable_max_retries: u32,
    #[serde(with = "humantime_duration")]
    pub unavailable_backoff_base: Duration,
    #[serde(with = "humantime_duration")]
    pub unavailable_backoff_ceiling: Duration,
    /// Authorization and order polling
    #[serde(with = "humantime_duration")]
    pub poll_interval: Duration,
    pub poll_attempts: u32,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            staging: false,
            directory_url: None,
            storage_path: PathBuf::from("/var/lib/certgate"),
            challenge_dir: PathBuf::from("/var/www/certgate"),
            renew_before_days: None,
            validation_retries: 3,
            validation_retry_delay: Duration::from_secs(10),
            unavailable_max_retries: 5,
            unavailable_backoff_base: Duration::from_secs(2),
            unavailable_backoff_ceiling: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
            poll_attempts: 30,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RenewalConfig {
    #[serde(with = "humantime_duration")]
    pub period: Duration,
    #[serde(with = "humantime_duration")]
    pub failure_backoff: Duration,
    /// Relative jitter, 0.1 means ±10%
    pub jitter: f64,
    #[serde(with = "humantime_duration")]
    pub initial_delay: Duration,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(12 * 60 * 60),
            failure_backoff: Duration::from_secs(30 * 60),
            jitter: 0.1,
            initial_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_second: u32,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 1,
            burst: 5,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AdminConfig {
    /// Status and metrics listener; disabled when unset
    pub listen_addr: Option<String>,
}

/// Durations as humantime strings such as `"12h"` or `"500ms"`.
mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}
