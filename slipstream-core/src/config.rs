//! Configuration model, loading and validation.
//!
//! The configuration file is YAML. Duration-valued fields are integer
//! seconds. Validation runs at load time and fails with a message naming
//! the offending field.

use std::path::Path;
use std::time::Duration;

use http::Uri;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_https_port")]
    pub https_port: u16,
    /// Seconds the server waits for a request head before giving up.
    #[serde(default = "default_io_timeout")]
    pub read_timeout: u64,
    /// Seconds allotted for writing a response.
    #[serde(default = "default_io_timeout")]
    pub write_timeout: u64,
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub url: String,
    pub weight: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheckConfig {
    /// Seconds between probe rounds.
    #[serde(default = "default_health_interval")]
    pub interval: u64,
    /// Per-probe client timeout in seconds.
    #[serde(default = "default_health_timeout")]
    pub timeout: u64,
    /// Path probed on every backend.
    #[serde(default = "default_health_endpoint")]
    pub endpoint: String,
    /// Consecutive failures before a backend is marked down.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds between probes of a backend that is already down.
    #[serde(default = "default_recovery_interval")]
    pub recovery_interval: u64,
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            endpoint: default_health_endpoint(),
            failure_threshold: default_failure_threshold(),
            recovery_interval: default_recovery_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Entry lifetime in seconds.
    #[serde(default = "default_cache_ttl")]
    pub ttl: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl: default_cache_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_minute: default_requests_per_minute(),
            burst: default_burst(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_http_port() -> u16 {
    8080
}

fn default_https_port() -> u16 {
    8443
}

fn default_io_timeout() -> u64 {
    10
}

fn default_health_interval() -> u64 {
    5
}

fn default_health_timeout() -> u64 {
    2
}

fn default_health_endpoint() -> String {
    "/healthz".to_string()
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_recovery_interval() -> u64 {
    15
}

fn default_cache_ttl() -> u64 {
    60
}

fn default_requests_per_minute() -> u32 {
    600
}

fn default_burst() -> u32 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {}: {e}", path.display())))?;

        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Check every field the server relies on, naming the first offender.
    pub fn validate(&self) -> Result<()> {
        if self.server.host.is_empty() {
            return Err(Error::Config("server.host cannot be empty".into()));
        }
        if self.server.http_port == 0 {
            return Err(Error::Config("server.http_port must be positive".into()));
        }
        if self.server.https_port == 0 {
            return Err(Error::Config("server.https_port must be positive".into()));
        }
        if self.tls.enabled && self.server.http_port == self.server.https_port {
            return Err(Error::Config(
                "server.http_port and server.https_port must be different".into(),
            ));
        }

        if self.backends.is_empty() {
            return Err(Error::Config("at least one backend is required".into()));
        }
        for (index, backend) in self.backends.iter().enumerate() {
            if backend.url.is_empty() {
                return Err(Error::Config(format!("backend {index}: url cannot be empty")));
            }
            let uri: Uri = backend.url.parse().map_err(|e| {
                Error::Config(format!("backend {index}: invalid url {:?}: {e}", backend.url))
            })?;
            match uri.scheme_str() {
                Some("http") | Some("https") => {}
                _ => {
                    return Err(Error::Config(format!(
                        "backend {index}: url must start with http:// or https://"
                    )))
                }
            }
            if uri.authority().is_none() {
                return Err(Error::Config(format!("backend {index}: url is missing a host")));
            }
            if backend.weight == 0 {
                return Err(Error::Config(format!("backend {index}: weight must be positive")));
            }
        }

        if self.tls.enabled {
            if self.tls.cert_file.is_empty() {
                return Err(Error::Config(
                    "tls.cert_file is required when TLS is enabled".into(),
                ));
            }
            if self.tls.key_file.is_empty() {
                return Err(Error::Config(
                    "tls.key_file is required when TLS is enabled".into(),
                ));
            }
            if !Path::new(&self.tls.cert_file).exists() {
                return Err(Error::Config(format!(
                    "tls.cert_file does not exist: {}",
                    self.tls.cert_file
                )));
            }
            if !Path::new(&self.tls.key_file).exists() {
                return Err(Error::Config(format!(
                    "tls.key_file does not exist: {}",
                    self.tls.key_file
                )));
            }
        }

        if self.health_check.interval == 0 {
            return Err(Error::Config("health_check.interval must be positive".into()));
        }
        if self.health_check.timeout == 0 {
            return Err(Error::Config("health_check.timeout must be positive".into()));
        }
        if self.health_check.failure_threshold == 0 {
            return Err(Error::Config(
                "health_check.failure_threshold must be positive".into(),
            ));
        }
        if self.health_check.recovery_interval == 0 {
            return Err(Error::Config(
                "health_check.recovery_interval must be positive".into(),
            ));
        }

        if self.rate_limit.requests_per_minute == 0 {
            return Err(Error::Config(
                "rate_limit.requests_per_minute must be positive".into(),
            ));
        }
        if self.rate_limit.burst == 0 {
            return Err(Error::Config("rate_limit.burst must be positive".into()));
        }

        Ok(())
    }
}
