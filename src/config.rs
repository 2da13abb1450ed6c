//! Configuration management for Sluice.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::error::{GatewayError, Result};
use crate::ratelimit::{LimitParams, Rate};

/// Main configuration for the gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Proxied resources
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds to wait for in-flight requests at shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl ServerConfig {
    /// The socket address to bind.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Grace period for shutdown.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn default_host() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}

fn default_port() -> u16 {
    8080
}

fn default_shutdown_grace() -> u64 {
    10
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A proxied endpoint and the limits applied to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Name used in logs
    pub name: String,

    /// Path prefix the resource is served under, such as `/users`
    pub endpoint: String,

    /// Upstream base URL
    pub destination_url: String,

    /// Rate limit per HTTP method
    #[serde(default)]
    pub rate_limits: BTreeMap<String, RateLimitConfig>,
}

impl ResourceConfig {
    /// Rate limits keyed by parsed HTTP method.
    pub fn methods(&self) -> Result<Vec<(http::Method, &RateLimitConfig)>> {
        self.rate_limits
            .iter()
            .map(|(method, limit)| Ok((parse_method(method)?, limit)))
            .collect()
    }

    fn validate(&self) -> Result<()> {
        if !self.endpoint.starts_with('/') {
            return Err(GatewayError::Config(format!(
                "resource '{}': endpoint '{}' must start with '/'",
                self.name, self.endpoint
            )));
        }
        if self.rate_limits.is_empty() {
            return Err(GatewayError::Config(format!(
                "resource '{}' has no rate limits",
                self.name
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for (method, limit) in self.methods()? {
            if !seen.insert(method.clone()) {
                return Err(GatewayError::Config(format!(
                    "resource '{}': method {} is configured more than once",
                    self.name, method
                )));
            }
            limit.params().map_err(|e| {
                GatewayError::Config(format!("resource '{}' {}: {}", self.name, method, e))
            })?;
        }
        Ok(())
    }
}

fn parse_method(method: &str) -> Result<http::Method> {
    http::Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes())
        .map_err(|_| GatewayError::InvalidMethod(method.to_string()))
}

/// Rate limit for one HTTP method of a resource.
///
/// The rate is given either as a combined `rate: "10/1s"` expression or as
/// separate `requests` and `interval` fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Algorithm name, such as `TOKEN-BUCKET`
    pub strategy: String,

    /// Bucket size; defaults to the per-interval quantity
    #[serde(default)]
    pub capacity: Option<usize>,

    /// Combined rate expression
    #[serde(default)]
    pub rate: Option<String>,

    /// Requests per interval
    #[serde(default)]
    pub requests: Option<usize>,

    /// Interval length, such as `1s` or `1m 30s`
    #[serde(default)]
    pub interval: Option<String>,
}

impl RateLimitConfig {
    /// The parsed rate.
    pub fn rate(&self) -> Result<Rate> {
        match (&self.rate, self.requests, &self.interval) {
            (Some(rate), None, None) => rate.parse(),
            (None, Some(requests), Some(interval)) => {
                let interval = humantime::parse_duration(interval)
                    .map_err(|e| GatewayError::InvalidRate(format!("{}: {}", interval, e)))?;
                Rate::new(requests, interval)
            }
            _ => Err(GatewayError::Config(
                "set either 'rate' or both 'requests' and 'interval'".to_string(),
            )),
        }
    }

    /// Numeric parameters for the limiter.
    pub fn params(&self) -> Result<LimitParams> {
        LimitParams::new(self.rate()?, self.capacity)
    }
}

impl GatewayConfig {
    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatewayConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GatewayError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every resource and limit before anything starts.
    pub fn validate(&self) -> Result<()> {
        let mut endpoints = std::collections::HashSet::new();
        for resource in &self.resources {
            resource.validate()?;
            let endpoint = normalize_endpoint(&resource.endpoint);
            if !endpoints.insert(endpoint.clone()) {
                return Err(GatewayError::Config(format!(
                    "endpoint '{}' is configured more than once",
                    endpoint
                )));
            }
        }
        Ok(())
    }
}

/// Strip trailing slashes, keeping `/` for the root.
pub fn normalize_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}
