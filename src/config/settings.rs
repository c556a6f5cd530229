//! Proxy server configuration settings

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Main configuration for the proxy server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Server listening address
    pub listen_addr: SocketAddr,

    /// Log level configuration
    pub log_level: String,

    /// Upstream server configuration
    pub upstream: UpstreamConfig,

    /// Upstream connection pool configuration
    pub pool: PoolConfig,

    /// Request/response head limits
    pub limits: LimitsConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Runtime configuration
    pub runtime: RuntimeConfig,

    /// Seconds to wait for open client connections on shutdown
    pub shutdown_grace_secs: u64,
}

/// Upstream server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Upstream address (host:port)
    pub addr: String,

    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Disable Nagle's algorithm on upstream sockets
    pub nodelay: bool,
}

/// Upstream connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Reuse upstream connections across requests
    pub enabled: bool,

    /// Maximum idle connections kept in the pool
    pub capacity: usize,

    /// How long to wait for an idle connection before dialing a new one
    pub acquire_timeout_ms: u64,

    /// How long to wait for a free slot before closing a returned connection
    pub release_timeout_ms: u64,
}

/// Limits applied while parsing HTTP message heads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum size of a request or response head in bytes
    pub max_head_bytes: usize,

    /// Maximum number of header lines
    pub max_headers: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Also write logs to a daily-rolling file
    pub enable_file_logging: bool,

    /// Directory for log files
    pub log_dir: String,

    /// Log file name prefix
    pub file_prefix: String,
}

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Runtime mode: "single_threaded" or "multi_threaded"
    pub mode: String,

    /// Number of worker threads for multi-threaded mode (None = one per CPU core)
    pub worker_threads: Option<usize>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            log_level: "info".to_string(),
            upstream: UpstreamConfig::default(),
            pool: PoolConfig::default(),
            limits: LimitsConfig::default(),
            logging: LoggingConfig::default(),
            runtime: RuntimeConfig::default(),
            shutdown_grace_secs: 10,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8081".to_string(),
            connect_timeout_ms: 5000,
            nodelay: true,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 10,
            acquire_timeout_ms: 100,
            release_timeout_ms: 1000,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_head_bytes: 64 * 1024, // 64KB
            max_headers: 100,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_file_logging: false,
            log_dir: "logs".to_string(),
            file_prefix: "proxy.log".to_string(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: "multi_threaded".to_string(),
            worker_threads: None, // Auto-detect CPU cores
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: ProxyConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load configuration from a YAML file if it exists, apply environment
    /// overrides, and validate the result
    pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = if path.as_ref().exists() {
            Self::from_yaml_file(path)?
        } else {
            Self::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Override settings from environment variables
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(addr) = env_parse::<SocketAddr>("PROXY_LISTEN_ADDR")? {
            self.listen_addr = addr;
        }

        if let Ok(upstream) = std::env::var("PROXY_UPSTREAM_ADDR") {
            self.upstream.addr = upstream;
        }

        if let Some(timeout) = env_parse("PROXY_CONNECT_TIMEOUT_MS")? {
            self.upstream.connect_timeout_ms = timeout;
        }

        if let Ok(enabled) = std::env::var("PROXY_POOL_ENABLED") {
            self.pool.enabled = enabled.to_lowercase() == "true";
        }

        if let Some(capacity) = env_parse("PROXY_POOL_CAPACITY")? {
            self.pool.capacity = capacity;
        }

        if let Some(timeout) = env_parse("PROXY_POOL_ACQUIRE_TIMEOUT_MS")? {
            self.pool.acquire_timeout_ms = timeout;
        }

        if let Some(timeout) = env_parse("PROXY_POOL_RELEASE_TIMEOUT_MS")? {
            self.pool.release_timeout_ms = timeout;
        }

        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.log_level = log_level;
        }

        if let Ok(mode) = std::env::var("PROXY_RUNTIME_MODE") {
            self.runtime.mode = mode;
        }

        if let Some(threads) = env_parse("PROXY_WORKER_THREADS")? {
            self.runtime.worker_threads = Some(threads);
        }

        Ok(())
    }

    /// Reject settings the proxy cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.upstream.addr.trim().is_empty() {
            bail!("upstream.addr must not be empty");
        }
        if self.upstream.connect_timeout_ms == 0 {
            bail!("upstream.connect_timeout_ms must be greater than zero");
        }
        if self.pool.enabled && self.pool.capacity == 0 {
            bail!("pool.capacity must be greater than zero when pooling is enabled");
        }
        if self.pool.acquire_timeout_ms == 0 || self.pool.release_timeout_ms == 0 {
            bail!("pool timeouts must be greater than zero");
        }
        if self.limits.max_head_bytes == 0 || self.limits.max_headers == 0 {
            bail!("head limits must be greater than zero");
        }
        match self.runtime.mode.as_str() {
            "single_threaded" | "multi_threaded" => {}
            other => bail!("unknown runtime mode '{}'", other),
        }
        Ok(())
    }

    /// Render the effective configuration as YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize configuration")
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid value '{}' for {}: {}", raw, name, e)),
        Err(_) => Ok(None),
    }
}
