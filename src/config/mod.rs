//! Configuration management

pub mod settings;

pub use settings::{LimitsConfig, LoggingConfig, PoolConfig, ProxyConfig, RuntimeConfig, UpstreamConfig};
