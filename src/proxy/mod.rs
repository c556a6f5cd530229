//! Proxy server module

pub mod codec;
pub mod handler;
pub mod pool;
pub mod server;
pub mod stats;

// Re-exports
pub use codec::HeadLimits;
pub use handler::{ConnectionHandler, X_BYTES};
pub use pool::{BackendPool, PoolOptions, PoolStats, UpstreamConnection};
pub use server::{shutdown_signal, ProxyServer};
pub use stats::StatsAggregator;
