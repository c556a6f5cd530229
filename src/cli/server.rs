//! Server management CLI commands

use crate::config::settings::ProxyConfig;
use crate::proxy::server::ProxyServer;
use anyhow::Result;
use clap::Args;
use std::net::SocketAddr;
use tracing::{debug, info};

/// Overrides applied on top of the loaded configuration
#[derive(Debug, Default, Args)]
pub struct ServerArgs {
    /// Proxy listening address
    #[arg(long)]
    pub listen_addr: Option<SocketAddr>,

    /// Upstream server address (host:port)
    #[arg(long)]
    pub upstream: Option<String>,

    /// Maximum idle upstream connections kept in the pool
    #[arg(long)]
    pub pool_size: Option<usize>,

    /// Dial a fresh upstream connection for every request
    #[arg(long, conflicts_with = "pool_size")]
    pub no_pool: bool,

    /// Milliseconds to wait for an idle upstream connection before dialing
    #[arg(long)]
    pub acquire_timeout_ms: Option<u64>,

    /// Milliseconds to wait for a pool slot before closing a connection
    #[arg(long)]
    pub release_timeout_ms: Option<u64>,
}

impl ServerArgs {
    /// Overlay the arguments that were given onto `config`
    pub fn apply_to(&self, config: &mut ProxyConfig) {
        debug!("Applying CLI overrides to ProxyConfig");

        if let Some(addr) = self.listen_addr {
            config.listen_addr = addr;
        }
        if let Some(upstream) = &self.upstream {
            config.upstream.addr = upstream.clone();
        }
        if let Some(size) = self.pool_size {
            config.pool.enabled = true;
            config.pool.capacity = size;
        }
        if self.no_pool {
            config.pool.enabled = false;
        }
        if let Some(timeout) = self.acquire_timeout_ms {
            config.pool.acquire_timeout_ms = timeout;
        }
        if let Some(timeout) = self.release_timeout_ms {
            config.pool.release_timeout_ms = timeout;
        }
    }

    /// Start the proxy with these overrides and serve until Ctrl-C
    pub async fn start_server(&self, mut config: ProxyConfig) -> Result<()> {
        self.apply_to(&mut config);
        config.validate()?;

        info!("📋 Server Configuration:");
        info!("   Listen: {}", config.listen_addr);
        info!("   Upstream: {}", config.upstream.addr);
        if config.pool.enabled {
            info!(
                "   Pool: {} connections (acquire {}ms, release {}ms)",
                config.pool.capacity, config.pool.acquire_timeout_ms, config.pool.release_timeout_ms
            );
        } else {
            info!("   Pool: disabled");
        }
        info!("   Log level: {}", config.log_level);

        let server = ProxyServer::bind(&config).await?;
        server.run().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: ServerArgs,
    }

    fn parse(argv: &[&str]) -> ServerArgs {
        let mut full = vec!["proxy"];
        full.extend_from_slice(argv);
        TestCli::parse_from(full).args
    }

    #[test]
    fn test_no_arguments_leave_config_untouched() {
        let mut config = ProxyConfig::default();
        parse(&[]).apply_to(&mut config);
        assert_eq!(config.listen_addr, ProxyConfig::default().listen_addr);
        assert_eq!(config.pool.capacity, 10);
        assert!(config.pool.enabled);
    }

    #[test]
    fn test_overrides_are_applied() {
        let mut config = ProxyConfig::default();
        parse(&[
            "--listen-addr",
            "0.0.0.0:9000",
            "--upstream",
            "10.0.0.5:80",
            "--pool-size",
            "4",
            "--acquire-timeout-ms",
            "250",
        ])
        .apply_to(&mut config);

        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.upstream.addr, "10.0.0.5:80");
        assert_eq!(config.pool.capacity, 4);
        assert_eq!(config.pool.acquire_timeout_ms, 250);
        assert_eq!(config.pool.release_timeout_ms, 1000);
    }

    #[test]
    fn test_no_pool_disables_pooling() {
        let mut config = ProxyConfig::default();
        parse(&["--no-pool"]).apply_to(&mut config);
        assert!(!config.pool.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_no_pool_conflicts_with_pool_size() {
        let result = TestCli::try_parse_from(["proxy", "--no-pool", "--pool-size", "3"]);
        assert!(result.is_err());
    }
}
