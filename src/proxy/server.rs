//! Accept loop and server lifecycle

use crate::config::settings::{LimitsConfig, ProxyConfig};
use crate::error::{Error, Result};
use crate::proxy::codec::HeadLimits;
use crate::proxy::handler::ConnectionHandler;
use crate::proxy::pool::BackendPool;
use crate::proxy::stats::StatsAggregator;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

impl From<&LimitsConfig> for HeadLimits {
    fn from(config: &LimitsConfig) -> Self {
        Self {
            max_head_bytes: config.max_head_bytes,
            max_headers: config.max_headers,
        }
    }
}

/// A bound proxy listener together with the state its handlers share
pub struct ProxyServer {
    listener: TcpListener,
    pool: Arc<BackendPool>,
    stats: Arc<StatsAggregator>,
    limits: HeadLimits,
    shutdown_grace: Duration,
}

impl ProxyServer {
    /// Bind the listening socket; failure here is fatal for the process
    pub async fn bind(config: &ProxyConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::Config(format!("{:#}", e)))?;

        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|source| Error::Bind {
                addr: config.listen_addr,
                source,
            })?;

        let server = Self {
            listener,
            pool: Arc::new(BackendPool::from_config(config)),
            stats: Arc::new(StatsAggregator::new()),
            limits: HeadLimits::from(&config.limits),
            shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
        };

        info!("✅ Proxy listening on {}", server.local_addr()?);
        info!("   Forwarding to {}", config.upstream.addr);
        Ok(server)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn stats(&self) -> Arc<StatsAggregator> {
        Arc::clone(&self.stats)
    }

    pub fn pool(&self) -> Arc<BackendPool> {
        Arc::clone(&self.pool)
    }

    /// Serve until the process is interrupted with Ctrl-C
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Serve until `shutdown` resolves, then drain
    ///
    /// Open client connections get the configured grace period to finish;
    /// whatever is left is aborted before the pool is closed.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let ProxyServer {
            listener,
            pool,
            stats,
            limits,
            shutdown_grace,
        } = self;

        tokio::pin!(shutdown);
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, client_addr)) => {
                        debug!("🔗 Accepted connection from {}", client_addr);
                        let handler = ConnectionHandler::new(
                            client_addr,
                            Arc::clone(&pool),
                            Arc::clone(&stats),
                            limits,
                        );
                        handlers.spawn(handler.run(stream));
                    }
                    Err(e) => {
                        error!("{}", Error::Accept(e));
                        // Out of file descriptors is the usual cause; let some close.
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },

                Some(finished) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!("💥 Connection handler panicked: {}", e);
                        }
                    }
                }
            }
        }

        drop(listener);
        info!("🛑 Shutting down, {} client connections still open", handlers.len());

        let drained = timeout(shutdown_grace, async {
            while handlers.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                "⚠️  Aborting {} client connections after {:?} grace period",
                handlers.len(),
                shutdown_grace
            );
            handlers.shutdown().await;
        }

        pool.shutdown().await;
        stats.log_summary();
        pool.log_stats();
        info!("👋 Proxy stopped");
        Ok(())
    }
}

/// Resolve on Ctrl-C
pub async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C"),
        Err(e) => {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    fn config_on_ephemeral_port(upstream: SocketAddr) -> ProxyConfig {
        let mut config = ProxyConfig::default();
        config.listen_addr = "127.0.0.1:0".parse().unwrap();
        config.upstream.addr = upstream.to_string();
        config.shutdown_grace_secs = 1;
        config
    }

    #[tokio::test]
    async fn test_bind_conflict_is_a_bind_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = ProxyConfig::default();
        config.listen_addr = taken.local_addr().unwrap();

        let err = ProxyServer::bind(&config).await.err().unwrap();
        assert!(matches!(err, Error::Bind { .. }));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_before_binding() {
        let mut config = ProxyConfig::default();
        config.listen_addr = "127.0.0.1:0".parse().unwrap();
        config.pool.acquire_timeout_ms = 0;

        let err = ProxyServer::bind(&config).await.err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_run_until_stops_accepting() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = ProxyServer::bind(&config_on_ephemeral_port(upstream.local_addr().unwrap()))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let pool = server.pool();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let running = tokio::spawn(server.run_until(async {
            let _ = stop_rx.await;
        }));

        // An idle client is aborted once the grace period runs out.
        let mut idle_client = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        stop_tx.send(()).unwrap();
        running.await.unwrap().unwrap();

        let mut buf = [0u8; 16];
        let n = idle_client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
        assert!(TcpStream::connect(addr).await.is_err());
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_bad_client_does_not_stop_server() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = upstream.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1024];
                    let mut seen = Vec::new();
                    while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => seen.extend_from_slice(&buf[..n]),
                        }
                    }
                    let _ = stream
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                        .await;
                });
            }
        });

        let server = ProxyServer::bind(&config_on_ephemeral_port(upstream_addr)).await.unwrap();
        let addr = server.local_addr().unwrap();
        let stats = server.stats();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let running = tokio::spawn(server.run_until(async {
            let _ = stop_rx.await;
        }));

        let mut bad = TcpStream::connect(addr).await.unwrap();
        bad.write_all(b"garbage\r\n\r\n").await.unwrap();
        let mut rest = Vec::new();
        bad.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let mut good = TcpStream::connect(addr).await.unwrap();
        good.write_all(b"GET /ok HTTP/1.1\r\nConnection: close\r\n\r\n").await.unwrap();
        let mut response = Vec::new();
        good.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("X-Bytes: 2\r\n"));
        assert_eq!(stats.get("/ok"), 2);

        stop_tx.send(()).unwrap();
        running.await.unwrap().unwrap();
    }
}
