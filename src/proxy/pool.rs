//! Connection pooling for the upstream server
//!
//! Idle connections sit in a bounded channel of capacity N:
//! - acquire takes without waiting, then waits up to the acquire timeout,
//!   then dials a fresh connection
//! - release puts without waiting, then waits up to the release timeout,
//!   then closes the connection
//!
//! A capacity of zero disables pooling: every acquire dials and every release
//! closes.

use crate::config::settings::ProxyConfig;
use crate::error::{Error, Result};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::timeout;
use tracing::{debug, info, warn};

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Settings for the upstream pool
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Upstream address as `host:port`
    pub upstream: String,
    /// Maximum idle connections kept (0 disables pooling)
    pub capacity: usize,
    /// How long acquire waits for an idle connection before dialing
    pub acquire_timeout: Duration,
    /// How long release waits for a free slot before closing
    pub release_timeout: Duration,
    /// Timeout for establishing a new connection
    pub connect_timeout: Duration,
    /// Set TCP_NODELAY on upstream sockets
    pub nodelay: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            upstream: "127.0.0.1:8081".to_string(),
            capacity: 10,
            acquire_timeout: Duration::from_millis(100),
            release_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            nodelay: true,
        }
    }
}

impl PoolOptions {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            upstream: config.upstream.addr.clone(),
            capacity: if config.pool.enabled { config.pool.capacity } else { 0 },
            acquire_timeout: Duration::from_millis(config.pool.acquire_timeout_ms),
            release_timeout: Duration::from_millis(config.pool.release_timeout_ms),
            connect_timeout: Duration::from_millis(config.upstream.connect_timeout_ms),
            nodelay: config.upstream.nodelay,
        }
    }
}

/// An open connection to the upstream with buffered read and write halves
#[derive(Debug)]
pub struct UpstreamConnection {
    id: u64,
    peer: SocketAddr,
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    created_at: Instant,
    uses: u64,
}

impl UpstreamConnection {
    fn new(stream: TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            id: CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            peer,
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            created_at: Instant::now(),
            uses: 1,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Number of requests this connection has been checked out for
    pub fn uses(&self) -> u64 {
        self.uses
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Borrow both buffered halves at once
    pub fn io(&mut self) -> (&mut BufReader<OwnedReadHalf>, &mut BufWriter<OwnedWriteHalf>) {
        (&mut self.reader, &mut self.writer)
    }

    /// Close the connection; dropping the write half sends FIN
    pub fn close(self) {
        debug!(
            "🔌 Closing upstream connection #{} to {} after {} uses ({:?} old)",
            self.id,
            self.peer,
            self.uses,
            self.age()
        );
    }
}

/// Snapshot of pool counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub idle: usize,
    /// Acquires served from the pool
    pub hits: u64,
    /// Acquires that fell back to dialing
    pub misses: u64,
    pub dialed: u64,
    pub dial_failures: u64,
    /// Releases that put the connection back into the pool
    pub released: u64,
    /// Connections closed by the pool instead of being kept
    pub discarded: u64,
    pub pending_releases: usize,
}

#[derive(Debug, Default)]
struct PoolCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    dialed: AtomicU64,
    dial_failures: AtomicU64,
    released: AtomicU64,
    discarded: AtomicU64,
}

#[derive(Debug)]
struct IdleQueue {
    tx: mpsc::Sender<UpstreamConnection>,
    rx: Mutex<mpsc::Receiver<UpstreamConnection>>,
}

impl IdleQueue {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    async fn take(&self, wait: Duration) -> Option<UpstreamConnection> {
        if let Ok(mut rx) = self.rx.try_lock() {
            if let Ok(conn) = rx.try_recv() {
                return Some(conn);
            }
        }

        // The lock wait counts against the same deadline as the receive.
        timeout(wait, async { self.rx.lock().await.recv().await })
            .await
            .ok()
            .flatten()
    }

    fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Bounded pool of reusable upstream connections
#[derive(Debug)]
pub struct BackendPool {
    options: PoolOptions,
    idle: Option<IdleQueue>,
    counters: PoolCounters,
    pending_releases: AtomicUsize,
    releases_done: Notify,
}

impl BackendPool {
    pub fn new(options: PoolOptions) -> Self {
        let idle = (options.capacity > 0).then(|| IdleQueue::new(options.capacity));

        info!("🚀 Initializing upstream pool for {}", options.upstream);
        if idle.is_some() {
            info!("   Capacity: {} idle connections", options.capacity);
            info!("   Acquire timeout: {:?}", options.acquire_timeout);
            info!("   Release timeout: {:?}", options.release_timeout);
        } else {
            info!("   Pooling disabled: one upstream connection per request");
        }

        Self {
            options,
            idle,
            counters: PoolCounters::default(),
            pending_releases: AtomicUsize::new(0),
            releases_done: Notify::new(),
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(PoolOptions::from_config(config))
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    pub fn is_enabled(&self) -> bool {
        self.idle.is_some()
    }

    /// Number of idle connections currently held
    pub fn idle_count(&self) -> usize {
        self.idle.as_ref().map(IdleQueue::len).unwrap_or(0)
    }

    /// Check out a connection, dialing a fresh one if none becomes idle in time
    pub async fn acquire(&self) -> Result<UpstreamConnection> {
        if let Some(idle) = &self.idle {
            if let Some(mut conn) = idle.take(self.options.acquire_timeout).await {
                conn.uses += 1;
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                debug!("♻️  Reusing upstream connection #{} (use {})", conn.id, conn.uses);
                return Ok(conn);
            }
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            debug!("Pool empty after {:?}, dialing upstream", self.options.acquire_timeout);
        }

        self.dial().await
    }

    async fn dial(&self) -> Result<UpstreamConnection> {
        let addr = self.options.upstream.as_str();
        let connected = timeout(self.options.connect_timeout, TcpStream::connect(addr)).await;

        let result = match connected {
            Ok(Ok(stream)) => {
                if self.options.nodelay {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY on upstream socket: {}", e);
                    }
                }
                UpstreamConnection::new(stream)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timed out after {:?}", self.options.connect_timeout),
            )),
        };

        match result {
            Ok(conn) => {
                self.counters.dialed.fetch_add(1, Ordering::Relaxed);
                debug!("🔗 Dialed upstream connection #{} to {}", conn.id, conn.peer);
                Ok(conn)
            }
            Err(source) => {
                self.counters.dial_failures.fetch_add(1, Ordering::Relaxed);
                Err(Error::Dial {
                    addr: addr.to_string(),
                    source,
                })
            }
        }
    }

    /// Return a connection, closing it if no slot frees up within the release timeout
    pub async fn release(&self, conn: UpstreamConnection) {
        let Some(idle) = &self.idle else {
            self.discard(conn, "pooling disabled");
            return;
        };

        let conn = match idle.tx.try_send(conn) {
            Ok(()) => {
                self.counters.released.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(TrySendError::Full(conn)) => conn,
            Err(TrySendError::Closed(conn)) => {
                self.discard(conn, "pool is shut down");
                return;
            }
        };

        match idle.tx.send_timeout(conn, self.options.release_timeout).await {
            Ok(()) => {
                self.counters.released.fetch_add(1, Ordering::Relaxed);
            }
            Err(SendTimeoutError::Timeout(conn)) => self.discard(conn, "pool stayed full"),
            Err(SendTimeoutError::Closed(conn)) => self.discard(conn, "pool is shut down"),
        }
    }

    /// Release on a background task the pool keeps count of
    ///
    /// `shutdown` waits for these before draining, so a connection is never
    /// left between owners.
    pub fn release_in_background(self: &Arc<Self>, conn: UpstreamConnection) {
        self.pending_releases.fetch_add(1, Ordering::SeqCst);
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.release(conn).await;
            if pool.pending_releases.fetch_sub(1, Ordering::SeqCst) == 1 {
                pool.releases_done.notify_waiters();
            }
        });
    }

    fn discard(&self, conn: UpstreamConnection, reason: &str) {
        self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        debug!("Discarding upstream connection #{}: {}", conn.id, reason);
        conn.close();
    }

    /// Wait for background releases, then close every idle connection
    ///
    /// Later releases are closed instead of pooled; later acquires still dial.
    pub async fn shutdown(&self) {
        let wait_for_releases = async {
            loop {
                let notified = self.releases_done.notified();
                if self.pending_releases.load(Ordering::SeqCst) == 0 {
                    break;
                }
                notified.await;
            }
        };

        // Every pending release finishes within the release timeout.
        let limit = self.options.release_timeout + Duration::from_millis(100);
        if timeout(limit, wait_for_releases).await.is_err() {
            warn!(
                "⚠️  {} upstream releases still pending at shutdown",
                self.pending_releases.load(Ordering::SeqCst)
            );
        }

        let Some(idle) = &self.idle else {
            return;
        };

        let mut rx = idle.rx.lock().await;
        rx.close();
        let mut drained = 0usize;
        while let Ok(conn) = rx.try_recv() {
            self.discard(conn, "shutting down");
            drained += 1;
        }
        info!("🔌 Upstream pool drained: {} idle connections closed", drained);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.options.capacity,
            idle: self.idle_count(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            dialed: self.counters.dialed.load(Ordering::Relaxed),
            dial_failures: self.counters.dial_failures.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            pending_releases: self.pending_releases.load(Ordering::SeqCst),
        }
    }

    /// Log the pool counters at info level
    pub fn log_stats(&self) {
        let stats = self.stats();
        info!("📊 Upstream Pool Statistics:");
        info!("   Idle: {}/{}", stats.idle, stats.capacity);
        info!("   Reused: {} | Dialed: {} | Dial failures: {}", stats.hits, stats.dialed, stats.dial_failures);
        info!("   Returned: {} | Closed by pool: {}", stats.released, stats.discarded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Upstream that accepts and holds connections open
    async fn start_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        addr
    }

    async fn refused_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    fn options(upstream: SocketAddr, capacity: usize) -> PoolOptions {
        PoolOptions {
            upstream: upstream.to_string(),
            capacity,
            acquire_timeout: Duration::from_millis(50),
            release_timeout: Duration::from_millis(50),
            ..PoolOptions::default()
        }
    }

    #[tokio::test]
    async fn test_released_connection_is_reused() {
        let pool = BackendPool::new(options(start_upstream().await, 2));

        let conn = pool.acquire().await.unwrap();
        let id = conn.id();
        pool.release(conn).await;
        assert_eq!(pool.idle_count(), 1);

        let again = pool.acquire().await.unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(again.uses(), 2);

        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.dialed, 1);
        assert_eq!(stats.idle, 0);
    }

    #[tokio::test]
    async fn test_acquire_falls_back_to_dial_after_timeout() {
        let pool = BackendPool::new(options(start_upstream().await, 2));

        let started = Instant::now();
        let conn = pool.acquire().await.unwrap();
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_secs(2));
        assert_eq!(conn.uses(), 1);
        assert_eq!(pool.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_waiting_acquire_receives_released_connection() {
        let mut opts = options(start_upstream().await, 1);
        opts.acquire_timeout = Duration::from_secs(2);
        let pool = Arc::new(BackendPool::new(opts));

        let conn = pool.dial().await.unwrap();
        let id = conn.id();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.release(conn).await;

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.id(), id);
        assert_eq!(pool.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_release_into_full_pool_closes_after_timeout() {
        let pool = BackendPool::new(options(start_upstream().await, 2));

        let mut conns = Vec::new();
        for _ in 0..3 {
            conns.push(pool.dial().await.unwrap());
        }
        pool.release(conns.remove(0)).await;
        pool.release(conns.remove(0)).await;

        let started = Instant::now();
        pool.release(conns.remove(0)).await;
        assert!(started.elapsed() >= Duration::from_millis(50));

        let stats = pool.stats();
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.released, 2);
        assert_eq!(stats.discarded, 1);
    }

    #[tokio::test]
    async fn test_disabled_pool_dials_every_time() {
        let pool = BackendPool::new(options(start_upstream().await, 0));
        assert!(!pool.is_enabled());

        let first = pool.acquire().await.unwrap();
        let first_id = first.id();
        pool.release(first).await;

        let second = pool.acquire().await.unwrap();
        assert_ne!(second.id(), first_id);

        let stats = pool.stats();
        assert_eq!(stats.dialed, 2);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.idle, 0);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_a_dial_error() {
        let pool = BackendPool::new(options(refused_addr().await, 2));
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, Error::Dial { .. }));
        assert_eq!(pool.stats().dial_failures, 1);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_background_releases() {
        let pool = Arc::new(BackendPool::new(options(start_upstream().await, 4)));

        for _ in 0..3 {
            let conn = pool.dial().await.unwrap();
            pool.release_in_background(conn);
        }
        pool.shutdown().await;

        let stats = pool.stats();
        assert_eq!(stats.pending_releases, 0);
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.released, 3);
        assert_eq!(stats.discarded, 3);

        // Releases after shutdown are closed, acquires still dial.
        let conn = pool.acquire().await.unwrap();
        pool.release(conn).await;
        assert_eq!(pool.idle_count(), 0);
    }
}
