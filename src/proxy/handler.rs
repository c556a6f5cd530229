//! Per-client relay loop
//!
//! One handler owns one client connection and serves its requests strictly in
//! order. Each request checks out its own upstream connection from the pool.

use crate::error::{Error, Result};
use crate::log_proxy_transaction;
use crate::models::{BodyFraming, ProxyLog, RequestData, RequestHead, ResponseData, ResponseHead};
use crate::proxy::codec::{
    expects_continue, read_request_head, read_response_head, relay_body, request_framing,
    request_keep_alive, response_framing, response_keep_alive, HeadLimits, TransferError,
};
use crate::proxy::pool::BackendPool;
use crate::proxy::stats::StatsAggregator;
use crate::utils::{content_length, duration_to_ms, set_header};
use hyper::StatusCode;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

/// Response header carrying the cumulative byte count for the request path
pub const X_BYTES: &str = "X-Bytes";

/// What happens to the client connection after one exchange
struct Exchange {
    response: ResponseData,
    keep_client_open: bool,
}

pub struct ConnectionHandler {
    client_addr: SocketAddr,
    pool: Arc<BackendPool>,
    stats: Arc<StatsAggregator>,
    limits: HeadLimits,
}

impl ConnectionHandler {
    pub fn new(
        client_addr: SocketAddr,
        pool: Arc<BackendPool>,
        stats: Arc<StatsAggregator>,
        limits: HeadLimits,
    ) -> Self {
        Self {
            client_addr,
            pool,
            stats,
            limits,
        }
    }

    /// Serve a client socket until it disconnects or a relay step fails
    pub async fn run(self, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", self.client_addr, e);
        }
        let (reader, writer) = stream.into_split();

        match self.serve(reader, writer).await {
            Ok(()) => {}
            Err(e) if e.is_clean_close() => {
                debug!("Client {} went away: {}", self.client_addr, e);
            }
            Err(e) if e.is_upstream() => {
                error!("❌ Upstream failure, closing connection from {}: {}", self.client_addr, e);
            }
            Err(e) => {
                warn!("❌ Closing connection from {}: {}", self.client_addr, e);
            }
        }
    }

    /// Request/response loop over any client transport
    ///
    /// Returns `Ok(())` when the client closes between requests or the
    /// exchange ends the session; any error closes the connection without a
    /// synthesized response.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut client_reader = BufReader::new(reader);
        let mut client_writer = BufWriter::new(writer);
        let mut served = 0u64;

        loop {
            let Some(request) = read_request_head(&mut client_reader, &self.limits).await? else {
                debug!("Client {} closed after {} requests", self.client_addr, served);
                return Ok(());
            };

            debug!("📥 {} {} from {}", request.method, request.target, self.client_addr);
            let mut record = RequestData::from_head(&request, self.client_addr);

            let exchange = match self
                .exchange(&request, &mut record, &mut client_reader, &mut client_writer)
                .await
            {
                Ok(exchange) => exchange,
                Err(e) => {
                    log_proxy_transaction!(&ProxyLog::failed(record, e.to_string()));
                    return Err(e);
                }
            };

            served += 1;
            debug!(
                "📤 {} {} → {} ({} bytes, X-Bytes {})",
                request.method,
                request.path,
                exchange.response.status_code,
                exchange.response.body_bytes,
                exchange.response.path_total_bytes
            );
            let keep_client_open = exchange.keep_client_open;
            log_proxy_transaction!(&ProxyLog::completed(record, exchange.response));

            if !keep_client_open {
                debug!("Closing client {} after {} requests", self.client_addr, served);
                return Ok(());
            }
        }
    }

    /// One request/response cycle against a pooled upstream connection
    async fn exchange<R, W>(
        &self,
        request: &RequestHead,
        record: &mut RequestData,
        client_reader: &mut R,
        client_writer: &mut W,
    ) -> Result<Exchange>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let started = Instant::now();
        let body_framing = request_framing(request)?;

        let mut upstream = self.pool.acquire().await?;
        let upstream_id = upstream.id();
        let reused = upstream.uses() > 1;
        debug!(
            "Forwarding {} {} over upstream #{} to {}",
            request.method,
            request.path,
            upstream_id,
            upstream.peer()
        );
        let (upstream_reader, upstream_writer) = upstream.io();

        upstream_writer
            .write_all(&request.encode())
            .await
            .map_err(Error::UpstreamWrite)?;
        if expects_continue(request) {
            // The client sends its body only after the upstream's 100 Continue.
            upstream_writer.flush().await.map_err(Error::UpstreamWrite)?;
        }
        record.body_bytes = relay_body(body_framing, client_reader, upstream_writer)
            .await
            .map_err(|e| match e {
                TransferError::Read(e) => Error::ClientRead(e),
                TransferError::Write(e) => Error::UpstreamWrite(e),
            })?;
        upstream_writer.flush().await.map_err(Error::UpstreamWrite)?;

        let mut response = loop {
            let head = read_response_head(upstream_reader, &self.limits).await?;
            if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
                client_writer
                    .write_all(&head.encode())
                    .await
                    .map_err(Error::ResponseWrite)?;
                client_writer.flush().await.map_err(Error::ResponseWrite)?;
                continue;
            }
            break head;
        };

        let framing = response_framing(&request.method, &response)?;
        let declared = declared_length(&response);
        let path_total = self.stats.update(&request.path, declared.unwrap_or(0));
        set_header(&mut response.headers, X_BYTES, &path_total.to_string());

        client_writer
            .write_all(&response.encode())
            .await
            .map_err(Error::ResponseWrite)?;
        let body_bytes = relay_body(framing, upstream_reader, client_writer)
            .await
            .map_err(|e| match e {
                TransferError::Read(e) => Error::UpstreamRead(e),
                TransferError::Write(e) => Error::ResponseWrite(e),
            })?;
        client_writer.flush().await.map_err(Error::ResponseWrite)?;

        // 101 hands the connection to another protocol, which is not relayed.
        let upgraded = response.status == StatusCode::SWITCHING_PROTOCOLS;
        let delimited = framing != BodyFraming::UntilClose;
        let client_keep_alive = request_keep_alive(request);

        // A forwarded `Connection: close` lets the upstream close after responding.
        if delimited && !upgraded && client_keep_alive && response_keep_alive(&response) {
            self.pool.release_in_background(upstream);
        } else {
            upstream.close();
        }

        Ok(Exchange {
            response: ResponseData {
                status_code: response.status.as_u16(),
                content_length: declared,
                body_bytes,
                path_total_bytes: path_total,
                upstream_connection: upstream_id,
                reused_connection: reused,
                response_time_ms: duration_to_ms(started.elapsed()),
            },
            keep_client_open: delimited && !upgraded && client_keep_alive,
        })
    }
}

/// Content-Length as declared by the upstream, ignored under Transfer-Encoding
fn declared_length(head: &ResponseHead) -> Option<u64> {
    if head
        .headers
        .iter()
        .any(|h| h.name.eq_ignore_ascii_case("transfer-encoding"))
    {
        return None;
    }
    content_length(&head.headers).ok().flatten()
}
