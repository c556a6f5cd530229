//! HTTP/1.1 message framing
//!
//! Heads are read line by line off a buffered stream and handed to `httparse`;
//! bodies are relayed without being buffered as a whole. Everything is
//! forwarded byte-for-byte, so chunk extensions and trailers survive the hop.

use crate::error::{Error, Result};
use crate::models::{BodyFraming, Header, RequestHead, ResponseHead};
use crate::utils::{content_length, has_token, is_chunked};
use bytes::{BufMut, BytesMut};
use hyper::{Method, StatusCode, Uri, Version};
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum length of a single chunk-size or trailer line
const MAX_CHUNK_LINE: u64 = 4096;

/// Size limits applied while reading message heads
#[derive(Debug, Clone, Copy)]
pub struct HeadLimits {
    pub max_head_bytes: usize,
    pub max_headers: usize,
}

impl Default for HeadLimits {
    fn default() -> Self {
        Self {
            max_head_bytes: 64 * 1024,
            max_headers: 100,
        }
    }
}

/// Failure while relaying a body, split by the side that failed
#[derive(Debug)]
pub enum TransferError {
    Read(io::Error),
    Write(io::Error),
}

/// Read the next request head from a client
///
/// Returns `Ok(None)` when the client closed the connection before sending
/// anything, which is the normal end of a keep-alive session.
pub async fn read_request_head<R>(reader: &mut R, limits: &HeadLimits) -> Result<Option<RequestHead>>
where
    R: AsyncBufRead + Unpin,
{
    let raw = match read_head_bytes(reader, limits).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return Ok(None),
        Err(e) if is_framing_error(&e) => return Err(Error::RequestParse(e.to_string())),
        Err(e) => return Err(Error::ClientRead(e)),
    };

    parse_request_head(&raw, limits).map(Some)
}

/// Read a response head from the upstream
pub async fn read_response_head<R>(reader: &mut R, limits: &HeadLimits) -> Result<ResponseHead>
where
    R: AsyncBufRead + Unpin,
{
    match read_head_bytes(reader, limits).await {
        Ok(Some(raw)) => parse_response_head(&raw, limits),
        Ok(None) => Err(Error::UpstreamRead(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "upstream closed the connection before responding",
        ))),
        Err(e) if e.kind() == io::ErrorKind::InvalidData => Err(Error::ResponseParse(e.to_string())),
        Err(e) => Err(Error::UpstreamRead(e)),
    }
}

fn is_framing_error(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof)
}

/// Collect raw head bytes up to and including the terminating blank line
async fn read_head_bytes<R>(reader: &mut R, limits: &HeadLimits) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(1024);

    loop {
        let remaining = limits.max_head_bytes.saturating_sub(head.len());
        if remaining == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("message head exceeds {} bytes", limits.max_head_bytes),
            ));
        }

        let start = head.len();
        let n = (&mut *reader)
            .take(remaining as u64)
            .read_until(b'\n', &mut head)
            .await?;

        if n == 0 {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed in the middle of a message head",
            ));
        }

        let line = &head[start..];
        if !line.ends_with(b"\n") {
            // Either the size limit or EOF; the next iteration reports which.
            continue;
        }

        if line == b"\r\n" || line == b"\n" {
            if start == 0 {
                // Stray CRLF between keep-alive requests.
                head.clear();
                continue;
            }
            return Ok(Some(head));
        }
    }
}

fn parse_request_head(raw: &[u8], limits: &HeadLimits) -> Result<RequestHead> {
    let mut slots = vec![httparse::EMPTY_HEADER; limits.max_headers];
    let mut req = httparse::Request::new(&mut slots);

    match req.parse(raw) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(Error::RequestParse("incomplete request head".to_string()))
        }
        Err(e) => return Err(Error::RequestParse(e.to_string())),
    }

    let method = req
        .method
        .ok_or_else(|| Error::RequestParse("missing method".to_string()))
        .and_then(|m| {
            Method::from_bytes(m.as_bytes())
                .map_err(|_| Error::RequestParse(format!("invalid method: {}", m)))
        })?;
    let target = req
        .path
        .ok_or_else(|| Error::RequestParse("missing request-target".to_string()))?
        .to_string();
    let version = http_version(req.version)
        .ok_or_else(|| Error::RequestParse("unsupported HTTP version".to_string()))?;
    let path = request_path(&target)?;

    Ok(RequestHead {
        method,
        target,
        path,
        version,
        headers: collect_headers(req.headers),
    })
}

fn parse_response_head(raw: &[u8], limits: &HeadLimits) -> Result<ResponseHead> {
    let mut slots = vec![httparse::EMPTY_HEADER; limits.max_headers];
    let mut resp = httparse::Response::new(&mut slots);

    match resp.parse(raw) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(Error::ResponseParse("incomplete response head".to_string()))
        }
        Err(e) => return Err(Error::ResponseParse(e.to_string())),
    }

    let status = resp
        .code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| Error::ResponseParse("invalid status code".to_string()))?;
    let version = http_version(resp.version)
        .ok_or_else(|| Error::ResponseParse("unsupported HTTP version".to_string()))?;

    Ok(ResponseHead {
        version,
        status,
        reason: resp.reason.unwrap_or_default().to_string(),
        headers: collect_headers(resp.headers),
    })
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> Vec<Header> {
    parsed.iter().map(|h| Header::new(h.name, h.value)).collect()
}

fn http_version(minor: Option<u8>) -> Option<Version> {
    match minor {
        Some(0) => Some(Version::HTTP_10),
        Some(1) => Some(Version::HTTP_11),
        _ => None,
    }
}

fn version_str(version: Version) -> &'static str {
    if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}

/// Extract the path component of a request-target
///
/// Works for origin-form (`/a/b?q`), absolute-form (`http://host/a/b`) and the
/// asterisk form used by `OPTIONS *`.
pub fn request_path(target: &str) -> Result<String> {
    if target == "*" {
        return Ok("*".to_string());
    }

    let uri: Uri = target
        .parse()
        .map_err(|e| Error::RequestParse(format!("invalid request-target {:?}: {}", target, e)))?;

    Ok(uri.path().to_string())
}

/// Determine how a request body is framed
pub fn request_framing(head: &RequestHead) -> Result<BodyFraming> {
    if head.headers.iter().any(|h| h.name.eq_ignore_ascii_case("transfer-encoding")) {
        // Forwarded verbatim, so both headers would reach a shared upstream
        // connection with two different framings.
        if head.headers.iter().any(|h| h.name.eq_ignore_ascii_case("content-length")) {
            return Err(Error::RequestParse(
                "both transfer-encoding and content-length present".to_string(),
            ));
        }
        if is_chunked(&head.headers) {
            return Ok(BodyFraming::Chunked);
        }
        return Err(Error::RequestParse(
            "transfer-encoding without final chunked coding".to_string(),
        ));
    }

    match content_length(&head.headers).map_err(Error::RequestParse)? {
        Some(0) | None => Ok(BodyFraming::Empty),
        Some(n) => Ok(BodyFraming::Length(n)),
    }
}

/// Determine how a response body is framed, given the request it answers
pub fn response_framing(request_method: &Method, head: &ResponseHead) -> Result<BodyFraming> {
    if *request_method == Method::HEAD
        || head.status.is_informational()
        || head.status == StatusCode::NO_CONTENT
        || head.status == StatusCode::NOT_MODIFIED
    {
        return Ok(BodyFraming::Empty);
    }

    if head.headers.iter().any(|h| h.name.eq_ignore_ascii_case("transfer-encoding")) {
        if is_chunked(&head.headers) {
            return Ok(BodyFraming::Chunked);
        }
        return Ok(BodyFraming::UntilClose);
    }

    match content_length(&head.headers).map_err(Error::ResponseParse)? {
        Some(0) => Ok(BodyFraming::Empty),
        Some(n) => Ok(BodyFraming::Length(n)),
        None => Ok(BodyFraming::UntilClose),
    }
}

/// Whether the client holds its body back until it sees `100 Continue`
pub fn expects_continue(head: &RequestHead) -> bool {
    head.version != Version::HTTP_10 && has_token(&head.headers, "expect", "100-continue")
}

/// Whether the client wants the connection kept open after this exchange
pub fn request_keep_alive(head: &RequestHead) -> bool {
    keep_alive(head.version, &head.headers)
}

/// Whether the upstream left the connection usable for another request
pub fn response_keep_alive(head: &ResponseHead) -> bool {
    keep_alive(head.version, &head.headers)
}

fn keep_alive(version: Version, headers: &[Header]) -> bool {
    if has_token(headers, "connection", "close") {
        return false;
    }
    version != Version::HTTP_10 || has_token(headers, "connection", "keep-alive")
}

impl RequestHead {
    /// Serialize the head in wire format
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_slice(self.method.as_str().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.target.as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(version_str(self.version).as_bytes());
        buf.put_slice(b"\r\n");
        encode_headers(&mut buf, &self.headers);
        buf
    }
}

impl ResponseHead {
    /// Serialize the head in wire format
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_slice(version_str(self.version).as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.status.as_str().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.reason.as_bytes());
        buf.put_slice(b"\r\n");
        encode_headers(&mut buf, &self.headers);
        buf
    }
}

fn encode_headers(buf: &mut BytesMut, headers: &[Header]) {
    for header in headers {
        buf.put_slice(header.name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(&header.value);
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
}

/// Relay a body from `reader` to `writer` according to its framing
///
/// Returns the number of payload bytes moved (chunk framing excluded).
pub async fn relay_body<R, W>(
    framing: BodyFraming,
    reader: &mut R,
    writer: &mut W,
) -> std::result::Result<u64, TransferError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match framing {
        BodyFraming::Empty => Ok(0),
        BodyFraming::Length(n) => copy_exact(reader, writer, n).await,
        BodyFraming::Chunked => copy_chunked(reader, writer).await,
        BodyFraming::UntilClose => copy_to_end(reader, writer).await,
    }
}

async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, len: u64) -> std::result::Result<u64, TransferError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = len;
    while remaining > 0 {
        let buf = reader.fill_buf().await.map_err(TransferError::Read)?;
        if buf.is_empty() {
            return Err(TransferError::Read(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("body ended {} bytes early", remaining),
            )));
        }
        let n = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        writer.write_all(&buf[..n]).await.map_err(TransferError::Write)?;
        reader.consume(n);
        remaining -= n as u64;
    }
    Ok(len)
}

async fn copy_to_end<R, W>(reader: &mut R, writer: &mut W) -> std::result::Result<u64, TransferError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        let buf = reader.fill_buf().await.map_err(TransferError::Read)?;
        if buf.is_empty() {
            return Ok(total);
        }
        let n = buf.len();
        writer.write_all(buf).await.map_err(TransferError::Write)?;
        reader.consume(n);
        total += n as u64;
    }
}

async fn copy_chunked<R, W>(reader: &mut R, writer: &mut W) -> std::result::Result<u64, TransferError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        let size_line = read_line(reader).await?;
        writer.write_all(&size_line).await.map_err(TransferError::Write)?;

        let size = parse_chunk_size(&size_line).map_err(TransferError::Read)?;
        if size == 0 {
            // Trailer section, terminated by an empty line.
            loop {
                let trailer = read_line(reader).await?;
                writer.write_all(&trailer).await.map_err(TransferError::Write)?;
                if is_blank_line(&trailer) {
                    return Ok(total);
                }
            }
        }

        total += copy_exact(reader, writer, size).await?;

        let terminator = read_line(reader).await?;
        if !is_blank_line(&terminator) {
            return Err(TransferError::Read(io::Error::new(
                io::ErrorKind::InvalidData,
                "missing CRLF after chunk data",
            )));
        }
        writer.write_all(&terminator).await.map_err(TransferError::Write)?;
    }
}

async fn read_line<R>(reader: &mut R) -> std::result::Result<Vec<u8>, TransferError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(16);
    let n = (&mut *reader)
        .take(MAX_CHUNK_LINE)
        .read_until(b'\n', &mut line)
        .await
        .map_err(TransferError::Read)?;

    if n == 0 || !line.ends_with(b"\n") {
        let kind = if n as u64 == MAX_CHUNK_LINE {
            io::ErrorKind::InvalidData
        } else {
            io::ErrorKind::UnexpectedEof
        };
        return Err(TransferError::Read(io::Error::new(kind, "truncated chunk framing")));
    }
    Ok(line)
}

fn is_blank_line(line: &[u8]) -> bool {
    line == b"\r\n" || line == b"\n"
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let invalid = || io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size");

    let text = std::str::from_utf8(line).map_err(|_| invalid())?;
    let size = text
        .split(';')
        .next()
        .unwrap_or_default()
        .trim_matches(|c: char| c == ' ' || c == '\t' || c == '\r' || c == '\n');

    if size.is_empty() {
        return Err(invalid());
    }
    u64::from_str_radix(size, 16).map_err(|_| invalid())
}
