use chrono::{DateTime, Utc};
use hyper::{Method, StatusCode, Version};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// A single header line, kept with its original casing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: Vec<u8>,
}

impl Header {
    pub fn new(name: &str, value: &[u8]) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_vec(),
        }
    }
}

/// Parsed head of a client request
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    /// Request-target exactly as received (origin-form or absolute-form)
    pub target: String,
    /// Path component of the target, used as the stats key
    pub path: String,
    pub version: Version,
    /// Headers in wire order
    pub headers: Vec<Header>,
}

/// Parsed head of an upstream response
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    pub reason: String,
    pub headers: Vec<Header>,
}

/// How the body following a message head is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
    /// Body runs until the peer closes the connection (responses only)
    UntilClose,
}

// Summary of one relayed request/response cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestData {
    pub method: String,
    pub path: String,
    pub http_version: String,
    pub client_addr: SocketAddr,
    pub body_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseData {
    pub status_code: u16,
    pub content_length: Option<u64>,
    pub body_bytes: u64,
    /// Cumulative total reported to the client in `X-Bytes`
    pub path_total_bytes: u64,
    pub upstream_connection: u64,
    pub reused_connection: bool,
    pub response_time_ms: u64,
}

// Complete request-response pair for logging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyLog {
    pub timestamp: DateTime<Utc>,
    pub request: RequestData,
    pub response: Option<ResponseData>,
    pub error: Option<String>,
}

impl RequestData {
    pub fn from_head(head: &RequestHead, client_addr: SocketAddr) -> Self {
        Self {
            method: head.method.to_string(),
            path: head.path.clone(),
            http_version: format!("{:?}", head.version),
            client_addr,
            body_bytes: 0,
        }
    }
}

impl ProxyLog {
    pub fn completed(request: RequestData, response: ResponseData) -> Self {
        Self {
            timestamp: Utc::now(),
            request,
            response: Some(response),
            error: None,
        }
    }

    pub fn failed(request: RequestData, error: String) -> Self {
        Self {
            timestamp: Utc::now(),
            request,
            response: None,
            error: Some(error),
        }
    }
}
