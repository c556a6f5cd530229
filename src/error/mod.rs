//! Error handling module for the proxy server

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Custom error type for the proxy server
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    #[error("malformed request: {0}")]
    RequestParse(String),

    #[error("failed to read from client: {0}")]
    ClientRead(#[source] io::Error),

    #[error("failed to dial upstream {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to write request upstream: {0}")]
    UpstreamWrite(#[source] io::Error),

    #[error("failed to read upstream response: {0}")]
    UpstreamRead(#[source] io::Error),

    #[error("malformed upstream response: {0}")]
    ResponseParse(String),

    #[error("failed to write response to client: {0}")]
    ResponseWrite(#[source] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the error is an ordinary peer disconnect rather than a fault.
    pub fn is_clean_close(&self) -> bool {
        match self {
            Error::ClientRead(e) | Error::ResponseWrite(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// Whether the failure happened on the upstream side of the relay.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            Error::Dial { .. }
                | Error::UpstreamWrite(_)
                | Error::UpstreamRead(_)
                | Error::ResponseParse(_)
        )
    }
}

/// Result type for the proxy server
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_close_classification() {
        let reset = Error::ClientRead(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(reset.is_clean_close());

        let pipe = Error::ResponseWrite(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(pipe.is_clean_close());

        let parse = Error::RequestParse("bad request line".to_string());
        assert!(!parse.is_clean_close());
    }

    #[test]
    fn test_upstream_classification() {
        let dial = Error::Dial {
            addr: "127.0.0.1:1".to_string(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert!(dial.is_upstream());
        assert!(dial.to_string().contains("127.0.0.1:1"));
        assert!(!Error::RequestParse("x".into()).is_upstream());
    }
}
