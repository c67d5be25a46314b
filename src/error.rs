use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Why a raw request could not be turned into a [`crate::request::Request`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("request head is not terminated")]
    Incomplete,
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("request has no Host header")]
    MissingHost,
    #[error("{field} exceeds {limit} bytes")]
    Oversized { field: &'static str, limit: usize },
    #[error("invalid port in {0:?}")]
    InvalidPort(String),
}

/// Connection-local failures. None of them is fatal to the server.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("client read failed: {0}")]
    Read(#[source] io::Error),
    #[error("client closed the connection without sending a request")]
    EmptyRequest,
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("cannot resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("relay aborted: {0}")]
    RelayIo(#[source] io::Error),
    #[error("cache i/o failed: {0}")]
    Cache(#[source] io::Error),
}

/// Coarse classification carried by access log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Read,
    Parse,
    Resolve,
    Connect,
    RelayIo,
    Cache,
}

impl ProxyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::Read(_) | ProxyError::EmptyRequest => ErrorKind::Read,
            ProxyError::Parse(_) => ErrorKind::Parse,
            ProxyError::Resolve { .. } => ErrorKind::Resolve,
            ProxyError::Connect { .. } => ErrorKind::Connect,
            ProxyError::RelayIo(_) => ErrorKind::RelayIo,
            ProxyError::Cache(_) => ErrorKind::Cache,
        }
    }

    pub(crate) fn connect(addr: SocketAddr, source: io::Error) -> Self {
        ProxyError::Connect {
            addr: addr.to_string(),
            source,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Read => "read_error",
            ErrorKind::Parse => "parse_error",
            ErrorKind::Resolve => "resolve_error",
            ErrorKind::Connect => "connect_error",
            ErrorKind::RelayIo => "relay_io_error",
            ErrorKind::Cache => "cache_error",
        };
        f.write_str(name)
    }
}
