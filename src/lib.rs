use std::time::Duration;

pub mod access_log;
pub mod blacklist;
pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod relay;
pub mod request;
pub mod server;
pub mod worker;

pub use access_log::{LogRecord, LogSink, Outcome, TracingSink};
pub use blacklist::Blacklist;
pub use cache::{cache_key, CacheKey, DiskCache};
pub use config::{Config, Limits};
pub use error::{ErrorKind, ParseError, ProxyError};
pub use relay::{Capture, Resolve, SystemResolver};
pub use request::{parse, Request};
pub use server::{Server, Shutdown, ShutdownSignal};
pub use worker::ProxyContext;

pub const DEFAULT_PORT: u16 = 80;
pub const READ_BUFFER_SIZE: usize = 8192;
pub const MAX_REQUEST_SIZE: usize = 64 * 1024;
pub const MAX_HEADERS: usize = 64;
pub const MAX_TARGET_LEN: usize = 2048;
pub const MAX_HOST_LEN: usize = 255;
/// Responses are captured for caching up to this many bytes; the rest is
/// still forwarded to the client.
pub const CAPTURE_LIMIT: usize = 10 * READ_BUFFER_SIZE;
pub const MAX_CONNECTIONS: usize = 1024;
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub const FORBIDDEN_RESPONSE: &[u8] = b"HTTP/1.1 403 Forbidden\r\nContent-Type: text/plain\r\nContent-Length: 14\r\nConnection: close\r\n\r\n403 Forbidden\n";
pub const NOT_IMPLEMENTED_RESPONSE: &[u8] =
    b"HTTP/1.1 501 Not Implemented\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
pub const SERVICE_UNAVAILABLE_RESPONSE: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\n\r\n";
