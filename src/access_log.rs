use std::fmt;
use std::net::SocketAddr;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::info;

use crate::error::ErrorKind;

pub const ACCESS_TARGET: &str = "cacheproxy::access";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    CacheHit { bytes: u64 },
    Relayed { bytes: u64, cached: bool },
    Blocked,
    Unsupported,
    /// Turned away with a 503 because every connection slot was taken.
    Rejected,
    Failed(ErrorKind),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::CacheHit { bytes } => write!(f, "hit bytes={bytes}"),
            Outcome::Relayed { bytes, cached } => {
                write!(f, "relayed bytes={bytes} cached={cached}")
            }
            Outcome::Blocked => f.write_str("blocked"),
            Outcome::Unsupported => f.write_str("unsupported"),
            Outcome::Rejected => f.write_str("rejected"),
            Outcome::Failed(kind) => write!(f, "failed {kind}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub client: SocketAddr,
    /// `None` when the request never got far enough to name a host.
    pub host: Option<String>,
    pub method: Option<String>,
    pub target: Option<String>,
    pub outcome: Outcome,
}

impl LogRecord {
    pub fn new(client: SocketAddr, outcome: Outcome) -> Self {
        Self {
            timestamp: Utc::now(),
            client,
            host: None,
            method: None,
            target: None,
            outcome,
        }
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.client,
            self.host.as_deref().unwrap_or("-"),
        )?;
        if let (Some(method), Some(target)) = (&self.method, &self.target) {
            write!(f, " \"{method} {target}\"")?;
        }
        write!(f, " {}", self.outcome)
    }
}

/// Where workers send their access records.
pub trait LogSink: Send + Sync {
    fn record(&self, record: LogRecord);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn record(&self, record: LogRecord) {
        info!(target: ACCESS_TARGET, "{}", record);
    }
}
