use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::builder::RangedU64ValueParser;
use clap::Parser;

use crate::{CAPTURE_LIMIT, CONNECT_TIMEOUT, DRAIN_TIMEOUT, IDLE_TIMEOUT, MAX_CONNECTIONS, MAX_REQUEST_SIZE};

/// Forward HTTP proxy with an on-disk response cache.
#[derive(Parser, Debug, Clone)]
#[command(name = "cacheproxy", version, about)]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "CACHEPROXY_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Directory holding cached responses
    #[arg(long, env = "CACHEPROXY_CACHE_DIR", default_value = "cache")]
    pub cache_dir: PathBuf,

    /// File with one blocked host substring per line
    #[arg(long, env = "CACHEPROXY_BLACKLIST", default_value = "blacklist.txt")]
    pub blacklist: PathBuf,

    /// Append access records to this file
    #[arg(long, env = "CACHEPROXY_ACCESS_LOG")]
    pub access_log: Option<PathBuf>,

    /// Connections served at once; extra ones get 503
    #[arg(long, env = "CACHEPROXY_MAX_CONNECTIONS", default_value_t = MAX_CONNECTIONS,
          value_parser = RangedU64ValueParser::<usize>::new().range(1..))]
    pub max_connections: usize,

    /// Bytes of each response kept for the cache
    #[arg(long, env = "CACHEPROXY_CAPTURE_LIMIT", default_value_t = CAPTURE_LIMIT)]
    pub capture_limit: usize,

    /// Seconds to wait for an origin connection
    #[arg(long, env = "CACHEPROXY_CONNECT_TIMEOUT", default_value_t = CONNECT_TIMEOUT.as_secs(),
          value_parser = clap::value_parser!(u64).range(1..))]
    pub connect_timeout: u64,

    /// Seconds a client or origin may stay silent
    #[arg(long, env = "CACHEPROXY_IDLE_TIMEOUT", default_value_t = IDLE_TIMEOUT.as_secs(),
          value_parser = clap::value_parser!(u64).range(1..))]
    pub idle_timeout: u64,

    /// Seconds to let in-flight connections finish on shutdown (0 aborts them)
    #[arg(long, env = "CACHEPROXY_DRAIN_TIMEOUT", default_value_t = DRAIN_TIMEOUT.as_secs())]
    pub drain_timeout: u64,
}

impl Config {
    pub fn limits(&self) -> Limits {
        Limits {
            read_limit: MAX_REQUEST_SIZE,
            capture_limit: self.capture_limit,
            connect_timeout: Duration::from_secs(self.connect_timeout),
            idle_timeout: Duration::from_secs(self.idle_timeout),
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout)
    }
}

/// Per-connection limits shared by the worker and the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Largest request head accepted from a client.
    pub read_limit: usize,
    pub capture_limit: usize,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            read_limit: MAX_REQUEST_SIZE,
            capture_limit: CAPTURE_LIMIT,
            connect_timeout: CONNECT_TIMEOUT,
            idle_timeout: IDLE_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::try_parse_from(["cacheproxy"]).unwrap();
        assert_eq!(config.listen, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.cache_dir, PathBuf::from("cache"));
        assert_eq!(config.blacklist, PathBuf::from("blacklist.txt"));
        assert!(config.access_log.is_none());
        assert_eq!(config.max_connections, MAX_CONNECTIONS);
        assert_eq!(config.limits(), Limits::default());
        assert_eq!(config.drain_timeout(), DRAIN_TIMEOUT);
    }

    #[test]
    fn test_config_overrides() {
        let config = Config::try_parse_from([
            "cacheproxy",
            "--listen",
            "127.0.0.1:3128",
            "--capture-limit",
            "1024",
            "--idle-timeout",
            "5",
            "--drain-timeout",
            "0",
            "--access-log",
            "/tmp/access.log",
        ])
        .unwrap();
        assert_eq!(config.listen.port(), 3128);
        assert_eq!(config.limits().capture_limit, 1024);
        assert_eq!(config.limits().idle_timeout, Duration::from_secs(5));
        assert_eq!(config.drain_timeout(), Duration::ZERO);
        assert_eq!(config.access_log, Some(PathBuf::from("/tmp/access.log")));
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        assert!(Config::try_parse_from(["cacheproxy", "--idle-timeout", "0"]).is_err());
        assert!(Config::try_parse_from(["cacheproxy", "--max-connections", "0"]).is_err());
    }
}
