use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::access_log::{LogRecord, LogSink, Outcome, TracingSink};
use crate::blacklist::Blacklist;
use crate::cache::DiskCache;
use crate::config::Limits;
use crate::error::{ErrorKind, ParseError, ProxyError};
use crate::relay::{self, Resolve, SystemResolver};
use crate::request::{self, Request};
use crate::{FORBIDDEN_RESPONSE, NOT_IMPLEMENTED_RESPONSE, READ_BUFFER_SIZE};

pub struct ProxyContext {
    pub cache: DiskCache,
    pub blacklist: Blacklist,
    pub resolver: Arc<dyn Resolve>,
    pub access_log: Arc<dyn LogSink>,
    pub limits: Limits,
}

impl ProxyContext {
    pub fn new(cache: DiskCache, blacklist: Blacklist) -> Self {
        Self {
            cache,
            blacklist,
            resolver: Arc::new(SystemResolver),
            access_log: Arc::new(TracingSink),
            limits: Limits::default(),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_access_log(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.access_log = sink;
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }
}

/// Serves one client connection to completion.
///
/// The connection is shut down on every path and exactly one access record
/// is emitted, whatever the outcome.
pub async fn handle<S>(stream: S, peer: SocketAddr, ctx: &ProxyContext) -> Outcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let started = Utc::now();
    let (mut rd, mut wr) = tokio::io::split(stream);
    let mut request = None;

    let outcome = match serve(&mut rd, &mut wr, ctx, &mut request).await {
        Ok(outcome) => outcome,
        Err(e) => {
            match e.kind() {
                ErrorKind::Resolve | ErrorKind::Connect => warn!("{}: {}", peer, e),
                _ => debug!("{}: {}", peer, e),
            }
            Outcome::Failed(e.kind())
        }
    };

    if let Err(e) = wr.shutdown().await {
        debug!("Failed to shut down client {}: {}", peer, e);
    }

    let mut record = LogRecord::new(peer, outcome);
    record.timestamp = started;
    if let Some(request) = request {
        record.host = Some(request.host);
        record.method = Some(request.method);
        record.target = Some(request.target);
    }
    ctx.access_log.record(record);
    outcome
}

async fn serve<R, W>(
    rd: &mut R,
    wr: &mut W,
    ctx: &ProxyContext,
    seen: &mut Option<Request>,
) -> Result<Outcome, ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let head = read_head(rd, &ctx.limits).await?;
    let request = &*seen.insert(request::parse(&head)?);
    debug!("{} {}", request.method, request.target);

    if let Some(pattern) = ctx.blacklist.first_match(&request.host) {
        info!("BLOCKED: {} (matches {:?})", request.host, pattern);
        if let Err(e) = wr.write_all(FORBIDDEN_RESPONSE).await {
            debug!("Failed to send 403 response: {}", e);
        }
        return Ok(Outcome::Blocked);
    }

    if request.is_connect() {
        debug!("Tunneling not supported, refusing CONNECT {}", request.target);
        if let Err(e) = wr.write_all(NOT_IMPLEMENTED_RESPONSE).await {
            debug!("Failed to send 501 response: {}", e);
        }
        return Ok(Outcome::Unsupported);
    }

    if request.is_get() {
        if let Some(bytes) = serve_from_cache(&ctx.cache, &request.target, wr).await? {
            info!("CACHE HIT: {} ({} bytes)", request.target, bytes);
            return Ok(Outcome::CacheHit { bytes });
        }
        debug!("CACHE MISS: {}", request.target);
    }

    let relayed = relay::relay(request, rd, wr, ctx.resolver.as_ref(), &ctx.limits).await?;

    let mut cached = false;
    if request.is_get() {
        if relayed.capture.is_empty() {
            debug!("Empty response for {}, not caching", request.target);
        } else if !relayed.complete {
            warn!(
                "Origin stalled before the end of {} ({} bytes), not caching",
                request.target, relayed.bytes
            );
        } else {
            if relayed.truncated {
                debug!(
                    "Response for {} exceeds {} bytes, caching a prefix",
                    request.target, ctx.limits.capture_limit
                );
            }
            match ctx.cache.put(&request.target, &relayed.capture).await {
                Ok(()) => {
                    info!("CACHED: {} ({} bytes)", request.target, relayed.capture.len());
                    cached = true;
                }
                Err(e) => warn!("Failed to cache {}: {}", request.target, e),
            }
        }
    }

    Ok(Outcome::Relayed {
        bytes: relayed.bytes,
        cached,
    })
}

async fn read_head<R>(rd: &mut R, limits: &Limits) -> Result<BytesMut, ProxyError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        match timeout(limits.idle_timeout, rd.read_buf(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(_)) => {
                if buf.len() > limits.read_limit {
                    return Err(ParseError::Oversized {
                        field: "request",
                        limit: limits.read_limit,
                    }
                    .into());
                }
                if request::has_complete_head(&buf) {
                    break;
                }
            }
            Ok(Err(e)) => return Err(ProxyError::Read(e)),
            Err(_) => {
                return Err(ProxyError::Read(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "client sent no complete request",
                )))
            }
        }
    }
    if buf.is_empty() {
        return Err(ProxyError::EmptyRequest);
    }
    Ok(buf)
}

// Ok(None) is a miss.
async fn serve_from_cache<W>(
    cache: &DiskCache,
    url: &str,
    wr: &mut W,
) -> Result<Option<u64>, ProxyError>
where
    W: AsyncWrite + Unpin,
{
    let mut file = match cache.open_entry(url).await {
        Ok(Some(file)) => file,
        Ok(None) => return Ok(None),
        Err(e) => {
            warn!("Cannot open cache entry for {}: {}, treating as miss", url, e);
            return Ok(None);
        }
    };

    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let mut total = 0u64;
    loop {
        buf.clear();
        let n = file.read_buf(&mut buf).await.map_err(ProxyError::Cache)?;
        if n == 0 {
            break;
        }
        wr.write_all(&buf[..n]).await.map_err(ProxyError::RelayIo)?;
        total += n as u64;
    }
    wr.flush().await.map_err(ProxyError::RelayIo)?;
    Ok(Some(total))
}
