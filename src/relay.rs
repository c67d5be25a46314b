use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::debug;

use crate::config::Limits;
use crate::error::ProxyError;
use crate::request::Request;
use crate::{MAX_HEADERS, READ_BUFFER_SIZE};

pub type ResolveFuture<'a> = Pin<Box<dyn Future<Output = io::Result<Vec<SocketAddr>>> + Send + 'a>>;

/// Turns an origin host name into socket addresses.
pub trait Resolve: Send + Sync {
    fn resolve<'a>(&'a self, host: &'a str, port: u16) -> ResolveFuture<'a>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl Resolve for SystemResolver {
    fn resolve<'a>(&'a self, host: &'a str, port: u16) -> ResolveFuture<'a> {
        Box::pin(async move { Ok(lookup_host((host, port)).await?.collect()) })
    }
}

/// Bounded prefix of a response kept for the cache.
#[derive(Debug)]
pub struct Capture {
    buf: BytesMut,
    limit: usize,
    truncated: bool,
}

impl Capture {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(limit.min(READ_BUFFER_SIZE)),
            limit,
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit - self.buf.len();
        if chunk.len() > room {
            self.truncated = true;
        }
        self.buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

#[derive(Debug)]
pub struct Relayed {
    /// Bytes forwarded from the origin to the client.
    pub bytes: u64,
    pub capture: Bytes,
    pub truncated: bool,
    /// False when the origin went idle short of the length its head declared.
    pub complete: bool,
}

/// Streams the origin's response to the client while copying any further
/// client bytes upstream. Ends when the origin closes or goes idle.
pub async fn relay<R, W>(
    request: &Request,
    client_rd: &mut R,
    client_wr: &mut W,
    resolver: &dyn Resolve,
    limits: &Limits,
) -> Result<Relayed, ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let addrs = resolver
        .resolve(&request.host, request.port)
        .await
        .map_err(|source| ProxyError::Resolve {
            host: request.host.clone(),
            source,
        })?;
    if addrs.is_empty() {
        return Err(ProxyError::Resolve {
            host: request.host.clone(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
        });
    }

    let origin = connect(&addrs, limits.connect_timeout).await?;
    let (mut origin_rd, mut origin_wr) = origin.into_split();

    origin_wr
        .write_all(&request.raw)
        .await
        .map_err(ProxyError::RelayIo)?;

    let upload = async {
        if let Err(e) = tokio::io::copy(&mut *client_rd, &mut origin_wr).await {
            debug!("Client to origin copy stopped: {}", e);
        }
        std::future::pending::<Infallible>().await
    };
    let download = stream_response(&mut origin_rd, client_wr, limits);

    tokio::select! {
        result = download => result,
        never = upload => match never {},
    }
}

async fn connect(addrs: &[SocketAddr], connect_timeout: Duration) -> Result<TcpStream, ProxyError> {
    let mut last_error = None;
    for addr in addrs {
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                debug!("Connected to origin {}", addr);
                return Ok(stream);
            }
            Ok(Err(e)) => {
                debug!("Connect to {} failed: {}", addr, e);
                last_error = Some(ProxyError::connect(*addr, e));
            }
            Err(_) => {
                debug!("Connect to {} timed out", addr);
                last_error = Some(ProxyError::connect(
                    *addr,
                    io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                ));
            }
        }
    }
    Err(last_error.unwrap_or_else(|| ProxyError::Connect {
        addr: String::new(),
        source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
    }))
}

async fn stream_response<R, W>(
    origin: &mut R,
    client: &mut W,
    limits: &Limits,
) -> Result<Relayed, ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let mut capture = Capture::new(limits.capture_limit);
    let mut bytes = 0u64;
    let mut idle = false;

    loop {
        buf.clear();
        match timeout(limits.idle_timeout, origin.read_buf(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                client
                    .write_all(&buf[..n])
                    .await
                    .map_err(ProxyError::RelayIo)?;
                capture.push(&buf[..n]);
                bytes += n as u64;
            }
            Ok(Err(e)) => return Err(ProxyError::RelayIo(e)),
            Err(_) => {
                debug!("Origin idle for {:?}, ending relay", limits.idle_timeout);
                idle = true;
                break;
            }
        }
    }
    client.flush().await.map_err(ProxyError::RelayIo)?;

    let truncated = capture.is_truncated();
    let capture = capture.into_bytes();
    // A closed origin has said everything it will say.
    let complete = !idle || declared_length_met(&capture, bytes);
    Ok(Relayed {
        bytes,
        capture,
        truncated,
        complete,
    })
}

// `total` rather than the capture length, which may be truncated.
fn declared_length_met(capture: &[u8], total: u64) -> bool {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    let head_len = match response.parse(capture) {
        Ok(httparse::Status::Complete(len)) => len as u64,
        Ok(httparse::Status::Partial) | Err(_) => return false,
    };

    let declared = response
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("content-length"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    match declared {
        Some(length) => total.saturating_sub(head_len) >= length,
        None => true,
    }
}
