#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use cacheproxy::relay::ResolveFuture;
use cacheproxy::request::has_complete_head;
use cacheproxy::{
    Blacklist, DiskCache, Limits, LogRecord, LogSink, ProxyContext, Resolve, Server, Shutdown,
};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Default)]
pub struct RecordingSink(Mutex<Vec<LogRecord>>);

impl RecordingSink {
    pub fn records(&self) -> Vec<LogRecord> {
        self.0.lock().unwrap().clone()
    }

    /// Waits until at least `n` records arrived.
    pub async fn wait_for(&self, n: usize) -> Vec<LogRecord> {
        for _ in 0..200 {
            let records = self.records();
            if records.len() >= n {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {n} access records, got {}", self.records().len());
    }
}

impl LogSink for RecordingSink {
    fn record(&self, record: LogRecord) {
        self.0.lock().unwrap().push(record);
    }
}

/// Sends every host to one local address and counts lookups.
pub struct StaticResolver {
    addr: SocketAddr,
    calls: AtomicUsize,
}

impl StaticResolver {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Resolve for StaticResolver {
    fn resolve<'a>(&'a self, _host: &'a str, _port: u16) -> ResolveFuture<'a> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let addr = self.addr;
        Box::pin(async move { Ok(vec![addr]) })
    }
}

pub struct Origin {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicUsize>,
}

impl Origin {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// An origin that answers the n-th connection with `responses[n % len]`
/// after `delay`, then closes.
pub async fn spawn_origin(responses: Vec<Vec<u8>>, delay: Duration) -> Origin {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let response = responses[n % responses.len()].clone();
            tokio::spawn(async move {
                read_head(&mut stream).await;
                tokio::time::sleep(delay).await;
                let _ = stream.write_all(&response).await;
            });
        }
    });
    Origin { addr, hits }
}

pub async fn read_head(stream: &mut TcpStream) -> BytesMut {
    let mut head = BytesMut::new();
    while !has_complete_head(&head) {
        match stream.read_buf(&mut head).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
    head
}

/// A port nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

pub struct ProxyOptions {
    pub patterns: Vec<&'static str>,
    pub limits: Limits,
    pub max_connections: usize,
    pub drain_timeout: Duration,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            patterns: Vec::new(),
            limits: Limits::default(),
            max_connections: 64,
            drain_timeout: Duration::from_millis(100),
        }
    }
}

pub struct TestProxy {
    pub addr: SocketAddr,
    pub cache: DiskCache,
    pub sink: Arc<RecordingSink>,
    pub resolver: Arc<StaticResolver>,
    shutdown: Shutdown,
    handle: JoinHandle<()>,
    _dir: TempDir,
}

impl TestProxy {
    pub async fn start(origin: SocketAddr, options: ProxyOptions) -> Self {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::open(dir.path().join("cache")).await.unwrap();
        let sink = Arc::new(RecordingSink::default());
        let resolver = Arc::new(StaticResolver::new(origin));

        let ctx = ProxyContext::new(cache.clone(), Blacklist::from_patterns(options.patterns))
            .with_resolver(resolver.clone())
            .with_access_log(sink.clone())
            .with_limits(options.limits);
        let server = Server::bind("127.0.0.1:0".parse().unwrap(), Arc::new(ctx))
            .await
            .unwrap()
            .with_max_connections(options.max_connections)
            .with_drain_timeout(options.drain_timeout);
        let addr = server.local_addr().unwrap();

        let shutdown = Shutdown::new();
        let handle = tokio::spawn(server.run(shutdown.subscribe()));

        Self {
            addr,
            cache,
            sink,
            resolver,
            shutdown,
            handle,
            _dir: dir,
        }
    }

    pub fn trigger_shutdown(&self) {
        self.shutdown.trigger();
    }

    pub async fn stop(self) {
        self.shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("server did not stop")
            .unwrap();
    }

    pub async fn wait_stopped(&mut self) {
        tokio::time::timeout(Duration::from_secs(5), &mut self.handle)
            .await
            .expect("server did not stop")
            .unwrap();
    }
}

pub fn get_request(url: &str, host: &str) -> Vec<u8> {
    format!("GET {url} HTTP/1.1\r\nHost: {host}\r\nUser-Agent: test\r\n\r\n").into_bytes()
}

/// Sends `request` through the proxy and returns everything sent back.
pub async fn send(proxy: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("proxy did not close the connection")
        .unwrap();
    response
}
