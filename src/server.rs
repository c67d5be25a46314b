use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::access_log::{LogRecord, Outcome};
use crate::worker::{self, ProxyContext};
use crate::{DRAIN_TIMEOUT, MAX_CONNECTIONS, SERVICE_UNAVAILABLE_RESPONSE};

// Pause after a failed accept; EMFILE would otherwise fail again at once.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Owner of the stop signal. Triggering (or dropping) it stops every
/// [`Server`] holding one of its subscriptions.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    // Also resolves if the owner is dropped.
    pub async fn recv(&mut self) {
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

pub struct Server {
    listener: TcpListener,
    ctx: Arc<ProxyContext>,
    admission: Arc<Semaphore>,
    max_connections: usize,
    drain_timeout: Duration,
}

impl Server {
    pub async fn bind(addr: SocketAddr, ctx: Arc<ProxyContext>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            ctx,
            admission: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
            max_connections: MAX_CONNECTIONS,
            drain_timeout: DRAIN_TIMEOUT,
        })
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.admission = Arc::new(Semaphore::new(max_connections));
        self.max_connections = max_connections;
        self
    }

    /// How long in-flight connections may run after shutdown. Zero aborts
    /// them as soon as the listener is closed.
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` fires, then releases the
    /// listening socket and drains in-flight workers.
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        let Server {
            listener,
            ctx,
            admission,
            max_connections,
            drain_timeout,
        } = self;
        let mut workers = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                () = shutdown.recv() => {
                    info!("Shutdown requested, closing listener");
                    break;
                }
                Some(joined) = workers.join_next(), if !workers.is_empty() => reap(joined),
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        dispatch(stream, peer, &ctx, &admission, max_connections, &mut workers);
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        if backoff(&mut shutdown).await {
                            info!("Shutdown requested, closing listener");
                            break;
                        }
                    }
                },
            }
        }

        drop(listener);
        drain(workers, drain_timeout).await;
        info!("Server stopped");
    }
}

fn dispatch(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: &Arc<ProxyContext>,
    admission: &Arc<Semaphore>,
    max_connections: usize,
    workers: &mut JoinSet<()>,
) {
    let Ok(permit) = admission.clone().try_acquire_owned() else {
        warn!("Connection limit reached ({}), rejecting {}", max_connections, peer);
        if let Err(e) = stream.try_write(SERVICE_UNAVAILABLE_RESPONSE) {
            debug!("Failed to send 503 response: {}", e);
        }
        ctx.access_log.record(LogRecord::new(peer, Outcome::Rejected));
        return;
    };

    debug!(
        "Accepted connection from {} (active: {})",
        peer,
        max_connections - admission.available_permits()
    );
    let ctx = Arc::clone(ctx);
    workers.spawn(async move {
        let _permit = permit;
        worker::handle(stream, peer, &ctx).await;
    });
}

async fn backoff(shutdown: &mut ShutdownSignal) -> bool {
    tokio::select! {
        () = shutdown.recv() => true,
        () = sleep(ACCEPT_BACKOFF) => false,
    }
}

fn reap(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("Connection worker panicked: {}", e);
        }
    }
}

async fn drain(mut workers: JoinSet<()>, drain_timeout: Duration) {
    if workers.is_empty() {
        return;
    }
    if drain_timeout.is_zero() {
        warn!("Aborting {} in-flight connections", workers.len());
        workers.shutdown().await;
        return;
    }

    info!(
        "Waiting up to {:?} for {} in-flight connections",
        drain_timeout,
        workers.len()
    );
    let drained = timeout(drain_timeout, async {
        while let Some(joined) = workers.join_next().await {
            reap(joined);
        }
    })
    .await;
    if drained.is_err() {
        warn!("Drain timed out, aborting {} connections", workers.len());
        workers.shutdown().await;
    }
}
