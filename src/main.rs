use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

use cacheproxy::{logging, Blacklist, Config, DiskCache, ProxyContext, Server, Shutdown};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let config = Config::parse();
    let _access_log_guard = logging::init(config.access_log.as_deref())?;

    info!("cacheproxy v{} - forward HTTP cache proxy", env!("CARGO_PKG_VERSION"));
    info!("Cache directory: {}", config.cache_dir.display());
    info!("Max connections: {}", config.max_connections);
    info!("Max cached response: {} KB", config.capture_limit / 1024);

    let cache = DiskCache::open(&config.cache_dir)
        .await
        .with_context(|| format!("Failed to open cache at {}", config.cache_dir.display()))?;
    let blacklist = Blacklist::load(&config.blacklist).await;
    info!(
        "Blacklist: {} patterns from {}",
        blacklist.len(),
        config.blacklist.display()
    );

    let ctx = Arc::new(ProxyContext::new(cache, blacklist).with_limits(config.limits()));
    let server = Server::bind(config.listen, Arc::clone(&ctx))
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?
        .with_max_connections(config.max_connections)
        .with_drain_timeout(config.drain_timeout());

    let shutdown = Shutdown::new();
    let stop = shutdown.subscribe();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating shutdown");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating shutdown");
                    break;
                }
                _ = sighup.recv() => {
                    ctx.blacklist.reload().await;
                }
            }
        }
        shutdown.trigger();
    });

    server.run(stop).await;
    Ok(())
}
