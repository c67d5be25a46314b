use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::access_log::ACCESS_TARGET;

const DEFAULT_DIRECTIVE: &str = "cacheproxy=info";

/// Installs the global subscriber: diagnostics to stderr, filtered by
/// `RUST_LOG`, plus access records appended to `access_log` when given.
///
/// The returned guard flushes the access log on drop and must be kept alive
/// for the lifetime of the process.
pub fn init(access_log: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

    let (access_layer, guard) = match access_log {
        Some(path) => {
            let (directory, file_name) = split_path(path)?;
            fs::create_dir_all(&directory).with_context(|| {
                format!("Failed to create access log directory {}", directory.display())
            })?;
            let (writer, guard) = tracing_appender::non_blocking(rolling::never(directory, file_name));
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .with_level(false)
                .without_time()
                .with_filter(filter_fn(|meta| meta.target() == ACCESS_TARGET));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_filter(env_filter))
        .with(access_layer)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(guard)
}

fn split_path(path: &Path) -> Result<(PathBuf, &str)> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("Invalid access log file name {}", path.display()))?;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    Ok((dir, file_name))
}
