use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::fs;
use tracing::{info, warn};

pub struct Blacklist {
    source: Option<PathBuf>,
    patterns: ArcSwap<Vec<String>>,
}

impl Blacklist {
    /// A blacklist that blocks nothing and has no source to reload from.
    pub fn empty() -> Self {
        Self::from_patterns(Vec::<String>::new())
    }

    pub fn from_patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns = patterns
            .into_iter()
            .map(Into::into)
            .filter(|p: &String| !p.is_empty())
            .collect();
        Self {
            source: None,
            patterns: ArcSwap::from_pointee(patterns),
        }
    }

    /// Loads patterns from `path`. A missing or unreadable file yields an
    /// empty list: an unavailable source is not a reason to block traffic.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let patterns = read_patterns(&path).await;
        Self {
            source: Some(path),
            patterns: ArcSwap::from_pointee(patterns),
        }
    }

    /// Re-reads the source file and returns the number of active patterns.
    pub async fn reload(&self) -> usize {
        let Some(path) = &self.source else {
            return self.len();
        };
        let patterns = read_patterns(path).await;
        let count = patterns.len();
        self.patterns.store(Arc::new(patterns));
        info!("Blacklist reloaded from {} ({} patterns)", path.display(), count);
        count
    }

    pub fn is_blocked(&self, host: &str) -> bool {
        self.first_match(host).is_some()
    }

    /// The first pattern, in file order, that occurs in `host`.
    pub fn first_match(&self, host: &str) -> Option<String> {
        self.patterns
            .load()
            .iter()
            .find(|pattern| host.contains(pattern.as_str()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.patterns.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}

impl Default for Blacklist {
    fn default() -> Self {
        Self::empty()
    }
}

async fn read_patterns(path: &Path) -> Vec<String> {
    match fs::read_to_string(path).await {
        Ok(contents) => parse_patterns(&contents),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!("No blacklist at {}, nothing will be blocked", path.display());
            Vec::new()
        }
        Err(e) => {
            warn!("Cannot read blacklist {}: {}", path.display(), e);
            Vec::new()
        }
    }
}

fn parse_patterns(contents: &str) -> Vec<String> {
    contents
        .split('\n')
        .map(|line| line.trim_end_matches(['\r', '\n']))
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
