use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use bytes::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_128;

const TEMP_SUFFIX: &str = ".tmp";

/// Lowercase hex digest of a request target; 32 characters wide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn cache_key(url: &str) -> CacheKey {
    CacheKey(format!("{:032x}", xxh3_128(url.as_bytes())))
}

type KeyLock = tokio::sync::Mutex<()>;

#[derive(Clone)]
pub struct DiskCache {
    inner: Arc<Inner>,
}

struct Inner {
    root: PathBuf,
    // Writers to the same key queue up here; entries die with their last holder.
    locks: Mutex<HashMap<CacheKey, Weak<KeyLock>>>,
    next_temp: AtomicU64,
}

impl DiskCache {
    pub async fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        let swept = sweep_temp_files(&root).await?;
        if swept > 0 {
            debug!("Removed {} stale temporary cache files", swept);
        }
        Ok(Self {
            inner: Arc::new(Inner {
                root,
                locks: Mutex::new(HashMap::new()),
                next_temp: AtomicU64::new(0),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.inner.root.join(key.as_str())
    }

    pub async fn get(&self, url: &str) -> io::Result<Option<Bytes>> {
        match fs::read(self.path_for(&cache_key(url))).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn open_entry(&self, url: &str) -> io::Result<Option<fs::File>> {
        match fs::File::open(self.path_for(&cache_key(url))).await {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn contains(&self, url: &str) -> bool {
        fs::try_exists(self.path_for(&cache_key(url)))
            .await
            .unwrap_or(false)
    }

    /// Replaces the entry for `url`. Readers never see a partial write.
    pub async fn put(&self, url: &str, data: &[u8]) -> io::Result<()> {
        let key = cache_key(url);
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        let final_path = self.path_for(&key);
        let temp_path = self.inner.root.join(format!(
            ".{}.{}.{}{}",
            key,
            std::process::id(),
            self.inner.next_temp.fetch_add(1, Ordering::Relaxed),
            TEMP_SUFFIX
        ));

        let result = write_then_rename(&temp_path, &final_path, data).await;
        if result.is_err() {
            if let Err(e) = fs::remove_file(&temp_path).await {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove {}: {}", temp_path.display(), e);
                }
            }
        }
        result
    }

    fn key_lock(&self, key: &CacheKey) -> Arc<KeyLock> {
        let mut locks = self
            .inner
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(lock) = locks.get(key).and_then(Weak::upgrade) {
            return lock;
        }
        locks.retain(|_, lock| lock.strong_count() > 0);
        let lock = Arc::new(KeyLock::new(()));
        locks.insert(key.clone(), Arc::downgrade(&lock));
        lock
    }
}

async fn write_then_rename(temp_path: &Path, final_path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(temp_path).await?;
    file.write_all(data).await?;
    file.flush().await?;
    drop(file);
    fs::rename(temp_path, final_path).await
}

async fn sweep_temp_files(root: &Path) -> io::Result<usize> {
    let mut removed = 0;
    let mut entries = fs::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with('.') && name.ends_with(TEMP_SUFFIX) {
            match fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove stale {}: {}", name, e),
            }
        }
    }
    Ok(removed)
}
