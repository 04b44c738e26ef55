//! Memoization of validation results keyed by the submitted URL.
//!
//! Entries are written once and never mutated or expired. The in-memory map is
//! loaded from a [`CacheStore`] at startup and flushed back after every write.

use crate::validator::ValidationResult;
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};

pub type CacheEntries = HashMap<String, ValidationResult>;

/// Backing medium for the validation cache.
pub trait CacheStore: Send + Sync {
    fn load(&self) -> Result<CacheEntries>;
    fn save(&self, entries: &CacheEntries) -> Result<()>;

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Cache persisted as one JSON object keyed by URL.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "cache.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl CacheStore for JsonFileStore {
    fn load(&self) -> Result<CacheEntries> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!(
                    "Cache file {} not found, starting empty",
                    self.path.display()
                );
                return Ok(CacheEntries::new());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("read cache: {}", self.path.display()))
            }
        };

        let raw: serde_json::Map<String, serde_json::Value> = match serde_json::from_slice(&bytes)
        {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!(
                    "Corrupted cache file {}, resetting cache: {e}",
                    self.path.display()
                );
                return Ok(CacheEntries::new());
            }
        };

        let mut entries = CacheEntries::with_capacity(raw.len());
        for (url, value) in raw {
            match serde_json::from_value::<ValidationResult>(value) {
                Ok(result) if result.confidence_score > 100 => log::warn!(
                    "Skipping cache entry for {url}: score {} out of range",
                    result.confidence_score
                ),
                Ok(mut result) => {
                    result.cached = false;
                    entries.insert(url, result);
                }
                Err(e) => log::warn!("Skipping unreadable cache entry for {url}: {e}"),
            }
        }

        log::info!(
            "Loaded {} cached results from {}",
            entries.len(),
            self.path.display()
        );
        Ok(entries)
    }

    fn save(&self, entries: &CacheEntries) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create cache dir: {}", parent.display()))?;
            }
        }

        let ordered: BTreeMap<&String, &ValidationResult> = entries.iter().collect();
        let json = serde_json::to_string_pretty(&ordered).context("serialize cache")?;

        let temp = self.temp_path();
        std::fs::write(&temp, json)
            .with_context(|| format!("write cache: {}", temp.display()))?;
        std::fs::rename(&temp, &self.path)
            .with_context(|| format!("replace cache: {}", self.path.display()))?;
        Ok(())
    }
}

/// In-memory store, mostly for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<CacheEntries>,
    saves: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: CacheEntries) -> Self {
        Self {
            entries: Mutex::new(entries),
            saves: Mutex::new(0),
        }
    }

    pub fn save_count(&self) -> usize {
        self.saves.lock().map(|n| *n).unwrap_or(0)
    }

    pub fn snapshot(&self) -> CacheEntries {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

impl CacheStore for MemoryStore {
    fn load(&self) -> Result<CacheEntries> {
        Ok(self.snapshot())
    }

    fn save(&self, entries: &CacheEntries) -> Result<()> {
        if let Ok(mut stored) = self.entries.lock() {
            *stored = entries.clone();
        }
        if let Ok(mut saves) = self.saves.lock() {
            *saves += 1;
        }
        Ok(())
    }
}

type KeyLocks = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

/// Exclusive hold on one cache key. The lock table entry is dropped with the
/// last holder.
pub struct KeyGuard<'a> {
    key_locks: &'a KeyLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut locks = self
            .key_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

pub struct ValidationCache {
    entries: RwLock<CacheEntries>,
    store: Arc<dyn CacheStore>,
    writer: AsyncMutex<()>,
    key_locks: KeyLocks,
}

impl ValidationCache {
    /// Load the store. A store that cannot be read yields an empty cache.
    pub fn open(store: Arc<dyn CacheStore>) -> Self {
        let entries = store.load().unwrap_or_else(|e| {
            log::warn!("Could not load validation cache, starting empty: {e:#}");
            CacheEntries::new()
        });

        Self {
            entries: RwLock::new(entries),
            store,
            writer: AsyncMutex::new(()),
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &str) -> Option<ValidationResult> {
        self.entries.read().await.get(key).cloned()
    }

    /// Store `result` under `key` unless an entry already exists, then flush.
    /// Returns false when the key was already present.
    pub async fn put(&self, key: &str, result: ValidationResult) -> bool {
        let _writer = self.writer.lock().await;

        {
            let mut entries = self.entries.write().await;
            if entries.contains_key(key) {
                log::debug!("Cache entry for {key} already present, keeping it");
                return false;
            }
            entries.insert(key.to_string(), ValidationResult { cached: false, ..result });
        }

        self.flush().await;
        true
    }

    /// Drop a single entry. Returns whether it existed.
    pub async fn forget(&self, key: &str) -> bool {
        let _writer = self.writer.lock().await;

        let removed = self.entries.write().await.remove(key).is_some();
        if removed {
            self.flush().await;
        }
        removed
    }

    /// Serialize work on one key. Hold the guard across lookup and compute.
    pub async fn lock_key(&self, key: &str) -> KeyGuard<'_> {
        let lock = {
            let mut locks = self
                .key_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        KeyGuard {
            key_locks: &self.key_locks,
            key: key.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Number of keys currently locked or waited on.
    pub fn locked_keys(&self) -> usize {
        self.key_locks
            .lock()
            .map(|locks| locks.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Final flush and store shutdown.
    pub async fn close(&self) -> Result<()> {
        let _writer = self.writer.lock().await;
        self.save_snapshot().await?;
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.close()).await?
    }

    /// Caller holds the writer lock.
    async fn flush(&self) {
        if let Err(e) = self.save_snapshot().await {
            log::error!("Failed to persist validation cache: {e:#}");
        }
    }

    async fn save_snapshot(&self) -> Result<()> {
        let snapshot = self.entries.read().await.clone();
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.save(&snapshot))
            .await
            .context("cache writer task failed")?
    }
}
