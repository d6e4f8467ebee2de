//! Durable fallback store.
//!
//! A key/value layer that survives restarts. Each value is wrapped in an
//! envelope carrying its write time; reads past the configured TTL behave as
//! misses. The store never surfaces backend failures: a full, disabled or
//! throwing backend simply yields misses and dropped writes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::config::DurableConfig;
use super::keys::{ResourceKey, ResourcePrefix};
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::durable";
const FILE_EXTENSION: &str = "json";

const METRIC_HIT: &str = "paddock_durable_hit_total";
const METRIC_MISS: &str = "paddock_durable_miss_total";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage quota exceeded ({used} of {quota} bytes)")]
    QuotaExceeded { used: usize, quota: usize },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Raw string storage underneath the durable store and the query snapshot.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<String>, BackendError>;
    async fn write(&self, key: &str, value: &str) -> Result<(), BackendError>;
    async fn remove(&self, key: &str) -> Result<(), BackendError>;
    async fn keys(&self) -> Result<Vec<String>, BackendError>;
}

/// One JSON file per key under a directory.
///
/// File names are the SHA-256 digest of the key, so arbitrarily long search
/// strings stay within filesystem name limits. Each file carries its original
/// key next to the value.
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
    staging_sequence: Arc<AtomicU64>,
}

#[derive(Serialize, Deserialize)]
struct StoredFile {
    key: String,
    value: String,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            staging_sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_stem(key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hex::encode(hasher.finalize().to_vec())
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root
            .join(format!("{}.{FILE_EXTENSION}", Self::file_stem(key)))
    }

    /// Unique per write so concurrent writers of one key never share a
    /// staging file.
    fn staging_path_for(&self, key: &str) -> PathBuf {
        let sequence = self.staging_sequence.fetch_add(1, Ordering::Relaxed);
        self.root.join(format!(
            "{}.{}-{sequence}.tmp",
            Self::file_stem(key),
            std::process::id()
        ))
    }

    async fn read_file(path: &Path) -> Result<Option<StoredFile>, BackendError> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_str(&contents) {
            Ok(stored) => Ok(Some(stored)),
            Err(err) => {
                debug!(path = %path.display(), error = %err, "Ignoring unreadable durable file");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl KeyValueBackend for FileBackend {
    async fn read(&self, key: &str) -> Result<Option<String>, BackendError> {
        Ok(Self::read_file(&self.path_for(key))
            .await?
            .filter(|stored| stored.key == key)
            .map(|stored| stored.value))
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), BackendError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let stored = StoredFile {
            key: key.to_string(),
            value: value.to_string(),
        };
        let contents = serde_json::to_string(&stored)
            .map_err(|err| BackendError::Unavailable(err.to_string()))?;
        let staging = self.staging_path_for(key);
        if let Err(err) = tokio::fs::write(&staging, contents).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(err.into());
        }
        if let Err(err) = tokio::fs::rename(&staging, self.path_for(key)).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), BackendError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, BackendError> {
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut keys = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }
            if let Some(stored) = Self::read_file(&path).await? {
                keys.push(stored.key);
            }
        }
        Ok(keys)
    }
}

/// Process-local backend with an optional byte quota.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, String>>,
    quota: Option<usize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes that would push total stored bytes past `quota`.
    pub fn with_quota(quota: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            quota: Some(quota),
        }
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "memory.len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    async fn read(&self, key: &str) -> Result<Option<String>, BackendError> {
        Ok(rw_read(&self.entries, SOURCE, "memory.read").get(key).cloned())
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), BackendError> {
        let mut entries = rw_write(&self.entries, SOURCE, "memory.write");
        if let Some(quota) = self.quota {
            let used: usize = entries
                .iter()
                .filter(|(existing, _)| existing.as_str() != key)
                .map(|(existing, stored)| existing.len() + stored.len())
                .sum::<usize>()
                + key.len()
                + value.len();
            if used > quota {
                return Err(BackendError::QuotaExceeded { used, quota });
            }
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), BackendError> {
        rw_write(&self.entries, SOURCE, "memory.remove").remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, BackendError> {
        Ok(rw_read(&self.entries, SOURCE, "memory.keys")
            .keys()
            .cloned()
            .collect())
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    data: T,
    /// Unix time of the write, in milliseconds.
    timestamp: i64,
}

pub(crate) fn now_millis() -> i64 {
    i64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

fn age_of(timestamp: i64) -> Duration {
    let elapsed = now_millis().saturating_sub(timestamp).max(0);
    Duration::from_millis(u64::try_from(elapsed).unwrap_or(0))
}

/// Resource-keyed, TTL-governed, failure-swallowing persistence.
#[derive(Clone)]
pub struct DurableStore {
    backend: Arc<dyn KeyValueBackend>,
    config: DurableConfig,
}

impl DurableStore {
    pub fn new(backend: Arc<dyn KeyValueBackend>, config: DurableConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend(&self) -> &Arc<dyn KeyValueBackend> {
        &self.backend
    }

    fn storage_key(&self, key: &ResourceKey) -> String {
        format!("{}{key}", self.config.namespace)
    }

    fn ttl_for(&self, key: &ResourceKey) -> Duration {
        match key {
            ResourceKey::Categories => self.config.categories_ttl,
            _ => self.config.ttl,
        }
    }

    /// Return the stored value if present, decodable and within its TTL.
    pub async fn get<T: DeserializeOwned>(&self, key: &ResourceKey) -> Option<T> {
        let storage_key = self.storage_key(key);
        let raw = match self.backend.read(&storage_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                counter!(METRIC_MISS).increment(1);
                return None;
            }
            Err(err) => {
                warn!(resource = %key, error = %err, "Durable store read failed; treating as miss");
                counter!(METRIC_MISS).increment(1);
                return None;
            }
        };

        let envelope: Envelope<T> = match serde_json::from_str(&raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(resource = %key, error = %err, "Durable entry malformed; discarding");
                self.remove(key).await;
                counter!(METRIC_MISS).increment(1);
                return None;
            }
        };

        let age = age_of(envelope.timestamp);
        if age > self.ttl_for(key) {
            debug!(resource = %key, age_secs = age.as_secs(), "Durable entry expired");
            counter!(METRIC_MISS).increment(1);
            return None;
        }

        counter!(METRIC_HIT).increment(1);
        Some(envelope.data)
    }

    pub async fn set<T: Serialize>(&self, key: &ResourceKey, value: &T) {
        let envelope = Envelope {
            data: value,
            timestamp: now_millis(),
        };
        let raw = match serde_json::to_string(&envelope) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(resource = %key, error = %err, "Durable entry could not be encoded");
                return;
            }
        };
        if let Err(err) = self.backend.write(&self.storage_key(key), &raw).await {
            warn!(resource = %key, error = %err, "Durable store write failed; dropping entry");
        }
    }

    pub async fn remove(&self, key: &ResourceKey) {
        if let Err(err) = self.backend.remove(&self.storage_key(key)).await {
            warn!(resource = %key, error = %err, "Durable store remove failed");
        }
    }

    /// Remove every entry of this store's namespace matching `prefix`.
    ///
    /// Keys of other namespaces sharing the backend are left alone.
    pub async fn clear(&self, prefix: &ResourcePrefix) -> usize {
        let keys = match self.backend.keys().await {
            Ok(keys) => keys,
            Err(err) => {
                warn!(error = %err, "Durable store key listing failed; nothing cleared");
                return 0;
            }
        };

        let mut removed = 0;
        for storage_key in keys {
            let Some(rest) = storage_key.strip_prefix(self.config.namespace.as_str()) else {
                continue;
            };
            let matches = match rest.parse::<ResourceKey>() {
                Ok(key) => key.matches(prefix),
                // Unparseable leftovers of an older layout only go with a full clear.
                Err(_) => matches!(prefix, ResourcePrefix::All),
            };
            if !matches {
                continue;
            }
            match self.backend.remove(&storage_key).await {
                Ok(()) => removed += 1,
                Err(err) => warn!(key = %storage_key, error = %err, "Durable store remove failed"),
            }
        }
        debug!(removed, prefix = ?prefix, "Durable store cleared");
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenBackend;

    #[async_trait]
    impl KeyValueBackend for BrokenBackend {
        async fn read(&self, _key: &str) -> Result<Option<String>, BackendError> {
            Err(BackendError::Unavailable("disabled".into()))
        }
        async fn write(&self, _key: &str, _value: &str) -> Result<(), BackendError> {
            Err(BackendError::Unavailable("disabled".into()))
        }
        async fn remove(&self, _key: &str) -> Result<(), BackendError> {
            Err(BackendError::Unavailable("disabled".into()))
        }
        async fn keys(&self) -> Result<Vec<String>, BackendError> {
            Err(BackendError::Unavailable("disabled".into()))
        }
    }

    fn memory_store() -> (Arc<MemoryBackend>, DurableStore) {
        let backend = Arc::new(MemoryBackend::new());
        let store = DurableStore::new(backend.clone(), DurableConfig::default());
        (backend, store)
    }

    #[tokio::test]
    async fn roundtrip_within_ttl() {
        let (_, store) = memory_store();
        store.set(&ResourceKey::Featured, &vec![1, 2, 3]).await;
        let value: Option<Vec<i32>> = store.get(&ResourceKey::Featured).await;
        assert_eq!(value, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn expired_entries_read_as_misses() {
        let (backend, store) = memory_store();
        let eleven_minutes_ago = now_millis() - 11 * 60 * 1000;
        let raw = format!(r#"{{"data":[1],"timestamp":{eleven_minutes_ago}}}"#);
        backend.write("paddock:posts:all", &raw).await.expect("seed");
        backend
            .write("paddock:categories:all", &raw)
            .await
            .expect("seed");

        let items: Option<Vec<i32>> = store.get(&ResourceKey::Items).await;
        assert_eq!(items, None);

        // Categories keep a longer backup window.
        let categories: Option<Vec<i32>> = store.get(&ResourceKey::Categories).await;
        assert_eq!(categories, Some(vec![1]));
    }

    #[tokio::test]
    async fn malformed_entries_are_discarded() {
        let (backend, store) = memory_store();
        backend
            .write("paddock:posts:all", "{not json")
            .await
            .expect("seed");
        let value: Option<Vec<i32>> = store.get(&ResourceKey::Items).await;
        assert_eq!(value, None);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn broken_backend_never_surfaces_errors() {
        let store = DurableStore::new(Arc::new(BrokenBackend), DurableConfig::default());
        store.set(&ResourceKey::Items, &vec![1]).await;
        let value: Option<Vec<i32>> = store.get(&ResourceKey::Items).await;
        assert_eq!(value, None);
        store.remove(&ResourceKey::Items).await;
        assert_eq!(store.clear(&ResourcePrefix::All).await, 0);
    }

    #[tokio::test]
    async fn full_backend_drops_writes() {
        let backend = Arc::new(MemoryBackend::with_quota(32));
        let store = DurableStore::new(backend.clone(), DurableConfig::default());
        store.set(&ResourceKey::Items, &"x".repeat(64)).await;
        assert!(backend.is_empty());
        let value: Option<String> = store.get(&ResourceKey::Items).await;
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn clear_by_prefix_spares_other_namespaces() {
        let (backend, store) = memory_store();
        store.set(&ResourceKey::Items, &1).await;
        store.set(&ResourceKey::ItemsByCategory("f1".into()), &2).await;
        store.set(&ResourceKey::Categories, &3).await;
        backend
            .write("paddock-query:snapshot", "{}")
            .await
            .expect("seed");

        assert_eq!(store.clear(&ResourcePrefix::AnyCategory).await, 1);
        assert_eq!(store.clear(&ResourcePrefix::All).await, 2);
        assert_eq!(backend.keys().await.expect("keys"), vec!["paddock-query:snapshot"]);
    }

    #[tokio::test]
    async fn file_backend_roundtrip_and_listing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(FileBackend::new(dir.path().join("durable")));
        let store = DurableStore::new(backend.clone(), DurableConfig::default());

        let key = ResourceKey::search("rain at spa");
        store.set(&key, &vec!["a".to_string()]).await;
        let value: Option<Vec<String>> = store.get(&key).await;
        assert_eq!(value, Some(vec!["a".to_string()]));

        let keys = backend.keys().await.expect("keys");
        assert_eq!(keys, vec!["paddock:posts:search:rain at spa".to_string()]);

        store.remove(&key).await;
        assert!(backend.keys().await.expect("keys").is_empty());
    }

    #[tokio::test]
    async fn long_search_keys_fit_in_a_file_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(FileBackend::new(dir.path()));
        let store = DurableStore::new(backend.clone(), DurableConfig::default());

        let query = "verstappen hamilton norris leclerc ".repeat(8);
        assert!(query.len() > 200);
        let key = ResourceKey::search(&query);
        store.set(&key, &vec![7u32]).await;
        assert_eq!(store.get::<Vec<u32>>(&key).await, Some(vec![7]));

        let keys = backend.keys().await.expect("keys");
        assert_eq!(keys, vec![format!("paddock:{key}")]);
    }

    #[tokio::test]
    async fn concurrent_writes_to_one_key_leave_a_complete_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = FileBackend::new(dir.path());

        let writes = (0..16).map(|n| {
            let backend = backend.clone();
            tokio::spawn(async move {
                let value = n.to_string().repeat(4096);
                backend.write("paddock:posts:all", &value).await
            })
        });
        for write in futures::future::join_all(writes).await {
            write.expect("task").expect("write");
        }

        let stored = backend
            .read("paddock:posts:all")
            .await
            .expect("read")
            .expect("present");
        assert!((0..16).any(|n| stored == n.to_string().repeat(4096)));
        let mut names = std::fs::read_dir(dir.path())
            .expect("dir")
            .map(|entry| entry.expect("entry").file_name().into_string().expect("utf8"))
            .collect::<Vec<_>>();
        names.retain(|name| name.ends_with(".tmp"));
        assert!(names.is_empty(), "staging files left behind: {names:?}");
    }
}
