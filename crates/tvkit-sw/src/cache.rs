//! Cache generations and their entries.

use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use tvkit_net::{Request, Response, Url};

use crate::config::StorageConfig;
use crate::ServiceWorkerError;

/// Cache storage shared between the host and its workers.
pub type SharedCacheStorage = Arc<RwLock<CacheStorage>>;

// ==================== Keys & Entries ====================

/// Request identity: method plus URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(method: &Method, url: &Url) -> Self {
        Self(format!("{} {}", method, url))
    }

    pub fn for_request(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored response snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers, in arrival order.
    pub headers: Vec<(String, String)>,

    /// Response body.
    pub body: Vec<u8>,

    /// Stored at (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response for `request`.
    pub fn from_response(request: &Request, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            url: request.url.to_string(),
            method: request.method.to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body.to_vec(),
            cached_at: now_millis(),
        }
    }

    /// Key this entry is stored under.
    pub fn key(&self) -> CacheKey {
        CacheKey(format!("{} {}", self.method, self.url))
    }

    /// Rebuild a response from the snapshot.
    pub fn to_response(&self) -> Result<Response, ServiceWorkerError> {
        let url = Url::parse(&self.url)
            .map_err(|e| ServiceWorkerError::CacheError(format!("bad cached url: {e}")))?;
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| ServiceWorkerError::CacheError(format!("bad cached status: {e}")))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.append(n, v);
            }
        }

        Ok(Response {
            url,
            status,
            headers,
            body: Bytes::from(self.body.clone()),
        })
    }

    fn size(&self) -> usize {
        self.body.len()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ==================== Cache ====================

/// One generation of the cache store.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Cache {
    /// Cache name (the version tag).
    pub name: String,

    entries: HashMap<CacheKey, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request key.
    pub fn match_key(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Match a GET for `url`.
    pub fn match_url(&self, url: &str) -> Option<&CacheEntry> {
        Url::parse(url)
            .ok()
            .and_then(|u| self.match_key(&CacheKey::new(&Method::GET, &u)))
    }

    fn put(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        self.entries.insert(entry.key(), entry)
    }

    /// Delete entry.
    pub fn delete(&mut self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<&CacheKey> {
        let mut keys: Vec<_> = self.entries.keys().collect();
        keys.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        keys
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn size(&self) -> usize {
        self.entries.values().map(CacheEntry::size).sum()
    }
}

// ==================== Cache Storage ====================

/// Every cache generation of one origin.
///
/// Each mutation replaces whole entries under one `&mut` borrow, so readers
/// never see half-written entries. With a persistence directory, the touched
/// generation is rewritten to disk before the mutation returns.
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
    persist_dir: Option<PathBuf>,
    quota_bytes: Option<usize>,
}

impl CacheStorage {
    /// Create in-memory cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the summed body size of all entries.
    pub fn with_quota(mut self, quota_bytes: usize) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    /// Build storage from config, restoring persisted generations.
    pub async fn from_config(config: &StorageConfig) -> Result<Self, ServiceWorkerError> {
        let mut storage = match config.persist_dir {
            Some(ref dir) => Self::open_persistent(dir).await?,
            None => Self::new(),
        };
        storage.quota_bytes = config.quota_bytes;
        Ok(storage)
    }

    /// Open storage mirrored to `dir`, loading any generations found there.
    ///
    /// Unreadable generation files are skipped with a warning.
    pub async fn open_persistent(dir: impl AsRef<Path>) -> Result<Self, ServiceWorkerError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let mut caches = HashMap::new();
        let mut listing = tokio::fs::read_dir(&dir).await?;
        while let Some(file) = listing.next_entry().await? {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let loaded = tokio::fs::read(&path)
                .await
                .map_err(ServiceWorkerError::from)
                .and_then(|raw| serde_json::from_slice::<Cache>(&raw).map_err(Into::into));
            match loaded {
                Ok(cache) => {
                    debug!(name = %cache.name, entries = cache.len(), "Restored cache generation");
                    caches.insert(cache.name.clone(), cache);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable cache file"),
            }
        }

        info!(dir = %dir.display(), generations = caches.len(), "Cache storage opened");

        Ok(Self {
            caches,
            persist_dir: Some(dir),
            quota_bytes: None,
        })
    }

    /// Open a cache (creates if doesn't exist).
    pub fn open(&mut self, name: &str) -> &mut Cache {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Get a cache without creating it.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Check if cache exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// All cache names, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut names: Vec<_> = self.caches.keys().cloned().collect();
        names.sort();
        names
    }

    /// Summed body size of every entry in every generation.
    pub fn total_bytes(&self) -> usize {
        self.caches.values().map(Cache::size).sum()
    }

    /// Store one entry in `name`, creating the generation if needed.
    pub async fn put(&mut self, name: &str, entry: CacheEntry) -> Result<(), ServiceWorkerError> {
        self.put_all(name, vec![entry]).await
    }

    /// Store one entry only if generation `name` already exists.
    ///
    /// Returns `false` when the generation is gone (already purged).
    pub async fn put_existing(
        &mut self,
        name: &str,
        entry: CacheEntry,
    ) -> Result<bool, ServiceWorkerError> {
        if !self.has(name) {
            return Ok(false);
        }
        self.put(name, entry).await?;
        Ok(true)
    }

    /// Store a batch in `name`. Either every entry lands or none does.
    pub async fn put_all(
        &mut self,
        name: &str,
        entries: Vec<CacheEntry>,
    ) -> Result<(), ServiceWorkerError> {
        self.check_quota(name, &entries)?;

        // Staged copy; readers see it only once it is on disk
        let mut staged = self
            .caches
            .get(name)
            .cloned()
            .unwrap_or_else(|| Cache::new(name));
        for entry in entries {
            staged.put(entry);
        }

        self.persist(&staged).await?;
        self.caches.insert(name.to_string(), staged);
        Ok(())
    }

    fn check_quota(&self, name: &str, entries: &[CacheEntry]) -> Result<(), ServiceWorkerError> {
        let Some(quota) = self.quota_bytes else {
            return Ok(());
        };

        // Overwritten entries free their old bytes
        let existing = self.caches.get(name);
        let mut freed = 0;
        let mut added = 0;
        let mut seen = hashbrown::HashSet::new();
        for entry in entries {
            let key = entry.key();
            if seen.insert(key.clone()) {
                freed += existing
                    .and_then(|c| c.match_key(&key))
                    .map_or(0, CacheEntry::size);
            }
            added += entry.size();
        }

        let used = self.total_bytes().saturating_sub(freed);
        let available = quota.saturating_sub(used);
        if added > available {
            return Err(ServiceWorkerError::QuotaExceeded {
                needed: added,
                available,
            });
        }
        Ok(())
    }

    /// Delete a cache generation.
    ///
    /// With persistence the file goes first; if that fails the generation
    /// stays listed so a later purge can retry it.
    pub async fn delete(&mut self, name: &str) -> Result<bool, ServiceWorkerError> {
        if !self.has(name) {
            return Ok(false);
        }

        if let Some(path) = self.file_for(name) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.caches.remove(name);
        Ok(true)
    }

    /// Most recently stored entry for `key` across all generations.
    pub fn match_request(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.caches
            .values()
            .filter_map(|cache| cache.match_key(key))
            .max_by_key(|entry| entry.cached_at)
    }

    fn file_for(&self, name: &str) -> Option<PathBuf> {
        self.persist_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", urlencoding::encode(name))))
    }

    async fn persist(&self, cache: &Cache) -> Result<(), ServiceWorkerError> {
        let Some(path) = self.file_for(&cache.name) else {
            return Ok(());
        };

        let json = serde_json::to_vec(cache)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(url: &str) -> Request {
        Request::parse_get(url).unwrap()
    }

    fn entry(url: &str, body: &str) -> CacheEntry {
        let request = get(url);
        let response = Response::new(request.url.clone(), StatusCode::OK, body.to_string())
            .with_header(
                HeaderName::from_static("content-type"),
                HeaderValue::from_static("text/plain"),
            );
        CacheEntry::from_response(&request, &response)
    }

    #[test]
    fn test_cache_key_includes_method() {
        let url = Url::parse("https://tv.example/").unwrap();
        assert_ne!(CacheKey::new(&Method::GET, &url), CacheKey::new(&Method::HEAD, &url));
        assert_eq!(CacheKey::new(&Method::GET, &url).as_str(), "GET https://tv.example/");
    }

    #[test]
    fn test_entry_round_trips_to_response() {
        let entry = entry("https://tv.example/manifest.json", "{}");
        let response = entry.to_response().unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.header("content-type"), Some("text/plain"));
        assert_eq!(&response.body[..], b"{}");
    }

    #[tokio::test]
    async fn test_cache_put_and_match() {
        let mut storage = CacheStorage::new();
        storage
            .put("v1", entry("https://tv.example/style.css", "body{}"))
            .await
            .unwrap();

        let cache = storage.get("v1").unwrap();
        assert!(cache.match_url("https://tv.example/style.css").is_some());
        assert!(cache.match_url("https://tv.example/other.css").is_none());
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let mut storage = CacheStorage::new();
        storage.put("v1", entry("https://tv.example/", "old")).await.unwrap();
        storage.put("v1", entry("https://tv.example/", "new")).await.unwrap();

        let cache = storage.get("v1").unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.match_url("https://tv.example/").unwrap().body, b"new");
    }

    #[tokio::test]
    async fn test_match_request_prefers_most_recent() {
        let mut storage = CacheStorage::new();
        let mut older = entry("https://tv.example/", "older");
        older.cached_at = 1;
        let mut newer = entry("https://tv.example/", "newer");
        newer.cached_at = 2;

        storage.put("v1", newer).await.unwrap();
        storage.put("v0", older).await.unwrap();

        let key = CacheKey::for_request(&get("https://tv.example/"));
        assert_eq!(storage.match_request(&key).unwrap().body, b"newer");
    }

    #[tokio::test]
    async fn test_put_existing_skips_missing_generation() {
        let mut storage = CacheStorage::new();
        let stored = storage
            .put_existing("gone", entry("https://tv.example/", "x"))
            .await
            .unwrap();
        assert!(!stored);
        assert!(!storage.has("gone"));
    }

    #[tokio::test]
    async fn test_delete_generation() {
        let mut storage = CacheStorage::new();
        storage.open("v1");
        assert!(storage.has("v1"));

        assert!(storage.delete("v1").await.unwrap());
        assert!(!storage.has("v1"));
        assert!(!storage.delete("v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_quota_rejects_whole_batch() {
        let mut storage = CacheStorage::new().with_quota(8);
        let batch = vec![
            entry("https://tv.example/a", "1234"),
            entry("https://tv.example/b", "12345"),
        ];

        let err = storage.put_all("v1", batch).await.unwrap_err();
        assert!(matches!(err, ServiceWorkerError::QuotaExceeded { needed: 9, available: 8 }));
        assert!(!storage.has("v1"));
    }

    #[tokio::test]
    async fn test_quota_counts_overwrites_once() {
        let mut storage = CacheStorage::new().with_quota(8);
        storage.put("v1", entry("https://tv.example/a", "123456")).await.unwrap();

        // Replacing the 6-byte body with 8 bytes fits
        storage.put("v1", entry("https://tv.example/a", "12345678")).await.unwrap();
        assert_eq!(storage.total_bytes(), 8);

        assert!(storage.put("v1", entry("https://tv.example/b", "1")).await.is_err());
    }

    #[tokio::test]
    async fn test_persistent_storage_restores_generations() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut storage = CacheStorage::open_persistent(dir.path()).await.unwrap();
            storage
                .put("tvkit/v1", entry("https://tv.example/", "<html>"))
                .await
                .unwrap();
        }

        let storage = CacheStorage::open_persistent(dir.path()).await.unwrap();
        assert_eq!(storage.keys(), vec!["tvkit/v1".to_string()]);
        let cache = storage.get("tvkit/v1").unwrap();
        assert_eq!(cache.match_url("https://tv.example/").unwrap().body, b"<html>");
    }

    #[tokio::test]
    async fn test_persistent_delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = CacheStorage::open_persistent(dir.path()).await.unwrap();
        storage.put("v1", entry("https://tv.example/", "x")).await.unwrap();
        assert!(dir.path().join("v1.json").exists());

        assert!(storage.delete("v1").await.unwrap());
        assert!(!dir.path().join("v1.json").exists());
    }

    #[tokio::test]
    async fn test_failed_file_delete_keeps_generation() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = CacheStorage::open_persistent(dir.path()).await.unwrap();
        storage.put("v1", entry("https://tv.example/", "x")).await.unwrap();

        // A directory where the file should be makes remove_file fail
        let path = dir.path().join("v1.json");
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        assert!(storage.delete("v1").await.is_err());
        assert!(storage.has("v1"));
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_generation() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = CacheStorage::open_persistent(dir.path()).await.unwrap();

        // A directory where the staging file goes makes the write fail
        std::fs::create_dir(dir.path().join("v2.json.tmp")).unwrap();

        let seed = vec![
            entry("https://tv.example/", "<html>"),
            entry("https://tv.example/manifest.json", "{}"),
        ];
        assert!(storage.put_all("v2", seed).await.is_err());
        assert!(!storage.has("v2"));
        assert!(storage
            .match_request(&CacheKey::for_request(&get("https://tv.example/")))
            .is_none());
    }

    #[tokio::test]
    async fn test_failed_write_keeps_previous_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = CacheStorage::open_persistent(dir.path()).await.unwrap();
        storage.put("v1", entry("https://tv.example/", "old")).await.unwrap();

        std::fs::create_dir(dir.path().join("v1.json.tmp")).unwrap();
        assert!(storage.put("v1", entry("https://tv.example/", "new")).await.is_err());

        let cache = storage.get("v1").unwrap();
        assert_eq!(cache.match_url("https://tv.example/").unwrap().body, b"old");
    }

    #[tokio::test]
    async fn test_corrupt_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), b"not json").unwrap();

        let storage = CacheStorage::open_persistent(dir.path()).await.unwrap();
        assert!(storage.keys().is_empty());
    }
}
