//! File-based bucket storage with an in-memory index
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/<sha256(bucket name)>/index.json
//! <root>/<sha256(bucket name)>/<sha256(METHOD url)>-<attempt>
//! ```
//!
//! Bodies for a `put_all` call are written to a staging directory first and
//! only moved into the bucket once every write has succeeded. The index is
//! replaced last, so an interrupted attempt never becomes visible.

use crate::error::{AgentError, Result};
use crate::storage::CacheStorage;
use crate::types::{CacheStats, RequestKey, StoredResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const INDEX_FILE: &str = "index.json";
const STAGING_PREFIX: &str = ".staging-";

/// Metadata for one stored response
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    key: RequestKey,
    response: StoredResponse,
    file: String,
    size: u64,
    stored_at: DateTime<Utc>,
}

/// Persisted index of one bucket
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BucketIndex {
    name: String,
    created_at: DateTime<Utc>,
    entries: Vec<IndexEntry>,
}

/// Bucket storage persisted under a directory
pub struct FileStorage {
    /// In-memory copy of every bucket index, oldest bucket first
    buckets: Arc<RwLock<Vec<BucketIndex>>>,
    /// Directory holding one subdirectory per bucket
    root: PathBuf,
    /// Distinguishes staging directories of concurrent writers
    staging_seq: AtomicU64,
}

impl FileStorage {
    pub fn new(root: PathBuf) -> Self {
        Self {
            buckets: Arc::new(RwLock::new(Vec::new())),
            root,
            staging_seq: AtomicU64::new(0),
        }
    }

    /// Create the root directory and load buckets left by a previous process
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;

        let mut loaded = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(item) = dir.next_entry().await? {
            if !item.file_type().await?.is_dir() {
                continue;
            }
            let path = item.path();
            if is_staging(&path) {
                // Left over from an interrupted write
                let _ = fs::remove_dir_all(&path).await;
                continue;
            }
            match read_index(&path.join(INDEX_FILE)).await {
                Ok(index) => loaded.push(index),
                Err(e) => warn!(path = ?path, error = %e, "Skipping unreadable bucket"),
            }
        }
        loaded.sort_by_key(|b| b.created_at);

        info!(root = ?self.root, buckets = loaded.len(), "Cache storage initialized");
        *self.buckets.write().await = loaded;
        Ok(())
    }

    /// Hex SHA-256 of a string, used for directory and file names
    pub fn hash_name(value: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(value.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn bucket_dir(&self, name: &str) -> PathBuf {
        self.root.join(Self::hash_name(name))
    }

    /// Body file name for `key` written by one `put_all` attempt.
    ///
    /// Every attempt uses fresh names so live bodies are never overwritten.
    fn entry_file(key: &RequestKey, attempt: &str) -> String {
        format!("{}-{}", Self::hash_name(&key.to_string()), attempt)
    }

    async fn write_index(&self, index: &BucketIndex) -> Result<()> {
        let dir = self.bucket_dir(&index.name);
        let tmp = dir.join(format!("{}.tmp", INDEX_FILE));
        fs::write(&tmp, serde_json::to_vec(index)?).await?;
        fs::rename(&tmp, dir.join(INDEX_FILE)).await?;
        Ok(())
    }

    /// Write every body into a fresh staging directory
    async fn stage(
        &self,
        staging: &Path,
        attempt: &str,
        entries: &[(RequestKey, StoredResponse)],
    ) -> Result<Vec<IndexEntry>> {
        fs::create_dir_all(staging).await?;

        let mut staged = Vec::with_capacity(entries.len());
        for (key, response) in entries {
            let file = Self::entry_file(key, attempt);
            fs::write(staging.join(&file), &response.body).await?;

            let mut metadata = response.clone();
            metadata.body = Vec::new();
            staged.push(IndexEntry {
                key: key.clone(),
                response: metadata,
                file,
                size: response.body.len() as u64,
                stored_at: Utc::now(),
            });
        }
        Ok(staged)
    }

    /// Move staged bodies into the bucket and swap in the new index.
    ///
    /// Bodies replaced by this attempt are removed only after the index is
    /// written. On failure the moved bodies are removed again and the old
    /// index stays in force.
    async fn commit(
        &self,
        buckets: &mut Vec<BucketIndex>,
        name: &str,
        staging: &Path,
        staged: Vec<IndexEntry>,
    ) -> Result<()> {
        let dir = self.bucket_dir(name);

        let mut moved = Vec::with_capacity(staged.len());
        for entry in &staged {
            let target = dir.join(&entry.file);
            if let Err(e) = fs::rename(staging.join(&entry.file), &target).await {
                remove_files(&moved).await;
                return Err(e.into());
            }
            moved.push(target);
        }

        let mut index = buckets
            .iter()
            .find(|b| b.name == name)
            .cloned()
            .unwrap_or_else(|| new_index(name));
        let mut superseded = Vec::new();
        for entry in staged {
            match index.entries.iter_mut().find(|e| e.key == entry.key) {
                Some(slot) => {
                    superseded.push(dir.join(&slot.file));
                    *slot = entry;
                }
                None => index.entries.push(entry),
            }
        }

        if let Err(e) = self.write_index(&index).await {
            remove_files(&moved).await;
            return Err(e);
        }
        remove_files(&superseded).await;

        match buckets.iter_mut().find(|b| b.name == name) {
            Some(slot) => *slot = index,
            None => buckets.push(index),
        }
        Ok(())
    }
}

impl CacheStorage for FileStorage {
    async fn open(&self, name: &str) -> Result<()> {
        let mut buckets = self.buckets.write().await;
        if buckets.iter().any(|b| b.name == name) {
            return Ok(());
        }

        fs::create_dir_all(self.bucket_dir(name)).await?;
        let index = new_index(name);
        self.write_index(&index).await?;
        buckets.push(index);

        debug!(cache = %name, "Created bucket");
        Ok(())
    }

    async fn put_all(&self, name: &str, entries: Vec<(RequestKey, StoredResponse)>) -> Result<()> {
        let mut buckets = self.buckets.write().await;
        fs::create_dir_all(self.bucket_dir(name)).await?;

        let seq = self.staging_seq.fetch_add(1, Ordering::Relaxed);
        let staging = self
            .root
            .join(format!("{}{}-{}", STAGING_PREFIX, Self::hash_name(name), seq));
        let attempt = format!(
            "{}-{}",
            Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            seq
        );

        let result = match self.stage(&staging, &attempt, &entries).await {
            Ok(staged) => self.commit(&mut buckets, name, &staging, staged).await,
            Err(e) => Err(e),
        };
        let _ = fs::remove_dir_all(&staging).await;

        match &result {
            Ok(()) => debug!(cache = %name, count = entries.len(), "Stored entries"),
            Err(e) => warn!(cache = %name, error = %e, "Failed to store entries"),
        }
        result
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let buckets = self.buckets.read().await;
        Ok(buckets.iter().map(|b| b.name.clone()).collect())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let mut buckets = self.buckets.write().await;
        let Some(position) = buckets.iter().position(|b| b.name == name) else {
            return Ok(false);
        };

        let dir = self.bucket_dir(name);
        fs::remove_dir_all(&dir)
            .await
            .map_err(|e| AgentError::Storage(format!("failed to delete bucket {}: {}", name, e)))?;
        buckets.remove(position);

        debug!(cache = %name, "Deleted bucket");
        Ok(true)
    }

    async fn match_request(&self, name: &str, key: &RequestKey) -> Result<Option<StoredResponse>> {
        let entry = {
            let buckets = self.buckets.read().await;
            buckets
                .iter()
                .find(|b| b.name == name)
                .and_then(|b| b.entries.iter().find(|e| e.key == *key))
                .cloned()
        };

        let Some(entry) = entry else {
            return Ok(None);
        };

        let body = fs::read(self.bucket_dir(name).join(&entry.file))
            .await
            .map_err(|e| {
                warn!(cache = %name, key = %key, error = %e, "Failed to read cached body");
                AgentError::from(e)
            })?;

        let mut response = entry.response;
        response.body = body;
        Ok(Some(response))
    }

    async fn entries(&self, name: &str) -> Result<Vec<RequestKey>> {
        let buckets = self.buckets.read().await;
        Ok(buckets
            .iter()
            .find(|b| b.name == name)
            .map(|b| b.entries.iter().map(|e| e.key.clone()).collect())
            .unwrap_or_default())
    }

    async fn stats(&self) -> Result<CacheStats> {
        let buckets = self.buckets.read().await;
        Ok(CacheStats {
            buckets: buckets.len(),
            entries: buckets.iter().map(|b| b.entries.len()).sum(),
            total_size: buckets
                .iter()
                .flat_map(|b| b.entries.iter())
                .map(|e| e.size)
                .sum(),
        })
    }
}

fn new_index(name: &str) -> BucketIndex {
    BucketIndex {
        name: name.to_string(),
        created_at: Utc::now(),
        entries: Vec::new(),
    }
}

fn is_staging(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(STAGING_PREFIX))
        .unwrap_or(false)
}

async fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = fs::remove_file(path).await {
            warn!(path = ?path, error = %e, "Failed to remove body file");
        }
    }
}

async fn read_index(path: &Path) -> Result<BucketIndex> {
    let data = fs::read(path).await?;
    Ok(serde_json::from_slice(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(url: &str, body: &str) -> (RequestKey, StoredResponse) {
        (
            RequestKey::get(url),
            StoredResponse::new(url, 200, body).with_header("content-type", "text/plain"),
        )
    }

    async fn storage(root: &Path) -> FileStorage {
        let storage = FileStorage::new(root.to_path_buf());
        storage.init().await.unwrap();
        storage
    }

    async fn storage_at(root: &Path) -> FileStorage {
        storage(root).await
    }

    /// Body files in a bucket directory, index files excluded
    fn body_files(bucket_dir: &Path) -> Vec<String> {
        std::fs::read_dir(bucket_dir)
            .unwrap()
            .map(|item| item.unwrap())
            .filter(|item| item.file_type().unwrap().is_file())
            .map(|item| item.file_name().to_string_lossy().into_owned())
            .filter(|name| !name.starts_with(INDEX_FILE))
            .collect()
    }

    #[test]
    fn test_hash_name() {
        let a = FileStorage::hash_name("busetas-cr-cache-v1");
        let b = FileStorage::hash_name("busetas-cr-cache-v1");
        let c = FileStorage::hash_name("busetas-cr-cache-v2");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_put_all_and_match() {
        let dir = tempdir().unwrap();
        let storage = storage(dir.path()).await;

        storage.open("cache-v1").await.unwrap();
        storage
            .put_all("cache-v1", vec![entry("http://localhost/", "Hello, world!")])
            .await
            .unwrap();

        let hit = storage
            .match_request("cache-v1", &RequestKey::get("http://localhost/"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.body, b"Hello, world!");
        assert_eq!(hit.status, 200);
        assert_eq!(hit.header("Content-Type"), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_match_miss() {
        let dir = tempdir().unwrap();
        let storage = storage(dir.path()).await;
        storage.open("cache-v1").await.unwrap();

        let result = storage
            .match_request("cache-v1", &RequestKey::get("http://localhost/nope"))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_buckets_survive_restart() {
        let dir = tempdir().unwrap();
        {
            let storage = storage(dir.path()).await;
            storage.open("cache-v0").await.unwrap();
            storage
                .put_all("cache-v1", vec![entry("http://localhost/a", "persisted")])
                .await
                .unwrap();
        }

        let reopened = storage(dir.path()).await;
        assert_eq!(reopened.keys().await.unwrap(), vec!["cache-v0", "cache-v1"]);

        let hit = reopened
            .match_request("cache-v1", &RequestKey::get("http://localhost/a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.body, b"persisted");
    }

    #[tokio::test]
    async fn test_delete_removes_directory() {
        let dir = tempdir().unwrap();
        let storage = storage(dir.path()).await;
        storage
            .put_all("cache-v0", vec![entry("http://localhost/", "old")])
            .await
            .unwrap();

        assert!(storage.delete("cache-v0").await.unwrap());
        assert!(!storage.delete("cache-v0").await.unwrap());
        assert!(!dir.path().join(FileStorage::hash_name("cache-v0")).exists());
        assert!(storage.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_stage_leaves_bucket_untouched() {
        let dir = tempdir().unwrap();
        let storage = storage(dir.path()).await;
        storage
            .put_all("cache-v1", vec![entry("http://localhost/", "home")])
            .await
            .unwrap();

        // A plain file where the next staging directory goes makes staging fail
        let staging_blocker = dir.path().join(format!(
            "{}{}-1",
            STAGING_PREFIX,
            FileStorage::hash_name("cache-v1")
        ));
        std::fs::write(&staging_blocker, b"").unwrap();

        let result = storage
            .put_all("cache-v1", vec![entry("http://localhost/new", "new")])
            .await;
        assert!(result.is_err());

        assert_eq!(
            storage.entries("cache-v1").await.unwrap(),
            vec![RequestKey::get("http://localhost/")]
        );
        let bucket_dir = dir.path().join(FileStorage::hash_name("cache-v1"));
        assert_eq!(body_files(&bucket_dir).len(), 1);

        // The index on disk agrees after a restart
        std::fs::remove_file(&staging_blocker).unwrap();
        let reopened = storage_at(dir.path()).await;
        assert_eq!(reopened.entries("cache-v1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_index_write_keeps_previous_entry() {
        let dir = tempdir().unwrap();
        let storage = storage(dir.path()).await;
        let home = RequestKey::get("http://localhost/");
        storage
            .put_all(
                "cache-v1",
                vec![(
                    home.clone(),
                    StoredResponse::new(&home.url, 200, "old").with_header("etag", "\"old\""),
                )],
            )
            .await
            .unwrap();

        // A directory in place of the temporary index makes the index write fail
        let bucket_dir = dir.path().join(FileStorage::hash_name("cache-v1"));
        std::fs::create_dir(bucket_dir.join(format!("{}.tmp", INDEX_FILE))).unwrap();

        let result = storage
            .put_all(
                "cache-v1",
                vec![
                    (
                        home.clone(),
                        StoredResponse::new(&home.url, 200, "new")
                            .with_header("etag", "\"new\""),
                    ),
                    entry("http://localhost/added", "added"),
                ],
            )
            .await;
        assert!(result.is_err());

        let cached = storage
            .match_request("cache-v1", &home)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.body, b"old");
        assert_eq!(cached.header("etag"), Some("\"old\""));
        assert_eq!(storage.entries("cache-v1").await.unwrap(), vec![home]);
        assert_eq!(body_files(&bucket_dir).len(), 1);
    }

    #[tokio::test]
    async fn test_overwrite_removes_superseded_body() {
        let dir = tempdir().unwrap();
        let storage = storage(dir.path()).await;
        storage
            .put_all("cache-v1", vec![entry("http://localhost/", "old")])
            .await
            .unwrap();
        storage
            .put_all("cache-v1", vec![entry("http://localhost/", "new")])
            .await
            .unwrap();

        let bucket_dir = dir.path().join(FileStorage::hash_name("cache-v1"));
        assert_eq!(body_files(&bucket_dir).len(), 1);

        let reopened = storage_at(dir.path()).await;
        let cached = reopened
            .match_request("cache-v1", &RequestKey::get("http://localhost/"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.body, b"new");
    }

    #[tokio::test]
    async fn test_unreadable_body_is_an_error() {
        let dir = tempdir().unwrap();
        let storage = storage(dir.path()).await;
        storage
            .put_all("cache-v1", vec![entry("http://localhost/", "home")])
            .await
            .unwrap();

        let bucket_dir = dir.path().join(FileStorage::hash_name("cache-v1"));
        for file in body_files(&bucket_dir) {
            std::fs::remove_file(bucket_dir.join(file)).unwrap();
        }

        let result = storage
            .match_request("cache-v1", &RequestKey::get("http://localhost/"))
            .await;
        assert!(matches!(result, Err(AgentError::Io(_))));
    }

    #[tokio::test]
    async fn test_stats() {
        let dir = tempdir().unwrap();
        let storage = storage(dir.path()).await;

        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.total_size, 0);

        storage
            .put_all(
                "cache-v1",
                vec![entry("http://localhost/", "test data"), entry("http://localhost/a", "a")],
            )
            .await
            .unwrap();

        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.buckets, 1);
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.total_size, 10);
    }
}
