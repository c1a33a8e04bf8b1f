//! Named cache bucket storage
//!
//! [`CacheStorage`] is the seam between the agent and whatever persists its
//! buckets. [`MemoryStorage`] keeps everything in process and is what the
//! agent's tests run against; [`crate::FileStorage`] persists to disk.

use crate::error::{AgentError, Result};
use crate::types::{CacheStats, RequestKey, StoredResponse};
use std::collections::HashSet;
use std::future::Future;
use tokio::sync::RwLock;
use tracing::debug;

/// Storage for named cache buckets keyed by request identity
pub trait CacheStorage: Send + Sync {
    /// Open the bucket, creating it if absent
    fn open(&self, name: &str) -> impl Future<Output = Result<()>> + Send;

    /// Store every entry in the bucket, or none of them
    fn put_all(
        &self,
        name: &str,
        entries: Vec<(RequestKey, StoredResponse)>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Names of all buckets, oldest first
    fn keys(&self) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Delete a bucket. Returns false if it did not exist.
    fn delete(&self, name: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Look up a request in a bucket
    fn match_request(
        &self,
        name: &str,
        key: &RequestKey,
    ) -> impl Future<Output = Result<Option<StoredResponse>>> + Send;

    /// Request identities stored in a bucket, in insertion order. Empty if the bucket is absent.
    fn entries(&self, name: &str) -> impl Future<Output = Result<Vec<RequestKey>>> + Send;

    fn stats(&self) -> impl Future<Output = Result<CacheStats>> + Send;
}

#[derive(Debug)]
struct MemoryBucket {
    name: String,
    entries: Vec<(RequestKey, StoredResponse)>,
}

impl MemoryBucket {
    fn insert(&mut self, key: RequestKey, response: StoredResponse) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = response,
            None => self.entries.push((key, response)),
        }
    }
}

/// In-process bucket storage
#[derive(Debug, Default)]
pub struct MemoryStorage {
    buckets: RwLock<Vec<MemoryBucket>>,
    /// Buckets whose deletion is refused
    locked: RwLock<HashSet<String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse future deletions of `name`, as a host would for a bucket still in use
    pub async fn lock_bucket(&self, name: &str) {
        self.locked.write().await.insert(name.to_string());
    }
}

impl CacheStorage for MemoryStorage {
    async fn open(&self, name: &str) -> Result<()> {
        let mut buckets = self.buckets.write().await;
        if !buckets.iter().any(|b| b.name == name) {
            buckets.push(MemoryBucket {
                name: name.to_string(),
                entries: Vec::new(),
            });
            debug!(cache = %name, "Created bucket");
        }
        Ok(())
    }

    async fn put_all(&self, name: &str, entries: Vec<(RequestKey, StoredResponse)>) -> Result<()> {
        let mut buckets = self.buckets.write().await;
        let index = match buckets.iter().position(|b| b.name == name) {
            Some(index) => index,
            None => {
                buckets.push(MemoryBucket {
                    name: name.to_string(),
                    entries: Vec::new(),
                });
                buckets.len() - 1
            }
        };

        let bucket = &mut buckets[index];
        for (key, response) in entries {
            bucket.insert(key, response);
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let buckets = self.buckets.read().await;
        Ok(buckets.iter().map(|b| b.name.clone()).collect())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        if self.locked.read().await.contains(name) {
            return Err(AgentError::Storage(format!("bucket {} is locked", name)));
        }

        let mut buckets = self.buckets.write().await;
        let before = buckets.len();
        buckets.retain(|b| b.name != name);
        Ok(buckets.len() != before)
    }

    async fn match_request(&self, name: &str, key: &RequestKey) -> Result<Option<StoredResponse>> {
        let buckets = self.buckets.read().await;
        Ok(buckets
            .iter()
            .find(|b| b.name == name)
            .and_then(|b| b.entries.iter().find(|(k, _)| k == key))
            .map(|(_, response)| response.clone()))
    }

    async fn entries(&self, name: &str) -> Result<Vec<RequestKey>> {
        let buckets = self.buckets.read().await;
        Ok(buckets
            .iter()
            .find(|b| b.name == name)
            .map(|b| b.entries.iter().map(|(k, _)| k.clone()).collect())
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
                .map(|(_, r)| r.body.len() as u64)
                .sum(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(url: &str, body: &str) -> (RequestKey, StoredResponse) {
        (RequestKey::get(url), StoredResponse::new(url, 200, body))
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let storage = MemoryStorage::new();
        storage.open("cache-v1").await.unwrap();
        storage.open("cache-v1").await.unwrap();

        assert_eq!(storage.keys().await.unwrap(), vec!["cache-v1"]);
    }

    #[tokio::test]
    async fn test_keys_in_creation_order() {
        let storage = MemoryStorage::new();
        storage.open("cache-v0").await.unwrap();
        storage.open("cache-v2").await.unwrap();
        storage.open("cache-v1").await.unwrap();

        assert_eq!(
            storage.keys().await.unwrap(),
            vec!["cache-v0", "cache-v2", "cache-v1"]
        );
    }

    #[tokio::test]
    async fn test_put_all_and_match() {
        let storage = MemoryStorage::new();
        storage
            .put_all(
                "cache-v1",
                vec![entry("http://localhost/", "home"), entry("http://localhost/a", "a")],
            )
            .await
            .unwrap();

        let hit = storage
            .match_request("cache-v1", &RequestKey::get("http://localhost/a"))
            .await
            .unwrap();
        assert_eq!(hit.unwrap().body, b"a");

        let miss = storage
            .match_request("cache-v1", &RequestKey::get("http://localhost/b"))
            .await
            .unwrap();
        assert!(miss.is_none());

        let other_bucket = storage
            .match_request("cache-v0", &RequestKey::get("http://localhost/a"))
            .await
            .unwrap();
        assert!(other_bucket.is_none());
    }

    #[tokio::test]
    async fn test_put_all_replaces_existing_entry() {
        let storage = MemoryStorage::new();
        storage
            .put_all("cache-v1", vec![entry("http://localhost/", "old")])
            .await
            .unwrap();
        storage
            .put_all("cache-v1", vec![entry("http://localhost/", "new")])
            .await
            .unwrap();

        assert_eq!(storage.entries("cache-v1").await.unwrap().len(), 1);
        let hit = storage
            .match_request("cache-v1", &RequestKey::get("http://localhost/"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.body, b"new");
    }

    #[tokio::test]
    async fn test_delete() {
        let storage = MemoryStorage::new();
        storage.open("cache-v0").await.unwrap();

        assert!(storage.delete("cache-v0").await.unwrap());
        assert!(!storage.delete("cache-v0").await.unwrap());
        assert!(storage.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_locked_bucket_refuses_delete() {
        let storage = MemoryStorage::new();
        storage.open("cache-v0").await.unwrap();
        storage.lock_bucket("cache-v0").await;

        let result = storage.delete("cache-v0").await;
        assert!(matches!(result, Err(AgentError::Storage(_))));
        assert_eq!(storage.keys().await.unwrap(), vec!["cache-v0"]);
    }

    #[tokio::test]
    async fn test_stats() {
        let storage = MemoryStorage::new();
        storage.open("cache-v0").await.unwrap();
        storage
            .put_all(
                "cache-v1",
                vec![entry("http://localhost/", "12345"), entry("http://localhost/a", "123")],
            )
            .await
            .unwrap();

        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.buckets, 2);
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.total_size, 8);
    }
}
