use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::storage::StorageManager;

const CACHE_PREFIX: &str = "cache_";

// Size bound for the whole cache; oldest entries are evicted on write once
// it is reached. TTL expiry is still checked lazily on every read.
const MAX_CACHE_ENTRIES: usize = 512;

// Stored envelope for every cached value.
#[derive(Serialize, Deserialize, Debug)]
struct CacheEntry {
    value: serde_json::Value,
    stored_at: i64, // Unix timestamp (milliseconds)
    expires_at: Option<i64>,
}

impl CacheEntry {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|expiry| now_ms > expiry)
    }
}

/// Expiring key-value cache on top of the local storage layer.
///
/// Caching is best-effort: storage failures are logged and treated as a
/// miss on read or dropped on write, and never surface to the caller.
#[derive(Clone)]
pub struct CacheStore {
    storage: Arc<StorageManager>,
}

impl CacheStore {
    pub fn new(storage: Arc<StorageManager>) -> Self {
        Self { storage }
    }

    /// Stores `value` at `key`, overwriting any existing entry. With a TTL
    /// the entry expires `ttl_minutes` from now; without one it lives until
    /// evicted or removed.
    pub async fn put<T: Serialize>(&self, key: &str, value: &T, ttl_minutes: Option<i64>) {
        let json_value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("Cache: failed to serialize value for '{}': {}", key, e);
                return;
            }
        };

        let now = Utc::now().timestamp_millis();
        let entry = CacheEntry {
            value: json_value,
            stored_at: now,
            expires_at: ttl_minutes.map(|minutes| now + minutes * 60_000),
        };

        let serialized = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("Cache: failed to serialize entry for '{}': {}", key, e);
                return;
            }
        };

        let full_key = format!("{}{}", CACHE_PREFIX, key);
        self.trim_to_capacity(MAX_CACHE_ENTRIES, &full_key).await;

        if let Err(e) = self.storage.kv_set(&full_key, &serialized).await {
            log::warn!("Cache: write for '{}' dropped: {:?}", key, e);
        }
    }

    /// Reads the value at `key`. Absent, expired, unreadable, and
    /// undeserializable entries all report as a miss; expired entries are
    /// deleted on the way out.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let full_key = format!("{}{}", CACHE_PREFIX, key);

        let raw = match self.storage.kv_get(&full_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("Cache: read for '{}' failed, treating as miss: {:?}", key, e);
                return None;
            }
        };

        let entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Cache: entry for '{}' is corrupt, treating as miss: {}", key, e);
                return None;
            }
        };

        if entry.is_expired(Utc::now().timestamp_millis()) {
            log::debug!("Cache: entry for '{}' expired, removing", key);
            if let Err(e) = self.storage.kv_remove(&full_key).await {
                log::warn!("Cache: failed to remove expired entry '{}': {:?}", key, e);
            }
            return None;
        }

        match serde_json::from_value(entry.value) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("Cache: value for '{}' has unexpected shape: {}", key, e);
                None
            }
        }
    }

    pub async fn remove(&self, key: &str) {
        let full_key = format!("{}{}", CACHE_PREFIX, key);
        if let Err(e) = self.storage.kv_remove(&full_key).await {
            log::warn!("Cache: failed to remove entry '{}': {:?}", key, e);
        }
    }

    /// Removes every cache entry whose (unprefixed) key starts with `prefix`.
    pub async fn clear_prefix(&self, prefix: &str) {
        let full_prefix = format!("{}{}", CACHE_PREFIX, prefix);
        let keys = match self.storage.kv_keys(&full_prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                log::warn!("Cache: failed to list entries for clearing: {:?}", e);
                return;
            }
        };

        log::info!("Cache: clearing {} entries under '{}'", keys.len(), prefix);
        if let Err(e) = self.storage.kv_remove_many(&keys).await {
            log::warn!("Cache: failed to clear entries under '{}': {:?}", prefix, e);
        }
    }

    /// Removes every cache entry.
    pub async fn clear(&self) {
        self.clear_prefix("").await;
    }

    // Evicts oldest-first until a write of `incoming_key` would keep the
    // cache within `max` entries. Overwrites don't grow the cache, so the
    // incoming key is excluded from the count.
    async fn trim_to_capacity(&self, max: usize, incoming_key: &str) {
        let keys = match self.storage.kv_keys_oldest_first(CACHE_PREFIX).await {
            Ok(keys) => keys,
            Err(e) => {
                log::warn!("Cache: failed to list entries for eviction: {:?}", e);
                return;
            }
        };

        let existing: Vec<String> = keys.into_iter().filter(|k| k != incoming_key).collect();
        if existing.len() < max {
            return;
        }

        let evict_count = existing.len() - max + 1;
        let victims = existing[..evict_count].to_vec();
        log::debug!("Cache: evicting {} oldest entries", victims.len());
        if let Err(e) = self.storage.kv_remove_many(&victims).await {
            log::warn!("Cache: eviction failed: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BibleVersion;

    async fn test_cache() -> (CacheStore, Arc<StorageManager>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Arc::new(
            StorageManager::new(&dir.path().join("cache.sqlite"))
                .await
                .expect("storage init"),
        );
        (CacheStore::new(storage.clone()), storage, dir)
    }

    fn sample_version() -> BibleVersion {
        BibleVersion {
            id: "de4e12af7f28f599-02".to_string(),
            name: "King James Version".to_string(),
            abbreviation: "KJV".to_string(),
            language: "English".to_string(),
            language_code: "eng".to_string(),
        }
    }

    #[tokio::test]
    async fn round_trip_without_ttl() {
        let (cache, _storage, _dir) = test_cache().await;

        let version = sample_version();
        cache.put("versions", &vec![version.clone()], None).await;

        let cached: Option<Vec<BibleVersion>> = cache.get("versions").await;
        assert_eq!(cached, Some(vec![version]));
    }

    #[tokio::test]
    async fn missing_key_is_a_miss() {
        let (cache, _storage, _dir) = test_cache().await;
        let cached: Option<Vec<BibleVersion>> = cache.get("nope").await;
        assert_eq!(cached, None);
    }

    #[tokio::test]
    async fn unexpired_ttl_entry_is_returned() {
        let (cache, _storage, _dir) = test_cache().await;

        cache.put("books", &vec!["GEN", "EXO"], Some(60)).await;
        let cached: Option<Vec<String>> = cache.get("books").await;
        assert_eq!(cached, Some(vec!["GEN".to_string(), "EXO".to_string()]));
    }

    #[tokio::test]
    async fn expired_entry_is_deleted_on_read() {
        let (cache, storage, _dir) = test_cache().await;

        // Plant an entry that expired a minute ago.
        let now = Utc::now().timestamp_millis();
        let entry = CacheEntry {
            value: serde_json::json!({"stale": true}),
            stored_at: now - 120_000,
            expires_at: Some(now - 60_000),
        };
        storage
            .kv_set("cache_stale", &serde_json::to_string(&entry).unwrap())
            .await
            .unwrap();

        let cached: Option<serde_json::Value> = cache.get("stale").await;
        assert_eq!(cached, None);

        // The entry was removed from storage, not just skipped.
        assert_eq!(storage.kv_get("cache_stale").await.unwrap(), None);
    }

    #[tokio::test]
    async fn corrupt_entry_is_a_miss() {
        let (cache, storage, _dir) = test_cache().await;

        storage.kv_set("cache_bad", "not json at all").await.unwrap();
        let cached: Option<serde_json::Value> = cache.get("bad").await;
        assert_eq!(cached, None);
    }

    #[tokio::test]
    async fn clear_prefix_is_selective() {
        let (cache, _storage, _dir) = test_cache().await;

        cache.put("bible_versions", &1, None).await;
        cache.put("bible_books_kjv", &2, None).await;
        cache.put("other_thing", &3, None).await;

        cache.clear_prefix("bible_").await;

        assert_eq!(cache.get::<i32>("bible_versions").await, None);
        assert_eq!(cache.get::<i32>("bible_books_kjv").await, None);
        assert_eq!(cache.get::<i32>("other_thing").await, Some(3));
    }

    #[tokio::test]
    async fn eviction_removes_oldest_first() {
        let (cache, _storage, _dir) = test_cache().await;

        cache.put("first", &1, None).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        cache.put("second", &2, None).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        cache.put("third", &3, None).await;

        // Trimming to a capacity of 2 with one incoming write evicts the
        // two oldest entries.
        cache.trim_to_capacity(2, "cache_incoming").await;

        assert_eq!(cache.get::<i32>("first").await, None);
        assert_eq!(cache.get::<i32>("second").await, None);
        assert_eq!(cache.get::<i32>("third").await, Some(3));
    }
}
