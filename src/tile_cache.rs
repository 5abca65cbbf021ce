//! In-memory cache of tile-proxy responses
//!
//! Tiles are immutable on the tile server, so successful responses are kept
//! without expiry and evicted least-recently-used when the byte budget is
//! reached. Entries are keyed by path and query string.

use crate::upstream::RawResponse;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

struct TileEntry {
    response: RawResponse,
    last_accessed: u64,
}

#[derive(Default)]
struct TileStorage {
    entries: HashMap<String, TileEntry>,
    current_size: usize,
    clock: u64,
    hits: u64,
    misses: u64,
}

impl TileStorage {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Tile cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct TileCacheStats {
    pub entries: usize,
    pub size_bytes: usize,
    pub max_size_bytes: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Byte-bounded LRU of successful tile responses
pub struct TileCache {
    max_size_bytes: usize,
    storage: Mutex<TileStorage>,
}

impl TileCache {
    /// Create a cache holding at most `max_size_bytes` of response bodies
    ///
    /// A budget of 0 disables caching.
    pub fn new(max_size_bytes: usize) -> Self {
        TileCache {
            max_size_bytes,
            storage: Mutex::new(TileStorage::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_size_bytes > 0
    }

    pub fn cache_key(path: &str, query: Option<&str>) -> String {
        match query {
            Some(query) if !query.is_empty() => format!("{}?{}", path, query),
            _ => path.to_string(),
        }
    }

    pub fn lookup(&self, key: &str) -> Option<RawResponse> {
        if !self.is_enabled() {
            return None;
        }

        let mut storage = self.storage.lock().unwrap_or_else(PoisonError::into_inner);
        let now = storage.tick();
        let found = storage.entries.get_mut(key).map(|entry| {
            entry.last_accessed = now;
            entry.response.clone()
        });

        if found.is_some() {
            storage.hits += 1;
            debug!("Tile cache hit: {}", key);
        } else {
            storage.misses += 1;
        }
        found
    }

    /// Store a response; non-2xx responses and oversized bodies are skipped
    pub fn store(&self, key: &str, response: RawResponse) {
        let size = response.size();
        if !self.is_enabled() || !(200..300).contains(&response.status) || size > self.max_size_bytes
        {
            return;
        }

        let mut storage = self.storage.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(old) = storage.entries.remove(key) {
            storage.current_size = storage.current_size.saturating_sub(old.response.size());
        }

        while storage.current_size + size > self.max_size_bytes {
            let lru_key = storage
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(k, _)| k.clone());
            let Some(lru_key) = lru_key else {
                break;
            };
            if let Some(removed) = storage.entries.remove(&lru_key) {
                storage.current_size = storage.current_size.saturating_sub(removed.response.size());
                debug!("Evicted tile from cache: {}", lru_key);
            }
        }

        let now = storage.tick();
        storage.entries.insert(
            key.to_string(),
            TileEntry {
                response,
                last_accessed: now,
            },
        );
        storage.current_size += size;
    }

    pub fn stats(&self) -> TileCacheStats {
        let storage = self.storage.lock().unwrap_or_else(PoisonError::into_inner);
        TileCacheStats {
            entries: storage.entries.len(),
            size_bytes: storage.current_size,
            max_size_bytes: self.max_size_bytes,
            hits: storage.hits,
            misses: storage.misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn response(status: u16, len: usize) -> RawResponse {
        RawResponse {
            status,
            content_type: Some("image/jpeg".to_string()),
            body: Bytes::from(vec![7u8; len]),
        }
    }

    #[test]
    fn test_store_and_lookup() {
        let cache = TileCache::new(1024);
        let key = TileCache::cache_key("/tile-proxy/a", Some("q=1"));
        assert_eq!(key, "/tile-proxy/a?q=1");

        assert!(cache.lookup(&key).is_none());
        cache.store(&key, response(200, 10));
        assert_eq!(cache.lookup(&key), Some(response(200, 10)));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size_bytes, 10);
    }

    #[test]
    fn test_errors_not_cached() {
        let cache = TileCache::new(1024);
        cache.store("/tile-proxy/missing", response(404, 10));
        assert!(cache.lookup("/tile-proxy/missing").is_none());
    }

    #[test]
    fn test_lru_eviction() {
        let cache = TileCache::new(30);
        cache.store("a", response(200, 10));
        cache.store("b", response(200, 10));
        cache.store("c", response(200, 10));

        // Touch "a" so "b" becomes least recently used
        assert!(cache.lookup("a").is_some());
        cache.store("d", response(200, 10));

        assert!(cache.lookup("b").is_none());
        assert!(cache.lookup("a").is_some());
        assert!(cache.lookup("c").is_some());
        assert!(cache.lookup("d").is_some());
        assert_eq!(cache.stats().size_bytes, 30);
    }

    #[test]
    fn test_disabled_cache() {
        let cache = TileCache::new(0);
        cache.store("a", response(200, 1));
        assert!(cache.lookup("a").is_none());
        assert_eq!(cache.stats().entries, 0);
    }
}
