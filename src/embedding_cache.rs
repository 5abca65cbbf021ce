//! Persistent, size-bounded embedding cache
//!
//! One file per entry under the cache root, fanned out over two levels of
//! hashed subdirectories (`ab/cd/<xxh3-128>.emb`). The directory is shared
//! by every gateway process on the host:
//! - Writes go to a temp file in the target directory and are renamed into
//!   place, so readers only ever see a complete old or new entry
//! - Concurrent writers of the same key are last-write-wins
//! - Reads bump the file's modification time, which eviction uses as the
//!   access-recency order
//! - Eviction starts once the size limit is exceeded and removes entries
//!   down to a low-water mark below the limit
//!
//! Entry file layout:
//! ```text
//! [magic "EMB1"][crc32 of payload, u32 LE][bincode payload {key, vector}]
//! ```
//! An entry whose stored key differs from the requested one (hash
//! collision) is a miss. An entry failing the magic or checksum test is
//! removed and treated as a miss.

use crate::error::{GatewayError, Result};
use crate::models::{EmbeddingVector, PatchCoordinate};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_128;

const MAGIC: &[u8; 4] = b"EMB1";
const HEADER_LEN: usize = 8;
const ENTRY_EXTENSION: &str = "emb";

/// Eviction target as a percentage of the size limit
pub const EVICTION_LOW_WATER_PERCENT: u64 = 90;

/// Prefix of in-flight temp files; never treated as entries
pub const TEMP_PREFIX: &str = ".tmp-";

#[derive(Serialize)]
struct KeySeries<'a> {
    series_path: &'a str,
}

// Fields in lexicographic order; serde_json keeps declaration order
#[derive(Serialize)]
struct KeyPatch {
    height: i64,
    width: i64,
    x_origin: i64,
    y_origin: i64,
}

#[derive(Serialize)]
struct KeyDocument<'a> {
    dicom_path: KeySeries<'a>,
    patch: KeyPatch,
}

/// Canonical cache key for one patch of one series
///
/// Compact JSON with keys in fixed lexicographic order, so two requests for
/// the same patch produce the same key regardless of their field order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build the key from an internal series path and a patch
    pub fn new(series_path: &str, patch: &PatchCoordinate) -> Result<Self> {
        let document = KeyDocument {
            dicom_path: KeySeries { series_path },
            patch: KeyPatch {
                height: patch.height(),
                width: patch.width(),
                x_origin: patch.x_origin(),
                y_origin: patch.y_origin(),
            },
        };
        serde_json::to_string(&document)
            .map(CacheKey)
            .map_err(|e| GatewayError::Internal(format!("failed to encode cache key: {}", e)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn file_name_hash(&self) -> String {
        format!("{:032x}", xxh3_128(self.0.as_bytes()))
    }
}

#[derive(Serialize)]
struct EntryRef<'a> {
    key: &'a str,
    vector: &'a [f64],
}

#[derive(Deserialize)]
struct StoredEntry {
    key: String,
    vector: EmbeddingVector,
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EmbeddingCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub evictions: u64,
    pub errors: u64,
    pub approx_size_bytes: u64,
    pub size_limit_bytes: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
    errors: AtomicU64,
}

struct EntryFile {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

/// Disk-backed embedding cache bounded by a byte budget
pub struct EmbeddingCache {
    root: PathBuf,
    size_limit: u64,
    approx_size: AtomicU64,
    eviction_lock: Mutex<()>,
    counters: Counters,
}

impl EmbeddingCache {
    /// Open (or create) the cache at `root`
    ///
    /// Scans existing entries to seed the running size estimate.
    pub async fn open(root: impl AsRef<Path>, size_limit: u64) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await.map_err(|e| {
            GatewayError::Cache(format!(
                "failed to create cache directory {}: {}",
                root.display(),
                e
            ))
        })?;

        let cache = EmbeddingCache {
            root,
            size_limit,
            approx_size: AtomicU64::new(0),
            eviction_lock: Mutex::new(()),
            counters: Counters::default(),
        };

        let size = cache.total_size().await?;
        cache.approx_size.store(size, Ordering::Relaxed);
        info!(
            "Opened embedding cache at {} ({} bytes used, limit {} bytes)",
            cache.root.display(),
            size,
            size_limit
        );
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Look up an entry
    ///
    /// # Returns
    /// * `Ok(Some(vector))` on a hit
    /// * `Ok(None)` on a miss, a key collision or a corrupt entry
    /// * `Err(GatewayError::Cache)` if the entry exists but cannot be read
    pub async fn get(&self, key: &CacheKey) -> Result<Option<EmbeddingVector>> {
        let path = self.entry_path(key);

        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return Err(GatewayError::Cache(format!(
                    "failed to read cache entry {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        match decode_entry(&data) {
            Ok(entry) if entry.key == key.as_str() => {
                touch(&path).await;
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry.vector))
            }
            Ok(entry) => {
                debug!(
                    "Cache key collision at {}: stored {} requested {}",
                    path.display(),
                    entry.key,
                    key.as_str()
                );
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Err(reason) => {
                warn!("Removing corrupt cache entry {}: {}", path.display(), reason);
                if let Err(e) = fs::remove_file(&path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to remove corrupt entry {}: {}", path.display(), e);
                    }
                }
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Store an entry, evicting old entries if the budget is exceeded
    pub async fn set(&self, key: &CacheKey, vector: &[f64]) -> Result<()> {
        let path = self.entry_path(key);
        let contents = encode_entry(key, vector)?;
        let size = contents.len() as u64;

        let result = write_atomic(path, contents).await;
        if let Err(e) = result {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        self.counters.writes.fetch_add(1, Ordering::Relaxed);

        let estimated = self.approx_size.fetch_add(size, Ordering::Relaxed) + size;
        if estimated > self.size_limit {
            self.evict().await?;
        }
        Ok(())
    }

    /// Remove least recently accessed entries once over budget
    ///
    /// Rescans the directory (other processes write to it too). If the total
    /// exceeds the limit, deletes entries in ascending `(mtime, path)` order
    /// until the total is at or below the low-water mark.
    ///
    /// # Returns
    /// Number of entries removed
    pub async fn evict(&self) -> Result<u64> {
        let _guard = self.eviction_lock.lock().await;

        let root = self.root.clone();
        let limit = self.size_limit;
        let target = low_water_mark(limit);
        let (removed, remaining) =
            tokio::task::spawn_blocking(move || evict_blocking(&root, limit, target))
                .await
                .map_err(|e| GatewayError::Internal(format!("eviction task failed: {}", e)))??;

        self.approx_size.store(remaining, Ordering::Relaxed);
        self.counters.evictions.fetch_add(removed, Ordering::Relaxed);
        if removed > 0 {
            info!(
                "Evicted {} cache entries, {} bytes remain (limit {})",
                removed, remaining, limit
            );
        }
        Ok(removed)
    }

    /// Exact size of all committed entries, by directory scan
    pub async fn total_size(&self) -> Result<u64> {
        let root = self.root.clone();
        let entries = tokio::task::spawn_blocking(move || scan_entries(&root))
            .await
            .map_err(|e| GatewayError::Internal(format!("cache scan task failed: {}", e)))??;
        Ok(entries.iter().map(|entry| entry.size).sum())
    }

    pub fn stats(&self) -> EmbeddingCacheStats {
        EmbeddingCacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            approx_size_bytes: self.approx_size.load(Ordering::Relaxed),
            size_limit_bytes: self.size_limit,
        }
    }

    /// Path of the entry file for a key
    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        let hash = key.file_name_hash();
        self.root
            .join(&hash[0..2])
            .join(&hash[2..4])
            .join(format!("{}.{}", hash, ENTRY_EXTENSION))
    }
}

fn encode_entry(key: &CacheKey, vector: &[f64]) -> Result<Vec<u8>> {
    let payload = bincode::serialize(&EntryRef {
        key: key.as_str(),
        vector,
    })
    .map_err(|e| GatewayError::Cache(format!("failed to encode cache entry: {}", e)))?;

    let mut contents = Vec::with_capacity(HEADER_LEN + payload.len());
    contents.extend_from_slice(MAGIC);
    contents.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    contents.extend_from_slice(&payload);
    Ok(contents)
}

fn decode_entry(data: &[u8]) -> std::result::Result<StoredEntry, String> {
    if data.len() < HEADER_LEN || &data[..4] != MAGIC {
        return Err("bad header".to_string());
    }

    let expected = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    let payload = &data[HEADER_LEN..];
    let actual = crc32fast::hash(payload);
    if actual != expected {
        return Err(format!(
            "checksum mismatch (expected {:08x}, got {:08x})",
            expected, actual
        ));
    }

    bincode::deserialize(payload).map_err(|e| format!("undecodable payload: {}", e))
}

async fn write_atomic(path: PathBuf, contents: Vec<u8>) -> Result<()> {
    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| GatewayError::Internal(format!("entry path has no parent: {}", path.display())))?;

    fs::create_dir_all(&dir).await.map_err(|e| {
        GatewayError::Cache(format!("failed to create cache directory: {}", e))
    })?;

    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&dir)?;
        tmp.write_all(&contents)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| GatewayError::Internal(format!("cache write task failed: {}", e)))?
    .map_err(|e| GatewayError::Cache(format!("failed to write cache entry: {}", e)))
}

async fn touch(path: &Path) {
    let path = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || {
        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)?
            .set_modified(SystemTime::now())
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Failed to refresh cache entry access time: {}", e),
        Err(e) => debug!("Access time task failed: {}", e),
    }
}

fn scan_entries(root: &Path) -> Result<Vec<EntryFile>> {
    let mut entries = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let listing = match std::fs::read_dir(&dir) {
            Ok(listing) => listing,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                return Err(GatewayError::Cache(format!(
                    "failed to scan {}: {}",
                    dir.display(),
                    e
                )))
            }
        };

        for item in listing {
            let item = item?;
            let path = item.path();
            // Entries can vanish between listing and stat when another process evicts
            let metadata = match item.metadata() {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };

            if metadata.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|ext| ext == ENTRY_EXTENSION) {
                entries.push(EntryFile {
                    size: metadata.len(),
                    modified: metadata.modified()?,
                    path,
                });
            }
        }
    }

    Ok(entries)
}

fn low_water_mark(limit: u64) -> u64 {
    (u128::from(limit) * u128::from(EVICTION_LOW_WATER_PERCENT) / 100) as u64
}

fn evict_blocking(root: &Path, limit: u64, target: u64) -> Result<(u64, u64)> {
    let mut entries = scan_entries(root)?;
    let mut total: u64 = entries.iter().map(|entry| entry.size).sum();
    if total <= limit {
        return Ok((0, total));
    }

    entries.sort_by(|a, b| (a.modified, &a.path).cmp(&(b.modified, &b.path)));

    let mut removed = 0;
    for entry in entries {
        if total <= target {
            break;
        }
        match std::fs::remove_file(&entry.path) {
            Ok(()) => {
                debug!("Evicted {}", entry.path.display());
                total -= entry.size;
                removed += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                total -= entry.size;
            }
            Err(e) => warn!("Failed to evict {}: {}", entry.path.display(), e),
        }
    }

    Ok((removed, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(x: i64, y: i64) -> CacheKey {
        CacheKey::new("https://tiles.example.com/studies/1/series/2", &PatchCoordinate::at(x, y)).unwrap()
    }

    #[test]
    fn test_low_water_mark() {
        assert_eq!(low_water_mark(1000), 900);
        assert_eq!(low_water_mark(45_000_000_000), 40_500_000_000);
        assert!(low_water_mark(u64::MAX) < u64::MAX);
    }

    #[test]
    fn test_key_is_canonical_json() {
        let key = CacheKey::new("/s", &PatchCoordinate::at(1, 2)).unwrap();
        assert_eq!(
            key.as_str(),
            r#"{"dicom_path":{"series_path":"/s"},"patch":{"height":224,"width":224,"x_origin":1,"y_origin":2}}"#
        );
    }

    #[test]
    fn test_key_distinguishes_series_and_patch() {
        let a = CacheKey::new("/s1", &PatchCoordinate::at(1, 2)).unwrap();
        let b = CacheKey::new("/s2", &PatchCoordinate::at(1, 2)).unwrap();
        let c = CacheKey::new("/s1", &PatchCoordinate::at(2, 1)).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let dir = TempDir::new().unwrap();
        let cache = EmbeddingCache::open(dir.path(), 1024 * 1024).await.unwrap();

        assert_eq!(cache.get(&key(0, 0)).await.unwrap(), None);
        cache.set(&key(0, 0), &[0.25, -1.0, 3.5]).await.unwrap();
        assert_eq!(cache.get(&key(0, 0)).await.unwrap(), Some(vec![0.25, -1.0, 3.5]));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.writes, 1);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let cache = EmbeddingCache::open(dir.path(), 1024 * 1024).await.unwrap();
            cache.set(&key(224, 448), &[1.0; 8]).await.unwrap();
        }

        let reopened = EmbeddingCache::open(dir.path(), 1024 * 1024).await.unwrap();
        assert!(reopened.stats().approx_size_bytes > 0);
        assert_eq!(reopened.get(&key(224, 448)).await.unwrap(), Some(vec![1.0; 8]));
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_removed() {
        let dir = TempDir::new().unwrap();
        let cache = EmbeddingCache::open(dir.path(), 1024 * 1024).await.unwrap();
        let k = key(5, 5);
        cache.set(&k, &[1.0, 2.0]).await.unwrap();

        let path = cache.entry_path(&k);
        let mut data = std::fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        std::fs::write(&path, data).unwrap();

        assert_eq!(cache.get(&k).await.unwrap(), None);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_temp_files_are_not_entries() {
        let dir = TempDir::new().unwrap();
        let cache = EmbeddingCache::open(dir.path(), 1024 * 1024).await.unwrap();
        std::fs::write(dir.path().join(".tmp-partial"), vec![0u8; 4096]).unwrap();
        assert_eq!(cache.total_size().await.unwrap(), 0);
    }
}
