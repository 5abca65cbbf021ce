//! Partition an instance's patches into cache hits and misses

use crate::embedding_cache::{CacheKey, EmbeddingCache};
use crate::error::Result;
use crate::metrics::GatewayMetrics;
use crate::models::{PatchCoordinate, PatchEmbedding};
use tracing::{debug, warn};

/// Hits and misses of one instance, each tagged with its original index
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheSplit {
    pub hits: Vec<(usize, PatchEmbedding)>,
    pub misses: Vec<(usize, PatchCoordinate)>,
}

impl CacheSplit {
    /// Whether every patch was served from the cache
    pub fn is_complete(&self) -> bool {
        self.misses.is_empty()
    }

    pub fn total_len(&self) -> usize {
        self.hits.len() + self.misses.len()
    }

    pub fn miss_coordinates(&self) -> Vec<PatchCoordinate> {
        self.misses.iter().map(|(_, patch)| *patch).collect()
    }
}

/// Look up every patch of a series in the cache, in order
///
/// A failed cache read is logged and counted, then handled as a miss; the
/// patch is simply recomputed upstream.
pub async fn split(
    cache: &EmbeddingCache,
    series_path: &str,
    patches: &[PatchCoordinate],
    metrics: &GatewayMetrics,
) -> Result<CacheSplit> {
    let mut result = CacheSplit::default();

    for (index, patch) in patches.iter().enumerate() {
        let key = CacheKey::new(series_path, patch)?;
        match cache.get(&key).await {
            Ok(Some(embedding_vector)) => {
                metrics.record_cache_hit();
                result.hits.push((
                    index,
                    PatchEmbedding {
                        patch_coordinate: *patch,
                        embedding_vector,
                    },
                ));
            }
            Ok(None) => {
                metrics.record_cache_miss();
                result.misses.push((index, *patch));
            }
            Err(e) => {
                warn!("Cache read failed for patch {}, treating as miss: {}", index, e);
                metrics.record_cache_error();
                result.misses.push((index, *patch));
            }
        }
    }

    debug!(
        "Cache split for {}: {} hits, {} misses",
        series_path,
        result.hits.len(),
        result.misses.len()
    );
    Ok(result)
}
