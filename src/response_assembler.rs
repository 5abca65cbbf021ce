//! Response assembler for merging cached and computed embeddings

use crate::error::{GatewayError, Result};
use crate::models::{EmbeddingVector, PatchCoordinate, PatchEmbedding};
use crate::upstream::PREDICT_SERVICE;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use tracing::debug;

/// Rebuilds each instance's patch list in request order
#[derive(Debug, Default, Clone, Copy)]
pub struct ResponseAssembler;

impl ResponseAssembler {
    /// Create a new ResponseAssembler
    pub fn new() -> Self {
        ResponseAssembler
    }

    /// Pair computed vectors with the misses they were requested for
    ///
    /// Pairing is strictly positional: the n-th result belongs to the n-th
    /// miss. Coordinates echoed by the upstream are never used for matching.
    ///
    /// # Returns
    /// * `Err(GatewayError::Upstream)` if the counts differ
    pub fn pair_results(
        &self,
        misses: &[(usize, PatchCoordinate)],
        results: Vec<EmbeddingVector>,
    ) -> Result<Vec<(usize, PatchEmbedding)>> {
        if misses.len() != results.len() {
            return Err(GatewayError::upstream(
                PREDICT_SERVICE,
                format!(
                    "requested {} embeddings, received {}",
                    misses.len(),
                    results.len()
                ),
            ));
        }

        Ok(misses
            .iter()
            .zip(results)
            .map(|(&(index, patch_coordinate), embedding_vector)| {
                (
                    index,
                    PatchEmbedding {
                        patch_coordinate,
                        embedding_vector,
                    },
                )
            })
            .collect())
    }

    /// Merge hits and computed embeddings into one list in original order
    ///
    /// # Arguments
    /// * `total_len` - Number of patches in the request instance
    /// * `hits` - Cached embeddings tagged with their original index
    /// * `computed` - Fresh embeddings tagged with their original index
    ///
    /// # Returns
    /// * `Err(GatewayError::Internal)` if an index is filled twice, out of
    ///   range, or left empty
    pub fn merge(
        &self,
        total_len: usize,
        hits: Vec<(usize, PatchEmbedding)>,
        computed: Vec<(usize, PatchEmbedding)>,
    ) -> Result<Vec<PatchEmbedding>> {
        debug!(
            "Merging {} cached and {} computed embeddings (expected {})",
            hits.len(),
            computed.len(),
            total_len
        );

        let mut slots = BTreeMap::new();
        for (index, embedding) in hits.into_iter().chain(computed) {
            if index >= total_len {
                return Err(GatewayError::Internal(format!(
                    "embedding index {} out of range for {} patches",
                    index, total_len
                )));
            }
            if slots.insert(index, embedding).is_some() {
                return Err(GatewayError::Internal(format!(
                    "embedding index {} filled twice",
                    index
                )));
            }
        }

        // Every index was in range and unique, so only the count can be short
        if slots.len() != total_len {
            let missing = (0..total_len).find(|i| !slots.contains_key(i)).unwrap_or(0);
            return Err(GatewayError::Internal(format!(
                "missing embedding at index {} ({} of {} filled)",
                missing,
                slots.len(),
                total_len
            )));
        }

        Ok(slots.into_values().collect())
    }
}

/// Serialize `value` as JSON and gzip it
pub fn encode_gzip_json<T: Serialize>(value: &T) -> Result<Bytes> {
    let json = serde_json::to_vec(value)
        .map_err(|e| GatewayError::Internal(format!("failed to encode response: {}", e)))?;

    let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 2), Compression::default());
    encoder.write_all(&json)?;
    let compressed = encoder.finish()?;

    debug!(
        "Encoded response: {} bytes JSON, {} bytes gzip",
        json.len(),
        compressed.len()
    );
    Ok(Bytes::from(compressed))
}
