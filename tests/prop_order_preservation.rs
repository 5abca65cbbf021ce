// Property: for any mix of cached and uncached patches, the response lists
// one embedding per requested patch, in request order, and only the
// uncached patches are sent to the prediction service.

mod common;

use common::*;
use http::StatusCode;
use patch_embedding_gateway::{PatchCoordinate, PatchEmbedding, ResponseAssembler};
use proptest::prelude::*;
use tempfile::TempDir;
use tokio::runtime::Runtime;
use wiremock::MockServer;

fn patch_at(index: usize) -> (i64, i64) {
    ((index as i64) * 224, ((index % 3) as i64) * 224)
}

fn embedding(index: usize, value: f64) -> PatchEmbedding {
    let (x, y) = patch_at(index);
    PatchEmbedding {
        patch_coordinate: PatchCoordinate::at(x, y),
        embedding_vector: vec![value, index as f64],
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// End-to-end order preservation through `/predict`
    ///
    /// `cached_mask[i]` decides whether patch i is seeded into the cache
    /// before the request.
    #[test]
    fn prop_predict_preserves_request_order(cached_mask in prop::collection::vec(any::<bool>(), 1..10)) {
        let rt = Runtime::new().unwrap();

        let result: Result<(), TestCaseError> = rt.block_on(async {
            let mock_server = MockServer::start().await;
            let cache_dir = TempDir::new().unwrap();
            let gateway = predict_gateway(&mock_server, cache_dir.path()).await;

            let patches: Vec<(i64, i64)> = (0..cached_mask.len()).map(patch_at).collect();
            for (&(x, y), &is_cached) in patches.iter().zip(&cached_mask) {
                if is_cached {
                    seed_cache(&gateway, INTERNAL_SERIES, x, y).await;
                }
            }

            let any_miss = cached_mask.iter().any(|cached| !cached);
            mount_echo_predictor(&mock_server, if any_miss { 1 } else { 0 }).await;

            let (status, response) = post_predict(&gateway, &predict_body(PUBLIC_SERIES, &patches)).await;
            prop_assert_eq!(status, StatusCode::OK);

            let expected: Vec<Vec<f64>> = patches
                .iter()
                .zip(&cached_mask)
                .map(|(&(x, y), &is_cached)| {
                    if is_cached { cached_vector(x, y) } else { computed_vector(x, y) }
                })
                .collect();
            prop_assert_eq!(embeddings_of(&response, 0), expected);

            // Only misses went upstream, in their original relative order
            let forwarded = received_bodies(&mock_server).await;
            if any_miss {
                let sent: Vec<(i64, i64)> = forwarded[0]["instances"][0]["patch_coordinates"]
                    .as_array()
                    .unwrap()
                    .iter()
                    .map(|p| (p["x_origin"].as_i64().unwrap(), p["y_origin"].as_i64().unwrap()))
                    .collect();
                let misses: Vec<(i64, i64)> = patches
                    .iter()
                    .zip(&cached_mask)
                    .filter(|(_, is_cached)| !**is_cached)
                    .map(|(&patch, _)| patch)
                    .collect();
                prop_assert_eq!(sent, misses);
            } else {
                prop_assert!(forwarded.is_empty());
            }

            Ok(())
        });

        result?;
    }

    /// Merging any partition of indices into hits and computed results
    /// yields every embedding exactly once, ordered by index
    #[test]
    fn prop_merge_orders_by_index(cached_mask in prop::collection::vec(any::<bool>(), 0..64)) {
        let assembler = ResponseAssembler::new();

        let mut hits = Vec::new();
        let mut computed = Vec::new();
        for (index, &is_cached) in cached_mask.iter().enumerate() {
            if is_cached {
                hits.push((index, embedding(index, 0.0)));
            } else {
                computed.push((index, embedding(index, 1.0)));
            }
        }
        // Computed results may arrive in any order relative to hits
        computed.reverse();

        let merged = assembler.merge(cached_mask.len(), hits, computed).unwrap();

        prop_assert_eq!(merged.len(), cached_mask.len());
        for (index, (item, &is_cached)) in merged.iter().zip(&cached_mask).enumerate() {
            let expected = embedding(index, if is_cached { 0.0 } else { 1.0 });
            prop_assert_eq!(item, &expected);
        }
    }

    /// Dropping any single embedding is detected rather than shifting the rest
    #[test]
    fn prop_merge_rejects_missing_index(len in 1usize..32, dropped in any::<prop::sample::Index>()) {
        let assembler = ResponseAssembler::new();
        let dropped = dropped.index(len);

        let hits: Vec<(usize, PatchEmbedding)> = (0..len)
            .filter(|&index| index != dropped)
            .map(|index| (index, embedding(index, 0.0)))
            .collect();

        prop_assert!(assembler.merge(len, hits, Vec::new()).is_err());
    }
}
