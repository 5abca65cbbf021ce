//! Service context and request coordination
//!
//! [`EmbeddingGateway`] owns every shared resource (credentials, cache,
//! HTTP client, metrics). It is built once at startup and shared as an
//! `Arc` with every connection handler.

use crate::cache_split;
use crate::config::GatewayConfig;
use crate::credentials::{CredentialManager, RefreshState};
use crate::embedding_cache::{CacheKey, EmbeddingCache, EmbeddingCacheStats};
use crate::error::{GatewayError, Result};
use crate::metrics::GatewayMetrics;
use crate::models::{InferenceInstance, InferenceResponse, PatchEmbedding};
use crate::path_rewriter::PathRewriter;
use crate::request_validator::parse_request;
use crate::response_assembler::ResponseAssembler;
use crate::tile_cache::{TileCache, TileCacheStats};
use crate::upstream::{RawResponse, UpstreamClient};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Snapshot served by `GET /stats`
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub embedding_cache: EmbeddingCacheStats,
    pub tile_cache: TileCacheStats,
    pub credential: &'static str,
}

/// Shared state of one gateway process
pub struct EmbeddingGateway {
    config: GatewayConfig,
    credentials: Arc<CredentialManager>,
    cache: Arc<EmbeddingCache>,
    upstream: UpstreamClient,
    tile_cache: TileCache,
    rewriter: PathRewriter,
    assembler: ResponseAssembler,
    metrics: Arc<GatewayMetrics>,
}

impl EmbeddingGateway {
    pub fn new(
        config: GatewayConfig,
        credentials: Arc<CredentialManager>,
        cache: Arc<EmbeddingCache>,
        metrics: Arc<GatewayMetrics>,
    ) -> Result<Self> {
        let upstream = UpstreamClient::new(config.upstream_timeout(), metrics.clone())?;
        let rewriter = PathRewriter::new(config.public_tile_prefix(), config.tile_route_prefix.clone());
        let tile_cache = TileCache::new(config.tile_cache_size_bytes);

        Ok(EmbeddingGateway {
            config,
            credentials,
            cache,
            upstream,
            tile_cache,
            rewriter,
            assembler: ResponseAssembler::new(),
            metrics,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    pub fn credentials(&self) -> &CredentialManager {
        &self.credentials
    }

    /// Serve a `/predict` request body
    ///
    /// # Flow
    /// 1. Both upstream URLs must be configured
    /// 2. Validate and parse the whole body
    /// 3. Rewrite every series path; any failure rejects the request before
    ///    a single upstream call is made
    /// 4. Per instance, in order: split against the cache, compute misses
    ///    upstream, write them through to the cache, merge in request order
    pub async fn predict(&self, body: &[u8]) -> Result<InferenceResponse> {
        let predict_url = self.predict_url()?;
        let tile_server_url = self.tile_server_url()?;

        let request = parse_request(body)?;

        let mut instances = request.instances;
        for instance in &mut instances {
            instance.dicom_path.series_path = self
                .rewriter
                .rewrite_series_path(&instance.dicom_path.series_path, tile_server_url)?;
        }

        let mut per_instance = Vec::with_capacity(instances.len());
        for instance in &instances {
            per_instance.push(self.embed_instance(predict_url, instance).await?);
        }

        Ok(InferenceResponse::from_embeddings(per_instance))
    }

    async fn embed_instance(
        &self,
        predict_url: &str,
        instance: &InferenceInstance,
    ) -> Result<Vec<PatchEmbedding>> {
        let series_path = &instance.dicom_path.series_path;
        let split = cache_split::split(
            &self.cache,
            series_path,
            &instance.patch_coordinates,
            &self.metrics,
        )
        .await?;
        let total_len = split.total_len();

        if split.is_complete() {
            debug!("All {} patches of {} served from cache", total_len, series_path);
            return self.assembler.merge(total_len, split.hits, Vec::new());
        }

        let token = self.credentials.get_token().await?;
        let results = self
            .upstream
            .forward_inference(
                predict_url,
                &split.miss_coordinates(),
                &instance.dicom_path,
                &instance.extensions,
                &token,
            )
            .await?;
        let computed = self.assembler.pair_results(&split.misses, results)?;

        for (_, embedding) in &computed {
            self.write_through(series_path, embedding).await;
        }

        info!(
            "Embedded {} patches of {} ({} cached, {} computed)",
            total_len,
            series_path,
            split.hits.len(),
            computed.len()
        );
        self.assembler.merge(total_len, split.hits, computed)
    }

    async fn write_through(&self, series_path: &str, embedding: &PatchEmbedding) {
        let result = match CacheKey::new(series_path, &embedding.patch_coordinate) {
            Ok(key) => self.cache.set(&key, &embedding.embedding_vector).await,
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            warn!("Failed to cache embedding for {}: {}", series_path, e);
        }
        self.metrics.record_cache_write(result.is_ok());
    }

    /// Proxy a tile-server request
    ///
    /// # Arguments
    /// * `path` - Request path, starting with the tile route prefix
    /// * `query` - Raw query string, forwarded as-is
    /// * `body` - Request body, forwarded as-is; requests with a body bypass the tile cache
    pub async fn fetch_tile(&self, path: &str, query: Option<&str>, body: Bytes) -> Result<RawResponse> {
        let tile_server_url = self.tile_server_url()?;
        let url = self.rewriter.tile_url(path, tile_server_url)?;

        let cacheable = body.is_empty();
        let cache_key = TileCache::cache_key(path, query);
        if cacheable {
            if let Some(cached) = self.tile_cache.lookup(&cache_key) {
                return Ok(cached);
            }
        }

        let token = self.credentials.get_token().await?;
        let response = self
            .upstream
            .forward_tile_fetch(&url, &token, query, body)
            .await?;

        if cacheable {
            self.tile_cache.store(&cache_key, response.clone());
        }
        Ok(response)
    }

    pub fn stats(&self) -> GatewayStats {
        let credential = match self.credentials.refresh_state() {
            RefreshState::Valid => "valid",
            RefreshState::NeedsRefresh => "needs_refresh",
            RefreshState::Refreshing => "refreshing",
        };

        GatewayStats {
            embedding_cache: self.cache.stats(),
            tile_cache: self.tile_cache.stats(),
            credential,
        }
    }

    fn predict_url(&self) -> Result<&str> {
        self.config.predict_server_url.as_deref().ok_or_else(|| {
            GatewayError::Misconfiguration("prediction endpoint URL is not configured".to_string())
        })
    }

    fn tile_server_url(&self) -> Result<&str> {
        self.config.tile_server_url.as_deref().ok_or_else(|| {
            GatewayError::Misconfiguration("tile server URL is not configured".to_string())
        })
    }
}
