//! Patch Embedding Gateway
//!
//! A cache-augmented gateway in front of a patch-embedding inference service
//! and the image-tile (DICOMweb) server it reads from.
//!
//! # Overview
//!
//! Clients ask for embedding vectors of fixed-size (224x224) patches of a
//! slide series. The gateway answers as much as it can from a persistent,
//! size-bounded disk cache shared by every worker on the host, sends only
//! the uncached patches to the prediction service, writes the new vectors
//! through to the cache and returns all embeddings in request order.
//!
//! # Features
//!
//! - **Per-patch deduplication**: one cache entry per (series, patch), shared across processes
//! - **Order preservation**: hits and fresh results are merged back by original index
//! - **Managed credentials**: service-account token refreshed 5 minutes before expiry
//! - **Path rewriting**: public tile-proxy URLs are mapped to the internal tile server
//! - **Tile proxy**: authenticated passthrough to the tile server with an in-memory LRU
//! - **Cache export**: the whole cache directory streamed as a zip archive
//! - **Metrics**: Prometheus counters and histograms at `/metrics`
//!
//! # Architecture
//!
//! - [`EmbeddingGateway`]: service context coordinating every component
//! - [`request_validator`]: structural checks on `/predict` bodies
//! - [`PathRewriter`]: public → internal series path mapping
//! - [`EmbeddingCache`]: file-per-entry disk cache with LRU eviction
//! - [`cache_split`]: partitions patches into hits and misses
//! - [`UpstreamClient`]: prediction and tile-server calls
//! - [`ResponseAssembler`]: pairs and merges embeddings in request order
//! - [`CredentialManager`]: bearer token lifecycle
//! - [`GatewayMetrics`]: Prometheus collectors
//!
//! # Configuration
//!
//! Defaults can be overridden from a YAML file named by `GATEWAY_CONFIG`
//! and then from environment variables:
//!
//! ```yaml
//! listen_address: "0.0.0.0:8080"
//! workers: 6
//! request_timeout_secs: 600
//! upstream_timeout_secs: 300
//! tile_server_url: "https://healthcare.googleapis.com/v1/projects/p/locations/l/datasets/d/dicomStores/s/dicomWeb"
//! predict_server_url: "https://predict.example.com/v1/predict"
//! cache_dir: "./path-cache"
//! cache_size_limit_bytes: 45000000000
//! ```
//!
//! See [`GatewayConfig`] for every option.
//!
//! # Error Handling
//!
//! Every fallible operation returns [`Result`] with a [`GatewayError`];
//! the server maps each variant to an HTTP status:
//!
//! ```rust
//! use patch_embedding_gateway::GatewayError;
//!
//! let err = GatewayError::Validation("missing patch_coordinates".to_string());
//! assert_eq!(err.to_http_status(), 400);
//! ```

pub mod archive;
pub mod cache_split;
pub mod config;
pub mod credentials;
pub mod embedding_cache;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod models;
pub mod path_rewriter;
pub mod request_validator;
pub mod response_assembler;
pub mod server;
pub mod tile_cache;
pub mod upstream;

// Re-export commonly used types
pub use cache_split::CacheSplit;
pub use config::GatewayConfig;
pub use credentials::{
    BearerToken, Credential, CredentialManager, IssuedToken, RefreshState, ServiceAccountExchanger,
    ServiceAccountKey, TokenExchanger,
};
pub use embedding_cache::{CacheKey, EmbeddingCache, EmbeddingCacheStats};
pub use error::{GatewayError, Result};
pub use gateway::{EmbeddingGateway, GatewayStats};
pub use metrics::{GatewayMetrics, MetricsSnapshot};
pub use models::{
    DicomPath, EmbeddingVector, InferenceInstance, InferenceRequest, InferenceResponse,
    PatchCoordinate, PatchEmbedding,
};
pub use path_rewriter::PathRewriter;
pub use response_assembler::ResponseAssembler;
pub use tile_cache::TileCache;
pub use upstream::{RawResponse, UpstreamClient};
