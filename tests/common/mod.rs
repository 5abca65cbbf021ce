//! Shared fixtures for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::GzDecoder;
use http::{HeaderMap, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use patch_embedding_gateway::server;
use patch_embedding_gateway::{
    BearerToken, CacheKey, CredentialManager, EmbeddingCache, EmbeddingGateway, GatewayConfig,
    GatewayMetrics, IssuedToken, PatchCoordinate, Result, TokenExchanger,
};
use serde_json::{json, Value};
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TEST_TOKEN: &str = "test-token-7f3a9c";
pub const TEST_AUTHORIZATION: &str = "Bearer test-token-7f3a9c";
pub const TILE_SERVER: &str = "https://tiles.example.com/dicomWeb";
pub const PUBLIC_SERIES: &str = "http://localhost:8080/tile-proxy/studies/1.2.3/series/4.5.6";
pub const INTERNAL_SERIES: &str = "https://tiles.example.com/dicomWeb/studies/1.2.3/series/4.5.6";

/// Exchanger that always issues `TEST_TOKEN` valid for an hour
#[derive(Default)]
pub struct StaticExchanger {
    pub calls: AtomicUsize,
}

#[async_trait]
impl TokenExchanger for StaticExchanger {
    async fn exchange(&self) -> Result<IssuedToken> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(IssuedToken {
            token: BearerToken::new(TEST_TOKEN),
            expires_in: Some(Duration::from_secs(3600)),
        })
    }
}

pub fn test_config(
    predict_server_url: Option<String>,
    tile_server_url: Option<String>,
    cache_dir: &Path,
) -> GatewayConfig {
    GatewayConfig {
        predict_server_url,
        tile_server_url,
        cache_dir: cache_dir.display().to_string(),
        request_timeout_secs: 30,
        upstream_timeout_secs: 10,
        ..Default::default()
    }
}

pub async fn build_gateway(config: GatewayConfig) -> Arc<EmbeddingGateway> {
    let metrics = Arc::new(GatewayMetrics::new().unwrap());
    let credentials = Arc::new(
        CredentialManager::new(Arc::new(StaticExchanger::default())).with_metrics(metrics.clone()),
    );
    let cache = Arc::new(
        EmbeddingCache::open(&config.cache_dir, config.cache_size_limit_bytes)
            .await
            .unwrap(),
    );
    Arc::new(EmbeddingGateway::new(config, credentials, cache, metrics).unwrap())
}

/// Gateway wired to `server` for predictions and to `TILE_SERVER` for path rewriting
pub async fn predict_gateway(server: &MockServer, cache_dir: &Path) -> Arc<EmbeddingGateway> {
    build_gateway(test_config(
        Some(format!("{}/predict", server.uri())),
        Some(TILE_SERVER.to_string()),
        cache_dir,
    ))
    .await
}

pub async fn send(
    gateway: &Arc<EmbeddingGateway>,
    method: &str,
    uri: &str,
    body: Vec<u8>,
) -> (StatusCode, HeaderMap, Bytes) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Full::new(Bytes::from(body)))
        .unwrap();
    let response = server::handle_request(gateway.clone(), request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, body)
}

pub fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut decoded = Vec::new();
    GzDecoder::new(data).read_to_end(&mut decoded).unwrap();
    decoded
}

/// POST a JSON body to `/predict`, returning the status and decoded JSON
pub async fn post_predict(gateway: &Arc<EmbeddingGateway>, body: &Value) -> (StatusCode, Value) {
    let (status, headers, bytes) =
        send(gateway, "POST", "/predict", serde_json::to_vec(body).unwrap()).await;
    let is_gzip = headers
        .get("content-encoding")
        .is_some_and(|value| value == "gzip");
    let raw = if is_gzip { gunzip(&bytes) } else { bytes.to_vec() };
    (status, serde_json::from_slice(&raw).unwrap())
}

pub fn predict_body(series_path: &str, patches: &[(i64, i64)]) -> Value {
    json!({
        "instances": [{
            "dicom_path": {"series_path": series_path},
            "patch_coordinates": patches
                .iter()
                .map(|(x, y)| json!({"x_origin": x, "y_origin": y, "width": 224, "height": 224}))
                .collect::<Vec<_>>()
        }]
    })
}

/// Vector the stub predictor returns for a patch
pub fn computed_vector(x: i64, y: i64) -> Vec<f64> {
    vec![x as f64, y as f64, 1.0]
}

/// Vector seeded into the cache for a patch, distinguishable from `computed_vector`
pub fn cached_vector(x: i64, y: i64) -> Vec<f64> {
    vec![x as f64, y as f64, 0.0]
}

pub async fn seed_cache(gateway: &EmbeddingGateway, series_path: &str, x: i64, y: i64) {
    let key = CacheKey::new(series_path, &PatchCoordinate::at(x, y)).unwrap();
    gateway.cache().set(&key, &cached_vector(x, y)).await.unwrap();
}

pub async fn cached(gateway: &EmbeddingGateway, series_path: &str, x: i64, y: i64) -> Option<Vec<f64>> {
    let key = CacheKey::new(series_path, &PatchCoordinate::at(x, y)).unwrap();
    gateway.cache().get(&key).await.unwrap()
}

/// Embedding vectors of one instance of a `/predict` response
pub fn embeddings_of(response: &Value, instance: usize) -> Vec<Vec<f64>> {
    response["predictions"][instance]["result"]["patch_embeddings"]
        .as_array()
        .unwrap()
        .iter()
        .map(|embedding| serde_json::from_value(embedding["embedding_vector"].clone()).unwrap())
        .collect()
}

/// Predictor answer for the patches in a forwarded request body
pub fn echo_predictions(request_body: &[u8]) -> Value {
    let body: Value = serde_json::from_slice(request_body).unwrap();
    let patches = body["instances"][0]["patch_coordinates"]
        .as_array()
        .cloned()
        .unwrap_or_default();
    let embeddings: Vec<Value> = patches
        .iter()
        .map(|patch| {
            let x = patch["x_origin"].as_i64().unwrap();
            let y = patch["y_origin"].as_i64().unwrap();
            json!({"patch_coordinate": patch, "embedding_vector": computed_vector(x, y)})
        })
        .collect();
    json!({"predictions": [{"result": {"patch_embeddings": embeddings}}]})
}

/// Mount a predictor that embeds whatever it is sent, expecting `calls` calls
pub async fn mount_echo_predictor(server: &MockServer, calls: u64) {
    Mock::given(method("POST"))
        .and(path("/predict"))
        .and(header("authorization", TEST_AUTHORIZATION))
        .respond_with(|req: &wiremock::Request| {
            ResponseTemplate::new(200).set_body_json(echo_predictions(&req.body))
        })
        .expect(calls)
        .mount(server)
        .await;
}

/// Bodies of every request the mock server received, as JSON
pub async fn received_bodies(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|req| serde_json::from_slice(&req.body).unwrap())
        .collect()
}
