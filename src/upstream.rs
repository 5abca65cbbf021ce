//! HTTP client for the prediction service and the tile server
//!
//! Every call carries the service bearer token and an explicit timeout.
//! Failures become [`GatewayError::Upstream`] with the token scrubbed from
//! the message and upstream error bodies cut to 1024 characters. Calls are
//! never retried.

use crate::credentials::BearerToken;
use crate::error::{truncate_description, GatewayError, Result, MAX_ERROR_DESCRIPTION_LEN};
use crate::metrics::GatewayMetrics;
use crate::models::{DicomPath, EmbeddingVector, PatchCoordinate};
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const PREDICT_SERVICE: &str = "predict";
pub const TILE_SERVICE: &str = "tile";

const REDACTED: &str = "[REDACTED]";

/// Body, status and content type of a passthrough response
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl RawResponse {
    pub fn size(&self) -> usize {
        self.body.len()
    }
}

#[derive(Serialize)]
struct OutboundRequest<'a> {
    instances: [OutboundInstance<'a>; 1],
}

#[derive(Serialize)]
struct OutboundInstance<'a> {
    dicom_path: &'a DicomPath,
    patch_coordinates: &'a [PatchCoordinate],
    bearer_token: &'a str,
    #[serde(skip_serializing_if = "Map::is_empty")]
    extensions: &'a Map<String, Value>,
}

#[derive(Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<RemotePrediction>,
}

#[derive(Deserialize)]
struct RemotePrediction {
    #[serde(default)]
    result: Option<RemoteResult>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct RemoteResult {
    patch_embeddings: Vec<RemoteEmbedding>,
}

#[derive(Deserialize)]
struct RemoteEmbedding {
    embedding_vector: EmbeddingVector,
}

/// Remove every occurrence of the token from `text`
pub fn redact(text: &str, token: &BearerToken) -> String {
    let secret = token.expose();
    if secret.is_empty() {
        return text.to_string();
    }
    text.replace(&format!("Bearer {}", secret), &format!("Bearer {}", REDACTED))
        .replace(secret, REDACTED)
}

/// Redact, then truncate, an upstream-supplied description
fn scrub(text: &str, token: &BearerToken) -> String {
    truncate_description(&redact(text, token), MAX_ERROR_DESCRIPTION_LEN)
}

/// Client for upstream services
pub struct UpstreamClient {
    http_client: Client,
    timeout: Duration,
    metrics: Arc<GatewayMetrics>,
}

impl UpstreamClient {
    /// Create a client whose every request is bounded by `timeout`
    pub fn new(timeout: Duration, metrics: Arc<GatewayMetrics>) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| GatewayError::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(UpstreamClient {
            http_client,
            timeout,
            metrics,
        })
    }

    /// Ask the prediction service for embeddings of `patches`
    ///
    /// # Arguments
    /// * `url` - Prediction endpoint
    /// * `patches` - Uncached patches, in submission order
    /// * `dicom_path` - Series with its internal (rewritten) path
    /// * `extensions` - Client extensions, forwarded untouched
    /// * `token` - Sent as the Authorization header and as `bearer_token`
    ///
    /// # Returns
    /// One embedding vector per returned patch, in the order received.
    /// Matching them to `patches` is left to the caller.
    pub async fn forward_inference(
        &self,
        url: &str,
        patches: &[PatchCoordinate],
        dicom_path: &DicomPath,
        extensions: &Map<String, Value>,
        token: &BearerToken,
    ) -> Result<Vec<EmbeddingVector>> {
        let body = OutboundRequest {
            instances: [OutboundInstance {
                dicom_path,
                patch_coordinates: patches,
                bearer_token: token.expose(),
                extensions,
            }],
        };

        debug!(
            "Forwarding {} patch(es) of {} to prediction service",
            patches.len(),
            dicom_path.series_path
        );

        let request = self
            .http_client
            .post(url)
            .bearer_auth(token.expose())
            .json(&body);
        let response = self.send(PREDICT_SERVICE, request, token).await?;

        let parsed: PredictResponse = response.json().await.map_err(|e| {
            GatewayError::upstream(
                PREDICT_SERVICE,
                scrub(&format!("invalid prediction response: {}", e), token),
            )
        })?;

        let prediction = match <[RemotePrediction; 1]>::try_from(parsed.predictions) {
            Ok([prediction]) => prediction,
            Err(predictions) => {
                return Err(GatewayError::upstream(
                    PREDICT_SERVICE,
                    format!("expected 1 prediction, got {}", predictions.len()),
                ))
            }
        };

        if let Some(error) = prediction.error {
            let description = error
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(GatewayError::upstream(
                PREDICT_SERVICE,
                scrub(&format!("prediction failed: {}", description), token),
            ));
        }

        let result = prediction.result.ok_or_else(|| {
            GatewayError::upstream(PREDICT_SERVICE, "prediction has no result")
        })?;

        Ok(result
            .patch_embeddings
            .into_iter()
            .map(|embedding| embedding.embedding_vector)
            .collect())
    }

    /// Fetch a resource from the tile server
    ///
    /// The query string and any request body are forwarded as-is.
    pub async fn forward_tile_fetch(
        &self,
        url: &str,
        token: &BearerToken,
        query: Option<&str>,
        body: Bytes,
    ) -> Result<RawResponse> {
        let target = match query {
            Some(query) if !query.is_empty() => format!("{}?{}", url, query),
            _ => url.to_string(),
        };

        let mut request = self.http_client.get(&target).bearer_auth(token.expose());
        if !body.is_empty() {
            request = request.body(body);
        }
        let response = self.send(TILE_SERVICE, request, token).await?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(|e| {
            GatewayError::upstream(
                TILE_SERVICE,
                scrub(&format!("failed to read tile response: {}", e), token),
            )
        })?;

        Ok(RawResponse {
            status,
            content_type,
            body,
        })
    }

    /// Send a request, turning transport failures and non-2xx answers into errors
    async fn send(
        &self,
        service: &'static str,
        request: RequestBuilder,
        token: &BearerToken,
    ) -> Result<Response> {
        let started = Instant::now();
        let result = request.send().await;
        let elapsed = started.elapsed();

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.metrics.record_upstream(service, false, elapsed);
                let message = if e.is_timeout() {
                    format!("request timed out after {}s", self.timeout.as_secs())
                } else {
                    format!("request failed: {}", e)
                };
                let message = scrub(&message, token);
                warn!("Upstream {} call failed: {}", service, message);
                return Err(GatewayError::upstream(service, message));
            }
        };

        let status = response.status();
        if !status.is_success() {
            self.metrics.record_upstream(service, false, elapsed);
            let body = response.text().await.unwrap_or_default();
            let message = scrub(&body, token);
            warn!(
                "Upstream {} returned {}: {}",
                service,
                status.as_u16(),
                message
            );
            return Err(GatewayError::upstream_status(service, status.as_u16(), message));
        }

        self.metrics.record_upstream(service, true, elapsed);
        debug!(
            "Upstream {} returned {} in {:?}",
            service,
            status.as_u16(),
            elapsed
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_removes_header_and_bare_token() {
        let token = BearerToken::new("ya29.abc");
        let text = "denied for Bearer ya29.abc (token ya29.abc)";
        let redacted = redact(text, &token);
        assert!(!redacted.contains("ya29.abc"));
        assert_eq!(redacted, "denied for Bearer [REDACTED] (token [REDACTED])");
    }

    #[test]
    fn test_redact_with_empty_token() {
        let token = BearerToken::new("");
        assert_eq!(redact("unchanged", &token), "unchanged");
    }

    #[test]
    fn test_scrub_truncates_after_redaction() {
        let token = BearerToken::new("secret");
        let long = format!("{}secret", "x".repeat(1020));
        let scrubbed = scrub(&long, &token);
        assert_eq!(scrubbed.chars().count(), MAX_ERROR_DESCRIPTION_LEN);
        assert!(!scrubbed.contains("secret"));
        assert!(!scrubbed.contains("secr"));
    }

    #[test]
    fn test_outbound_body_shape() {
        let dicom_path = DicomPath {
            series_path: "https://tiles/studies/1/series/2".to_string(),
            instance_uids: vec!["1.2.3".to_string()],
        };
        let patches = [PatchCoordinate::at(0, 0)];
        let extensions = Map::new();
        let body = OutboundRequest {
            instances: [OutboundInstance {
                dicom_path: &dicom_path,
                patch_coordinates: &patches,
                bearer_token: "t",
                extensions: &extensions,
            }],
        };

        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"instances": [{
                "dicom_path": {"series_path": "https://tiles/studies/1/series/2", "instance_uids": ["1.2.3"]},
                "patch_coordinates": [{"x_origin": 0, "y_origin": 0, "width": 224, "height": 224}],
                "bearer_token": "t"
            }]})
        );
    }
}
