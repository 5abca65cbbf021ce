//! HTTP boundary of the gateway
//!
//! Routes:
//! - `POST /predict` - gzip JSON embeddings
//! - `GET <tile_route_prefix>...` - authenticated tile-server passthrough
//! - `GET /download_cache` - streamed zip of the embedding cache
//! - `GET /health`, `GET /stats`, `GET /metrics`
//!
//! This is the only place where [`GatewayError`] becomes an HTTP status.

use crate::archive;
use crate::error::{GatewayError, Result};
use crate::gateway::EmbeddingGateway;
use crate::response_assembler::encode_gzip_json;
use bytes::Bytes;
use http::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_DISPOSITION, CONTENT_ENCODING, CONTENT_TYPE,
};
use http::{Method, Request, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Body, Frame};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Display;
use std::io::{Seek, SeekFrom};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};

/// Response body type of every route
pub type GatewayBody = BoxBody<Bytes, std::io::Error>;

const ARCHIVE_CHUNK_SIZE: usize = 64 * 1024;

fn full(data: impl Into<Bytes>) -> GatewayBody {
    Full::new(data.into())
        .map_err(|never: Infallible| match never {})
        .boxed()
}

fn response_with(status: StatusCode, content_type: &'static str, data: impl Into<Bytes>) -> Response<GatewayBody> {
    let mut response = Response::new(full(data));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn json_error(status: StatusCode, message: &str) -> Response<GatewayBody> {
    let body = serde_json::json!({ "error": message });
    response_with(status, "application/json", body.to_string())
}

fn error_response(err: &GatewayError) -> Response<GatewayBody> {
    let status =
        StatusCode::from_u16(err.to_http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if err.is_client_error() {
        warn!("Rejected request: {}", err);
    } else {
        error!("Request failed with {}: {}", status.as_u16(), err);
    }
    json_error(status, &err.to_string())
}

fn route_label(path: &str, tile_prefix: &str) -> &'static str {
    match path {
        "/predict" => "predict",
        "/download_cache" => "download_cache",
        "/health" => "health",
        "/stats" => "stats",
        "/metrics" => "metrics",
        _ if path.starts_with(tile_prefix) => "tile",
        _ => "other",
    }
}

/// Handle one HTTP request
///
/// Applies the overall request timeout (504 when exceeded), translates
/// errors to JSON responses, adds the CORS header and records metrics.
pub async fn handle_request<B>(
    gateway: Arc<EmbeddingGateway>,
    req: Request<B>,
) -> std::result::Result<Response<GatewayBody>, Infallible>
where
    B: Body + Send,
    B::Error: Display,
{
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let route = route_label(&path, &gateway.config().tile_route_prefix);
    let timeout = gateway.config().request_timeout();

    let result = match tokio::time::timeout(timeout, route_request(&gateway, req)).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout(format!(
            "request exceeded {}s",
            timeout.as_secs()
        ))),
    };

    let mut response = result.unwrap_or_else(|e| error_response(&e));

    if let Some(origin) = &gateway.config().cors_origin {
        if let Ok(value) = HeaderValue::from_str(origin) {
            response
                .headers_mut()
                .insert(ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
    }

    let elapsed = started.elapsed();
    gateway
        .metrics()
        .record_request(route, response.status().as_u16(), elapsed);
    info!(
        "{} {} -> {} in {:?}",
        method,
        path,
        response.status().as_u16(),
        elapsed
    );
    Ok(response)
}

async fn route_request<B>(gateway: &EmbeddingGateway, req: Request<B>) -> Result<Response<GatewayBody>>
where
    B: Body,
    B::Error: Display,
{
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    let is_tile = path.starts_with(&gateway.config().tile_route_prefix);

    let allowed = match path.as_str() {
        "/predict" => Method::POST,
        "/download_cache" | "/health" | "/stats" | "/metrics" => Method::GET,
        _ if is_tile => Method::GET,
        _ => return Ok(json_error(StatusCode::NOT_FOUND, "not found")),
    };

    if method == Method::OPTIONS {
        return Ok(preflight_response(&allowed));
    }
    if method != allowed {
        return Ok(json_error(
            StatusCode::METHOD_NOT_ALLOWED,
            &format!("method {} not allowed on {}", method, path),
        ));
    }

    match path.as_str() {
        "/predict" => handle_predict(gateway, req).await,
        "/download_cache" => handle_download_cache(gateway).await,
        "/health" => Ok(response_with(StatusCode::OK, "text/plain", "Ok")),
        "/stats" => handle_stats(gateway),
        "/metrics" => handle_metrics(gateway),
        _ => handle_tile(gateway, req).await,
    }
}

fn preflight_response(allowed: &Method) -> Response<GatewayBody> {
    let mut response = Response::new(full(Bytes::new()));
    *response.status_mut() = StatusCode::NO_CONTENT;
    let headers = response.headers_mut();
    let methods = if *allowed == Method::POST {
        "POST, OPTIONS"
    } else {
        "GET, OPTIONS"
    };
    headers.insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static(methods));
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization"),
    );
    response
}

async fn read_body<B>(req: Request<B>) -> Result<Bytes>
where
    B: Body,
    B::Error: Display,
{
    req.into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| GatewayError::Validation(format!("failed to read request body: {}", e)))
}

async fn handle_predict<B>(gateway: &EmbeddingGateway, req: Request<B>) -> Result<Response<GatewayBody>>
where
    B: Body,
    B::Error: Display,
{
    let body = read_body(req).await?;
    let prediction = gateway.predict(&body).await?;
    let encoded = encode_gzip_json(&prediction)?;

    let mut response = response_with(StatusCode::OK, "application/json", encoded);
    response
        .headers_mut()
        .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    Ok(response)
}

async fn handle_tile<B>(gateway: &EmbeddingGateway, req: Request<B>) -> Result<Response<GatewayBody>>
where
    B: Body,
    B::Error: Display,
{
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let body = read_body(req).await?;

    let upstream = gateway.fetch_tile(&path, query.as_deref(), body).await?;

    let mut response = Response::new(full(upstream.body));
    *response.status_mut() = StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::OK);
    if let Some(value) = upstream
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
    {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    Ok(response)
}

fn handle_stats(gateway: &EmbeddingGateway) -> Result<Response<GatewayBody>> {
    let body = serde_json::to_vec(&gateway.stats())
        .map_err(|e| GatewayError::Internal(format!("failed to encode stats: {}", e)))?;
    Ok(response_with(StatusCode::OK, "application/json", body))
}

fn handle_metrics(gateway: &EmbeddingGateway) -> Result<Response<GatewayBody>> {
    let (content_type, body) = gateway
        .metrics()
        .render()
        .map_err(|e| GatewayError::Internal(format!("failed to render metrics: {}", e)))?;

    let mut response = Response::new(full(body));
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    Ok(response)
}

/// Zip the cache into an anonymous temp file, then stream it out in chunks
async fn handle_download_cache(gateway: &EmbeddingGateway) -> Result<Response<GatewayBody>> {
    let root = gateway.cache().root().to_path_buf();

    let file = tokio::task::spawn_blocking(move || -> Result<std::fs::File> {
        let mut file = tempfile::tempfile()?;
        archive::write_zip(&root, &mut file)?;
        file.seek(SeekFrom::Start(0))?;
        Ok(file)
    })
    .await
    .map_err(|e| GatewayError::Internal(format!("archive task failed: {}", e)))??;

    let (tx, rx) = mpsc::channel::<std::io::Result<Frame<Bytes>>>(8);
    tokio::spawn(async move {
        let mut file = tokio::fs::File::from_std(file);
        let mut buffer = vec![0u8; ARCHIVE_CHUNK_SIZE];
        loop {
            match file.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => {
                    let frame = Frame::data(Bytes::copy_from_slice(&buffer[..n]));
                    if tx.send(Ok(frame)).await.is_err() {
                        // Client went away
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });

    let mut response = Response::new(StreamBody::new(ReceiverStream::new(rx)).boxed());
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/zip"));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_static("attachment; filename=\"path-cache.zip\""),
    );
    info!("Streaming cache archive of {}", gateway.cache().root().display());
    Ok(response)
}

/// Accept connections until Ctrl-C
pub async fn serve(gateway: Arc<EmbeddingGateway>, listener: TcpListener) -> std::io::Result<()> {
    info!("Gateway listening on http://{}", listener.local_addr()?);

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, no longer accepting connections");
                return Ok(());
            }
        };

        let io = TokioIo::new(stream);
        let gateway = gateway.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| handle_request(gateway.clone(), req));
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                error!("Error serving connection from {}: {:?}", peer, err);
            }
        });
    }
}
