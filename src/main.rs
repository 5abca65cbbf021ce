//! Patch Embedding Gateway Server
//!
//! Loads configuration and the service-account credential, performs the
//! initial token exchange, opens the embedding cache and serves HTTP until
//! Ctrl-C. Any startup failure exits with status 1.

use anyhow::Context;
use patch_embedding_gateway::server;
use patch_embedding_gateway::{
    CredentialManager, EmbeddingCache, EmbeddingGateway, GatewayConfig, GatewayMetrics,
    ServiceAccountExchanger, ServiceAccountKey,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// # Usage
/// ```bash
/// SERVICE_ACC_KEY="$(cat key.json)" \
/// DICOM_SERVER_URL=https://tiles.example.com/dicomWeb \
/// PREDICT_ENDPOINT_URL=https://predict.example.com/v1/predict \
/// patch-embedding-gateway
/// ```
fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting Patch Embedding Gateway");

    let config = match GatewayConfig::from_env() {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            info!("  - Listen address: {}", cfg.listen_address);
            info!("  - Workers: {}", cfg.workers);
            info!("  - Cache dir: {} (limit {} bytes)", cfg.cache_dir, cfg.cache_size_limit_bytes);
            info!(
                "  - Tile server: {}",
                cfg.tile_server_url.as_deref().unwrap_or("<unset>")
            );
            info!(
                "  - Prediction endpoint: {}",
                cfg.predict_server_url.as_deref().unwrap_or("<unset>")
            );
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let key = match ServiceAccountKey::from_env() {
        Ok(key) => key,
        Err(e) => {
            error!("Failed to load service account credentials: {}", e);
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.workers)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(config, key)) {
        error!("Gateway stopped with error: {:#}", e);
        std::process::exit(1);
    }

    info!("Gateway shut down");
}

async fn run(config: GatewayConfig, key: ServiceAccountKey) -> anyhow::Result<()> {
    let metrics = Arc::new(GatewayMetrics::new().context("failed to register metrics")?);

    let exchanger = ServiceAccountExchanger::new(
        key,
        config.credential_scope.clone(),
        config.upstream_timeout(),
    )?;
    let credentials = Arc::new(CredentialManager::new(Arc::new(exchanger)).with_metrics(metrics.clone()));
    credentials
        .refresh()
        .await
        .context("initial credential exchange failed")?;

    let cache = Arc::new(
        EmbeddingCache::open(&config.cache_dir, config.cache_size_limit_bytes)
            .await
            .context("failed to open embedding cache")?,
    );

    let listener = TcpListener::bind(&config.listen_address)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_address))?;

    let gateway = Arc::new(EmbeddingGateway::new(config, credentials, cache, metrics)?);
    server::serve(gateway, listener).await?;
    Ok(())
}
