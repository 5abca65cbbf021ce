//! Configuration management for the embedding gateway

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Environment variable naming an optional YAML configuration file
pub const CONFIG_FILE_ENV: &str = "GATEWAY_CONFIG";

/// Configuration for the gateway
///
/// Upstream URLs are optional. When one is unset the gateway still starts
/// and the affected endpoint answers 500 at call time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    /// Address the HTTP server binds to (default: "0.0.0.0:8080")
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Number of runtime worker threads (default: 6)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Overall wall-clock budget for one request in seconds (default: 600)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Timeout for each upstream call in seconds (default: 300)
    /// Must be shorter than `request_timeout_secs`
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,

    /// Base URL of the internal tile (DICOMweb) server
    #[serde(default)]
    pub tile_server_url: Option<String>,

    /// Full URL of the prediction endpoint
    #[serde(default)]
    pub predict_server_url: Option<String>,

    /// Public base URL clients use to reach this gateway
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    /// Route prefix of the tile proxy (default: "/tile-proxy/")
    #[serde(default = "default_tile_route_prefix")]
    pub tile_route_prefix: String,

    /// Directory of the persistent embedding cache
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,

    /// Byte budget of the embedding cache (default: 45GB)
    #[serde(default = "default_cache_size_limit")]
    pub cache_size_limit_bytes: u64,

    /// Byte budget of the in-memory tile response cache, 0 disables it
    #[serde(default = "default_tile_cache_size")]
    pub tile_cache_size_bytes: usize,

    /// OAuth scope requested for the service credential
    #[serde(default = "default_credential_scope")]
    pub credential_scope: String,

    /// Origin allowed by CORS (optional)
    #[serde(default)]
    pub cors_origin: Option<String>,
}

// Default value functions for serde
fn default_listen_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_workers() -> usize {
    6
}

fn default_request_timeout() -> u64 {
    600
}

fn default_upstream_timeout() -> u64 {
    300
}

fn default_public_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_tile_route_prefix() -> String {
    "/tile-proxy/".to_string()
}

fn default_cache_dir() -> String {
    "./path-cache".to_string()
}

fn default_cache_size_limit() -> u64 {
    45_000_000_000 // 45GB
}

fn default_tile_cache_size() -> usize {
    256 * 1024 * 1024 // 256MB
}

fn default_credential_scope() -> String {
    "https://www.googleapis.com/auth/cloud-platform".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            listen_address: default_listen_address(),
            workers: default_workers(),
            request_timeout_secs: default_request_timeout(),
            upstream_timeout_secs: default_upstream_timeout(),
            tile_server_url: None,
            predict_server_url: None,
            public_base_url: default_public_base_url(),
            tile_route_prefix: default_tile_route_prefix(),
            cache_dir: default_cache_dir(),
            cache_size_limit_bytes: default_cache_size_limit(),
            tile_cache_size_bytes: default_tile_cache_size(),
            credential_scope: default_credential_scope(),
            cors_origin: None,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a YAML file
    ///
    /// # Returns
    /// * `Ok(GatewayConfig)` if loading and validation succeed
    /// * `Err(GatewayError)` if file cannot be read or config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            GatewayError::Config(format!("Failed to read config file: {}", e))
        })?;

        let config: GatewayConfig = serde_yaml::from_str(&content).map_err(|e| {
            GatewayError::Config(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the process environment
    ///
    /// Starts from the YAML file named by `GATEWAY_CONFIG` (or defaults) and
    /// applies environment overrides on top.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(CONFIG_FILE_ENV) {
            Some(path) if !path.is_empty() => Self::from_file(path)?,
            _ => GatewayConfig::default(),
        };
        config.apply_overrides(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides<F>(&mut self, lookup: &F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty("TILE_SERVER_URL").or_else(|| non_empty("DICOM_SERVER_URL")) {
            self.tile_server_url = Some(url);
        }
        if let Some(url) = non_empty("PREDICT_ENDPOINT_URL") {
            self.predict_server_url = Some(url);
        }
        if let Some(addr) = non_empty("LISTEN_ADDRESS") {
            self.listen_address = addr;
        }
        if let Some(dir) = non_empty("CACHE_DIR") {
            self.cache_dir = dir;
        }
        if let Some(limit) = non_empty("CACHE_SIZE_LIMIT_BYTES") {
            self.cache_size_limit_bytes = parse_number("CACHE_SIZE_LIMIT_BYTES", &limit)?;
        }
        if let Some(workers) = non_empty("GATEWAY_WORKERS") {
            self.workers = parse_number("GATEWAY_WORKERS", &workers)?;
        }
        if let Some(url) = non_empty("PUBLIC_BASE_URL") {
            self.public_base_url = url;
        }
        if let Some(origin) = non_empty("CORS_ORIGIN") {
            self.cors_origin = Some(origin);
        }
        Ok(())
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - workers must be > 0
    /// - both timeouts must be > 0
    /// - upstream_timeout_secs must be shorter than request_timeout_secs
    /// - cache_size_limit_bytes must be > 0
    /// - tile_route_prefix must start and end with '/'
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(GatewayError::Config(
                "workers must be greater than 0".to_string(),
            ));
        }

        if self.request_timeout_secs == 0 || self.upstream_timeout_secs == 0 {
            return Err(GatewayError::Config(
                "request_timeout_secs and upstream_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.upstream_timeout_secs >= self.request_timeout_secs {
            return Err(GatewayError::Config(format!(
                "upstream_timeout_secs ({}) must be shorter than request_timeout_secs ({})",
                self.upstream_timeout_secs, self.request_timeout_secs
            )));
        }

        if self.cache_size_limit_bytes == 0 {
            return Err(GatewayError::Config(
                "cache_size_limit_bytes must be greater than 0".to_string(),
            ));
        }

        if !self.tile_route_prefix.starts_with('/') || !self.tile_route_prefix.ends_with('/') {
            return Err(GatewayError::Config(format!(
                "tile_route_prefix must start and end with '/', got '{}'",
                self.tile_route_prefix
            )));
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    /// Public URL prefix that maps onto the tile proxy route
    pub fn public_tile_prefix(&self) -> String {
        format!(
            "{}{}",
            self.public_base_url.trim_end_matches('/'),
            self.tile_route_prefix
        )
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse::<T>().map_err(|_| {
        GatewayError::Config(format!("{} must be a number, got '{}'", key, value))
    })
}
