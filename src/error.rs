//! Error types for the embedding gateway

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Error types that can occur in the gateway
///
/// Variants are translated to HTTP status codes only at the server boundary
/// (see [`GatewayError::to_http_status`]).
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    /// Client-caused: malformed body, disallowed fields, path-prefix mismatch
    #[error("Validation error: {0}")]
    Validation(String),

    /// Network failure or unusable answer from an upstream service
    #[error("Upstream {service} error{}: {message}", status_suffix(.status))]
    Upstream {
        service: &'static str,
        status: Option<u16>,
        message: String,
    },

    /// A required endpoint URL is not configured
    #[error("Server misconfiguration: {0}")]
    Misconfiguration(String),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (status {})", s)).unwrap_or_default()
}

/// Longest error description passed through from an upstream body
pub const MAX_ERROR_DESCRIPTION_LEN: usize = 1024;

/// Truncate `text` to at most `max` characters
pub fn truncate_description(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Io(err.to_string())
    }
}

impl GatewayError {
    /// Convert error to HTTP status code
    ///
    /// - Validation errors: 400
    /// - Upstream and request-time credential failures: 502
    /// - Overall request deadline: 504
    /// - Everything else: 500
    pub fn to_http_status(&self) -> u16 {
        match self {
            GatewayError::Validation(_) => 400,
            GatewayError::Upstream { .. } => 502,
            GatewayError::Credential(_) => 502,
            GatewayError::Timeout(_) => 504,
            GatewayError::Misconfiguration(_) => 500,
            GatewayError::Config(_) => 500,
            GatewayError::Cache(_) => 500,
            GatewayError::Io(_) => 500,
            GatewayError::Internal(_) => 500,
        }
    }

    /// Whether the error was caused by the client request
    pub fn is_client_error(&self) -> bool {
        matches!(self, GatewayError::Validation(_))
    }

    /// Create an upstream error for a non-2xx status
    pub fn upstream_status(service: &'static str, status: u16, message: impl Into<String>) -> Self {
        GatewayError::Upstream {
            service,
            status: Some(status),
            message: message.into(),
        }
    }

    /// Create an upstream error with no HTTP status (network failure, bad payload)
    pub fn upstream(service: &'static str, message: impl Into<String>) -> Self {
        GatewayError::Upstream {
            service,
            status: None,
            message: message.into(),
        }
    }
}
