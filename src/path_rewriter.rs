//! Series-path rewriting between public, route and internal URL spaces
//!
//! Clients reference images through the gateway's own public URL
//! (`{public_base_url}/tile-proxy/...`). Before a request reaches the
//! prediction service those references are rewritten to the internal tile
//! server (`{tile_server_url}/...`), which the predictor can reach directly.
//!
//! The rewrite is a leading-prefix substitution keyed on configuration.
//! Dot segments are rejected in both literal and percent-encoded form, and
//! the rewritten URL is parsed and normalized before it is accepted, so a
//! rewritten path can only ever point under the configured tile server.

use crate::error::{GatewayError, Result};
use reqwest::Url;

/// Replace a leading `public_prefix` with `internal_prefix`
///
/// Paths that do not start with `public_prefix` are returned unchanged.
/// Only the leading occurrence is ever substituted.
pub fn to_internal(path: &str, public_prefix: &str, internal_prefix: &str) -> String {
    match path.strip_prefix(public_prefix) {
        Some(rest) => format!("{}{}", internal_prefix, rest),
        None => path.to_string(),
    }
}

pub fn verify_prefix(path: &str, expected_prefix: &str) -> bool {
    path.starts_with(expected_prefix)
}

/// Whether any segment of `path` is a dot segment (`.` or `..`)
///
/// `%2e` in either case counts as a dot, and a backslash separates segments the
/// same way URL parsers treat it for http(s).
pub fn has_traversal(path: &str) -> bool {
    path.split(['/', '\\', '?', '#'])
        .map(decode_dots)
        .any(|segment| segment == "." || segment == "..")
}

fn decode_dots(segment: &str) -> String {
    segment.replace("%2e", ".").replace("%2E", ".")
}

/// Whether `candidate` normalizes to a URL under `base`
///
/// Both are parsed the way the HTTP client will parse them; scheme, host and
/// port must match and the normalized path must start with the base path.
pub fn is_under_base(candidate: &str, base: &str) -> bool {
    let (candidate, base) = match (Url::parse(candidate), Url::parse(base)) {
        (Ok(candidate), Ok(base)) => (candidate, base),
        _ => return false,
    };

    candidate.scheme() == base.scheme()
        && candidate.host_str() == base.host_str()
        && candidate.port_or_known_default() == base.port_or_known_default()
        && candidate.path().starts_with(base.path())
}

/// Rewrites client-supplied series paths and tile-proxy paths
#[derive(Debug, Clone)]
pub struct PathRewriter {
    public_prefix: String,
    route_prefix: String,
}

impl PathRewriter {
    /// # Arguments
    /// * `public_prefix` - Public URL of the tile proxy, e.g. `http://localhost:8080/tile-proxy/`
    /// * `route_prefix` - Route of the tile proxy on this server, e.g. `/tile-proxy/`
    pub fn new(public_prefix: impl Into<String>, route_prefix: impl Into<String>) -> Self {
        PathRewriter {
            public_prefix: public_prefix.into(),
            route_prefix: route_prefix.into(),
        }
    }

    pub fn route_prefix(&self) -> &str {
        &self.route_prefix
    }

    /// Rewrite a client series path to the internal tile-server URL
    ///
    /// # Logic
    /// 1. Public prefix → route prefix; the result must start with the route prefix
    /// 2. Reject dot segments after the prefix, including `%2e%2e`
    /// 3. Route prefix → `{tile_server_url}/`; the result must start with it,
    ///    both as a string and after URL normalization
    ///
    /// # Returns
    /// * `Err(GatewayError::Validation)` if either prefix check fails
    pub fn rewrite_series_path(&self, series_path: &str, tile_server_url: &str) -> Result<String> {
        let routed = to_internal(series_path, &self.public_prefix, &self.route_prefix);
        if !verify_prefix(&routed, &self.route_prefix) {
            return Err(GatewayError::Validation(format!(
                "series_path must start with '{}' or '{}'",
                self.public_prefix, self.route_prefix
            )));
        }

        self.to_tile_server(&routed, tile_server_url)
    }

    /// Map a tile-proxy request path (`/tile-proxy/<rest>`) to the tile server
    pub fn tile_url(&self, request_path: &str, tile_server_url: &str) -> Result<String> {
        if !verify_prefix(request_path, &self.route_prefix) {
            return Err(GatewayError::Validation(format!(
                "tile path must start with '{}'",
                self.route_prefix
            )));
        }

        self.to_tile_server(request_path, tile_server_url)
    }

    fn to_tile_server(&self, routed: &str, tile_server_url: &str) -> Result<String> {
        let rest = &routed[self.route_prefix.len()..];
        if has_traversal(rest) {
            return Err(GatewayError::Validation(
                "path must not contain '.' or '..' segments".to_string(),
            ));
        }

        let internal_prefix = format!("{}/", tile_server_url.trim_end_matches('/'));
        let internal = to_internal(routed, &self.route_prefix, &internal_prefix);
        if !verify_prefix(&internal, &internal_prefix) || !is_under_base(&internal, &internal_prefix) {
            return Err(GatewayError::Validation(format!(
                "rewritten path does not start with '{}'",
                internal_prefix
            )));
        }

        Ok(internal)
    }
}
