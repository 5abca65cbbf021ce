//! Service-account credential management
//!
//! The gateway authenticates to its upstreams with a short-lived bearer
//! token obtained by exchanging a signed JWT assertion at the key's token
//! endpoint. [`CredentialManager`] keeps the current token and refreshes it
//! on the request path whenever it has no known expiry or expires within
//! [`REFRESH_MARGIN`].
//!
//! Token values are wrapped in [`BearerToken`], whose `Debug` and `Display`
//! output is redacted, so they never reach logs through formatting.

use crate::error::{truncate_description, GatewayError, Result, MAX_ERROR_DESCRIPTION_LEN};
use crate::metrics::GatewayMetrics;
use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Environment variable holding the service-account key JSON
pub const SERVICE_ACCOUNT_KEY_ENV: &str = "SERVICE_ACC_KEY";

/// A token is refreshed once it is this close to expiring
pub const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

const ASSERTION_LIFETIME: Duration = Duration::from_secs(3600);
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

/// Opaque bearer token
pub struct BearerToken(Secret<String>);

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        BearerToken(Secret::new(token.into()))
    }

    /// Raw token value, for building outbound requests only
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl Clone for BearerToken {
    fn clone(&self) -> Self {
        BearerToken::new(self.expose())
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken([REDACTED])")
    }
}

impl fmt::Display for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Parsed service-account key
#[derive(Debug, Deserialize)]
pub struct ServiceAccountKey {
    #[serde(rename = "type")]
    pub key_type: String,
    pub client_email: String,
    pub private_key: Secret<String>,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl ServiceAccountKey {
    /// Read and parse the key from `SERVICE_ACC_KEY`
    pub fn from_env() -> Result<Self> {
        let raw = std::env::var(SERVICE_ACCOUNT_KEY_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                GatewayError::Credential(format!(
                    "environment variable {} is not set or is empty",
                    SERVICE_ACCOUNT_KEY_ENV
                ))
            })?;
        Self::from_json(&raw)
    }

    /// Parse a key from its JSON text
    pub fn from_json(raw: &str) -> Result<Self> {
        let key: ServiceAccountKey = serde_json::from_str(raw).map_err(|e| {
            GatewayError::Credential(format!("invalid service account key JSON: {}", e))
        })?;

        if key.key_type != "service_account" {
            return Err(GatewayError::Credential(format!(
                "unsupported credential type '{}', expected 'service_account'",
                key.key_type
            )));
        }
        if key.client_email.trim().is_empty() {
            return Err(GatewayError::Credential(
                "service account key has no client_email".to_string(),
            ));
        }

        Ok(key)
    }
}

/// Fresh token returned by a [`TokenExchanger`]
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: BearerToken,
    /// Lifetime reported by the issuer, if any
    pub expires_in: Option<Duration>,
}

/// Source of new bearer tokens
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange(&self) -> Result<IssuedToken>;
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Exchanges an RS256-signed assertion for an access token (RFC 7523)
pub struct ServiceAccountExchanger {
    client_email: String,
    key_id: Option<String>,
    token_uri: String,
    scope: String,
    encoding_key: EncodingKey,
    client: Client,
}

impl ServiceAccountExchanger {
    /// Build an exchanger from a parsed key
    ///
    /// Fails with a credential error if the private key is not a valid RSA
    /// PEM, so a bad key is caught at startup rather than on first use.
    pub fn new(key: ServiceAccountKey, scope: impl Into<String>, timeout: Duration) -> Result<Self> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.expose_secret().as_bytes())
            .map_err(|e| GatewayError::Credential(format!("invalid service account private key: {}", e)))?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(ServiceAccountExchanger {
            client_email: key.client_email,
            key_id: key.private_key_id,
            token_uri: key.token_uri,
            scope: scope.into(),
            encoding_key,
            client,
        })
    }

    fn assertion(&self, now: SystemTime) -> Result<String> {
        let iat = now
            .duration_since(UNIX_EPOCH)
            .map_err(|e| GatewayError::Internal(format!("system clock before epoch: {}", e)))?
            .as_secs();
        let claims = AssertionClaims {
            iss: &self.client_email,
            scope: &self.scope,
            aud: &self.token_uri,
            iat,
            exp: iat + ASSERTION_LIFETIME.as_secs(),
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key_id.clone();

        encode(&header, &claims, &self.encoding_key)
            .map_err(|e| GatewayError::Credential(format!("failed to sign assertion: {}", e)))
    }
}

#[async_trait]
impl TokenExchanger for ServiceAccountExchanger {
    async fn exchange(&self) -> Result<IssuedToken> {
        let assertion = self.assertion(SystemTime::now())?;

        let response = self
            .client
            .post(&self.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| GatewayError::Credential(format!("token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Credential(format!(
                "token endpoint returned {}: {}",
                status.as_u16(),
                truncate_description(&body, MAX_ERROR_DESCRIPTION_LEN)
            )));
        }

        let parsed: TokenResponse = response.json().await.map_err(|e| {
            GatewayError::Credential(format!("invalid token endpoint response: {}", e))
        })?;

        Ok(IssuedToken {
            token: BearerToken::new(parsed.access_token),
            expires_in: parsed.expires_in.map(Duration::from_secs),
        })
    }
}

/// Current token and its expiry
#[derive(Debug, Clone, Default)]
pub struct Credential {
    token: Option<BearerToken>,
    expiry: Option<SystemTime>,
}

impl Credential {
    pub fn new(token: BearerToken, expiry: Option<SystemTime>) -> Self {
        Credential {
            token: Some(token),
            expiry,
        }
    }

    pub fn expiry(&self) -> Option<SystemTime> {
        self.expiry
    }

    /// Whether a refresh is due at `now`
    ///
    /// True when there is no token, no known expiry, or at most
    /// [`REFRESH_MARGIN`] of validity left.
    pub fn needs_refresh(&self, now: SystemTime) -> bool {
        if self.token.is_none() {
            return true;
        }
        match self.expiry {
            None => true,
            Some(expiry) => now + REFRESH_MARGIN >= expiry,
        }
    }

    /// Whether the token is known to still be valid at `now`
    pub fn is_unexpired(&self, now: SystemTime) -> bool {
        self.token.is_some() && self.expiry.is_some_and(|expiry| expiry > now)
    }
}

/// Observable refresh state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Valid,
    NeedsRefresh,
    Refreshing,
}

/// Clears the refreshing flag when dropped, including on cancellation
struct RefreshingGuard<'a>(&'a AtomicBool);

impl<'a> RefreshingGuard<'a> {
    fn set(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        RefreshingGuard(flag)
    }
}

impl Drop for RefreshingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Holds the service credential and refreshes it on demand
///
/// Concurrent callers that find the token due for refresh serialize on a
/// single refresh; whoever comes second reuses the new token.
pub struct CredentialManager {
    exchanger: Arc<dyn TokenExchanger>,
    credential: RwLock<Credential>,
    refresh_lock: Mutex<()>,
    refreshing: AtomicBool,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl CredentialManager {
    pub fn new(exchanger: Arc<dyn TokenExchanger>) -> Self {
        Self::with_credential(exchanger, Credential::default())
    }

    /// Create a manager seeded with an existing credential
    pub fn with_credential(exchanger: Arc<dyn TokenExchanger>, credential: Credential) -> Self {
        CredentialManager {
            exchanger,
            credential: RwLock::new(credential),
            refresh_lock: Mutex::new(()),
            refreshing: AtomicBool::new(false),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn current(&self) -> Credential {
        self.credential
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn refresh_state(&self) -> RefreshState {
        if self.refreshing.load(Ordering::Acquire) {
            return RefreshState::Refreshing;
        }
        if self.current().needs_refresh(SystemTime::now()) {
            RefreshState::NeedsRefresh
        } else {
            RefreshState::Valid
        }
    }

    /// Return a usable token, refreshing first if one is due
    ///
    /// If the refresh fails but the current token has not yet expired, the
    /// current token is returned and the failure is only logged.
    pub async fn get_token(&self) -> Result<BearerToken> {
        let credential = self.current();
        if !credential.needs_refresh(SystemTime::now()) {
            if let Some(token) = &credential.token {
                return Ok(token.clone());
            }
        }

        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited
        let credential = self.current();
        if !credential.needs_refresh(SystemTime::now()) {
            if let Some(token) = &credential.token {
                return Ok(token.clone());
            }
        }

        match self.refresh().await {
            Ok(token) => Ok(token),
            Err(e) if credential.is_unexpired(SystemTime::now()) => {
                warn!("Credential refresh failed, using current token until expiry: {}", e);
                credential
                    .token
                    .ok_or_else(|| GatewayError::Credential("no token available".to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Unconditionally exchange for a new token
    pub async fn refresh(&self) -> Result<BearerToken> {
        let guard = RefreshingGuard::set(&self.refreshing);
        debug!("Refreshing service credential");
        let result = self.exchanger.exchange().await;
        drop(guard);

        if let Some(metrics) = &self.metrics {
            metrics.record_credential_refresh(result.is_ok());
        }

        let issued = result?;
        // An expiry past the representable range counts as unknown
        let expiry = issued
            .expires_in
            .and_then(|ttl| SystemTime::now().checked_add(ttl));
        info!(
            "Service credential refreshed, expires in {}",
            issued
                .expires_in
                .map(|ttl| format!("{}s", ttl.as_secs()))
                .unwrap_or_else(|| "unknown".to_string())
        );

        let token = issued.token;
        *self
            .credential
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Credential::new(token.clone(), expiry);
        Ok(token)
    }
}
