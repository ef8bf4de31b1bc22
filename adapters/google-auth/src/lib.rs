//! google-auth — Google service-account credentials and OAuth2 access tokens.
//!
//! Purpose
//! - Parse a JSON service-account key as downloaded from the cloud console.
//! - Mint OAuth2 access tokens with the JWT-bearer grant: sign an RS256
//!   assertion with the key, exchange it at the key's `token_uri`.
//!
//! API
//! - `ServiceAccountKey::from_json(bytes)` → `Result<ServiceAccountKey, AuthError>`
//! - `TokenSource::new(key, scopes)` then `token().await` → `Result<AccessToken, AuthError>`
//!
//! Notes
//! - Tokens are cached inside the `TokenSource` until shortly before expiry,
//!   so one source should be kept for the lifetime of the app handle.
//! - The private key is never logged; `Debug` output redacts it.

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
pub const DATASTORE_SCOPE: &str = "https://www.googleapis.com/auth/datastore";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_TTL: Duration = Duration::from_secs(60 * 60);
// Refresh this long before the reported expiry.
const EXPIRY_SKEW: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed service account key: {0}")]
    MalformedKey(String),
    #[error("unsupported credentials type {0:?}, expected \"service_account\"")]
    UnsupportedKeyType(String),
    #[error("invalid private key")]
    InvalidPrivateKey,
    #[error("failed to sign token assertion")]
    Signing,
    #[error("token endpoint rejected the assertion ({status}): {message}")]
    TokenRejected { status: u16, message: String },
    #[error("invalid token response: {0}")]
    InvalidResponse(String),
    #[error("network error talking to token endpoint: {0}")]
    Network(String),
}

/// JSON service-account key.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    #[serde(rename = "type")]
    pub key_type: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub private_key_id: Option<String>,
    pub private_key: String,
    pub client_email: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    /// Parse and sanity-check a key. The private key itself is only parsed
    /// when building a [`TokenSource`].
    pub fn from_json(bytes: &[u8]) -> Result<Self, AuthError> {
        let key: ServiceAccountKey =
            serde_json::from_slice(bytes).map_err(|e| AuthError::MalformedKey(e.to_string()))?;
        if key.key_type != "service_account" {
            return Err(AuthError::UnsupportedKeyType(key.key_type));
        }
        if key.client_email.trim().is_empty() {
            return Err(AuthError::MalformedKey("empty client_email".into()));
        }
        Ok(key)
    }
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("key_type", &self.key_type)
            .field("project_id", &self.project_id)
            .field("private_key_id", &self.private_key_id)
            .field("private_key", &"<redacted>")
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .finish()
    }
}

/// Bearer token plus the moment it stops being valid.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: SystemTime,
}

impl AccessToken {
    fn is_fresh(&self, now: SystemTime) -> bool {
        self.expires_at > now + EXPIRY_SKEW
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AssertionClaims {
    iss: String,
    scope: String,
    aud: String,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Mints and caches access tokens for one service account.
pub struct TokenSource {
    key: ServiceAccountKey,
    signing_key: EncodingKey,
    scope: String,
    http: reqwest::Client,
    cache: Mutex<Option<AccessToken>>,
}

impl TokenSource {
    /// Build a source for `scopes`. Fails when the PEM private key does not parse.
    pub fn new(key: ServiceAccountKey, scopes: &[&str]) -> Result<Self, AuthError> {
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|_| AuthError::InvalidPrivateKey)?;
        Ok(Self {
            key,
            signing_key,
            scope: scopes.join(" "),
            http: reqwest::Client::new(),
            cache: Mutex::new(None),
        })
    }

    pub fn key(&self) -> &ServiceAccountKey {
        &self.key
    }

    /// Return a valid access token, minting a new one when the cached one is
    /// missing or about to expire.
    pub async fn token(&self) -> Result<AccessToken, AuthError> {
        // Check cache without holding the lock across the exchange.
        {
            let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(tok) = cache.as_ref().filter(|t| t.is_fresh(SystemTime::now())) {
                trace!("google-auth: using cached access token");
                return Ok(tok.clone());
            }
        }

        let fresh = self.mint().await?;
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        *cache = Some(fresh.clone());
        Ok(fresh)
    }

    /// Drop any cached token so the next call mints a new one.
    pub fn invalidate(&self) {
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        *cache = None;
    }

    async fn mint(&self) -> Result<AccessToken, AuthError> {
        let now = SystemTime::now();
        let assertion = self.signed_assertion(now)?;
        debug!(
            client_email = %self.key.client_email,
            token_uri = %self.key.token_uri,
            "google-auth: exchanging assertion for access token"
        );

        let resp = self
            .http
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;
        if !status.is_success() {
            let message = match serde_json::from_str::<TokenErrorBody>(&body) {
                Ok(b) => match b.error_description {
                    Some(desc) => format!("{}: {}", b.error, desc),
                    None => b.error,
                },
                Err(_) => body,
            };
            return Err(AuthError::TokenRejected {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
        let lifetime = parsed
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(ASSERTION_TTL);
        Ok(AccessToken {
            token: parsed.access_token,
            expires_at: now + lifetime,
        })
    }

    fn signed_assertion(&self, now: SystemTime) -> Result<String, AuthError> {
        let iat = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        let claims = AssertionClaims {
            iss: self.key.client_email.clone(),
            scope: self.scope.clone(),
            aud: self.key.token_uri.clone(),
            iat,
            exp: iat + ASSERTION_TTL.as_secs(),
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key.private_key_id.clone();
        encode(&header, &claims, &self.signing_key).map_err(|_| AuthError::Signing)
    }
}

impl fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSource")
            .field("key", &self.key)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}
