//! Credentials
//!
//! Every request to the store carries the headers of a fresh credential.
//! Providers hand out a credential per request; caching and refresh are the
//! provider's concern.

use crate::sink::transport::{HttpRequest, HttpTransport, Method};
use parking_lot::Mutex;
use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Metadata server endpoint for the default service account token
pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
/// Scope granting read/write access to objects
pub const STORAGE_READ_WRITE_SCOPE: &str =
    "https://www.googleapis.com/auth/devstorage.read_write";
/// Tokens are refreshed this long before they expire
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("credential source unavailable: {0}")]
    Unavailable(String),
    #[error("malformed credential response: {0}")]
    Malformed(String),
}

/// Request headers proving the caller's identity
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    headers: Vec<(String, String)>,
}

impl Credential {
    /// `Authorization: Bearer <token>`
    pub fn bearer(token: impl Into<String>) -> Self {
        let token = token.into();
        Credential {
            headers: vec![("Authorization".to_string(), format!("Bearer {}", token))],
            token,
        }
    }

    /// Add a header sent alongside the authorization (e.g. a quota project)
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn request_headers(&self) -> &[(String, String)] {
        &self.headers
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("headers", &self.headers.len())
            .finish()
    }
}

/// Source of request credentials
pub trait CredentialProvider: Send + Sync + 'static {
    fn credential<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<Credential, CredentialError>> + Send + 'a>>;
}

/// A fixed credential (tests, tokens minted out of band)
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    credential: Credential,
}

impl StaticCredentials {
    pub fn new(credential: Credential) -> Self {
        StaticCredentials { credential }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        StaticCredentials::new(Credential::bearer(token))
    }
}

impl CredentialProvider for StaticCredentials {
    fn credential<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<Credential, CredentialError>> + Send + 'a>> {
        let credential = self.credential.clone();
        Box::pin(async move { Ok(credential) })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
    #[serde(default)]
    token_type: Option<String>,
}

struct CachedToken {
    credential: Credential,
    refresh_at: Instant,
}

/// Tokens from the compute metadata server, cached until shortly before expiry
pub struct MetadataServerCredentials {
    transport: Arc<dyn HttpTransport>,
    token_url: Url,
    cached: Mutex<Option<CachedToken>>,
}

impl MetadataServerCredentials {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Result<Self, CredentialError> {
        Self::with_token_url(transport, METADATA_TOKEN_URL)
    }

    /// Use a different token endpoint (emulators, tests)
    pub fn with_token_url(
        transport: Arc<dyn HttpTransport>,
        token_url: &str,
    ) -> Result<Self, CredentialError> {
        let mut token_url = Url::parse(token_url)
            .map_err(|e| CredentialError::Unavailable(format!("bad token URL: {}", e)))?;
        token_url
            .query_pairs_mut()
            .append_pair("scopes", STORAGE_READ_WRITE_SCOPE);
        Ok(MetadataServerCredentials {
            transport,
            token_url,
            cached: Mutex::new(None),
        })
    }

    fn cached_credential(&self) -> Option<Credential> {
        let cached = self.cached.lock();
        cached
            .as_ref()
            .filter(|token| Instant::now() < token.refresh_at)
            .map(|token| token.credential.clone())
    }

    async fn fetch(&self) -> Result<Credential, CredentialError> {
        let request = HttpRequest::new(Method::Get, self.token_url.clone())
            .header("Metadata-Flavor", "Google");
        let response = self
            .transport
            .execute(request)
            .await
            .map_err(|e| CredentialError::Unavailable(e.to_string()))?;
        if !response.is_success() {
            return Err(CredentialError::Unavailable(format!(
                "metadata server returned HTTP {}: {}",
                response.status,
                response.body_text()
            )));
        }

        let token: TokenResponse = serde_json::from_slice(&response.body)
            .map_err(|e| CredentialError::Malformed(e.to_string()))?;
        if let Some(kind) = token.token_type.as_deref() {
            if !kind.eq_ignore_ascii_case("bearer") {
                return Err(CredentialError::Malformed(format!(
                    "unsupported token type '{}'",
                    kind
                )));
            }
        }

        let lifetime = Duration::from_secs(token.expires_in);
        let credential = Credential::bearer(token.access_token);
        *self.cached.lock() = Some(CachedToken {
            credential: credential.clone(),
            refresh_at: Instant::now() + lifetime.saturating_sub(REFRESH_MARGIN),
        });
        debug!(expires_in_secs = token.expires_in, "Fetched access token from metadata server");
        Ok(credential)
    }
}

impl CredentialProvider for MetadataServerCredentials {
    fn credential<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<Credential, CredentialError>> + Send + 'a>> {
        Box::pin(async move {
            if let Some(credential) = self.cached_credential() {
                return Ok(credential);
            }
            self.fetch().await
        })
    }
}
