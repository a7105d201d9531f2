//! Credential resolution for registry hosts
//!
//! An [`Authenticator`] routes each registry host to one configured
//! [`CredentialProvider`]: static basic auth, a static bearer token, or a
//! short-lived token exchanged from a cloud workload identity or an OIDC
//! token. Which mechanism is in use is hidden from callers.
//!
//! Resolved credentials are cached in memory per host with their expiry and
//! refreshed proactively when fewer than the configured safety margin of
//! validity remains, so a credential never lapses mid-request. Credential
//! values are never logged, never persisted, and redacted from `Debug`
//! output.

use crate::error::{DistributionError, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Opaque bearer/basic material plus an expiry hint. Held only in memory.
#[derive(Clone)]
pub struct AuthCredential {
    header: String,
    expires_at: Option<Instant>,
}

impl AuthCredential {
    pub fn basic(username: &str, password: &str) -> Self {
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
        Self {
            header: format!("Basic {encoded}"),
            expires_at: None,
        }
    }

    pub fn bearer(token: &str, expires_in: Option<Duration>) -> Self {
        Self {
            header: format!("Bearer {token}"),
            expires_at: expires_in.map(|d| Instant::now() + d),
        }
    }

    /// Value for the `Authorization` header.
    pub fn header_value(&self) -> &str {
        &self.header
    }

    /// Whether remaining validity is below the refresh safety margin.
    /// Credentials without an expiry hint never need refresh.
    pub fn needs_refresh(&self, margin: Duration) -> bool {
        match self.expires_at {
            Some(at) => at.saturating_duration_since(Instant::now()) < margin,
            None => false,
        }
    }
}

impl fmt::Debug for AuthCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthCredential")
            .field("header", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// One identity mechanism capable of producing a credential for a host.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<AuthCredential>;

    /// Mechanism name used in error messages and logs. Never includes
    /// credential material.
    fn mechanism(&self) -> &'static str;
}

/// Static username/password supplied directly.
pub struct BasicProvider {
    username: String,
    password: String,
}

impl BasicProvider {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for BasicProvider {
    async fn resolve(&self, _host: &str) -> Result<AuthCredential> {
        Ok(AuthCredential::basic(&self.username, &self.password))
    }

    fn mechanism(&self) -> &'static str {
        "basic"
    }
}

/// Static bearer token supplied directly.
pub struct BearerProvider {
    token: String,
}

impl BearerProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for BearerProvider {
    async fn resolve(&self, _host: &str) -> Result<AuthCredential> {
        Ok(AuthCredential::bearer(&self.token, None))
    }

    fn mechanism(&self) -> &'static str {
        "bearer"
    }
}

/// Token endpoint response. Some issuers return `token`, others
/// `access_token`.
#[derive(Debug, Deserialize)]
struct TokenExchangeResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
}

async fn exchange_token(
    http: &reqwest::Client,
    mechanism: &'static str,
    host: &str,
    endpoint: &str,
    form: &[(&str, &str)],
) -> Result<AuthCredential> {
    let response = http
        .post(endpoint)
        .form(form)
        .send()
        .await
        .map_err(|_| DistributionError::AuthExpired {
            host: host.to_string(),
            mechanism: mechanism.to_string(),
        })?;

    if !response.status().is_success() {
        return Err(DistributionError::Authentication {
            host: host.to_string(),
            mechanism: mechanism.to_string(),
        });
    }

    let body: TokenExchangeResponse =
        response
            .json()
            .await
            .map_err(|_| DistributionError::Authentication {
                host: host.to_string(),
                mechanism: mechanism.to_string(),
            })?;

    let token = body
        .token
        .or(body.access_token)
        .ok_or_else(|| DistributionError::Authentication {
            host: host.to_string(),
            mechanism: mechanism.to_string(),
        })?;

    debug!(host, mechanism, "exchanged identity token for registry credential");
    Ok(AuthCredential::bearer(
        &token,
        body.expires_in.map(Duration::from_secs),
    ))
}

/// Cloud-workload identity: exchanges an ambient platform identity token
/// (projected into a file, IAM-role-for-service-account style) for a
/// short-lived registry bearer token.
pub struct WorkloadIdentityProvider {
    token_file: PathBuf,
    exchange_endpoint: String,
    audience: String,
    http: reqwest::Client,
}

impl WorkloadIdentityProvider {
    pub fn new(
        token_file: impl Into<PathBuf>,
        exchange_endpoint: impl Into<String>,
        audience: impl Into<String>,
    ) -> Self {
        Self {
            token_file: token_file.into(),
            exchange_endpoint: exchange_endpoint.into(),
            audience: audience.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CredentialProvider for WorkloadIdentityProvider {
    async fn resolve(&self, host: &str) -> Result<AuthCredential> {
        let identity = tokio::fs::read_to_string(&self.token_file)
            .await
            .map_err(|_| DistributionError::Authentication {
                host: host.to_string(),
                mechanism: self.mechanism().to_string(),
            })?;
        let identity = identity.trim();

        exchange_token(
            &self.http,
            self.mechanism(),
            host,
            &self.exchange_endpoint,
            &[
                ("grant_type", "urn:ietf:params:oauth:grant-type:token-exchange"),
                ("subject_token", identity),
                ("audience", &self.audience),
            ],
        )
        .await
    }

    fn mechanism(&self) -> &'static str {
        "workload-identity"
    }
}

/// OIDC/keyless: exchanges an externally supplied OIDC token for registry
/// access at the issuer's token endpoint.
pub struct OidcProvider {
    token_endpoint: String,
    client_id: String,
    subject_token: String,
    http: reqwest::Client,
}

impl OidcProvider {
    pub fn new(
        token_endpoint: impl Into<String>,
        client_id: impl Into<String>,
        subject_token: impl Into<String>,
    ) -> Self {
        Self {
            token_endpoint: token_endpoint.into(),
            client_id: client_id.into(),
            subject_token: subject_token.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CredentialProvider for OidcProvider {
    async fn resolve(&self, host: &str) -> Result<AuthCredential> {
        exchange_token(
            &self.http,
            self.mechanism(),
            host,
            &self.token_endpoint,
            &[
                ("grant_type", "urn:ietf:params:oauth:grant-type:token-exchange"),
                ("client_id", &self.client_id),
                ("subject_token", &self.subject_token),
            ],
        )
        .await
    }

    fn mechanism(&self) -> &'static str {
        "oidc"
    }
}

/// Per-host provider routing plus the in-memory credential cache.
///
/// Providers are selected at construction time by configuration, never by
/// runtime type inspection. The cache is process-local; each client
/// instance resolves its own credentials.
pub struct Authenticator {
    providers: HashMap<String, Arc<dyn CredentialProvider>>,
    fallback: Option<Arc<dyn CredentialProvider>>,
    cache: Mutex<HashMap<String, AuthCredential>>,
    refresh_margin: Duration,
}

/// Default safety margin before expiry at which a cached credential is
/// refreshed rather than reused.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(60);

impl Authenticator {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            fallback: None,
            cache: Mutex::new(HashMap::new()),
            refresh_margin: DEFAULT_REFRESH_MARGIN,
        }
    }

    /// Override the refresh safety margin. When this authenticator is
    /// handed to an `ArtifactClient`, the client's configured margin takes
    /// precedence.
    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    /// Route `host` to `provider`.
    pub fn with_provider(
        mut self,
        host: impl Into<String>,
        provider: Arc<dyn CredentialProvider>,
    ) -> Self {
        self.providers.insert(host.into(), provider);
        self
    }

    /// Provider used for hosts with no explicit route.
    pub fn with_fallback(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.fallback = Some(provider);
        self
    }

    fn provider_for(&self, host: &str) -> Result<&Arc<dyn CredentialProvider>> {
        self.providers
            .get(host)
            .or(self.fallback.as_ref())
            .ok_or_else(|| DistributionError::Authentication {
                host: host.to_string(),
                mechanism: "none".to_string(),
            })
    }

    /// Produce a valid credential for `host`, from cache when fresh enough,
    /// refreshing transparently when the remaining lifetime is below the
    /// safety margin.
    pub async fn resolve_credential(&self, host: &str) -> Result<AuthCredential> {
        {
            let cache = self.cache.lock().expect("credential cache poisoned");
            if let Some(cred) = cache.get(host) {
                if !cred.needs_refresh(self.refresh_margin) {
                    return Ok(cred.clone());
                }
            }
        }

        let provider = self.provider_for(host)?;
        debug!(host, mechanism = provider.mechanism(), "resolving registry credential");
        let cred = provider.resolve(host).await?;

        let mut cache = self.cache.lock().expect("credential cache poisoned");
        cache.insert(host.to_string(), cred.clone());
        Ok(cred)
    }

    /// Drop the cached credential for `host`, forcing the next
    /// [`resolve_credential`] to hit the provider. Used after a 401.
    ///
    /// [`resolve_credential`]: Authenticator::resolve_credential
    pub fn invalidate(&self, host: &str) {
        let mut cache = self.cache.lock().expect("credential cache poisoned");
        cache.remove(host);
    }
}

impl Default for Authenticator {
    fn default() -> Self {
        Self::new()
    }
}
