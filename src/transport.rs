//! Registry wire transport: OCI Distribution Spec v1.1 client calls
//!
//! [`RegistryTransport`] is the seam between the orchestrator and the wire:
//! one method per registry round-trip, each the unit wrapped by the
//! resilience layer. [`HttpTransport`] is the production implementation
//! over reqwest; tests drive the orchestrator through an in-memory mock.

use crate::auth::AuthCredential;
use crate::config::ClientConfig;
use crate::error::{DistributionError, Result};
use crate::manifest::Digest;
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// One page of a repository tag listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagPage {
    pub tags: Vec<String>,
    /// Whether another page should be requested (cursor: last tag of this
    /// page).
    pub more: bool,
}

/// Raw registry operations. Every call is a single network round-trip;
/// retries, circuit breaking and deadlines live above this trait.
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    /// Resolve a tag to the manifest digest it currently points at
    /// (HEAD, `Docker-Content-Digest`).
    async fn resolve_tag(
        &self,
        host: &str,
        repository: &str,
        tag: &str,
        cred: Option<&AuthCredential>,
    ) -> Result<Digest>;

    /// Fetch manifest bytes by tag or digest, together with the digest the
    /// registry reports for them.
    async fn fetch_manifest(
        &self,
        host: &str,
        repository: &str,
        reference: &str,
        cred: Option<&AuthCredential>,
    ) -> Result<(Vec<u8>, Digest)>;

    /// Upload a manifest under a tag or digest reference.
    async fn put_manifest(
        &self,
        host: &str,
        repository: &str,
        reference: &str,
        media_type: &str,
        data: Vec<u8>,
        cred: Option<&AuthCredential>,
    ) -> Result<()>;

    /// Existence check (HEAD) for a blob, used to skip redundant uploads.
    async fn blob_exists(
        &self,
        host: &str,
        repository: &str,
        digest: &Digest,
        cred: Option<&AuthCredential>,
    ) -> Result<bool>;

    async fn fetch_blob(
        &self,
        host: &str,
        repository: &str,
        digest: &Digest,
        cred: Option<&AuthCredential>,
    ) -> Result<Vec<u8>>;

    async fn put_blob(
        &self,
        host: &str,
        repository: &str,
        digest: &Digest,
        data: Vec<u8>,
        cred: Option<&AuthCredential>,
    ) -> Result<()>;

    /// One page of the tag listing (`n`/`last` cursor pagination).
    async fn list_tags_page(
        &self,
        host: &str,
        repository: &str,
        page_size: u32,
        last: Option<&str>,
        cred: Option<&AuthCredential>,
    ) -> Result<TagPage>;
}

#[derive(Debug, Deserialize)]
struct TagListBody {
    #[allow(dead_code)]
    name: Option<String>,
    tags: Option<Vec<String>>,
}

/// reqwest-backed transport speaking the `/v2/` API. Works against Harbor,
/// ECR, ACR, GAR and generic OCI-compliant registries.
pub struct HttpTransport {
    client: reqwest::Client,
    plain_http: bool,
}

impl HttpTransport {
    pub fn new(attempt_timeout: Duration, skip_tls: bool) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(attempt_timeout);
        if skip_tls {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|e| DistributionError::Network(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            plain_http: false,
        })
    }

    /// Build from a [`ClientConfig`], honoring its attempt timeout and
    /// `skip_tls` flag.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Self::new(config.attempt_timeout(), config.skip_tls)
    }

    /// Speak plain HTTP instead of HTTPS (local test registries).
    pub fn with_plain_http(mut self) -> Self {
        self.plain_http = true;
        self
    }

    fn base_url(&self, host: &str) -> String {
        let scheme = if self.plain_http { "http" } else { "https" };
        format!("{scheme}://{host}")
    }

    fn authorize(
        request: reqwest::RequestBuilder,
        cred: Option<&AuthCredential>,
    ) -> reqwest::RequestBuilder {
        match cred {
            Some(cred) => request.header(AUTHORIZATION, cred.header_value()),
            None => request,
        }
    }

    /// Map a non-success status onto the error taxonomy; `reference`
    /// names what was being addressed, for context.
    fn status_error(host: &str, reference: &str, status: StatusCode) -> DistributionError {
        match status {
            StatusCode::NOT_FOUND => DistributionError::ReferenceNotFound {
                reference: reference.to_string(),
            },
            StatusCode::UNAUTHORIZED => DistributionError::AuthExpired {
                host: host.to_string(),
                mechanism: "registry".to_string(),
            },
            StatusCode::FORBIDDEN => DistributionError::Authentication {
                host: host.to_string(),
                mechanism: "registry".to_string(),
            },
            StatusCode::TOO_MANY_REQUESTS => {
                DistributionError::Network(format!("rate limited by {host} (429)"))
            }
            s if s.is_server_error() => {
                DistributionError::Network(format!("{host} returned {s}"))
            }
            s => DistributionError::Registry(format!("{host} returned unexpected status {s}")),
        }
    }

    fn digest_header(response: &Response) -> Option<Digest> {
        response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Digest::parse(v).ok())
    }
}

#[async_trait]
impl RegistryTransport for HttpTransport {
    async fn resolve_tag(
        &self,
        host: &str,
        repository: &str,
        tag: &str,
        cred: Option<&AuthCredential>,
    ) -> Result<Digest> {
        let url = format!("{}/v2/{repository}/manifests/{tag}", self.base_url(host));
        let response = Self::authorize(self.client.head(&url), cred).send().await?;

        if !response.status().is_success() {
            return Err(Self::status_error(
                host,
                &format!("{host}/{repository}:{tag}"),
                response.status(),
            ));
        }

        Self::digest_header(&response).ok_or_else(|| {
            DistributionError::Registry(format!(
                "{host} did not report a digest for {repository}:{tag}"
            ))
        })
    }

    async fn fetch_manifest(
        &self,
        host: &str,
        repository: &str,
        reference: &str,
        cred: Option<&AuthCredential>,
    ) -> Result<(Vec<u8>, Digest)> {
        let url = format!(
            "{}/v2/{repository}/manifests/{reference}",
            self.base_url(host)
        );
        let response = Self::authorize(self.client.get(&url), cred)
            .header("Accept", crate::manifest::MANIFEST_MEDIA_TYPE)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::status_error(
                host,
                &format!("{host}/{repository}:{reference}"),
                response.status(),
            ));
        }

        let reported = Self::digest_header(&response);
        let body = response.bytes().await?.to_vec();
        let computed = Digest::from_bytes(&body);
        if let Some(reported) = reported {
            if reported != computed {
                return Err(DistributionError::DigestMismatch {
                    expected: reported.to_string(),
                    computed: computed.to_string(),
                });
            }
        }
        debug!(host, repository, reference, digest = %computed, "fetched manifest");
        Ok((body, computed))
    }

    async fn put_manifest(
        &self,
        host: &str,
        repository: &str,
        reference: &str,
        media_type: &str,
        data: Vec<u8>,
        cred: Option<&AuthCredential>,
    ) -> Result<()> {
        let url = format!(
            "{}/v2/{repository}/manifests/{reference}",
            self.base_url(host)
        );
        let response = Self::authorize(self.client.put(&url), cred)
            .header(CONTENT_TYPE, media_type)
            .body(data)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::status_error(
                host,
                &format!("{host}/{repository}:{reference}"),
                response.status(),
            ));
        }
        debug!(host, repository, reference, "uploaded manifest");
        Ok(())
    }

    async fn blob_exists(
        &self,
        host: &str,
        repository: &str,
        digest: &Digest,
        cred: Option<&AuthCredential>,
    ) -> Result<bool> {
        let url = format!("{}/v2/{repository}/blobs/{digest}", self.base_url(host));
        let response = Self::authorize(self.client.head(&url), cred).send().await?;

        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(Self::status_error(
                host,
                &format!("{host}/{repository}@{digest}"),
                s,
            )),
        }
    }

    async fn fetch_blob(
        &self,
        host: &str,
        repository: &str,
        digest: &Digest,
        cred: Option<&AuthCredential>,
    ) -> Result<Vec<u8>> {
        let url = format!("{}/v2/{repository}/blobs/{digest}", self.base_url(host));
        let response = Self::authorize(self.client.get(&url), cred).send().await?;

        if !response.status().is_success() {
            return Err(Self::status_error(
                host,
                &format!("{host}/{repository}@{digest}"),
                response.status(),
            ));
        }

        Ok(response.bytes().await?.to_vec())
    }

    async fn put_blob(
        &self,
        host: &str,
        repository: &str,
        digest: &Digest,
        data: Vec<u8>,
        cred: Option<&AuthCredential>,
    ) -> Result<()> {
        // Two-step monolithic upload: POST opens an upload session, the
        // returned Location takes the bytes via PUT with the digest query.
        let start_url = format!("{}/v2/{repository}/blobs/uploads/", self.base_url(host));
        let response = Self::authorize(self.client.post(&start_url), cred)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::status_error(
                host,
                &format!("{host}/{repository}@{digest}"),
                response.status(),
            ));
        }

        let location = response
            .headers()
            .get("Location")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                DistributionError::Registry(format!(
                    "{host} returned no Location header for blob upload"
                ))
            })?;
        // Location may be absolute or registry-relative; resolve it against
        // the base and append the digest as a query parameter either way.
        let mut upload_url = Url::parse(&self.base_url(host))?.join(location)?;
        upload_url
            .query_pairs_mut()
            .append_pair("digest", &digest.to_string());
        let response = Self::authorize(self.client.put(upload_url.as_str()), cred)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::status_error(
                host,
                &format!("{host}/{repository}@{digest}"),
                response.status(),
            ));
        }
        debug!(host, repository, %digest, "uploaded blob");
        Ok(())
    }

    async fn list_tags_page(
        &self,
        host: &str,
        repository: &str,
        page_size: u32,
        last: Option<&str>,
        cred: Option<&AuthCredential>,
    ) -> Result<TagPage> {
        let mut url = format!(
            "{}/v2/{repository}/tags/list?n={page_size}",
            self.base_url(host)
        );
        if let Some(last) = last {
            url.push_str(&format!("&last={last}"));
        }
        let response = Self::authorize(self.client.get(&url), cred).send().await?;

        if !response.status().is_success() {
            return Err(Self::status_error(
                host,
                &format!("{host}/{repository}"),
                response.status(),
            ));
        }

        let link_next = response
            .headers()
            .get(reqwest::header::LINK)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("rel=\"next\""));
        let body: TagListBody = response.json().await?;
        Ok(tag_page(body.tags.unwrap_or_default(), page_size, link_next))
    }
}

/// Registries may cap `n` below the requested page size (ECR does), so a
/// `Link: <...>; rel="next"` header is authoritative when present; the
/// full-page heuristic only applies when the registry sent no Link header.
fn tag_page(tags: Vec<String>, page_size: u32, link_next: Option<bool>) -> TagPage {
    let more = link_next.unwrap_or(tags.len() as u32 == page_size);
    TagPage { tags, more }
}
