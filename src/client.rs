//! The public push/pull/inspect/list surface
//!
//! [`ArtifactClient`] composes the manifest model, authentication, local
//! cache, resilience layer and wire transport, and owns the end-to-end
//! consistency guarantees: digest verification on every fetched byte,
//! write-through caching, in-process de-duplication of concurrent pulls,
//! a per-operation deadline, and one credential refresh on a 401 before
//! giving up.

use crate::auth::{AuthCredential, Authenticator};
use crate::cache::BlobCache;
use crate::config::{CacheConfig, ClientConfig};
use crate::error::{DistributionError, Result};
use crate::manifest::{
    ANNOTATION_CREATED, ANNOTATION_TOOL, ArtifactConfig, ArtifactManifest, Digest,
    LayerDescriptor, MANIFEST_MEDIA_TYPE,
};
use crate::reference::{ReferenceKind, RegistryReference};
use crate::resilience::{BreakerRegistry, retry_with_backoff};
use crate::transport::RegistryTransport;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// The raw artifact payload handed over by the compilation pipeline: one
/// or more byte parts, each becoming a content layer, plus caller
/// annotations. Digests are computed here, never supplied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPayload {
    parts: Vec<Vec<u8>>,
    annotations: BTreeMap<String, String>,
}

impl ArtifactPayload {
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self {
            parts: vec![data.into()],
            annotations: BTreeMap::new(),
        }
    }

    pub fn from_parts(parts: Vec<Vec<u8>>) -> Self {
        Self {
            parts,
            annotations: BTreeMap::new(),
        }
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }
}

/// A tag together with the manifest digest it pointed at when listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTag {
    pub reference: RegistryReference,
    pub digest: Digest,
}

pub struct ArtifactClientBuilder {
    transport: Arc<dyn RegistryTransport>,
    authenticator: Authenticator,
    cache: Option<CacheConfig>,
    config: ClientConfig,
}

impl ArtifactClientBuilder {
    pub fn new(transport: Arc<dyn RegistryTransport>, authenticator: Authenticator) -> Self {
        Self {
            transport,
            authenticator,
            cache: None,
            config: ClientConfig::default(),
        }
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<ArtifactClient> {
        let cache = match self.cache {
            Some(config) => Some(BlobCache::new(&config)?),
            None => None,
        };
        Ok(ArtifactClient {
            transport: self.transport,
            // The client's configured margin is authoritative.
            auth: self
                .authenticator
                .with_refresh_margin(self.config.refresh_margin()),
            cache,
            breakers: BreakerRegistry::new(self.config.breaker.clone()),
            inflight: Mutex::new(HashMap::new()),
            config: self.config,
        })
    }
}

/// Artifact distribution client. Cheap to share behind an `Arc`; all
/// operations take `&self` and operations on different digests run fully
/// in parallel.
pub struct ArtifactClient {
    transport: Arc<dyn RegistryTransport>,
    auth: Authenticator,
    cache: Option<BlobCache>,
    /// Per-host breaker state, shared by every operation of this instance.
    breakers: BreakerRegistry,
    /// Per-manifest-digest gates letting concurrent pulls of the same
    /// unseen digest converge on a single network fetch.
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    config: ClientConfig,
}

impl ArtifactClient {
    pub fn builder(
        transport: Arc<dyn RegistryTransport>,
        authenticator: Authenticator,
    ) -> ArtifactClientBuilder {
        ArtifactClientBuilder::new(transport, authenticator)
    }

    /// Push a payload, returning its manifest. Blobs already present on
    /// the registry are not re-uploaded; digest-addressed content is never
    /// mutated, only the tag pointer moves.
    pub async fn push(
        &self,
        payload: &ArtifactPayload,
        reference: &RegistryReference,
    ) -> Result<ArtifactManifest> {
        self.with_deadline("push", self.push_inner(payload, reference))
            .await
    }

    /// Pull a payload by reference. Digest-pinned references served
    /// entirely from the verified cache never touch the network; tags are
    /// re-resolved on every call.
    pub async fn pull(&self, reference: &RegistryReference) -> Result<Vec<u8>> {
        self.with_deadline("pull", self.pull_inner(reference)).await
    }

    /// Fetch and validate only the manifest, without layer bodies.
    pub async fn inspect(&self, reference: &RegistryReference) -> Result<ArtifactManifest> {
        self.with_deadline("inspect", self.inspect_inner(reference))
            .await
    }

    /// List a repository's tags, paginating transparently. Order is the
    /// registry's reported order, stable within one call.
    pub async fn list(&self, host: &str, repository: &str) -> Result<Vec<RegistryReference>> {
        self.with_deadline("list", self.list_inner(host, repository))
            .await
    }

    /// Like [`list`], but additionally resolves each tag to its manifest
    /// digest with bounded-parallel existence checks rather than one
    /// serial round-trip per tag.
    ///
    /// [`list`]: ArtifactClient::list
    pub async fn list_resolved(&self, host: &str, repository: &str) -> Result<Vec<ResolvedTag>> {
        self.with_deadline("list", self.list_resolved_inner(host, repository))
            .await
    }

    async fn with_deadline<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.config.operation_timeout(), fut)
            .await
            .map_err(|_| DistributionError::DeadlineExceeded {
                operation: operation.to_string(),
            })?
    }

    /// Run one registry round-trip under the resilience layer. Each
    /// attempt resolves a credential (cached, refreshed when near expiry)
    /// and carries its own timeout slice so a stuck attempt cannot eat the
    /// whole operation deadline. A 401 invalidates the cached credential
    /// and is replayed exactly once with a fresh one.
    async fn registry_call<T, F, Fut>(&self, host: &str, operation: &str, f: F) -> Result<T>
    where
        F: Fn(Option<AuthCredential>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let refreshed = AtomicBool::new(false);
        let f = &f;
        let refreshed = &refreshed;
        retry_with_backoff(&self.config.retry, &self.breakers, host, operation, || async move {
            let cred = match self.auth.resolve_credential(host).await {
                Ok(cred) => Some(cred),
                // No mechanism configured for this host: proceed
                // anonymously and let the registry decide.
                Err(DistributionError::Authentication { ref mechanism, .. })
                    if mechanism == "none" =>
                {
                    None
                }
                Err(e) => return Err(e),
            };

            let result =
                match tokio::time::timeout(self.config.attempt_timeout(), f(cred)).await {
                    Ok(result) => result,
                    Err(_) => Err(DistributionError::Network(format!(
                        "{operation} attempt against {host} timed out"
                    ))),
                };

            match result {
                Err(err @ DistributionError::AuthExpired { .. }) => {
                    if refreshed.swap(true, Ordering::SeqCst) {
                        // The refreshed credential was rejected too; this
                        // is a hard auth failure, not a stale token.
                        Err(DistributionError::Authentication {
                            host: host.to_string(),
                            mechanism: "registry".to_string(),
                        })
                    } else {
                        debug!(host, operation, "credential rejected, refreshing once");
                        self.auth.invalidate(host);
                        Err(err)
                    }
                }
                other => other,
            }
        })
        .await
    }

    // ---- push -----------------------------------------------------------

    async fn push_inner(
        &self,
        payload: &ArtifactPayload,
        reference: &RegistryReference,
    ) -> Result<ArtifactManifest> {
        if payload.parts.is_empty() {
            return Err(DistributionError::Validation(
                "artifact payload must contain at least one part".to_string(),
            ));
        }

        let layers: Vec<LayerDescriptor> = payload
            .parts
            .iter()
            .map(|part| LayerDescriptor::for_layer(part))
            .collect();

        // The config blob is deterministic for a given payload so that a
        // repeated push of identical content skips every blob upload.
        let artifact_config =
            ArtifactConfig::new(payload.parts.iter().map(|p| p.len() as u64).collect());
        let config_bytes = artifact_config.canonical_bytes()?;
        let config_descriptor = LayerDescriptor::for_config(&config_bytes);

        let mut annotations = payload.annotations.clone();
        annotations.insert(ANNOTATION_CREATED.to_string(), chrono::Utc::now().to_rfc3339());
        annotations.insert(
            ANNOTATION_TOOL.to_string(),
            concat!("floe-distribution/", env!("CARGO_PKG_VERSION")).to_string(),
        );

        let manifest = ArtifactManifest::new(config_descriptor.clone(), layers, annotations);
        let manifest_bytes = manifest.canonical_bytes()?;
        let manifest_digest = Digest::from_bytes(&manifest_bytes);

        if let Some(pinned) = reference.pinned_digest() {
            if *pinned != manifest_digest {
                return Err(DistributionError::Validation(format!(
                    "reference pins {pinned} but the manifest digests to {manifest_digest}"
                )));
            }
        }

        // Upload config and layers, skipping blobs the registry already
        // has.
        self.upload_blob_if_missing(reference, &config_descriptor, &config_bytes)
            .await?;
        for (descriptor, part) in manifest.layers.iter().zip(&payload.parts) {
            self.upload_blob_if_missing(reference, descriptor, part).await?;
        }

        let host = &reference.host;
        let repository = &reference.repository;
        let reference_part = reference.reference_part();
        self.registry_call(host, "manifest upload", |cred| {
            let data = manifest_bytes.clone();
            let reference_part = reference_part.clone();
            async move {
                self.transport
                    .put_manifest(
                        host,
                        repository,
                        &reference_part,
                        MANIFEST_MEDIA_TYPE,
                        data,
                        cred.as_ref(),
                    )
                    .await
            }
        })
        .await?;

        // The pushed digest becomes visible in the cache synchronously, so
        // a pull of that exact digest on this client observes the content.
        self.cache_put(&manifest_digest, &manifest_bytes);

        debug!(reference = %reference, digest = %manifest_digest, "pushed artifact");
        Ok(manifest)
    }

    async fn upload_blob_if_missing(
        &self,
        reference: &RegistryReference,
        descriptor: &LayerDescriptor,
        data: &[u8],
    ) -> Result<()> {
        let host = &reference.host;
        let repository = &reference.repository;
        let digest = &descriptor.digest;

        let exists = self
            .registry_call(host, "blob existence check", |cred| async move {
                self.transport
                    .blob_exists(host, repository, digest, cred.as_ref())
                    .await
            })
            .await?;

        if exists {
            debug!(%digest, "blob already present, skipping upload");
        } else {
            self.registry_call(host, "blob upload", |cred| {
                let data = data.to_vec();
                async move {
                    self.transport
                        .put_blob(host, repository, digest, data, cred.as_ref())
                        .await
                }
            })
            .await?;
        }

        self.cache_put(digest, data);
        Ok(())
    }

    // ---- pull -----------------------------------------------------------

    async fn pull_inner(&self, reference: &RegistryReference) -> Result<Vec<u8>> {
        // Digest-pinned references are immutable: a fully cached artifact
        // needs no network at all.
        if let Some(digest) = reference.pinned_digest() {
            if let Some(payload) = self.assemble_from_cache(digest) {
                return Ok(payload);
            }
        }

        let manifest_digest = self.resolve_reference(reference).await?;

        // Concurrent pulls of the same digest queue on one gate; whoever
        // wins fetches, the rest find the cache populated on re-check.
        let gate = self.fetch_gate(&manifest_digest);
        let _guard = gate.lock().await;

        if let Some(payload) = self.assemble_from_cache(&manifest_digest) {
            self.release_gate(&manifest_digest);
            return Ok(payload);
        }

        let result = self.fetch_and_assemble(reference, &manifest_digest).await;
        self.release_gate(&manifest_digest);
        result
    }

    async fn fetch_and_assemble(
        &self,
        reference: &RegistryReference,
        manifest_digest: &Digest,
    ) -> Result<Vec<u8>> {
        let manifest = self
            .fetch_manifest_verified(reference, manifest_digest)
            .await?;

        let config_bytes = self.fetch_layer(reference, &manifest.config).await?;
        let artifact_config = ArtifactConfig::from_bytes(&config_bytes)?;

        let parts: Vec<Vec<u8>> = stream::iter(
            manifest
                .layers
                .iter()
                .map(|descriptor| self.fetch_layer(reference, descriptor)),
        )
        .buffered(self.config.max_concurrent_fetches.max(1))
        .try_collect()
        .await?;

        check_part_sizes(&artifact_config, &parts)?;
        Ok(parts.concat())
    }

    /// Resolve a reference to its manifest digest: identity for
    /// digest-pinned references, a registry round-trip for tags (tags may
    /// move and are re-resolved on every use).
    async fn resolve_reference(&self, reference: &RegistryReference) -> Result<Digest> {
        match &reference.kind {
            ReferenceKind::Digest(digest) => Ok(digest.clone()),
            ReferenceKind::Tag(tag) => {
                let host = &reference.host;
                let repository = &reference.repository;
                self.registry_call(host, "tag resolution", |cred| async move {
                    self.transport
                        .resolve_tag(host, repository, tag, cred.as_ref())
                        .await
                })
                .await
            }
        }
    }

    async fn fetch_manifest_verified(
        &self,
        reference: &RegistryReference,
        expected_digest: &Digest,
    ) -> Result<ArtifactManifest> {
        if let Some(bytes) = self.cache_get(expected_digest) {
            return ArtifactManifest::from_bytes(&bytes);
        }

        let host = &reference.host;
        let repository = &reference.repository;
        let reference_part = expected_digest.to_string();
        let (bytes, fetched_digest) = self
            .registry_call(host, "manifest fetch", |cred| {
                let reference_part = reference_part.clone();
                async move {
                    self.transport
                        .fetch_manifest(host, repository, &reference_part, cred.as_ref())
                        .await
                }
            })
            .await?;

        // Fatal, never retried: a mismatch means a transport bug, a
        // compromised registry, or disk corruption.
        if fetched_digest != *expected_digest {
            return Err(DistributionError::DigestMismatch {
                expected: expected_digest.to_string(),
                computed: fetched_digest.to_string(),
            });
        }
        expected_digest.verify(&bytes)?;

        let manifest = ArtifactManifest::from_bytes(&bytes)?;
        self.cache_put(expected_digest, &bytes);
        Ok(manifest)
    }

    async fn fetch_layer(
        &self,
        reference: &RegistryReference,
        descriptor: &LayerDescriptor,
    ) -> Result<Vec<u8>> {
        if let Some(bytes) = self.cache_get(&descriptor.digest) {
            return Ok(bytes);
        }

        let host = &reference.host;
        let repository = &reference.repository;
        let digest = &descriptor.digest;
        let bytes = self
            .registry_call(host, "blob fetch", |cred| async move {
                self.transport
                    .fetch_blob(host, repository, digest, cred.as_ref())
                    .await
            })
            .await?;

        descriptor.verify(&bytes)?;
        self.cache_put(&descriptor.digest, &bytes);
        Ok(bytes)
    }

    /// Reassemble a payload purely from verified cache entries, or `None`
    /// if the manifest, the config blob or any layer is absent (or the
    /// cached pieces disagree, in which case the network path re-fetches
    /// and surfaces the error).
    fn assemble_from_cache(&self, manifest_digest: &Digest) -> Option<Vec<u8>> {
        let manifest_bytes = self.cache_get(manifest_digest)?;
        let manifest = ArtifactManifest::from_bytes(&manifest_bytes).ok()?;

        let config_bytes = self.cache_get(&manifest.config.digest)?;
        let artifact_config = ArtifactConfig::from_bytes(&config_bytes).ok()?;

        let mut parts = Vec::with_capacity(manifest.layers.len());
        for descriptor in &manifest.layers {
            parts.push(self.cache_get(&descriptor.digest)?);
        }
        check_part_sizes(&artifact_config, &parts).ok()?;
        debug!(digest = %manifest_digest, "pull served entirely from cache");
        Some(parts.concat())
    }

    // ---- inspect --------------------------------------------------------

    async fn inspect_inner(&self, reference: &RegistryReference) -> Result<ArtifactManifest> {
        let manifest_digest = self.resolve_reference(reference).await?;
        self.fetch_manifest_verified(reference, &manifest_digest).await
    }

    // ---- list -----------------------------------------------------------

    async fn list_inner(&self, host: &str, repository: &str) -> Result<Vec<RegistryReference>> {
        let mut references = Vec::new();
        let mut last: Option<String> = None;

        loop {
            let last_ref = last.as_deref();
            let page = self
                .registry_call(host, "tag list", |cred| async move {
                    self.transport
                        .list_tags_page(host, repository, self.config.page_size, last_ref, cred.as_ref())
                        .await
                })
                .await?;

            references.extend(
                page.tags
                    .iter()
                    .map(|tag| RegistryReference::with_tag(host, repository, tag)),
            );

            if !page.more || page.tags.is_empty() {
                break;
            }
            last = page.tags.last().cloned();
        }

        Ok(references)
    }

    async fn list_resolved_inner(&self, host: &str, repository: &str) -> Result<Vec<ResolvedTag>> {
        let references = self.list_inner(host, repository).await?;

        // The naive shape here is one serial round-trip per tag; bound the
        // parallelism instead and preserve the listing order.
        stream::iter(references.into_iter().map(|reference| async move {
            let digest = self.resolve_reference(&reference).await?;
            Ok::<_, DistributionError>(ResolvedTag { reference, digest })
        }))
        .buffered(self.config.max_concurrent_fetches.max(1))
        .try_collect()
        .await
    }

    // ---- cache helpers --------------------------------------------------

    /// Cache read; any cache failure is a miss, never an operation error.
    fn cache_get(&self, digest: &Digest) -> Option<Vec<u8>> {
        let cache = self.cache.as_ref()?;
        match cache.get(digest) {
            Ok(hit) => hit,
            Err(e) => {
                warn!(%digest, error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    /// Write-through cache insert. Failures degrade to cache-less
    /// operation: the cache is an optimization, not a correctness
    /// requirement.
    fn cache_put(&self, digest: &Digest, data: &[u8]) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        if let Err(e) = cache.put(digest, data) {
            warn!(%digest, error = %e, "cache write failed, continuing without cache");
        }
    }

    fn fetch_gate(&self, digest: &Digest) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inflight.lock().expect("inflight map poisoned");
        map.entry(digest.hex().to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn release_gate(&self, digest: &Digest) {
        let mut map = self.inflight.lock().expect("inflight map poisoned");
        if let Some(gate) = map.get(digest.hex()) {
            // Drop the map entry once no other pull holds the gate.
            if Arc::strong_count(gate) <= 2 {
                map.remove(digest.hex());
            }
        }
    }
}

/// The config blob records how the payload was split; a disagreement with
/// the actual layer bodies means the artifact was assembled inconsistently.
fn check_part_sizes(config: &ArtifactConfig, parts: &[Vec<u8>]) -> Result<()> {
    let actual: Vec<u64> = parts.iter().map(|p| p.len() as u64).collect();
    if config.part_sizes != actual {
        return Err(DistributionError::ManifestCorrupt(format!(
            "config declares part sizes {:?} but layers have sizes {:?}",
            config.part_sizes, actual
        )));
    }
    Ok(())
}
