//! End-to-end client behavior against an in-memory registry.

use async_trait::async_trait;
use floe_distribution::auth::{AuthCredential, Authenticator, CredentialProvider};
use floe_distribution::manifest::{
    ArtifactConfig, ArtifactManifest, LayerDescriptor, ANNOTATION_REVISION,
};
use floe_distribution::transport::{RegistryTransport, TagPage};
use floe_distribution::{
    ArtifactClient, ArtifactPayload, CacheConfig, ClientConfig, Digest, DistributionError,
    RegistryReference, RetryConfig,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// In-memory OCI registry shared by the mock transport and the assertions.
#[derive(Default)]
struct MockRegistry {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    manifests: Mutex<HashMap<String, Vec<u8>>>,
    tags: Mutex<BTreeMap<String, Digest>>,
    blob_fetches: AtomicUsize,
    blob_uploads: AtomicUsize,
    manifest_fetches: AtomicUsize,
    tag_page_requests: AtomicUsize,
    /// Corrupt every fetched blob body (digest verification must catch it).
    corrupt_blob_fetches: std::sync::atomic::AtomicBool,
    /// Reject this many calls with a stale-credential error before
    /// behaving normally.
    reject_as_expired: AtomicUsize,
    /// Delay every call by this long, like a congested registry.
    delay_ms: AtomicU64,
    /// Cap tag pages below the requested size, like ECR does.
    tag_page_cap: AtomicUsize,
}

impl MockRegistry {
    fn store_blob(&self, data: &[u8]) -> Digest {
        let digest = Digest::from_bytes(data);
        self.blobs
            .lock()
            .unwrap()
            .insert(digest.hex().to_string(), data.to_vec());
        digest
    }

    /// Seed a complete artifact without going through the client.
    fn seed_artifact(&self, tag: &str, parts: &[&[u8]]) -> Digest {
        let config = ArtifactConfig::new(parts.iter().map(|p| p.len() as u64).collect());
        let config_bytes = config.canonical_bytes().unwrap();
        let config_descriptor = LayerDescriptor::for_config(&config_bytes);
        self.store_blob(&config_bytes);

        let layers: Vec<LayerDescriptor> = parts
            .iter()
            .map(|part| {
                self.store_blob(part);
                LayerDescriptor::for_layer(part)
            })
            .collect();

        let manifest = ArtifactManifest::new(config_descriptor, layers, BTreeMap::new());
        let bytes = manifest.canonical_bytes().unwrap();
        let digest = Digest::from_bytes(&bytes);
        self.manifests
            .lock()
            .unwrap()
            .insert(digest.to_string(), bytes);
        self.tags
            .lock()
            .unwrap()
            .insert(tag.to_string(), digest.clone());
        digest
    }

    fn seed_tags(&self, count: usize) {
        let digest = self.seed_artifact("seed", &[b"seed"]);
        let mut tags = self.tags.lock().unwrap();
        for i in 0..count {
            tags.insert(format!("v{i:04}"), digest.clone());
        }
        tags.remove("seed");
    }

    async fn check_gate(&self) -> Result<(), DistributionError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let remaining = self.reject_as_expired.load(Ordering::SeqCst);
        if remaining > 0 {
            self.reject_as_expired.store(remaining - 1, Ordering::SeqCst);
            return Err(DistributionError::AuthExpired {
                host: "registry.test".to_string(),
                mechanism: "registry".to_string(),
            });
        }
        Ok(())
    }
}

struct MockTransport {
    registry: Arc<MockRegistry>,
}

#[async_trait]
impl RegistryTransport for MockTransport {
    async fn resolve_tag(
        &self,
        _host: &str,
        _repository: &str,
        tag: &str,
        _cred: Option<&AuthCredential>,
    ) -> Result<Digest, DistributionError> {
        self.registry.check_gate().await?;
        self.registry
            .tags
            .lock()
            .unwrap()
            .get(tag)
            .cloned()
            .ok_or_else(|| DistributionError::ReferenceNotFound {
                reference: tag.to_string(),
            })
    }

    async fn fetch_manifest(
        &self,
        host: &str,
        repository: &str,
        reference: &str,
        cred: Option<&AuthCredential>,
    ) -> Result<(Vec<u8>, Digest), DistributionError> {
        self.registry.check_gate().await?;
        self.registry.manifest_fetches.fetch_add(1, Ordering::SeqCst);
        let digest = if reference.starts_with("sha256:") {
            reference.parse::<Digest>()?
        } else {
            self.resolve_tag(host, repository, reference, cred).await?
        };
        let bytes = self
            .registry
            .manifests
            .lock()
            .unwrap()
            .get(&digest.to_string())
            .cloned()
            .ok_or_else(|| DistributionError::ReferenceNotFound {
                reference: reference.to_string(),
            })?;
        Ok((bytes, digest))
    }

    async fn put_manifest(
        &self,
        _host: &str,
        _repository: &str,
        reference: &str,
        _media_type: &str,
        data: Vec<u8>,
        _cred: Option<&AuthCredential>,
    ) -> Result<(), DistributionError> {
        self.registry.check_gate().await?;
        let digest = Digest::from_bytes(&data);
        self.registry
            .manifests
            .lock()
            .unwrap()
            .insert(digest.to_string(), data);
        if !reference.starts_with("sha256:") {
            self.registry
                .tags
                .lock()
                .unwrap()
                .insert(reference.to_string(), digest);
        }
        Ok(())
    }

    async fn blob_exists(
        &self,
        _host: &str,
        _repository: &str,
        digest: &Digest,
        _cred: Option<&AuthCredential>,
    ) -> Result<bool, DistributionError> {
        self.registry.check_gate().await?;
        Ok(self.registry.blobs.lock().unwrap().contains_key(digest.hex()))
    }

    async fn fetch_blob(
        &self,
        _host: &str,
        _repository: &str,
        digest: &Digest,
        _cred: Option<&AuthCredential>,
    ) -> Result<Vec<u8>, DistributionError> {
        self.registry.check_gate().await?;
        self.registry.blob_fetches.fetch_add(1, Ordering::SeqCst);
        let mut bytes = self
            .registry
            .blobs
            .lock()
            .unwrap()
            .get(digest.hex())
            .cloned()
            .ok_or_else(|| DistributionError::ReferenceNotFound {
                reference: digest.to_string(),
            })?;
        if self.registry.corrupt_blob_fetches.load(Ordering::SeqCst) {
            bytes[0] ^= 0xff;
        }
        Ok(bytes)
    }

    async fn put_blob(
        &self,
        _host: &str,
        _repository: &str,
        digest: &Digest,
        data: Vec<u8>,
        _cred: Option<&AuthCredential>,
    ) -> Result<(), DistributionError> {
        self.registry.check_gate().await?;
        self.registry.blob_uploads.fetch_add(1, Ordering::SeqCst);
        self.registry
            .blobs
            .lock()
            .unwrap()
            .insert(digest.hex().to_string(), data);
        Ok(())
    }

    async fn list_tags_page(
        &self,
        _host: &str,
        _repository: &str,
        page_size: u32,
        last: Option<&str>,
        _cred: Option<&AuthCredential>,
    ) -> Result<TagPage, DistributionError> {
        self.registry.check_gate().await?;
        self.registry.tag_page_requests.fetch_add(1, Ordering::SeqCst);
        let cap = self.registry.tag_page_cap.load(Ordering::SeqCst);
        let effective = if cap == 0 {
            page_size as usize
        } else {
            cap.min(page_size as usize)
        };
        let remaining: Vec<String> = self
            .registry
            .tags
            .lock()
            .unwrap()
            .keys()
            .filter(|tag| last.is_none_or(|cursor| tag.as_str() > cursor))
            .cloned()
            .collect();
        let tags: Vec<String> = remaining.iter().take(effective).cloned().collect();
        // A real registry knows exactly whether a next page exists and
        // says so, no matter how far it capped `n`.
        let more = remaining.len() > tags.len();
        Ok(TagPage { tags, more })
    }
}

fn fast_config() -> ClientConfig {
    let mut config = ClientConfig::default().with_retry(RetryConfig {
        max_attempts: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        backoff_multiplier: 1.0,
    });
    config.page_size = 100;
    config
}

fn client_for(registry: &Arc<MockRegistry>) -> ArtifactClient {
    ArtifactClient::builder(
        Arc::new(MockTransport {
            registry: Arc::clone(registry),
        }),
        Authenticator::new(),
    )
    .with_config(fast_config())
    .build()
    .unwrap()
}

fn cached_client_for(registry: &Arc<MockRegistry>, tmp: &TempDir) -> ArtifactClient {
    ArtifactClient::builder(
        Arc::new(MockTransport {
            registry: Arc::clone(registry),
        }),
        Authenticator::new(),
    )
    .with_config(fast_config())
    .with_cache(CacheConfig::new(tmp.path().join("cache")))
    .build()
    .unwrap()
}

fn reference(tag: &str) -> RegistryReference {
    format!("registry.test/team/app:{tag}").parse().unwrap()
}

#[tokio::test]
async fn push_then_pull_round_trips() {
    let registry = Arc::new(MockRegistry::default());
    let client = client_for(&registry);

    let payload = ArtifactPayload::from_parts(vec![b"first part".to_vec(), b"second part".to_vec()])
        .with_annotation(ANNOTATION_REVISION, "abc123");
    let manifest = client.push(&payload, &reference("v1")).await.unwrap();
    assert_eq!(manifest.layers.len(), 2);

    let pulled = client.pull(&reference("v1")).await.unwrap();
    assert_eq!(pulled, b"first partsecond part");
}

#[tokio::test]
async fn inspect_returns_manifest_without_layer_fetches() {
    let registry = Arc::new(MockRegistry::default());
    let client = client_for(&registry);

    client
        .push(
            &ArtifactPayload::from_bytes(b"payload".to_vec())
                .with_annotation(ANNOTATION_REVISION, "deadbeef"),
            &reference("v1"),
        )
        .await
        .unwrap();

    let manifest = client.inspect(&reference("v1")).await.unwrap();
    assert_eq!(
        manifest.annotations.get(ANNOTATION_REVISION).map(String::as_str),
        Some("deadbeef")
    );
    assert_eq!(registry.blob_fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn tag_moves_but_pinned_digest_does_not() {
    let registry = Arc::new(MockRegistry::default());
    let client = client_for(&registry);

    let first = client
        .push(&ArtifactPayload::from_bytes(b"version one".to_vec()), &reference("latest"))
        .await
        .unwrap();
    let first_digest = first.digest().unwrap();

    client
        .push(&ArtifactPayload::from_bytes(b"version two".to_vec()), &reference("latest"))
        .await
        .unwrap();

    assert_eq!(client.pull(&reference("latest")).await.unwrap(), b"version two");

    let pinned = reference("latest").pinned(first_digest);
    assert_eq!(client.pull(&pinned).await.unwrap(), b"version one");
}

#[tokio::test]
async fn repeated_push_skips_every_blob_upload() {
    let registry = Arc::new(MockRegistry::default());
    let client = client_for(&registry);
    let payload = ArtifactPayload::from_parts(vec![b"part a".to_vec(), b"part b".to_vec()]);

    client.push(&payload, &reference("v1")).await.unwrap();
    let uploads_after_first = registry.blob_uploads.load(Ordering::SeqCst);
    assert_eq!(uploads_after_first, 3); // config + two layers

    client.push(&payload, &reference("v2")).await.unwrap();
    assert_eq!(registry.blob_uploads.load(Ordering::SeqCst), uploads_after_first);
}

#[tokio::test]
async fn concurrent_pulls_of_one_digest_fetch_once() {
    let registry = Arc::new(MockRegistry::default());
    registry.seed_artifact("v1", &[b"shared content"]);
    let tmp = TempDir::new().unwrap();
    let client = Arc::new(cached_client_for(&registry, &tmp));

    let reference = reference("v1");
    let (a, b, c) = tokio::join!(
        client.pull(&reference),
        client.pull(&reference),
        client.pull(&reference),
    );
    assert_eq!(a.unwrap(), b"shared content");
    assert_eq!(b.unwrap(), b"shared content");
    assert_eq!(c.unwrap(), b"shared content");

    assert_eq!(registry.manifest_fetches.load(Ordering::SeqCst), 1);
    // Config blob plus the single layer, each fetched exactly once.
    assert_eq!(registry.blob_fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn pinned_pull_is_served_from_cache_without_network() {
    let registry = Arc::new(MockRegistry::default());
    let tmp = TempDir::new().unwrap();
    let client = cached_client_for(&registry, &tmp);

    let manifest = client
        .push(&ArtifactPayload::from_bytes(b"cached bytes".to_vec()), &reference("v1"))
        .await
        .unwrap();
    let pinned = reference("v1").pinned(manifest.digest().unwrap());

    // Wipe the registry; the pinned pull must not notice.
    registry.blobs.lock().unwrap().clear();
    registry.manifests.lock().unwrap().clear();

    assert_eq!(client.pull(&pinned).await.unwrap(), b"cached bytes");
    assert_eq!(registry.manifest_fetches.load(Ordering::SeqCst), 0);
    assert_eq!(registry.blob_fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn corrupted_blob_fails_without_retry() {
    let registry = Arc::new(MockRegistry::default());
    registry.seed_artifact("v1", &[b"will be corrupted"]);
    registry.corrupt_blob_fetches.store(true, Ordering::SeqCst);
    let client = client_for(&registry);

    let err = client.pull(&reference("v1")).await.unwrap_err();
    assert!(matches!(err, DistributionError::DigestMismatch { .. }));
    // Integrity failures are fatal, never retried.
    assert_eq!(registry.blob_fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_tag_is_not_found() {
    let registry = Arc::new(MockRegistry::default());
    let client = client_for(&registry);

    let err = client.pull(&reference("missing")).await.unwrap_err();
    assert!(matches!(err, DistributionError::ReferenceNotFound { .. }));
}

#[tokio::test]
async fn list_paginates_through_all_tags() {
    let registry = Arc::new(MockRegistry::default());
    registry.seed_tags(250);
    let client = client_for(&registry);

    let references = client.list("registry.test", "team/app").await.unwrap();
    assert_eq!(references.len(), 250);
    assert_eq!(references[0].reference_part(), "v0000");
    assert_eq!(references[249].reference_part(), "v0249");
    // Two full pages plus the final partial page.
    assert_eq!(registry.tag_page_requests.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn list_resolved_pins_each_tag() {
    let registry = Arc::new(MockRegistry::default());
    let digest_a = registry.seed_artifact("a", &[b"artifact a"]);
    let digest_b = registry.seed_artifact("b", &[b"artifact b"]);
    let client = client_for(&registry);

    let resolved = client.list_resolved("registry.test", "team/app").await.unwrap();
    assert_eq!(resolved.len(), 2);
    assert_eq!(resolved[0].reference.reference_part(), "a");
    assert_eq!(resolved[0].digest, digest_a);
    assert_eq!(resolved[1].digest, digest_b);
}

#[tokio::test]
async fn stale_credential_is_refreshed_and_replayed_once() {
    let registry = Arc::new(MockRegistry::default());
    registry.seed_artifact("v1", &[b"content"]);
    registry.reject_as_expired.store(1, Ordering::SeqCst);
    let client = client_for(&registry);

    assert_eq!(client.pull(&reference("v1")).await.unwrap(), b"content");
}

#[tokio::test]
async fn persistent_rejection_becomes_hard_auth_failure() {
    let registry = Arc::new(MockRegistry::default());
    registry.seed_artifact("v1", &[b"content"]);
    registry.reject_as_expired.store(usize::MAX, Ordering::SeqCst);
    let client = client_for(&registry);

    let err = client.pull(&reference("v1")).await.unwrap_err();
    assert!(matches!(err, DistributionError::Authentication { .. }));
}

#[tokio::test]
async fn provider_credential_failure_propagates() {
    struct FailingProvider;

    #[async_trait]
    impl CredentialProvider for FailingProvider {
        async fn resolve(&self, host: &str) -> Result<AuthCredential, DistributionError> {
            Err(DistributionError::Authentication {
                host: host.to_string(),
                mechanism: self.mechanism().to_string(),
            })
        }

        fn mechanism(&self) -> &'static str {
            "oidc"
        }
    }

    let registry = Arc::new(MockRegistry::default());
    registry.seed_artifact("v1", &[b"content"]);
    let client = ArtifactClient::builder(
        Arc::new(MockTransport {
            registry: Arc::clone(&registry),
        }),
        Authenticator::new()
            .with_provider("registry.test", Arc::new(FailingProvider)),
    )
    .with_config(fast_config())
    .build()
    .unwrap();

    let err = client.pull(&reference("v1")).await.unwrap_err();
    assert!(matches!(err, DistributionError::Authentication { .. }));
}

#[tokio::test]
async fn empty_payload_is_rejected() {
    let registry = Arc::new(MockRegistry::default());
    let client = client_for(&registry);

    let err = client
        .push(&ArtifactPayload::from_parts(Vec::new()), &reference("v1"))
        .await
        .unwrap_err();
    assert!(matches!(err, DistributionError::Validation(_)));
}

#[tokio::test]
async fn refresh_margin_config_drives_proactive_refresh() {
    struct IssuingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CredentialProvider for IssuingProvider {
        async fn resolve(&self, _host: &str) -> Result<AuthCredential, DistributionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AuthCredential::bearer("tok", Some(Duration::from_secs(3600))))
        }

        fn mechanism(&self) -> &'static str {
            "counting"
        }
    }

    let client_with_margin = |registry: &Arc<MockRegistry>,
                              provider: &Arc<IssuingProvider>,
                              margin_secs: u64| {
        let mut config = fast_config();
        config.refresh_margin_secs = margin_secs;
        ArtifactClient::builder(
            Arc::new(MockTransport {
                registry: Arc::clone(registry),
            }),
            Authenticator::new().with_provider("registry.test", provider.clone()),
        )
        .with_config(config)
        .build()
        .unwrap()
    };

    // A margin dwarfing the credential lifetime forces a provider call on
    // every registry round-trip of the pull.
    let registry = Arc::new(MockRegistry::default());
    registry.seed_artifact("v1", &[b"content"]);
    let provider = Arc::new(IssuingProvider {
        calls: AtomicUsize::new(0),
    });
    let client = client_with_margin(&registry, &provider, 100_000);
    client.pull(&reference("v1")).await.unwrap();
    assert!(provider.calls.load(Ordering::SeqCst) >= 3);

    // The default margin reuses the cached credential across the pull.
    let registry = Arc::new(MockRegistry::default());
    registry.seed_artifact("v1", &[b"content"]);
    let provider = Arc::new(IssuingProvider {
        calls: AtomicUsize::new(0),
    });
    let client = client_with_margin(&registry, &provider, 60);
    client.pull(&reference("v1")).await.unwrap();
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_registry_exceeds_the_operation_deadline() {
    let registry = Arc::new(MockRegistry::default());
    registry.seed_artifact("v1", &[b"content"]);
    registry.delay_ms.store(600_000, Ordering::SeqCst);

    let client = ArtifactClient::builder(
        Arc::new(MockTransport {
            registry: Arc::clone(&registry),
        }),
        Authenticator::new(),
    )
    .with_config(fast_config().with_operation_timeout(Duration::from_secs(5)))
    .build()
    .unwrap();

    let err = client.pull(&reference("v1")).await.unwrap_err();
    assert!(matches!(err, DistributionError::DeadlineExceeded { .. }));
}

#[tokio::test]
async fn pull_survives_an_unwritable_cache() {
    let registry = Arc::new(MockRegistry::default());
    registry.seed_artifact("v1", &[b"degraded but correct"]);
    let tmp = TempDir::new().unwrap();
    let client = cached_client_for(&registry, &tmp);

    // Replace the blob tree with a plain file so every cache write fails.
    let blobs = tmp.path().join("cache").join("blobs");
    std::fs::remove_dir_all(&blobs).unwrap();
    std::fs::write(&blobs, b"not a directory").unwrap();

    assert_eq!(
        client.pull(&reference("v1")).await.unwrap(),
        b"degraded but correct"
    );

    // Nothing could be cached, so a second pull goes to the network again.
    let fetches = registry.manifest_fetches.load(Ordering::SeqCst);
    assert_eq!(
        client.pull(&reference("v1")).await.unwrap(),
        b"degraded but correct"
    );
    assert!(registry.manifest_fetches.load(Ordering::SeqCst) > fetches);
}

#[tokio::test]
async fn capped_tag_pages_still_list_everything() {
    let registry = Arc::new(MockRegistry::default());
    registry.seed_tags(250);
    // The registry serves at most 30 tags per page no matter what `n`
    // was requested.
    registry.tag_page_cap.store(30, Ordering::SeqCst);
    let client = client_for(&registry);

    let references = client.list("registry.test", "team/app").await.unwrap();
    assert_eq!(references.len(), 250);
    assert_eq!(registry.tag_page_requests.load(Ordering::SeqCst), 9);
}

#[tokio::test]
async fn config_part_size_disagreement_is_corrupt() {
    let registry = Arc::new(MockRegistry::default());

    // An inconsistently assembled artifact: the config blob claims part
    // sizes that do not match the actual layer.
    let part: &[u8] = b"actual layer";
    let artifact_config = ArtifactConfig::new(vec![999]);
    let config_bytes = artifact_config.canonical_bytes().unwrap();
    let config_descriptor = LayerDescriptor::for_config(&config_bytes);
    registry.store_blob(&config_bytes);
    registry.store_blob(part);

    let manifest = ArtifactManifest::new(
        config_descriptor,
        vec![LayerDescriptor::for_layer(part)],
        BTreeMap::new(),
    );
    let bytes = manifest.canonical_bytes().unwrap();
    let digest = Digest::from_bytes(&bytes);
    registry
        .manifests
        .lock()
        .unwrap()
        .insert(digest.to_string(), bytes);
    registry
        .tags
        .lock()
        .unwrap()
        .insert("bad".to_string(), digest);

    let client = client_for(&registry);
    let err = client.pull(&reference("bad")).await.unwrap_err();
    assert!(matches!(err, DistributionError::ManifestCorrupt(_)));
}
