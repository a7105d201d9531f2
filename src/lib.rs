//! Content-addressed artifact distribution over OCI registries.
//!
//! This crate pushes, pulls, inspects and lists versioned build artifacts
//! against any OCI Distribution compatible registry. Artifacts are
//! immutable and content-addressed: every blob and manifest is named by
//! the sha256 of its bytes, verified on every fetch and every cache read,
//! and a digest-pinned reference always yields the same bytes or a fatal
//! integrity error.
//!
//! The pieces compose bottom-up:
//!
//! - [`manifest`]: the manifest/digest data model with canonical
//!   serialization.
//! - [`reference`]: `host/repository[:tag|@digest]` parsing.
//! - [`auth`]: pluggable credential providers behind one [`Authenticator`].
//! - [`cache`]: a crash-safe, multi-process-tolerant local blob cache.
//! - [`resilience`]: retry with exponential backoff plus a per-host
//!   circuit breaker.
//! - [`transport`]: the OCI wire protocol behind the [`RegistryTransport`]
//!   trait.
//! - [`client`]: the [`ArtifactClient`] orchestrator tying it together.
//!
//! ```no_run
//! use floe_distribution::{
//!     ArtifactClient, ArtifactPayload, Authenticator, ClientConfig, HttpTransport,
//!     RegistryReference,
//! };
//! use std::sync::Arc;
//!
//! # async fn demo() -> floe_distribution::Result<()> {
//! let config = ClientConfig::default();
//! let transport = Arc::new(HttpTransport::from_config(&config)?);
//! let client = ArtifactClient::builder(transport, Authenticator::new())
//!     .with_config(config)
//!     .build()?;
//!
//! let reference: RegistryReference = "registry.example.com/team/app:v1.2.0".parse()?;
//! let manifest = client
//!     .push(&ArtifactPayload::from_bytes(b"artifact bytes".to_vec()), &reference)
//!     .await?;
//! let bytes = client.pull(&reference).await?;
//! # let _ = (manifest, bytes);
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod manifest;
pub mod reference;
pub mod resilience;
pub mod transport;

pub use auth::{
    AuthCredential, Authenticator, BasicProvider, BearerProvider, CredentialProvider,
    OidcProvider, WorkloadIdentityProvider,
};
pub use cache::BlobCache;
pub use client::{ArtifactClient, ArtifactClientBuilder, ArtifactPayload, ResolvedTag};
pub use config::{BreakerConfig, CacheConfig, ClientConfig, RetryConfig};
pub use error::{DistributionError, Result};
pub use manifest::{ArtifactConfig, ArtifactManifest, Digest, LayerDescriptor};
pub use reference::{ReferenceKind, RegistryReference};
pub use transport::{HttpTransport, RegistryTransport, TagPage};
