//! Content-addressed artifact manifests
//!
//! An [`ArtifactManifest`] is the top-level descriptor of a pushed artifact:
//! a config blob plus an ordered list of content layers, all referenced by
//! digest. Serialization is canonical (fixed field order, sorted
//! annotations) so the manifest's own digest is reproducible; any mutation
//! produces a new digest and therefore a new identity.

pub mod digest;

pub use digest::Digest;

use crate::error::{DistributionError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Media type of the manifest document itself.
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.floe.artifact.manifest.v1+json";
/// Media type of the artifact configuration blob.
pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.floe.artifact.config.v1+json";
/// Media type of a content layer.
pub const LAYER_MEDIA_TYPE: &str = "application/vnd.floe.artifact.layer.v1";

/// The only schema version this client produces or accepts.
pub const SCHEMA_VERSION: u32 = 2;

/// Annotation keys stamped on pushed manifests.
pub const ANNOTATION_CREATED: &str = "vnd.floe.artifact.created";
pub const ANNOTATION_REVISION: &str = "vnd.floe.artifact.revision";
pub const ANNOTATION_TOOL: &str = "vnd.floe.artifact.tool";

/// One content blob referenced by a manifest: digest, byte size, media
/// type. The digest must match the actual bytes of the referenced blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerDescriptor {
    pub media_type: String,
    pub size: u64,
    pub digest: Digest,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl LayerDescriptor {
    /// Describe `data` as a content layer.
    pub fn for_layer(data: &[u8]) -> Self {
        Self {
            media_type: LAYER_MEDIA_TYPE.to_string(),
            size: data.len() as u64,
            digest: Digest::from_bytes(data),
            annotations: BTreeMap::new(),
        }
    }

    /// Describe `data` as the artifact config blob.
    pub fn for_config(data: &[u8]) -> Self {
        Self {
            media_type: CONFIG_MEDIA_TYPE.to_string(),
            size: data.len() as u64,
            digest: Digest::from_bytes(data),
            annotations: BTreeMap::new(),
        }
    }

    /// Recompute the digest of `data` and compare against this descriptor.
    /// Used on every cache write and every network fetch, no exceptions.
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        if data.len() as u64 != self.size {
            return Err(DistributionError::DigestMismatch {
                expected: format!("{} ({} bytes)", self.digest, self.size),
                computed: format!("{} ({} bytes)", Digest::from_bytes(data), data.len()),
            });
        }
        self.digest.verify(data)
    }
}

/// The content-addressed descriptor of a pushed artifact. Immutable once
/// computed: the manifest digest is taken over [`canonical_bytes`] and any
/// change yields a different digest.
///
/// [`canonical_bytes`]: ArtifactManifest::canonical_bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactManifest {
    pub schema_version: u32,
    pub media_type: String,
    pub config: LayerDescriptor,
    pub layers: Vec<LayerDescriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ArtifactManifest {
    pub fn new(
        config: LayerDescriptor,
        layers: Vec<LayerDescriptor>,
        annotations: BTreeMap<String, String>,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            media_type: MANIFEST_MEDIA_TYPE.to_string(),
            config,
            layers,
            annotations,
        }
    }

    /// Canonical serialized form: fixed field order (struct declaration
    /// order) and sorted annotation keys (`BTreeMap`), so
    /// `Digest::from_bytes(canonical_bytes())` is reproducible.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Digest of the canonical serialized form; the manifest's identity.
    pub fn digest(&self) -> Result<Digest> {
        Ok(Digest::from_bytes(&self.canonical_bytes()?))
    }

    /// Parse and validate manifest bytes. Unparseable bytes, an unknown
    /// schema version, a foreign media type, or an empty layer list all
    /// produce [`DistributionError::ManifestCorrupt`].
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let manifest: ArtifactManifest = serde_json::from_slice(data)
            .map_err(|e| DistributionError::ManifestCorrupt(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check required invariants: supported schema version, our media
    /// type, at least one content layer.
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(DistributionError::ManifestCorrupt(format!(
                "unsupported schema version: {}",
                self.schema_version
            )));
        }
        if self.media_type != MANIFEST_MEDIA_TYPE {
            return Err(DistributionError::ManifestCorrupt(format!(
                "unexpected media type: {}",
                self.media_type
            )));
        }
        if self.layers.is_empty() {
            return Err(DistributionError::ManifestCorrupt(
                "manifest must contain at least one layer".to_string(),
            ));
        }
        Ok(())
    }
}

/// The artifact configuration blob. Records how the payload was split into
/// layers so `pull` can reassemble the original byte sequence.
///
/// Deliberately deterministic for a given payload (no timestamps): a
/// repeated push of identical content must hit the registry's existing
/// config blob and skip the upload. Provenance metadata lives in manifest
/// annotations instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactConfig {
    pub tool: String,
    /// Byte size of each payload part, in layer order.
    pub part_sizes: Vec<u64>,
}

impl ArtifactConfig {
    pub fn new(part_sizes: Vec<u64>) -> Self {
        Self {
            tool: concat!("floe-distribution/", env!("CARGO_PKG_VERSION")).to_string(),
            part_sizes,
        }
    }

    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| DistributionError::ManifestCorrupt(format!("artifact config: {e}")))
    }
}
