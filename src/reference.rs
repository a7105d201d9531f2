//! Registry references: `host/repository:tag` and `host/repository@digest`
//!
//! A reference pinned by digest is immutable; a reference pinned by tag is
//! mutable and is re-resolved against the registry on every use.

use crate::error::{DistributionError, Result};
use crate::manifest::Digest;
use std::fmt;
use std::str::FromStr;

/// Tag or digest pinning of a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceKind {
    /// Mutable pointer; may move between pushes.
    Tag(String),
    /// Immutable content address.
    Digest(Digest),
}

/// A parsed registry reference: registry host, repository path, and either
/// a tag or a digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryReference {
    pub host: String,
    pub repository: String,
    pub kind: ReferenceKind,
}

impl RegistryReference {
    pub fn with_tag(host: &str, repository: &str, tag: &str) -> Self {
        Self {
            host: host.to_string(),
            repository: repository.to_string(),
            kind: ReferenceKind::Tag(tag.to_string()),
        }
    }

    pub fn with_digest(host: &str, repository: &str, digest: Digest) -> Self {
        Self {
            host: host.to_string(),
            repository: repository.to_string(),
            kind: ReferenceKind::Digest(digest),
        }
    }

    /// Parse `host/repo[:tag|@digest]`. The host is the first path
    /// segment; an `https://` or `http://` scheme prefix is tolerated and
    /// stripped. A reference with neither tag nor digest defaults to the
    /// `latest` tag.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input
            .trim()
            .trim_start_matches("https://")
            .trim_start_matches("http://");

        let (host, rest) = input.split_once('/').ok_or_else(|| {
            DistributionError::Validation(format!(
                "invalid reference '{input}': expected host/repository"
            ))
        })?;
        if host.is_empty() {
            return Err(DistributionError::Validation(format!(
                "invalid reference '{input}': empty registry host"
            )));
        }

        if let Some((repository, digest)) = rest.split_once('@') {
            let digest = Digest::parse(digest)?;
            return Ok(Self::with_digest(host, Self::check_repo(repository)?, digest));
        }

        // A ':' after the last '/' separates the tag; earlier colons would
        // belong to a host port, which is part of `host` already.
        match rest.rsplit_once(':') {
            Some((repository, tag)) if !tag.contains('/') => {
                if tag.is_empty() {
                    return Err(DistributionError::Validation(format!(
                        "invalid reference '{input}': empty tag"
                    )));
                }
                Ok(Self::with_tag(host, Self::check_repo(repository)?, tag))
            }
            _ => Ok(Self::with_tag(host, Self::check_repo(rest)?, "latest")),
        }
    }

    fn check_repo(repository: &str) -> Result<&str> {
        if repository.is_empty() {
            return Err(DistributionError::Validation(
                "invalid reference: empty repository path".to_string(),
            ));
        }
        Ok(repository)
    }

    /// The digest this reference is pinned to, if it is digest-pinned.
    pub fn pinned_digest(&self) -> Option<&Digest> {
        match &self.kind {
            ReferenceKind::Digest(d) => Some(d),
            ReferenceKind::Tag(_) => None,
        }
    }

    /// Tag or digest in the string form the registry API expects.
    pub fn reference_part(&self) -> String {
        match &self.kind {
            ReferenceKind::Tag(tag) => tag.clone(),
            ReferenceKind::Digest(digest) => digest.to_string(),
        }
    }

    /// The same repository pinned to `digest`.
    pub fn pinned(&self, digest: Digest) -> RegistryReference {
        RegistryReference::with_digest(&self.host, &self.repository, digest)
    }
}

impl fmt::Display for RegistryReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ReferenceKind::Tag(tag) => write!(f, "{}/{}:{}", self.host, self.repository, tag),
            ReferenceKind::Digest(digest) => {
                write!(f, "{}/{}@{}", self.host, self.repository, digest)
            }
        }
    }
}

impl FromStr for RegistryReference {
    type Err = DistributionError;

    fn from_str(s: &str) -> Result<Self> {
        RegistryReference::parse(s)
    }
}
