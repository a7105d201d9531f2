//! Error types for artifact distribution operations
//!
//! Every public operation returns one of the typed variants below, never a
//! bare error string, so callers can branch on kind. Messages carry the
//! reference, digest and host involved but never credential material.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DistributionError>;

#[derive(Debug, Error)]
pub enum DistributionError {
    /// A single network attempt failed (timeout, reset, 5xx, 429).
    /// Absorbed by the resilience layer; callers only see it once retries
    /// are exhausted, as [`DistributionError::NetworkExhausted`].
    #[error("network error: {0}")]
    Network(String),

    /// Retries exhausted against the registry.
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    NetworkExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    /// The circuit breaker for this host is open; no network call was made.
    #[error("registry {host} judged unavailable, failing fast (retry after {retry_after_secs}s)")]
    CircuitOpen { host: String, retry_after_secs: u64 },

    /// Fetched or cached content does not match its claimed digest.
    /// Always fatal, never retried.
    #[error("digest mismatch: expected {expected}, computed {computed}")]
    DigestMismatch { expected: String, computed: String },

    /// Manifest bytes failed to parse or violate the schema.
    #[error("corrupt manifest: {0}")]
    ManifestCorrupt(String),

    /// No configured mechanism produced a usable credential for this host.
    #[error("authentication failed for {host} (mechanism: {mechanism})")]
    Authentication { host: String, mechanism: String },

    /// The credential issuer was unreachable or the credential lapsed
    /// mid-operation. Retryable: prompts one refresh attempt.
    #[error("credential for {host} expired or issuer unreachable (mechanism: {mechanism})")]
    AuthExpired { host: String, mechanism: String },

    /// The registry confirmed the tag or digest does not exist.
    #[error("reference not found: {reference}")]
    ReferenceNotFound { reference: String },

    /// Local cache write failed (disk full, permission denied). Operations
    /// degrade to run without the cache rather than fail outright.
    #[error("cache write failed at {path}: {message}")]
    CacheWrite { message: String, path: PathBuf },

    /// The caller-supplied deadline elapsed; the in-flight call was
    /// abandoned.
    #[error("deadline exceeded during {operation}")]
    DeadlineExceeded { operation: String },

    /// Unexpected registry response (protocol violation, odd status).
    #[error("registry error: {0}")]
    Registry(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("io error: {0}")]
    Io(String),
}

impl DistributionError {
    /// Classification consumed by the retry loop. Transient transport
    /// failures are retryable; integrity, auth-config, validation and
    /// not-found errors propagate immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            DistributionError::Network(_) => true,
            DistributionError::AuthExpired { .. } => true,
            DistributionError::Io(_) => true,

            DistributionError::NetworkExhausted { .. } => false,
            DistributionError::CircuitOpen { .. } => false,
            DistributionError::DigestMismatch { .. } => false,
            DistributionError::ManifestCorrupt(_) => false,
            DistributionError::Authentication { .. } => false,
            DistributionError::ReferenceNotFound { .. } => false,
            DistributionError::CacheWrite { .. } => false,
            DistributionError::DeadlineExceeded { .. } => false,
            DistributionError::Registry(_) => false,
            DistributionError::Validation(_) => false,
            DistributionError::Parse(_) => false,
        }
    }
}

impl From<std::io::Error> for DistributionError {
    fn from(err: std::io::Error) -> Self {
        DistributionError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for DistributionError {
    fn from(err: serde_json::Error) -> Self {
        DistributionError::Parse(err.to_string())
    }
}

impl From<reqwest::Error> for DistributionError {
    fn from(err: reqwest::Error) -> Self {
        DistributionError::Network(err.to_string())
    }
}

impl From<url::ParseError> for DistributionError {
    fn from(err: url::ParseError) -> Self {
        DistributionError::Validation(err.to_string())
    }
}
