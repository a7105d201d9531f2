//! Content digests in algorithm-prefixed string form (`sha256:<hex>`)
//!
//! Digests identify immutable byte sequences; they are stable across
//! platforms and process restarts for the same bytes.

use crate::error::{DistributionError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha2Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// An algorithm-prefixed content hash, e.g.
/// `sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855`.
///
/// Only SHA-256 is currently supported; unrecognized algorithms are
/// rejected at parse time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    hex: String,
}

impl Digest {
    pub const ALGORITHM: &'static str = "sha256";

    /// Compute the digest of a byte sequence. Deterministic: identical
    /// bytes always yield the identical digest string.
    pub fn from_bytes(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self {
            hex: hex::encode(hash),
        }
    }

    /// Parse from either the full `sha256:<hex>` form or a bare 64-char
    /// hex string.
    pub fn parse(s: &str) -> Result<Self> {
        let hex_part = match s.split_once(':') {
            Some((algo, hex)) => {
                if algo != Self::ALGORITHM {
                    return Err(DistributionError::Validation(format!(
                        "unsupported digest algorithm: {algo}"
                    )));
                }
                hex
            }
            None => s,
        };
        if hex_part.len() != 64 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DistributionError::Validation(format!(
                "invalid digest: expected 64 hex characters, got '{hex_part}'"
            )));
        }
        Ok(Self {
            hex: hex_part.to_ascii_lowercase(),
        })
    }

    /// Hex portion without the algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Recompute the digest of `data` and compare. Mismatch is a hard
    /// error, never a warning.
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        let computed = Digest::from_bytes(data);
        if computed != *self {
            return Err(DistributionError::DigestMismatch {
                expected: self.to_string(),
                computed: computed.to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", Self::ALGORITHM, self.hex)
    }
}

impl FromStr for Digest {
    type Err = DistributionError;

    fn from_str(s: &str) -> Result<Self> {
        Digest::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = DistributionError;

    fn try_from(s: String) -> Result<Self> {
        Digest::parse(&s)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> String {
        d.to_string()
    }
}
