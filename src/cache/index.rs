//! Persisted cache metadata index (digest -> entry)
//!
//! Stored as JSON at `<cache_root>/index/entries.json`. All mutation
//! happens under the index lock; the file itself is replaced via
//! temp+rename so a crashed writer never leaves a truncated index behind.

use crate::error::{DistributionError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Metadata for one cached blob. Timestamps are unix seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexEntry {
    pub size: u64,
    pub last_accessed: u64,
    pub ttl_expiry: u64,
}

impl IndexEntry {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.ttl_expiry
    }
}

/// The in-memory view of the index, loaded and saved under the lock.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CacheIndex {
    /// Keyed by digest hex (without the algorithm prefix).
    pub entries: HashMap<String, IndexEntry>,
}

impl CacheIndex {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)?;
        match serde_json::from_str(&contents) {
            Ok(index) => Ok(index),
            Err(e) => {
                // A corrupt index is rebuilt from scratch rather than
                // propagated: the cache is an optimization, not a source
                // of truth.
                warn!(path = %path.display(), error = %e, "cache index unreadable, starting fresh");
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string(self)?;
        let tmp: PathBuf = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).map_err(|e| DistributionError::CacheWrite {
            message: e.to_string(),
            path: tmp.clone(),
        })?;
        file.write_all(json.as_bytes())
            .map_err(|e| DistributionError::CacheWrite {
                message: e.to_string(),
                path: tmp.clone(),
            })?;
        file.sync_all().map_err(|e| DistributionError::CacheWrite {
            message: e.to_string(),
            path: tmp.clone(),
        })?;
        drop(file);
        fs::rename(&tmp, path).map_err(|e| DistributionError::CacheWrite {
            message: e.to_string(),
            path: path.to_path_buf(),
        })?;
        Ok(())
    }

    pub fn total_size(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
