//! Disk-backed, digest-verified blob cache
//!
//! Layout under the cache root:
//!
//! ```text
//! <cache_root>/
//!   index/entries.json    # metadata index, guarded by index/.lock
//!   blobs/sha256/<hex>    # content-addressed blobs, temp+rename writes
//! ```
//!
//! Blobs are content-addressed and never mutated in place: writers produce
//! a temp file and atomically rename it over the final path, so no reader
//! ever observes a partially written entry. Two writers racing to insert
//! the same digest converge on identical content. The metadata index is
//! the only lock-guarded piece; the lock is never held across a blob
//! transfer.
//!
//! Reads are digest-verified. A verification failure is treated as a cache
//! miss (the corrupt entry is evicted) rather than an error; the cache is
//! a performance optimization, never a source of truth.

pub mod index;
pub mod lock;

use crate::config::CacheConfig;
use crate::error::{DistributionError, Result};
use crate::manifest::Digest;
use index::{CacheIndex, IndexEntry, unix_now};
use lock::IndexLock;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

const INDEX_DIR: &str = "index";
const INDEX_FILE: &str = "entries.json";
const LOCK_FILE: &str = ".lock";
const BLOBS_DIR: &str = "blobs";

/// Caller-visible view of one cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub digest: Digest,
    pub local_path: PathBuf,
    pub size: u64,
    pub last_accessed: u64,
    pub ttl_expiry: u64,
    pub ref_count: usize,
}

/// Scoped read reference. While alive, the entry it pins cannot be
/// evicted; the count is released on drop, on every exit path.
struct RefGuard {
    counts: Arc<Mutex<HashMap<String, usize>>>,
    key: String,
}

impl RefGuard {
    fn acquire(counts: &Arc<Mutex<HashMap<String, usize>>>, key: &str) -> Self {
        let mut map = counts.lock().expect("ref count map poisoned");
        *map.entry(key.to_string()).or_insert(0) += 1;
        Self {
            counts: Arc::clone(counts),
            key: key.to_string(),
        }
    }
}

impl Drop for RefGuard {
    fn drop(&mut self) {
        let mut map = self.counts.lock().expect("ref count map poisoned");
        if let Some(count) = map.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                map.remove(&self.key);
            }
        }
    }
}

/// The local blob cache, safe for concurrent use by multiple threads and
/// multiple processes sharing one cache directory.
///
/// Ref-counts are process-local: a crashed process can never leak a count
/// that would pin an entry forever. Cross-process read safety comes from
/// content-addressed immutability plus atomic renames.
pub struct BlobCache {
    root: PathBuf,
    ttl_secs: u64,
    max_bytes: u64,
    ref_counts: Arc<Mutex<HashMap<String, usize>>>,
}

impl BlobCache {
    pub fn new(config: &CacheConfig) -> Result<Self> {
        let root = config.root.clone();
        fs::create_dir_all(root.join(INDEX_DIR))?;
        fs::create_dir_all(root.join(BLOBS_DIR).join(Digest::ALGORITHM))?;
        Ok(Self {
            root,
            ttl_secs: config.ttl_secs,
            max_bytes: config.max_bytes,
            ref_counts: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join(BLOBS_DIR)
            .join(Digest::ALGORITHM)
            .join(digest.hex())
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_DIR).join(INDEX_FILE)
    }

    fn lock_path(&self) -> PathBuf {
        self.root.join(INDEX_DIR).join(LOCK_FILE)
    }

    fn ref_count_of(&self, key: &str) -> usize {
        self.ref_counts
            .lock()
            .expect("ref count map poisoned")
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Run one critical section against the index: lock, load, mutate,
    /// save, unlock.
    fn with_index<R>(&self, f: impl FnOnce(&mut CacheIndex) -> Result<R>) -> Result<R> {
        let _lock = IndexLock::acquire(self.lock_path())?;
        let mut index = CacheIndex::load(&self.index_path())?;
        let result = f(&mut index)?;
        index.save(&self.index_path())?;
        Ok(result)
    }

    /// Fetch cached bytes for `digest`. Returns `None` on absence, expiry,
    /// or digest-verification failure (the corrupt entry is evicted). A
    /// hit updates `last_accessed` and holds a ref-count for the duration
    /// of the read.
    pub fn get(&self, digest: &Digest) -> Result<Option<Vec<u8>>> {
        let now = unix_now();
        let found = self.with_index(|index| {
            match index.entries.get_mut(digest.hex()) {
                Some(entry) if !entry.is_expired(now) => {
                    entry.last_accessed = now;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })?;
        if !found {
            return Ok(None);
        }

        // Pin the entry before touching the blob so no sweep can remove it
        // mid-read. The blob read itself happens outside the index lock.
        let guard = RefGuard::acquire(&self.ref_counts, digest.hex());
        let path = self.blob_path(digest);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) => {
                warn!(digest = %digest, error = %e, "cached blob unreadable, evicting");
                drop(guard);
                self.evict_entry(digest)?;
                return Ok(None);
            }
        };

        if digest.verify(&data).is_err() {
            warn!(digest = %digest, "cached blob failed digest verification, evicting");
            drop(guard);
            self.evict_entry(digest)?;
            return Ok(None);
        }

        drop(guard);
        debug!(digest = %digest, size = data.len(), "cache hit");
        Ok(Some(data))
    }

    /// Insert verified bytes under `digest`. A no-op if the entry already
    /// exists: content-addressed entries are immutable, so racing writers
    /// converge on identical content.
    pub fn put(&self, digest: &Digest, data: &[u8]) -> Result<CacheEntry> {
        digest.verify(data)?;

        let path = self.blob_path(digest);
        if !path.exists() {
            self.write_blob_atomically(&path, data)?;
        }

        let now = unix_now();
        let ttl_expiry = now + self.ttl_secs;
        let entry = self.with_index(|index| {
            let entry = index
                .entries
                .entry(digest.hex().to_string())
                .or_insert_with(|| IndexEntry {
                    size: data.len() as u64,
                    last_accessed: now,
                    ttl_expiry,
                });
            Ok(entry.clone())
        })?;

        debug!(digest = %digest, size = data.len(), "cached blob");
        Ok(CacheEntry {
            digest: digest.clone(),
            local_path: path,
            size: entry.size,
            last_accessed: entry.last_accessed,
            ttl_expiry: entry.ttl_expiry,
            ref_count: self.ref_count_of(digest.hex()),
        })
    }

    fn write_blob_atomically(&self, path: &PathBuf, data: &[u8]) -> Result<()> {
        let parent = path.parent().expect("blob path has a parent");
        let tmp = parent.join(format!(".tmp-{}", uuid::Uuid::new_v4()));

        let write = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
            Ok(())
        })();
        if let Err(e) = write {
            let _ = fs::remove_file(&tmp);
            return Err(DistributionError::CacheWrite {
                message: e.to_string(),
                path: tmp,
            });
        }

        fs::rename(&tmp, path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            DistributionError::CacheWrite {
                message: e.to_string(),
                path: path.clone(),
            }
        })
    }

    /// Whether `digest` is present and unexpired. Does not verify content.
    pub fn contains(&self, digest: &Digest) -> bool {
        let now = unix_now();
        self.with_index(|index| {
            Ok(index
                .entries
                .get(digest.hex())
                .is_some_and(|e| !e.is_expired(now)))
        })
        .unwrap_or(false)
    }

    fn evict_entry(&self, digest: &Digest) -> Result<()> {
        self.with_index(|index| {
            index.entries.remove(digest.hex());
            Ok(())
        })?;
        let _ = fs::remove_file(self.blob_path(digest));
        Ok(())
    }

    /// Sweep entries whose TTL has passed and that are not currently being
    /// read. Entries with a live ref-count are skipped this pass and
    /// retried on the next sweep. Returns the number evicted.
    pub fn evict_expired(&self) -> Result<usize> {
        let now = unix_now();
        let evicted = self.with_index(|index| {
            let victims: Vec<String> = index
                .entries
                .iter()
                .filter(|(hex, entry)| entry.is_expired(now) && self.ref_count_of(hex) == 0)
                .map(|(hex, _)| hex.clone())
                .collect();
            for hex in &victims {
                index.entries.remove(hex);
            }
            Ok(victims)
        })?;

        for hex in &evicted {
            let _ = fs::remove_file(
                self.root.join(BLOBS_DIR).join(Digest::ALGORITHM).join(hex),
            );
        }
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted expired cache entries");
        }
        Ok(evicted.len())
    }

    /// Evict least-recently-accessed, zero-ref-count entries until total
    /// size is at or under `max_bytes`. Entries currently in use are never
    /// evicted, even if that leaves the cache over the limit.
    pub fn enforce_size_limit(&self, max_bytes: u64) -> Result<usize> {
        let evicted = self.with_index(|index| {
            let mut total = index.total_size();
            if total <= max_bytes {
                return Ok(Vec::new());
            }

            let mut candidates: Vec<(String, u64, u64)> = index
                .entries
                .iter()
                .filter(|(hex, _)| self.ref_count_of(hex) == 0)
                .map(|(hex, e)| (hex.clone(), e.last_accessed, e.size))
                .collect();
            candidates.sort_by_key(|(_, last_accessed, _)| *last_accessed);

            let mut victims = Vec::new();
            for (hex, _, size) in candidates {
                if total <= max_bytes {
                    break;
                }
                index.entries.remove(&hex);
                total -= size;
                victims.push(hex);
            }
            Ok(victims)
        })?;

        for hex in &evicted {
            let _ = fs::remove_file(
                self.root.join(BLOBS_DIR).join(Digest::ALGORITHM).join(hex),
            );
        }
        Ok(evicted.len())
    }

    /// Apply the configured size ceiling.
    pub fn enforce_configured_limit(&self) -> Result<usize> {
        self.enforce_size_limit(self.max_bytes)
    }

    /// Total bytes currently accounted for in the index.
    pub fn total_size(&self) -> Result<u64> {
        self.with_index(|index| Ok(index.total_size()))
    }
}
