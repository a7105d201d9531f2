//! Lock-file guard for the cache metadata index
//!
//! The cache directory may be shared by independent processes (parallel CI
//! jobs on one host). Index mutation is guarded by a lock-file convention:
//! `create_new` wins the lock, losers poll, and a lock older than the stale
//! threshold is assumed abandoned by a crashed process and taken over. The
//! lock is held only around index reads/writes, never across a blob
//! transfer.

use crate::error::{DistributionError, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::warn;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);
/// A lock this old belongs to a crashed process.
const STALE_THRESHOLD: Duration = Duration::from_secs(60);

/// Held for the duration of one index critical section; released on drop.
#[derive(Debug)]
pub struct IndexLock {
    path: PathBuf,
}

impl IndexLock {
    /// Acquire the lock at `path`, polling until it frees up or the
    /// acquisition timeout elapses.
    pub fn acquire(path: PathBuf) -> Result<Self> {
        let start = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let now = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_secs();
                    // pid:acquired_at, for stale-lock diagnostics only
                    let _ = write!(file, "{}:{}", std::process::id(), now);
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Self::is_stale(&path) {
                        warn!(path = %path.display(), "taking over stale cache index lock");
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if start.elapsed() >= ACQUIRE_TIMEOUT {
                        return Err(DistributionError::Io(format!(
                            "timed out acquiring cache index lock at {}",
                            path.display()
                        )));
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    return Err(DistributionError::Io(format!(
                        "cannot create cache index lock at {}: {e}",
                        path.display()
                    )));
                }
            }
        }
    }

    fn is_stale(path: &PathBuf) -> bool {
        let Ok(contents) = fs::read_to_string(path) else {
            return false;
        };
        let Some((_, acquired_at)) = contents.split_once(':') else {
            // Unparseable lock contents: treat as stale.
            return true;
        };
        let Ok(acquired_at) = acquired_at.trim().parse::<u64>() else {
            return true;
        };
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        now.saturating_sub(acquired_at) > STALE_THRESHOLD.as_secs()
    }
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
