//! Cross-process advisory lock for the store file.
//!
//! The lock is a sidecar file created with `create_new` — whichever process
//! wins the create owns the store until the guard drops. A holder that
//! crashes leaves the file behind, so locks older than `stale_after` are
//! reclaimed instead of deadlocking every future writer. Acquisition retries
//! with randomized exponential backoff up to a bounded attempt count, which
//! keeps worst-case latency bounded under contention.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Suffix appended to the store path to form the lock path.
const LOCK_SUFFIX: &str = ".lock";

/// Staleness and backoff parameters.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// A lock held longer than this is presumed abandoned and reclaimed.
    pub stale_after: Duration,
    /// Give up with `LockContended` after this many acquisition attempts.
    pub max_attempts: u32,
    /// First backoff delay; doubles per attempt.
    pub base_delay: Duration,
    /// Backoff ceiling.
    pub max_delay: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(30),
            max_attempts: 10,
            base_delay: Duration::from_millis(25),
            max_delay: Duration::from_millis(500),
        }
    }
}

/// Held lock on a store file. Released on drop.
#[derive(Debug)]
pub struct StoreLock {
    lock_path: PathBuf,
}

impl StoreLock {
    /// Acquire an exclusive lock for the store at `store_path`, blocking the
    /// calling thread through the backoff schedule if contended.
    pub fn acquire(store_path: &Path, config: &LockConfig) -> Result<Self> {
        let lock_path = lock_path_for(store_path);

        for attempt in 0..config.max_attempts {
            match try_create(&lock_path) {
                Ok(()) => {
                    debug!(path = %lock_path.display(), attempt, "store lock acquired");
                    return Ok(Self { lock_path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if reclaim_if_stale(&lock_path, config.stale_after)? {
                        // Removed a stale lock; loop again to race for create_new.
                        continue;
                    }
                    std::thread::sleep(backoff_delay(config, attempt));
                }
                Err(e) => return Err(Error::Storage(e)),
            }
        }

        Err(Error::LockContended {
            path: lock_path.display().to_string(),
            attempts: config.max_attempts,
        })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.lock_path) {
            // Someone may have reclaimed us as stale; nothing to do but note it.
            warn!(path = %self.lock_path.display(), "failed to release store lock: {e}");
        }
    }
}

fn lock_path_for(store_path: &Path) -> PathBuf {
    let mut os = store_path.as_os_str().to_owned();
    os.push(LOCK_SUFFIX);
    PathBuf::from(os)
}

/// Create the lock file exclusively, writing the holder pid for diagnostics.
fn try_create(lock_path: &Path) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)?;
    write!(file, "{}", std::process::id())?;
    Ok(())
}

/// Remove the lock file if its mtime is older than `stale_after`.
/// Returns true when a stale lock was removed.
fn reclaim_if_stale(lock_path: &Path, stale_after: Duration) -> Result<bool> {
    let meta = match std::fs::metadata(lock_path) {
        Ok(m) => m,
        // Holder released between our create attempt and now.
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(Error::Storage(e)),
    };

    let age = meta
        .modified()
        .ok()
        .and_then(|t| t.elapsed().ok())
        .unwrap_or(Duration::ZERO);

    if age > stale_after {
        warn!(
            path = %lock_path.display(),
            age_ms = age.as_millis() as u64,
            "reclaiming stale store lock"
        );
        match std::fs::remove_file(lock_path) {
            Ok(()) => Ok(true),
            // Lost the reclaim race to another acquirer.
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => Err(Error::Storage(e)),
        }
    } else {
        Ok(false)
    }
}

/// Exponential backoff with jitter: base * 2^attempt, scaled by 0.5–1.5,
/// capped at `max_delay`.
fn backoff_delay(config: &LockConfig, attempt: u32) -> Duration {
    let exp = config
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(config.max_delay);
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    exp.mul_f64(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fast_config() -> LockConfig {
        LockConfig {
            stale_after: Duration::from_secs(30),
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn acquire_and_release() {
        let dir = tempdir().unwrap();
        let store = dir.path().join("queue.json");

        let lock = StoreLock::acquire(&store, &fast_config()).unwrap();
        assert!(lock_path_for(&store).exists());
        drop(lock);
        assert!(!lock_path_for(&store).exists());
    }

    #[test]
    fn contended_lock_errors_after_bounded_attempts() {
        let dir = tempdir().unwrap();
        let store = dir.path().join("queue.json");

        let _held = StoreLock::acquire(&store, &fast_config()).unwrap();
        let err = StoreLock::acquire(&store, &fast_config()).unwrap_err();
        match err {
            Error::LockContended { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected LockContended, got {other:?}"),
        }
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = tempdir().unwrap();
        let store = dir.path().join("queue.json");
        let lock_path = lock_path_for(&store);

        // Fabricate an abandoned lock and backdate it past the threshold.
        std::fs::write(&lock_path, "99999").unwrap();
        let old = std::time::SystemTime::now() - Duration::from_secs(120);
        let file = OpenOptions::new().write(true).open(&lock_path).unwrap();
        file.set_modified(old).unwrap();

        let config = LockConfig {
            stale_after: Duration::from_secs(60),
            ..fast_config()
        };
        let lock = StoreLock::acquire(&store, &config).unwrap();
        drop(lock);
    }
}
