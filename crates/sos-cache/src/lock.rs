//! Cross-process refresh lock.
//!
//! The lock carries no ownership token: whoever holds a handle may release
//! it, including a watchdog that never acquired it. State is never cached in
//! memory; every call re-derives it from the backing store.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use sos_core::config::LOCK_FILE_NAME;
use sos_core::DirectoryResolver;
use tracing::{debug, info};

use crate::error::LockError;

/// Non-blocking mutual exclusion between refresh jobs.
///
/// A lease-based distributed lock can implement this for multi-host
/// deployments without touching the scheduler or watchdog.
pub trait MutualExclusion: Send + Sync {
    /// Single attempt to take the lock. `Ok(false)` means someone holds it.
    fn try_acquire(&self) -> Result<bool, LockError>;

    /// Drop the lock if present. Idempotent.
    fn release(&self) -> Result<(), LockError>;

    /// Whether the lock is currently held by anyone.
    fn is_held(&self) -> Result<bool, LockError>;
}

/// Lock represented by the existence of `cache.lock` in the cache base dir.
pub struct FileLock {
    resolver: Arc<dyn DirectoryResolver>,
}

impl FileLock {
    pub fn new(resolver: Arc<dyn DirectoryResolver>) -> Self {
        Self { resolver }
    }

    /// Resolve the lock file path. Re-resolved on every call.
    pub fn path(&self) -> Result<PathBuf, LockError> {
        let dir = self.resolver.cache_base_dir().map_err(LockError::Resolve)?;
        Ok(dir.join(LOCK_FILE_NAME))
    }
}

impl MutualExclusion for FileLock {
    fn try_acquire(&self) -> Result<bool, LockError> {
        let path = self.path()?;
        // create_new is atomic: exactly one concurrent creator wins.
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                // Diagnostics only; the file's existence is the lock.
                let _ = writeln!(
                    file,
                    "pid={} acquired_at={}",
                    std::process::id(),
                    chrono::Utc::now().to_rfc3339()
                );
                debug!(path = %path.display(), "cache lock acquired");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                info!(path = %path.display(), "cache lock already held");
                Ok(false)
            }
            Err(source) => Err(LockError::Io { path, source }),
        }
    }

    fn release(&self) -> Result<(), LockError> {
        let path = self.path()?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "cache lock released");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(LockError::Io { path, source }),
        }
    }

    fn is_held(&self) -> Result<bool, LockError> {
        let path = self.path()?;
        path.try_exists()
            .map_err(|source| LockError::Io { path: path.clone(), source })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use sos_core::FixedDirectory;

    use super::*;

    fn lock_in(dir: &std::path::Path) -> FileLock {
        FileLock::new(Arc::new(FixedDirectory::new(dir)))
    }

    #[test]
    fn acquire_release_cycle() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = lock_in(tmp.path());

        assert!(lock.try_acquire().unwrap());
        assert!(tmp.path().join(LOCK_FILE_NAME).exists());
        assert!(!lock.try_acquire().unwrap());

        lock.release().unwrap();
        assert!(!lock.is_held().unwrap());
        assert!(lock.try_acquire().unwrap());
    }

    #[test]
    fn release_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = lock_in(tmp.path());

        lock.release().unwrap();
        lock.release().unwrap();
        assert!(!lock.is_held().unwrap());
    }

    #[test]
    fn any_handle_may_release() {
        let tmp = tempfile::tempdir().unwrap();
        let owner = lock_in(tmp.path());
        let other = lock_in(tmp.path());

        assert!(owner.try_acquire().unwrap());
        other.release().unwrap();
        assert!(other.try_acquire().unwrap());
    }

    #[test]
    fn exactly_one_concurrent_acquirer_wins() {
        const CALLERS: usize = 16;
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().to_path_buf();
        let barrier = Arc::new(Barrier::new(CALLERS));

        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let lock = lock_in(&dir);
                thread::spawn(move || {
                    barrier.wait();
                    lock.try_acquire().unwrap()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn unresolvable_directory_is_recoverable_error() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("plain-file");
        std::fs::write(&file, "x").unwrap();
        let lock = lock_in(&file);

        assert!(matches!(lock.try_acquire(), Err(LockError::Resolve(_))));
        assert!(matches!(lock.release(), Err(LockError::Resolve(_))));
    }
}
