//! Cross-process advisory locks backed by `flock(2)`
//!
//! Locks are taken non-blocking and polled with a tokio timer so waiting never
//! ties up a runtime worker thread. `flock` locks belong to the open file
//! description, so two handles in the same process exclude each other too.

use crate::error::{CacheError, CacheResult};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Held exclusive lock; released on drop
pub struct FileLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl std::fmt::Debug for FileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLock").field("path", &self.path).finish()
    }
}

impl FileLock {
    /// Try once; `Ok(None)` when another holder has it
    pub fn try_acquire(path: &Path) -> CacheResult<Option<Self>> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| CacheError::io(format!("cannot open lock file {:?}", path), e))?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(Some(Self {
                _lock: lock,
                path: path.to_path_buf(),
            })),
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => Ok(None),
            Err((_, errno)) => Err(CacheError::Io(format!(
                "cannot lock {:?}: {}",
                path, errno
            ))),
        }
    }

    /// Wait until the lock is ours
    pub async fn acquire(path: &Path, poll: Duration) -> CacheResult<Self> {
        Self::acquire_cancellable(path, poll, &CancellationToken::new(), "").await
    }

    /// Wait until the lock is ours or `cancel` fires
    ///
    /// `label` names the model in the `Aborted` error.
    pub async fn acquire_cancellable(
        path: &Path,
        poll: Duration,
        cancel: &CancellationToken,
        label: &str,
    ) -> CacheResult<Self> {
        let mut logged = false;
        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                return Ok(lock);
            }
            if !logged {
                tracing::debug!(lock = ?path, "Lock held elsewhere, waiting");
                logged = true;
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(CacheError::Aborted { model: label.to_string() });
                }
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
