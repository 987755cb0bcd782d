//! Advisory file locks serializing access to shared on-disk state.
//!
//! Locks are `flock(2)` based, so they are held per open file and released
//! when the guard drops or the process dies.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use carte_common::error::{CarteError, Result};

/// An exclusive lock on a lock file, released on drop.
#[derive(Debug)]
pub struct FileLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl FileLock {
    /// Blocks until an exclusive lock on `path` is acquired.
    ///
    /// The file and its parent directories are created if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or locked.
    pub fn exclusive(path: &Path) -> Result<Self> {
        let file = open_lock_file(path)?;
        let lock = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, e)| lock_error(path, e))?;
        tracing::debug!(path = %path.display(), "lock acquired");
        Ok(Self {
            _lock: lock,
            path: path.to_path_buf(),
        })
    }

    /// Acquires the lock without blocking; `None` when another holder has it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or locked for a reason
    /// other than contention.
    pub fn try_exclusive(path: &Path) -> Result<Option<Self>> {
        let file = open_lock_file(path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(Some(Self {
                _lock: lock,
                path: path.to_path_buf(),
            })),
            Err((_, Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, e)) => Err(lock_error(path, e)),
        }
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CarteError::io(parent, e))?;
    }
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(|e| CarteError::io(path, e))
}

fn lock_error(path: &Path, err: Errno) -> CarteError {
    CarteError::Resource {
        message: format!("failed to lock {}: {err}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_holder_is_refused_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state.lock");

        let first = FileLock::exclusive(&path).unwrap();
        assert!(FileLock::try_exclusive(&path).unwrap().is_none());
        drop(first);

        let second = FileLock::try_exclusive(&path).unwrap();
        assert!(second.is_some());
        assert_eq!(second.unwrap().path(), path);
    }
}
