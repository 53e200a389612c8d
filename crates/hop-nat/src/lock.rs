//! Exclusive lock serializing rule mutation across processes.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{NatError, Result};

/// Held while owned chains are mutated. Released on drop.
#[derive(Debug)]
pub struct ChainLock {
    file: File,
    path: PathBuf,
}

impl ChainLock {
    /// Block until the lock at `path` is ours.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = open(path)?;
        file.lock().map_err(|source| NatError::Lock {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "chain lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Take the lock only if nobody holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let file = open(path)?;
        match file.try_lock() {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err(std::fs::TryLockError::WouldBlock) => Ok(None),
            Err(std::fs::TryLockError::Error(source)) => Err(NatError::Lock {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

impl Drop for ChainLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        debug!(path = %self.path.display(), "chain lock released");
    }
}

fn open(path: &Path) -> Result<File> {
    let lock_err = |source| NatError::Lock {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(lock_err)?;
    }
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(lock_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_holder_is_refused_until_release() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("hopnet.lock");

        let held = ChainLock::acquire(&path).expect("acquire");
        assert!(ChainLock::try_acquire(&path).expect("try").is_none());
        drop(held);
        assert!(ChainLock::try_acquire(&path).expect("try").is_some());
    }
}
