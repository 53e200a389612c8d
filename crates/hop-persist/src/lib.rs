//! JSON file-backed persistence for twinhop node state.
//!
//! Each store owns one file, `<state_dir>/<name>.json`. Writes go to a
//! sibling temp file first and are renamed into place, so a crash mid-write
//! never leaves a truncated snapshot behind.

#![forbid(unsafe_code)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised by [`JsonStore`].
#[derive(Debug, Error)]
pub enum PersistError {
    /// Filesystem failure.
    #[error("io error on {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Snapshot could not be (de)serialized.
    #[error("malformed snapshot {path}: {source}")]
    Serde {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },
}

/// A single JSON snapshot file.
#[derive(Debug, Clone)]
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    /// Create a store for `<state_dir>/<name>.json`. Nothing touches disk
    /// until the first load or save.
    pub fn new(state_dir: &Path, name: &str) -> Self {
        Self {
            path: state_dir.join(format!("{name}.json")),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a snapshot has been written.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the snapshot, `Ok(None)` if it was never written.
    pub fn try_load<T: DeserializeOwned>(&self) -> Result<Option<T>, PersistError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(PersistError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| PersistError::Serde {
                path: self.path.clone(),
                source,
            })
    }

    /// Load the snapshot, falling back to `T::default()` when it is missing
    /// or unreadable.
    pub fn load<T: DeserializeOwned + Default>(&self) -> T {
        match self.try_load() {
            Ok(Some(value)) => value,
            Ok(None) => T::default(),
            Err(e) => {
                warn!(error = %e, "discarding unreadable snapshot");
                T::default()
            }
        }
    }

    /// Atomically replace the snapshot.
    pub fn save<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), PersistError> {
        let io_err = |source| PersistError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let json = serde_json::to_vec_pretty(value).map_err(|source| PersistError::Serde {
            path: self.path.clone(),
            source,
        })?;

        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp).map_err(io_err)?;
            file.write_all(&json).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
        }
        fs::rename(&tmp, &self.path).map_err(io_err)?;

        debug!(path = %self.path.display(), bytes = json.len(), "snapshot written");
        Ok(())
    }

    /// Delete the snapshot if present.
    pub fn remove(&self) -> Result<(), PersistError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PersistError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}
