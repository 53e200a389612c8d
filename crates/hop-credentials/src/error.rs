//! Error types for credential operations.

use thiserror::Error;
use uuid::Uuid;

/// Result alias for credential operations.
pub type Result<T> = std::result::Result<T, CredentialError>;

/// Errors that can occur while issuing, storing or validating credentials.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// No credential with this id is registered.
    #[error("credential not found: {0}")]
    NotFound(Uuid),

    /// The peer identity is not recognised, or its key material does not
    /// match what this node already trusts.
    #[error("credential mismatch: {0}")]
    Mismatch(String),

    /// A credential with this id or name already exists.
    #[error("credential already exists: {0}")]
    Duplicate(String),

    /// Issuing credentials requires reality key material this node lacks.
    #[error("node cannot issue credentials: {0}")]
    NotIssuer(String),

    /// Invalid key format.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Invalid key length.
    #[error("invalid key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    /// Invalid short id.
    #[error("invalid short id: {0}")]
    InvalidShortId(String),

    /// Malformed share link or credential field.
    #[error("invalid credential field: {0}")]
    InvalidField(String),

    /// Persisting the registry failed.
    #[error(transparent)]
    Persist(#[from] hop_persist::PersistError),
}
