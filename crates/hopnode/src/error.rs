//! Error types for hopnode.

use hop_credentials::CredentialError;
use hop_nat::{NatError, Transport};
use hop_persist::PersistError;
use hop_render::RenderError;
use thiserror::Error;
use uuid::Uuid;

/// Result alias for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;

/// Errors that can occur in node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Configuration or rendered document is invalid. Fatal.
    #[error("configuration error: {0}")]
    ConfigValidation(String),

    /// Kernel rules could not be applied, even after retrying.
    #[error("rule apply failed: {0}")]
    RuleApply(String),

    /// The egress interface could not be determined. Operator input needed.
    #[error("egress interface resolution failed: {0}")]
    InterfaceResolution(String),

    /// The tunnel engine never started listening.
    #[error("listener {transport}/{port} not ready after {attempts} attempts")]
    ListenerNotReady {
        /// Port polled.
        port: u16,
        /// Transport polled.
        transport: Transport,
        /// Attempts made.
        attempts: u32,
    },

    /// A credential does not belong to this deployment. Never auto-resolved.
    #[error("credential mismatch: {0}")]
    CredentialMismatch(String),

    /// No credential with that id.
    #[error("credential not found: {0}")]
    CredentialNotFound(Uuid),

    /// Installed rules diverge from policy. Run `hopnode reapply`.
    #[error("{count} rule drift(s) detected; run `hopnode reapply`")]
    DriftDetected {
        /// Number of divergences.
        count: usize,
    },

    /// Container supervisor failure.
    #[error("container error: {0}")]
    Container(String),

    /// Egress probe failure.
    #[error("probe failed: {0}")]
    Probe(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// State persistence error.
    #[error("persistence error: {0}")]
    Persist(#[from] PersistError),
}

impl From<NatError> for NodeError {
    fn from(err: NatError) -> Self {
        match err {
            NatError::EgressUnresolved => {
                Self::InterfaceResolution("no egress interface known".into())
            }
            NatError::InvalidPolicy(msg) => Self::ConfigValidation(msg),
            NatError::Persist(e) => Self::Persist(e),
            other => Self::RuleApply(other.to_string()),
        }
    }
}

impl From<CredentialError> for NodeError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::NotFound(id) => Self::CredentialNotFound(id),
            CredentialError::Mismatch(msg) => Self::CredentialMismatch(msg),
            CredentialError::Persist(e) => Self::Persist(e),
            other => Self::ConfigValidation(other.to_string()),
        }
    }
}

impl From<RenderError> for NodeError {
    fn from(err: RenderError) -> Self {
        match err {
            RenderError::ConfigValidation(msg) => Self::ConfigValidation(msg),
            RenderError::Io(e) => Self::Io(e),
            other @ RenderError::Serde(_) => Self::ConfigValidation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_not_ready_display() {
        let err = NodeError::ListenerNotReady {
            port: 11081,
            transport: Transport::Udp,
            attempts: 20,
        };
        assert_eq!(err.to_string(), "listener udp/11081 not ready after 20 attempts");
    }

    #[test]
    fn test_drift_display_suggests_reapply() {
        let err = NodeError::DriftDetected { count: 2 };
        assert!(err.to_string().contains("hopnode reapply"));
    }

    #[test]
    fn test_nat_errors_map_to_taxonomy() {
        assert!(matches!(
            NodeError::from(NatError::EgressUnresolved),
            NodeError::InterfaceResolution(_)
        ));
        assert!(matches!(
            NodeError::from(NatError::Backend("x".into())),
            NodeError::RuleApply(_)
        ));
        assert!(matches!(
            NodeError::from(NatError::InvalidPolicy("x".into())),
            NodeError::ConfigValidation(_)
        ));
    }

    #[test]
    fn test_credential_errors_map_to_taxonomy() {
        let id = Uuid::new_v4();
        assert!(matches!(
            NodeError::from(CredentialError::NotFound(id)),
            NodeError::CredentialNotFound(found) if found == id
        ));
        assert!(matches!(
            NodeError::from(CredentialError::Mismatch("key".into())),
            NodeError::CredentialMismatch(_)
        ));
    }
}
