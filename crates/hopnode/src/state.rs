//! Node state persisted across restarts.
//!
//! The role marker is written once at provisioning and never rewritten with
//! a different role. The policy record holds the two values that outlive a
//! reboot: the subordinate toggle and the last egress interface.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use hop_persist::JsonStore;
use hop_render::NodeRole;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{NodeError, Result};

/// File name of the role marker under the state dir.
pub const ROLE_MARKER: &str = "role";

/// Key-value record of mutable policy parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRecord {
    /// Subordinate client subnet goes through the tunnel.
    pub tunnel_subordinate: bool,
    /// Interface the masquerade was last bound to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress_interface: Option<String>,
    /// Last change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Persisted node state under one state dir.
#[derive(Debug, Clone)]
pub struct NodeState {
    state_dir: PathBuf,
    policy: JsonStore,
}

impl NodeState {
    /// State rooted at `state_dir`.
    pub fn new(state_dir: &Path) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
            policy: JsonStore::new(state_dir, "policy"),
        }
    }

    /// State directory.
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn role_path(&self) -> PathBuf {
        self.state_dir.join(ROLE_MARKER)
    }

    /// The persisted role, `None` before provisioning.
    pub fn role(&self) -> Result<Option<NodeRole>> {
        match fs::read_to_string(self.role_path()) {
            Ok(raw) => Ok(Some(raw.parse()?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the role marker. Rewriting the same role is a no-op; changing it
    /// is refused.
    pub fn write_role(&self, role: NodeRole) -> Result<()> {
        match self.role()? {
            Some(existing) if existing == role => {
                debug!(%role, "role marker already present");
                Ok(())
            }
            Some(existing) => Err(NodeError::ConfigValidation(format!(
                "node is provisioned as {existing}; role cannot change to {role}"
            ))),
            None => {
                fs::create_dir_all(&self.state_dir)?;
                fs::write(self.role_path(), format!("{role}\n"))?;
                info!(%role, "wrote role marker");
                Ok(())
            }
        }
    }

    /// The policy record, `None` if never saved.
    pub fn policy(&self) -> Result<Option<PolicyRecord>> {
        Ok(self.policy.try_load()?)
    }

    /// Replace the policy record, stamping it.
    pub fn save_policy(&self, record: &PolicyRecord) -> Result<()> {
        let record = PolicyRecord {
            updated_at: Some(Utc::now()),
            ..record.clone()
        };
        self.policy.save(&record)?;
        debug!(
            tunnel_subordinate = record.tunnel_subordinate,
            egress = record.egress_interface.as_deref().unwrap_or("-"),
            "policy record saved"
        );
        Ok(())
    }
}
