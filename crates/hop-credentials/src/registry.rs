//! Credential registry.
//!
//! The Entry node issues credentials: each one gets a fresh UUID and short
//! id, and all of them share the node's reality key pair, generated the
//! first time anything is issued. Relays never issue; they import the
//! credential the Entry handed out (usually as a share link) and must never
//! hold the Entry's private key.

use std::fmt;
use std::net::IpAddr;
use std::path::Path;

use chrono::{DateTime, Utc};
use hop_persist::JsonStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::error::{CredentialError, Result};
use crate::keys::{Fingerprint, KeyPair, PrivateKey, PublicKey, ShortId};

/// Attempts at drawing a non-colliding UUID before giving up.
const MAX_ID_DRAWS: usize = 16;

/// Flow mode every credential is issued with.
pub const VISION_FLOW: &str = "xtls-rprx-vision";

/// Where a Relay reaches its Entry node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelEndpoint {
    /// Hostname or IP address of the Entry node.
    pub address: String,
    /// Port of the Entry's tunnel listener.
    pub port: u16,
}

impl TunnelEndpoint {
    /// Create an endpoint.
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl fmt::Display for TunnelEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => write!(f, "[{v6}]:{}", self.port),
            _ => write!(f, "{}:{}", self.address, self.port),
        }
    }
}

/// Identity of one tunnel peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Peer identity presented during the tunnel handshake.
    pub id: Uuid,
    /// Operator-facing label.
    pub name: String,
    /// Reality private key; `None` everywhere except on the Entry node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<PrivateKey>,
    /// Reality public key of the Entry node.
    pub public_key: PublicKey,
    /// Reality short id assigned to this peer.
    pub short_id: ShortId,
    /// Server name the handshake impersonates.
    pub sni: String,
    /// TLS client fingerprint the Relay presents.
    pub fingerprint: Fingerprint,
    /// Issue time.
    pub created_at: DateTime<Utc>,
}

impl Credential {
    /// Copy of this credential safe to hand to a Relay.
    #[must_use]
    pub fn without_private_key(&self) -> Self {
        Self {
            private_key: None,
            ..self.clone()
        }
    }

    /// Render a `vless://` share link pointing at `endpoint`.
    #[must_use]
    pub fn share_link(&self, endpoint: &TunnelEndpoint) -> String {
        let host = match endpoint.address.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("[{v6}]"),
            _ => endpoint.address.clone(),
        };
        let mut link = format!("vless://{}@{host}:{}", self.id, endpoint.port);
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query
            .append_pair("encryption", "none")
            .append_pair("flow", VISION_FLOW)
            .append_pair("security", "reality")
            .append_pair("sni", &self.sni)
            .append_pair("fp", self.fingerprint.as_str())
            .append_pair("pbk", &self.public_key.encode())
            .append_pair("sid", self.short_id.as_str())
            .append_pair("type", "tcp");
        link.push('?');
        link.push_str(&query.finish());
        link.push('#');
        link.push_str(&url::form_urlencoded::byte_serialize(self.name.as_bytes()).collect::<String>());
        link
    }

    /// Parse a share link produced by [`Credential::share_link`].
    pub fn from_share_link(link: &str) -> Result<(Self, TunnelEndpoint)> {
        let url = Url::parse(link.trim())
            .map_err(|e| CredentialError::InvalidField(format!("share link: {e}")))?;
        if url.scheme() != "vless" {
            return Err(CredentialError::InvalidField(format!(
                "share link scheme '{}' is not vless",
                url.scheme()
            )));
        }

        let id = Uuid::parse_str(url.username())
            .map_err(|e| CredentialError::InvalidField(format!("share link id: {e}")))?;
        let address = url
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
            .filter(|h| !h.is_empty())
            .ok_or_else(|| CredentialError::InvalidField("share link has no host".into()))?;
        let port = url
            .port()
            .ok_or_else(|| CredentialError::InvalidField("share link has no port".into()))?;

        let param = |key: &str| {
            url.query_pairs()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.into_owned())
                .ok_or_else(|| CredentialError::InvalidField(format!("share link missing '{key}'")))
        };

        let security = param("security")?;
        if security != "reality" {
            return Err(CredentialError::InvalidField(format!(
                "share link security '{security}' is not reality"
            )));
        }

        let name = url
            .fragment()
            .map(|f| {
                url::form_urlencoded::parse(format!("n={f}").as_bytes())
                    .next()
                    .map(|(_, v)| v.into_owned())
                    .unwrap_or_default()
            })
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| id.to_string());

        let credential = Self {
            id,
            name,
            private_key: None,
            public_key: PublicKey::decode(&param("pbk")?)?,
            short_id: param("sid")?.parse()?,
            sni: param("sni")?,
            fingerprint: param("fp")?.parse()?,
            created_at: Utc::now(),
        };

        Ok((credential, TunnelEndpoint::new(address, port)))
    }
}

/// Settings applied to newly issued credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueProfile {
    /// Server name the handshake impersonates.
    pub sni: String,
    /// Fingerprint recommended to the peer.
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryState {
    #[serde(default)]
    server_keys: Option<KeyPair>,
    #[serde(default)]
    credentials: Vec<Credential>,
}

/// Persisted set of tunnel credentials.
pub struct CredentialRegistry {
    state: RegistryState,
    store: JsonStore,
}

impl CredentialRegistry {
    /// Open the registry under `state_dir`, loading any existing snapshot.
    ///
    /// A corrupt snapshot is an error rather than an empty registry: silently
    /// forgetting issued identities would lock every Relay out.
    pub fn open(state_dir: &Path) -> Result<Self> {
        let store = JsonStore::new(state_dir, "credentials");
        let state: RegistryState = store.try_load()?.unwrap_or_default();
        debug!(count = state.credentials.len(), "loaded credentials from disk");
        Ok(Self { state, store })
    }

    /// Issue a credential for `name`, generating the node's reality key pair
    /// on first use.
    pub fn issue(&mut self, name: &str, profile: &IssueProfile) -> Result<Credential> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CredentialError::InvalidField("credential name is empty".into()));
        }
        if profile.sni.trim().is_empty() {
            return Err(CredentialError::InvalidField("sni is empty".into()));
        }
        if self.state.credentials.iter().any(|c| c.name == name) {
            return Err(CredentialError::Duplicate(name.to_string()));
        }

        let keys = match &self.state.server_keys {
            Some(keys) => keys.clone(),
            None => {
                if self.state.credentials.iter().any(|c| c.private_key.is_none()) {
                    return Err(CredentialError::NotIssuer(
                        "registry holds imported credentials; this is not an entry node".into(),
                    ));
                }
                let keys = KeyPair::generate();
                info!(public_key = %keys.public_key(), "generated reality key pair");
                self.state.server_keys = Some(keys.clone());
                keys
            }
        };

        let id = self.fresh_id()?;
        let credential = Credential {
            id,
            name: name.to_string(),
            private_key: Some(keys.private_key().clone()),
            public_key: *keys.public_key(),
            short_id: ShortId::generate(),
            sni: profile.sni.trim().to_string(),
            fingerprint: profile.fingerprint,
            created_at: Utc::now(),
        };

        self.state.credentials.push(credential.clone());
        self.snapshot()?;

        info!(id = %credential.id, name = %credential.name, "issued credential");
        Ok(credential)
    }

    /// Store a credential issued elsewhere (Relay side).
    pub fn import(&mut self, credential: Credential) -> Result<()> {
        if self.state.server_keys.is_some() {
            return Err(CredentialError::Mismatch(
                "entry nodes issue their own credentials and cannot import".into(),
            ));
        }
        if self.get(credential.id).is_some() {
            return Err(CredentialError::Duplicate(credential.id.to_string()));
        }
        if let Some(existing) = self
            .state
            .credentials
            .iter()
            .find(|c| c.public_key != credential.public_key)
        {
            return Err(CredentialError::Mismatch(format!(
                "public key {} differs from the entry key {} already trusted",
                credential.public_key, existing.public_key
            )));
        }

        let mut credential = credential;
        if credential.private_key.take().is_some() {
            warn!(id = %credential.id, "dropping entry private key from imported credential");
        }

        info!(id = %credential.id, name = %credential.name, "imported credential");
        self.state.credentials.push(credential);
        self.snapshot()
    }

    /// Remove a credential. Takes effect on peers once the tunnel engine is
    /// reloaded with a freshly rendered document.
    pub fn revoke(&mut self, id: Uuid) -> Result<Credential> {
        let idx = self
            .state
            .credentials
            .iter()
            .position(|c| c.id == id)
            .ok_or(CredentialError::NotFound(id))?;

        let removed = self.state.credentials.remove(idx);
        self.snapshot()?;

        info!(id = %removed.id, name = %removed.name, "revoked credential");
        Ok(removed)
    }

    /// All credentials, in issue order.
    pub fn list(&self) -> &[Credential] {
        &self.state.credentials
    }

    /// Look a credential up by id.
    pub fn get(&self, id: Uuid) -> Option<&Credential> {
        self.state.credentials.iter().find(|c| c.id == id)
    }

    /// Check that `id` is a recognised peer identity.
    pub fn authorize(&self, id: Uuid) -> Result<&Credential> {
        self.get(id)
            .ok_or_else(|| CredentialError::Mismatch(format!("peer identity {id} is not registered")))
    }

    /// The node's reality key pair (Entry only).
    pub fn server_keys(&self) -> Option<&KeyPair> {
        self.state.server_keys.as_ref()
    }

    /// Number of credentials.
    pub fn len(&self) -> usize {
        self.state.credentials.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.state.credentials.is_empty()
    }

    fn fresh_id(&self) -> Result<Uuid> {
        for _ in 0..MAX_ID_DRAWS {
            let id = Uuid::new_v4();
            if self.get(id).is_none() {
                return Ok(id);
            }
        }
        Err(CredentialError::Duplicate("could not draw a unique credential id".into()))
    }

    fn snapshot(&self) -> Result<()> {
        self.store.save(&self.state)?;
        Ok(())
    }
}

impl fmt::Debug for CredentialRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRegistry")
            .field("credentials", &self.state.credentials.len())
            .field("issuer", &self.state.server_keys.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> IssueProfile {
        IssueProfile {
            sni: "www.microsoft.com".into(),
            fingerprint: Fingerprint::Chrome,
        }
    }

    #[test]
    fn issue_generates_unique_ids_and_shared_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut registry = CredentialRegistry::open(dir.path()).expect("open");

        let a = registry.issue("relay-a", &profile()).expect("issue a");
        let b = registry.issue("relay-b", &profile()).expect("issue b");

        assert_ne!(a.id, b.id);
        assert_ne!(a.short_id, b.short_id);
        assert_eq!(a.public_key, b.public_key);
        assert!(a.private_key.is_some());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn issue_rejects_duplicate_and_empty_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut registry = CredentialRegistry::open(dir.path()).expect("open");

        registry.issue("relay", &profile()).expect("issue");
        assert!(matches!(
            registry.issue("relay", &profile()),
            Err(CredentialError::Duplicate(_))
        ));
        assert!(matches!(
            registry.issue("  ", &profile()),
            Err(CredentialError::InvalidField(_))
        ));
    }

    #[test]
    fn registry_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let issued = {
            let mut registry = CredentialRegistry::open(dir.path()).expect("open");
            registry.issue("relay", &profile()).expect("issue")
        };

        let registry = CredentialRegistry::open(dir.path()).expect("reopen");
        assert_eq!(registry.get(issued.id), Some(&issued));
        assert_eq!(
            registry.server_keys().map(|k| *k.public_key()),
            Some(issued.public_key)
        );
    }

    #[test]
    fn revoke_removes_and_reports_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut registry = CredentialRegistry::open(dir.path()).expect("open");
        let issued = registry.issue("relay", &profile()).expect("issue");

        let removed = registry.revoke(issued.id).expect("revoke");
        assert_eq!(removed.id, issued.id);
        assert!(registry.is_empty());
        assert!(matches!(
            registry.revoke(issued.id),
            Err(CredentialError::NotFound(id)) if id == issued.id
        ));
        assert!(registry.authorize(issued.id).is_err());
    }

    #[test]
    fn import_strips_private_key_and_rejects_foreign_entry_keys() {
        let entry_dir = tempfile::tempdir().expect("tempdir");
        let mut entry = CredentialRegistry::open(entry_dir.path()).expect("open");
        let first = entry.issue("relay-1", &profile()).expect("issue");
        let second = entry.issue("relay-2", &profile()).expect("issue");

        let relay_dir = tempfile::tempdir().expect("tempdir");
        let mut relay = CredentialRegistry::open(relay_dir.path()).expect("open");
        relay.import(first.clone()).expect("import");
        assert!(relay.get(first.id).and_then(|c| c.private_key.as_ref()).is_none());

        relay.import(second).expect("same entry key is accepted");

        let mut foreign = first.without_private_key();
        foreign.id = Uuid::new_v4();
        foreign.public_key = KeyPair::generate().public_key().to_owned();
        assert!(matches!(relay.import(foreign), Err(CredentialError::Mismatch(_))));
    }

    #[test]
    fn relay_registry_cannot_issue() {
        let entry_dir = tempfile::tempdir().expect("tempdir");
        let mut entry = CredentialRegistry::open(entry_dir.path()).expect("open");
        let issued = entry.issue("relay", &profile()).expect("issue");

        let relay_dir = tempfile::tempdir().expect("tempdir");
        let mut relay = CredentialRegistry::open(relay_dir.path()).expect("open");
        relay.import(issued).expect("import");
        assert!(matches!(
            relay.issue("other", &profile()),
            Err(CredentialError::NotIssuer(_))
        ));
    }

    #[test]
    fn share_link_carries_every_handshake_field() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut registry = CredentialRegistry::open(dir.path()).expect("open");
        let issued = registry.issue("home relay", &profile()).expect("issue");
        let endpoint = TunnelEndpoint::new("203.0.113.7", 443);

        let link = issued.share_link(&endpoint);
        assert!(link.starts_with(&format!("vless://{}@203.0.113.7:443?", issued.id)));
        assert!(!link.contains(&issued.private_key.as_ref().expect("entry key").encode()));

        let (parsed, parsed_endpoint) = Credential::from_share_link(&link).expect("parse");
        assert_eq!(parsed_endpoint, endpoint);
        assert_eq!(parsed.id, issued.id);
        assert_eq!(parsed.name, "home relay");
        assert_eq!(parsed.public_key, issued.public_key);
        assert_eq!(parsed.short_id, issued.short_id);
        assert_eq!(parsed.sni, issued.sni);
        assert!(parsed.private_key.is_none());
    }

    #[test]
    fn share_link_rejects_other_security_modes() {
        let link = format!(
            "vless://{}@example.net:443?security=tls&sni=a&fp=chrome&pbk=x&sid=00",
            Uuid::new_v4()
        );
        assert!(Credential::from_share_link(&link).is_err());
    }

    #[test]
    fn ipv6_endpoint_is_bracketed() {
        let endpoint = TunnelEndpoint::new("2001:db8::1", 8443);
        assert_eq!(endpoint.to_string(), "[2001:db8::1]:8443");
    }
}
