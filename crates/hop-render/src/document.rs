//! The tunnel engine's configuration document.
//!
//! Only the fields this system sets are typed; protocol-specific settings
//! stay as JSON values since their shape depends on the protocol.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RenderError, Result};

/// Outbound tag for plain egress.
pub const DIRECT_TAG: &str = "direct";
/// Outbound tag for the tunnel to the Entry node.
pub const TUNNEL_TAG: &str = "tunnel";
/// Outbound tag that drops traffic.
pub const BLOCK_TAG: &str = "block";

/// Role of a node in the two-node topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Terminates the tunnel and egresses to the internet.
    Entry,
    /// Originates the tunnel and forwards a local subnet through it.
    Relay,
}

impl NodeRole {
    /// Lowercase name, as persisted in the role marker.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Relay => "relay",
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeRole {
    type Err = RenderError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "entry" => Ok(Self::Entry),
            "relay" => Ok(Self::Relay),
            other => Err(RenderError::ConfigValidation(format!("unknown role '{other}'"))),
        }
    }
}

/// Log section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSection {
    /// Engine log level.
    pub loglevel: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            loglevel: "warning".to_string(),
        }
    }
}

/// One listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inbound {
    /// Routing tag.
    pub tag: String,
    /// Bind address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
    /// Bind port.
    pub port: u16,
    /// Protocol name.
    pub protocol: String,
    /// Protocol settings.
    #[serde(default)]
    pub settings: Value,
    /// Transport and security settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<Value>,
    /// Destination sniffing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sniffing: Option<Value>,
}

/// One egress path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outbound {
    /// Routing tag.
    pub tag: String,
    /// Protocol name.
    pub protocol: String,
    /// Protocol settings.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub settings: Value,
    /// Transport and security settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<Value>,
}

/// One routing rule; the engine evaluates rules top to bottom.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    /// Always `"field"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Match on the inbound the connection arrived through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbound_tag: Option<Vec<String>>,
    /// Match on destination address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<Vec<String>>,
    /// Where matching connections go.
    pub outbound_tag: String,
}

impl RoutingRule {
    /// Rule matching destination CIDRs.
    pub fn by_ip(ranges: Vec<String>, outbound: &str) -> Self {
        Self {
            kind: "field".to_string(),
            inbound_tag: None,
            ip: Some(ranges),
            outbound_tag: outbound.to_string(),
        }
    }

    /// Rule matching inbound tags.
    pub fn by_inbound(tags: Vec<String>, outbound: &str) -> Self {
        Self {
            kind: "field".to_string(),
            inbound_tag: Some(tags),
            ip: None,
            outbound_tag: outbound.to_string(),
        }
    }
}

/// Routing section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Routing {
    /// Domain resolution strategy for IP rules.
    pub domain_strategy: String,
    /// Ordered rules.
    pub rules: Vec<RoutingRule>,
}

/// A complete tunnel engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    /// Log section.
    #[serde(default)]
    pub log: LogSection,
    /// Listeners.
    pub inbounds: Vec<Inbound>,
    /// Egress paths.
    pub outbounds: Vec<Outbound>,
    /// Routing rules.
    pub routing: Routing,
}

impl ConfigDocument {
    /// Structural checks every rendered document must pass.
    pub fn validate(&self) -> Result<()> {
        let mut tags = HashSet::new();
        for inbound in &self.inbounds {
            if inbound.port == 0 {
                return Err(RenderError::ConfigValidation(format!(
                    "inbound '{}' has no port",
                    inbound.tag
                )));
            }
            if !tags.insert(inbound.tag.as_str()) {
                return Err(RenderError::ConfigValidation(format!(
                    "duplicate inbound tag '{}'",
                    inbound.tag
                )));
            }
        }

        let outbound_tags: HashSet<&str> = self.outbounds.iter().map(|o| o.tag.as_str()).collect();
        if outbound_tags.len() != self.outbounds.len() {
            return Err(RenderError::ConfigValidation("duplicate outbound tag".into()));
        }
        if !outbound_tags.contains(DIRECT_TAG) {
            return Err(RenderError::ConfigValidation(
                "document has no direct fallback outbound".into(),
            ));
        }

        for rule in &self.routing.rules {
            if !outbound_tags.contains(rule.outbound_tag.as_str()) {
                return Err(RenderError::ConfigValidation(format!(
                    "routing rule targets unknown outbound '{}'",
                    rule.outbound_tag
                )));
            }
            if let Some(inbound_tags) = &rule.inbound_tag {
                if let Some(unknown) = inbound_tags.iter().find(|t| !tags.contains(t.as_str())) {
                    return Err(RenderError::ConfigValidation(format!(
                        "routing rule references unknown inbound '{unknown}'"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Guess the node role from document contents.
    ///
    /// A reality listener holding a private key means Entry; a vless
    /// outbound means Relay. Only meant as a fallback when the explicit
    /// role marker is gone.
    pub fn infer_role(&self) -> Option<NodeRole> {
        let holds_private_key = self.inbounds.iter().any(|i| {
            i.stream_settings
                .as_ref()
                .and_then(|s| s.pointer("/realitySettings/privateKey"))
                .and_then(Value::as_str)
                .is_some_and(|k| !k.is_empty())
        });
        if holds_private_key {
            return Some(NodeRole::Entry);
        }
        if self.outbounds.iter().any(|o| o.protocol == "vless") {
            return Some(NodeRole::Relay);
        }
        None
    }

    /// Find an inbound by tag.
    pub fn inbound(&self, tag: &str) -> Option<&Inbound> {
        self.inbounds.iter().find(|i| i.tag == tag)
    }

    /// Find an outbound by tag.
    pub fn outbound(&self, tag: &str) -> Option<&Outbound> {
        self.outbounds.iter().find(|o| o.tag == tag)
    }

    /// Pretty JSON, as written to disk.
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Read a document from disk.
    pub fn read_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write the document atomically.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, self.to_json_pretty()?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}
