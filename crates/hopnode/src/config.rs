//! Node configuration.
//!
//! Configuration for the twinhop node agent, including:
//! - State and engine document locations
//! - Tunnel engine container and listener ports
//! - Entry listener and reality settings
//! - The Entry endpoint a Relay dials
//! - Routing policy parameters
//! - Diagnostics timing

use std::path::{Path, PathBuf};
use std::time::Duration;

use hop_credentials::{Fingerprint, IssueProfile, TunnelEndpoint};
use hop_nat::{ControlPort, RedirectPorts, RoutingPolicy, default_exempt_ranges};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::NodeError;

/// Tunnel engine container and local listeners.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Container running the tunnel engine.
    pub container: String,
    /// Transparent TCP listener (Relay).
    pub redirect_tcp_port: u16,
    /// Transparent UDP listener (Relay).
    pub redirect_udp_port: u16,
    /// Loopback SOCKS listener used by the end-to-end test (Relay).
    pub probe_port: u16,
    /// Ports kept reachable for the node's own control traffic.
    pub control_ports: Vec<ControlPort>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            container: "hopnode-engine".to_string(),
            redirect_tcp_port: 11081,
            redirect_udp_port: 11081,
            probe_port: 10808,
            control_ports: vec![ControlPort::tcp(22)],
        }
    }
}

/// Entry listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EntryConfig {
    /// Public tunnel listener port.
    pub listen_port: u16,
    /// `host:port` the handshake falls through to for unauthenticated clients.
    pub reality_dest: String,
    /// Server name presented by Relays.
    pub sni: String,
    /// TLS fingerprint recommended to Relays.
    pub fingerprint: Fingerprint,
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            listen_port: 443,
            reality_dest: "www.microsoft.com:443".to_string(),
            sni: "www.microsoft.com".to_string(),
            fingerprint: Fingerprint::Chrome,
        }
    }
}

impl EntryConfig {
    /// Settings for newly issued credentials.
    pub fn issue_profile(&self) -> IssueProfile {
        IssueProfile {
            sni: self.sni.clone(),
            fingerprint: self.fingerprint,
        }
    }
}

/// The Entry node a Relay dials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerConfig {
    /// Entry address.
    pub address: String,
    /// Entry tunnel port.
    pub port: u16,
    /// Stored credential to present; the only one when absent.
    #[serde(default)]
    pub identity: Option<Uuid>,
}

impl PeerConfig {
    /// The endpoint this peer describes.
    pub fn endpoint(&self) -> TunnelEndpoint {
        TunnelEndpoint::new(self.address.clone(), self.port)
    }
}

/// Routing policy parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PolicyConfig {
    /// Destinations never redirected.
    pub exempt_ranges: Vec<IpNet>,
    /// Sources never redirected.
    pub exempt_sources: Vec<IpNet>,
    /// Destinations the tunnel engine routes direct, on top of private ranges.
    pub extra_direct_ranges: Vec<IpNet>,
    /// Subordinate VPN client subnet.
    pub client_subnet: Option<IpNet>,
    /// Initial value of the subordinate toggle; the persisted value wins.
    pub tunnel_subordinate: bool,
    /// Egress interface override, skipping default route lookup.
    pub egress_interface: Option<String>,
    /// Apply attempts before escalating.
    pub apply_attempts: u32,
    /// Pause between apply attempts in milliseconds.
    pub apply_backoff_ms: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            exempt_ranges: default_exempt_ranges(),
            exempt_sources: Vec::new(),
            extra_direct_ranges: Vec::new(),
            client_subnet: None,
            tunnel_subordinate: false,
            egress_interface: None,
            apply_attempts: 3,
            apply_backoff_ms: 500,
        }
    }
}

impl PolicyConfig {
    /// Pause between apply attempts.
    pub const fn apply_backoff(&self) -> Duration {
        Duration::from_millis(self.apply_backoff_ms)
    }
}

/// Subordinate VPN service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VpnConfig {
    /// Container hosting the client subnet.
    pub container: String,
}

/// Diagnostics timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Listener poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Listener polls before giving up.
    pub max_attempts: u32,
    /// URL returning the caller's public address as plain text.
    pub probe_url: String,
    /// Per-probe timeout in seconds.
    pub probe_timeout_secs: u64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            max_attempts: 20,
            probe_url: "https://api.ipify.org".to_string(),
            probe_timeout_secs: 10,
        }
    }
}

impl DiagnosticsConfig {
    /// Listener poll interval.
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Per-probe timeout.
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/hopnode")
}

fn default_engine_config_path() -> PathBuf {
    PathBuf::from("/etc/hopnode/engine.json")
}

fn default_iptables() -> PathBuf {
    PathBuf::from("iptables")
}

fn default_systemd_unit_dir() -> PathBuf {
    PathBuf::from("/etc/systemd/system")
}

fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

/// Main node configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConfig {
    /// Directory holding role marker, credentials, policy and rule snapshot.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Where the rendered tunnel engine document is written.
    #[serde(default = "default_engine_config_path")]
    pub engine_config_path: PathBuf,
    /// iptables binary.
    #[serde(default = "default_iptables")]
    pub iptables: PathBuf,
    /// Directory the boot unit is installed into.
    #[serde(default = "default_systemd_unit_dir")]
    pub systemd_unit_dir: PathBuf,
    /// procfs mount, read for routes and listening sockets.
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,
    /// Tunnel engine.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Entry settings.
    #[serde(default)]
    pub entry: EntryConfig,
    /// Entry endpoint, Relay only.
    #[serde(default)]
    pub peer: Option<PeerConfig>,
    /// Routing policy.
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Subordinate VPN service, Relay only.
    #[serde(default)]
    pub vpn: Option<VpnConfig>,
    /// Diagnostics.
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            engine_config_path: default_engine_config_path(),
            iptables: default_iptables(),
            systemd_unit_dir: default_systemd_unit_dir(),
            proc_root: default_proc_root(),
            engine: EngineConfig::default(),
            entry: EntryConfig::default(),
            peer: None,
            policy: PolicyConfig::default(),
            vpn: None,
            diagnostics: DiagnosticsConfig::default(),
        }
    }
}

/// Commented configuration written by `hopnode init-config`.
pub const TEMPLATE: &str = r#"# hopnode configuration

# Role marker, credentials, policy record and rule snapshot live here.
state_dir = "/var/lib/hopnode"
# Rendered tunnel engine document, mounted into the engine container.
engine_config_path = "/etc/hopnode/engine.json"

[engine]
container = "hopnode-engine"
# Transparent listeners on Relays. TCP and UDP may share a number.
redirect_tcp_port = 11081
redirect_udp_port = 11081
# Loopback SOCKS listener the end-to-end test probes through.
probe_port = 10808
control_ports = [{ transport = "tcp", port = 22 }]

[entry]
listen_port = 443
reality_dest = "www.microsoft.com:443"
sni = "www.microsoft.com"
fingerprint = "chrome"

# Relay only: the Entry node to dial.
# [peer]
# address = "203.0.113.10"
# port = 443

[policy]
exempt_ranges = ["127.0.0.0/8", "10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"]
exempt_sources = []
# client_subnet = "10.8.0.0/24"
tunnel_subordinate = false
# egress_interface = "eth0"
apply_attempts = 3
apply_backoff_ms = 500

# Relay only: the VPN service hosting client_subnet.
# [vpn]
# container = "hopnode-vpn"

[diagnostics]
poll_interval_ms = 500
max_attempts = 20
probe_url = "https://api.ipify.org"
probe_timeout_secs = 10
"#;

impl NodeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, NodeError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            NodeError::ConfigValidation(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, NodeError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| NodeError::ConfigValidation(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.engine.container.trim().is_empty() {
            return Err(NodeError::ConfigValidation(
                "engine.container cannot be empty".to_string(),
            ));
        }

        if self.engine.redirect_tcp_port == 0
            || self.engine.redirect_udp_port == 0
            || self.engine.probe_port == 0
        {
            return Err(NodeError::ConfigValidation(
                "engine ports must be greater than 0".to_string(),
            ));
        }

        if self.entry.listen_port == 0 {
            return Err(NodeError::ConfigValidation(
                "entry.listen_port must be greater than 0".to_string(),
            ));
        }

        if self.entry.sni.trim().is_empty() {
            return Err(NodeError::ConfigValidation("entry.sni cannot be empty".to_string()));
        }

        if !self
            .entry
            .reality_dest
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok_and(|p| p > 0))
        {
            return Err(NodeError::ConfigValidation(
                "entry.reality_dest must be host:port".to_string(),
            ));
        }

        if let Some(peer) = &self.peer {
            if peer.address.trim().is_empty() {
                return Err(NodeError::ConfigValidation(
                    "peer.address cannot be empty".to_string(),
                ));
            }
            if peer.port == 0 {
                return Err(NodeError::ConfigValidation(
                    "peer.port must be greater than 0".to_string(),
                ));
            }
        }

        if self.vpn.as_ref().is_some_and(|v| v.container.trim().is_empty()) {
            return Err(NodeError::ConfigValidation(
                "vpn.container cannot be empty".to_string(),
            ));
        }

        if self
            .policy
            .egress_interface
            .as_deref()
            .is_some_and(|i| i.trim().is_empty())
        {
            return Err(NodeError::ConfigValidation(
                "policy.egress_interface cannot be empty".to_string(),
            ));
        }

        if self.policy.apply_attempts == 0 {
            return Err(NodeError::ConfigValidation(
                "policy.apply_attempts must be greater than 0".to_string(),
            ));
        }

        // Both role policies must be expressible as rules.
        self.relay_policy(self.policy.tunnel_subordinate).validate()?;

        if self.diagnostics.poll_interval_ms == 0 || self.diagnostics.max_attempts == 0 {
            return Err(NodeError::ConfigValidation(
                "diagnostics poll interval and attempts must be greater than 0".to_string(),
            ));
        }

        let url = Url::parse(&self.diagnostics.probe_url).map_err(|e| {
            NodeError::ConfigValidation(format!("diagnostics.probe_url is invalid: {e}"))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(NodeError::ConfigValidation(
                "diagnostics.probe_url must be http or https".to_string(),
            ));
        }

        Ok(())
    }

    /// Routing policy for an Entry node: only its own control ports.
    pub fn entry_policy(&self) -> RoutingPolicy {
        let mut control_ports = vec![ControlPort::tcp(self.entry.listen_port)];
        for port in &self.engine.control_ports {
            if !control_ports.contains(port) {
                control_ports.push(*port);
            }
        }
        RoutingPolicy {
            exempt_ranges: Vec::new(),
            exempt_sources: Vec::new(),
            control_ports,
            redirect_ports: RedirectPorts::default(),
            client_subnet: None,
            tunnel_subordinate: false,
        }
    }

    /// Routing policy for a Relay node with the given subordinate toggle.
    pub fn relay_policy(&self, tunnel_subordinate: bool) -> RoutingPolicy {
        RoutingPolicy {
            exempt_ranges: self.policy.exempt_ranges.clone(),
            exempt_sources: self.policy.exempt_sources.clone(),
            control_ports: self.engine.control_ports.clone(),
            redirect_ports: RedirectPorts {
                tcp: Some(self.engine.redirect_tcp_port),
                udp: Some(self.engine.redirect_udp_port),
            },
            client_subnet: self.policy.client_subnet,
            tunnel_subordinate,
        }
    }
}
