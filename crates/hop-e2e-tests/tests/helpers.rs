//! Test helpers for E2E tests.

#![allow(dead_code)]

use std::net::IpAddr;

use hop_nat::{FakeRuleBackend, Packet, Transport};
use hop_render::NodeRole;
use hopnode::config::{PeerConfig, VpnConfig};
use hopnode::{
    FakeEgressProbe, FakeListenerProbe, FakeSupervisor, Lifecycle, Node, NodeConfig,
    StaticRouteSource, provision,
};
use tempfile::TempDir;

/// Address the Relay's `[peer]` points at.
pub const ENTRY_ADDRESS: &str = "203.0.113.10";

/// Container name for the tunnel engine.
pub const ENGINE: &str = "hopnode-engine";

/// Container name for the subordinate VPN service.
pub const VPN: &str = "vpn";

/// Subnet served by the Relay's VPN.
pub const CLIENT_SUBNET: &str = "10.0.0.0/24";

fn base_config(dir: &TempDir, name: &str) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.state_dir = dir.path().join(name).join("state");
    config.engine_config_path = dir.path().join(name).join("engine.json");
    config.policy.apply_backoff_ms = 0;
    config.diagnostics.poll_interval_ms = 10;
    config.diagnostics.max_attempts = 5;
    config
}

/// Entry config rooted under `dir/entry`.
pub fn entry_config(dir: &TempDir) -> NodeConfig {
    base_config(dir, "entry")
}

/// Relay config rooted under `dir/relay`, peered with [`ENTRY_ADDRESS`].
pub fn relay_config(dir: &TempDir) -> NodeConfig {
    let mut config = base_config(dir, "relay");
    config.peer = Some(PeerConfig {
        address: ENTRY_ADDRESS.into(),
        port: config.entry.listen_port,
        identity: None,
    });
    config.policy.client_subnet = CLIENT_SUBNET.parse().ok();
    config.vpn = Some(VpnConfig {
        container: VPN.into(),
    });
    config
}

/// A provisioned node wired to fakes. Every fake handle shares state with
/// the copy the node owns.
pub struct TestNode {
    pub lifecycle: Lifecycle<FakeRuleBackend>,
    pub backend: FakeRuleBackend,
    pub supervisor: FakeSupervisor,
    pub listeners: FakeListenerProbe,
    pub egress: FakeEgressProbe,
    pub routes: StaticRouteSource,
}

impl TestNode {
    /// Provision and open a node for `role` with `config`.
    pub fn open(config: NodeConfig, role: NodeRole) -> Self {
        provision(&config, role).expect("provision");
        Self::reopen(config, role, FakeRuleBackend::new())
    }

    /// Open an already provisioned node against an existing kernel.
    pub fn reopen(config: NodeConfig, role: NodeRole, backend: FakeRuleBackend) -> Self {
        let supervisor = FakeSupervisor::new([ENGINE, VPN]);
        let listeners = FakeListenerProbe::new();
        let egress = FakeEgressProbe::new(Some("198.51.100.7"), Some(ENTRY_ADDRESS));
        let routes = StaticRouteSource::new(Some("eth0"));
        let node = Node::open(
            config,
            role,
            backend.clone(),
            Box::new(routes.clone()),
            Box::new(supervisor.clone()),
        )
        .expect("open node");
        Self {
            lifecycle: Lifecycle::new(node, Box::new(listeners.clone()), Box::new(egress.clone())),
            backend,
            supervisor,
            listeners,
            egress,
            routes,
        }
    }

    /// Entry node under `dir/entry`.
    pub fn entry(dir: &TempDir) -> Self {
        Self::open(entry_config(dir), NodeRole::Entry)
    }

    /// Relay node under `dir/relay`.
    pub fn relay(dir: &TempDir) -> Self {
        Self::open(relay_config(dir), NodeRole::Relay)
    }

    /// Make every listener the role needs bind immediately.
    pub fn bind_listeners(&self) {
        let node = self.lifecycle.node();
        for (transport, port) in node.controller().listeners(node.config()) {
            self.listeners.bind_after(transport, port, 0);
        }
    }

    /// The node.
    pub fn node(&self) -> &Node<FakeRuleBackend> {
        self.lifecycle.node()
    }

    /// The node, mutably.
    pub fn node_mut(&mut self) -> &mut Node<FakeRuleBackend> {
        self.lifecycle.node_mut()
    }

    /// Rendered engine document as text.
    pub fn engine_document(&self) -> String {
        std::fs::read_to_string(&self.node().config().engine_config_path)
            .expect("read engine config")
    }
}

/// A TCP packet from a client of the Relay's VPN.
pub fn client_packet(destination: &str, dport: u16) -> Packet {
    Packet {
        source: "10.0.0.2".parse::<IpAddr>().expect("ip"),
        destination: destination.parse().expect("ip"),
        transport: Transport::Tcp,
        dport,
        out_interface: Some("eth0".into()),
    }
}
