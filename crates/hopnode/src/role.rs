//! Role-specific behavior.
//!
//! Entry and Relay differ in three places: the routing policy handed to the
//! NAT engine, the topology handed to the renderer, and which listeners and
//! containers must be up before rules are applied.

use hop_nat::{RoutingPolicy, Transport};
use hop_render::{EntryTopology, NodeRole, PeerTopology, RelayTopology};

use crate::config::NodeConfig;

/// Behavior that depends on the node's role.
pub trait Role: Send + Sync {
    /// Which role this is.
    fn role(&self) -> NodeRole;

    /// Routing policy for this role.
    fn routing_policy(&self, config: &NodeConfig, tunnel_subordinate: bool) -> RoutingPolicy;

    /// Topology for the config renderer.
    fn topology(&self, config: &NodeConfig) -> PeerTopology;

    /// Listeners the tunnel engine must bind before rules point at it.
    fn listeners(&self, config: &NodeConfig) -> Vec<(Transport, u16)>;

    /// Containers to supervise, in start order.
    fn containers(&self, config: &NodeConfig) -> Vec<String>;

    /// Whether the subordinate client subnet toggle applies.
    fn supports_subordinate(&self) -> bool;

    /// Whether an end-to-end tunnel test makes sense here.
    fn probes_tunnel(&self) -> bool;
}

/// Terminates the tunnel and egresses to the internet.
///
/// Installs only the bypass for its own control traffic; no redirects and
/// no masquerade.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryRole;

impl Role for EntryRole {
    fn role(&self) -> NodeRole {
        NodeRole::Entry
    }

    fn routing_policy(&self, config: &NodeConfig, _tunnel_subordinate: bool) -> RoutingPolicy {
        config.entry_policy()
    }

    fn topology(&self, config: &NodeConfig) -> PeerTopology {
        PeerTopology::Entry(EntryTopology {
            listen_port: config.entry.listen_port,
            reality_dest: config.entry.reality_dest.clone(),
        })
    }

    fn listeners(&self, config: &NodeConfig) -> Vec<(Transport, u16)> {
        vec![(Transport::Tcp, config.entry.listen_port)]
    }

    fn containers(&self, config: &NodeConfig) -> Vec<String> {
        vec![config.engine.container.clone()]
    }

    fn supports_subordinate(&self) -> bool {
        false
    }

    fn probes_tunnel(&self) -> bool {
        false
    }
}

/// Originates the tunnel and forwards a local client subnet through it.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayRole;

impl Role for RelayRole {
    fn role(&self) -> NodeRole {
        NodeRole::Relay
    }

    fn routing_policy(&self, config: &NodeConfig, tunnel_subordinate: bool) -> RoutingPolicy {
        config.relay_policy(tunnel_subordinate)
    }

    fn topology(&self, config: &NodeConfig) -> PeerTopology {
        PeerTopology::Relay(RelayTopology {
            entry: config.peer.as_ref().map(|p| p.endpoint()),
            identity: config.peer.as_ref().and_then(|p| p.identity),
            redirect_tcp: config.engine.redirect_tcp_port,
            redirect_udp: config.engine.redirect_udp_port,
            probe_port: Some(config.engine.probe_port),
            direct_ranges: config.policy.extra_direct_ranges.clone(),
        })
    }

    fn listeners(&self, config: &NodeConfig) -> Vec<(Transport, u16)> {
        let mut listeners = vec![
            (Transport::Tcp, config.engine.redirect_tcp_port),
            (Transport::Udp, config.engine.redirect_udp_port),
            (Transport::Tcp, config.engine.probe_port),
        ];
        listeners.dedup();
        listeners
    }

    fn containers(&self, config: &NodeConfig) -> Vec<String> {
        let mut containers = vec![config.engine.container.clone()];
        containers.extend(config.vpn.as_ref().map(|v| v.container.clone()));
        containers
    }

    fn supports_subordinate(&self) -> bool {
        true
    }

    fn probes_tunnel(&self) -> bool {
        true
    }
}

/// Controller for `role`.
pub fn controller(role: NodeRole) -> Box<dyn Role> {
    match role {
        NodeRole::Entry => Box::new(EntryRole),
        NodeRole::Relay => Box::new(RelayRole),
    }
}
