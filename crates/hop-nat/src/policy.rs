//! Declarative routing policy.

use std::net::Ipv4Addr;

use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};

use crate::error::{NatError, Result};
use crate::types::Transport;

/// Local transparent-proxy listener ports, keyed per transport.
///
/// TCP and UDP are separate port namespaces, so both may carry the same
/// number; each transport's redirect rule only ever targets its own entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectPorts {
    /// TCP listener.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<u16>,
    /// UDP listener.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp: Option<u16>,
}

impl RedirectPorts {
    /// Same port for both transports.
    pub const fn both(port: u16) -> Self {
        Self {
            tcp: Some(port),
            udp: Some(port),
        }
    }

    /// Listener port for one transport.
    pub const fn get(&self, transport: Transport) -> Option<u16> {
        match transport {
            Transport::Tcp => self.tcp,
            Transport::Udp => self.udp,
        }
    }

    /// Configured `(transport, port)` pairs, TCP first.
    pub fn iter(&self) -> impl Iterator<Item = (Transport, u16)> + '_ {
        Transport::ALL
            .into_iter()
            .filter_map(|t| self.get(t).map(|p| (t, p)))
    }

    /// No listener configured at all.
    pub const fn is_empty(&self) -> bool {
        self.tcp.is_none() && self.udp.is_none()
    }
}

/// A port the node must keep reachable for its own control traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ControlPort {
    /// Transport.
    pub transport: Transport,
    /// Port.
    pub port: u16,
}

impl ControlPort {
    /// A TCP control port.
    pub const fn tcp(port: u16) -> Self {
        Self {
            transport: Transport::Tcp,
            port,
        }
    }
}

/// Loopback and RFC 1918 ranges, in match-frequency order.
pub fn default_exempt_ranges() -> Vec<IpNet> {
    [
        (Ipv4Addr::new(127, 0, 0, 0), 8),
        (Ipv4Addr::new(10, 0, 0, 0), 8),
        (Ipv4Addr::new(172, 16, 0, 0), 12),
        (Ipv4Addr::new(192, 168, 0, 0), 16),
    ]
    .into_iter()
    .filter_map(|(addr, len)| Ipv4Net::new(addr, len).ok().map(IpNet::V4))
    .collect()
}

/// What the kernel rules must achieve on one node.
///
/// Destination exemptions and the client subnet are independent: a range can
/// be exempt as a destination while the same addresses are still masqueraded
/// as a source on egress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingPolicy {
    /// Destinations that are never redirected.
    #[serde(default = "default_exempt_ranges")]
    pub exempt_ranges: Vec<IpNet>,
    /// Sources whose packets are never redirected.
    #[serde(default)]
    pub exempt_sources: Vec<IpNet>,
    /// Ports accepted ahead of the host firewall.
    #[serde(default)]
    pub control_ports: Vec<ControlPort>,
    /// Transparent listener ports.
    #[serde(default)]
    pub redirect_ports: RedirectPorts,
    /// Subordinate VPN client subnet, Relay only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_subnet: Option<IpNet>,
    /// Send the client subnet through the tunnel instead of direct.
    #[serde(default)]
    pub tunnel_subordinate: bool,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            exempt_ranges: default_exempt_ranges(),
            exempt_sources: Vec::new(),
            control_ports: Vec::new(),
            redirect_ports: RedirectPorts::default(),
            client_subnet: None,
            tunnel_subordinate: false,
        }
    }
}

impl RoutingPolicy {
    /// Check the policy can be expressed as rules.
    pub fn validate(&self) -> Result<()> {
        let nets = self
            .exempt_ranges
            .iter()
            .chain(&self.exempt_sources)
            .chain(self.client_subnet.iter());
        for net in nets {
            if !matches!(net, IpNet::V4(_)) {
                return Err(NatError::InvalidPolicy(format!(
                    "{net} is not an IPv4 range"
                )));
            }
        }
        if self.redirect_ports.iter().any(|(_, p)| p == 0) {
            return Err(NatError::InvalidPolicy("redirect port 0".into()));
        }
        if self.control_ports.iter().any(|c| c.port == 0) {
            return Err(NatError::InvalidPolicy("control port 0".into()));
        }
        Ok(())
    }

    /// Policy with every range truncated to its network address, the way
    /// the kernel reports them back.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        for net in self
            .exempt_ranges
            .iter_mut()
            .chain(self.exempt_sources.iter_mut())
            .chain(self.client_subnet.iter_mut())
        {
            *net = net.trunc();
        }
        self
    }

    /// Whether client traffic is redirected into the transparent listeners.
    pub fn redirects(&self) -> bool {
        self.tunnel_subordinate && !self.redirect_ports.is_empty()
    }
}
