//! Role-specific document rendering.

use hop_credentials::{Credential, TunnelEndpoint, VISION_FLOW};
use ipnet::IpNet;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::document::{
    BLOCK_TAG, ConfigDocument, DIRECT_TAG, Inbound, LogSection, NodeRole, Outbound, Routing,
    RoutingRule, TUNNEL_TAG,
};
use crate::error::{RenderError, Result};

/// Inbound tag of the Entry's tunnel listener.
pub const TUNNEL_INBOUND_TAG: &str = "tunnel-in";
/// Inbound tag of the Relay's transparent TCP listener.
pub const REDIRECT_TCP_TAG: &str = "redirect-tcp";
/// Inbound tag of the Relay's transparent UDP listener.
pub const REDIRECT_UDP_TAG: &str = "redirect-udp";
/// Inbound tag of the Relay's loopback probe listener.
pub const PROBE_TAG: &str = "probe-in";

/// Destinations that always leave directly, whatever the kernel rules say.
pub const ALWAYS_DIRECT: &[&str] = &[
    "127.0.0.0/8",
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "169.254.0.0/16",
    "100.64.0.0/10",
    "::1/128",
    "fc00::/7",
    "fe80::/10",
];

/// What an Entry node needs to know to serve peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryTopology {
    /// Port of the public tunnel listener.
    pub listen_port: u16,
    /// `host:port` of the site the handshake masquerades as.
    pub reality_dest: String,
}

/// What a Relay node needs to reach its Entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayTopology {
    /// The Entry node; mandatory.
    pub entry: Option<TunnelEndpoint>,
    /// Which stored credential to present; the only one when `None`.
    pub identity: Option<Uuid>,
    /// Transparent TCP listener port.
    pub redirect_tcp: u16,
    /// Transparent UDP listener port.
    pub redirect_udp: u16,
    /// Loopback SOCKS port used by the end-to-end probe.
    pub probe_port: Option<u16>,
    /// Extra destinations routed direct on top of [`ALWAYS_DIRECT`].
    pub direct_ranges: Vec<IpNet>,
}

/// Peer topology, per role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerTopology {
    /// Entry node topology.
    Entry(EntryTopology),
    /// Relay node topology.
    Relay(RelayTopology),
}

/// Render the engine document for a node.
///
/// Fails with [`RenderError::ConfigValidation`] when any mandatory field is
/// missing; a partially filled document is never returned.
pub fn render(
    role: NodeRole,
    topology: &PeerTopology,
    credentials: &[Credential],
) -> Result<ConfigDocument> {
    let document = match (role, topology) {
        (NodeRole::Entry, PeerTopology::Entry(entry)) => render_entry(entry, credentials)?,
        (NodeRole::Relay, PeerTopology::Relay(relay)) => render_relay(relay, credentials)?,
        (role, _) => {
            return Err(RenderError::ConfigValidation(format!(
                "topology does not match role {role}"
            )));
        }
    };

    document.validate()?;
    info!(
        %role,
        inbounds = document.inbounds.len(),
        outbounds = document.outbounds.len(),
        rules = document.routing.rules.len(),
        "rendered tunnel engine config"
    );
    Ok(document)
}

fn direct_ranges(extra: &[IpNet]) -> Vec<String> {
    let mut ranges: Vec<String> = ALWAYS_DIRECT.iter().map(ToString::to_string).collect();
    for net in extra {
        let net = net.trunc().to_string();
        if !ranges.contains(&net) {
            ranges.push(net);
        }
    }
    ranges
}

fn sniffing() -> serde_json::Value {
    json!({
        "enabled": true,
        "destOverride": ["http", "tls", "quic"],
        "routeOnly": true
    })
}

fn fallback_outbounds() -> [Outbound; 2] {
    [
        Outbound {
            tag: DIRECT_TAG.to_string(),
            protocol: "freedom".to_string(),
            settings: json!({ "domainStrategy": "UseIPv4" }),
            stream_settings: None,
        },
        Outbound {
            tag: BLOCK_TAG.to_string(),
            protocol: "blackhole".to_string(),
            settings: serde_json::Value::Null,
            stream_settings: None,
        },
    ]
}

fn render_entry(entry: &EntryTopology, credentials: &[Credential]) -> Result<ConfigDocument> {
    if entry.listen_port == 0 {
        return Err(RenderError::ConfigValidation("entry listen port is missing".into()));
    }
    if entry.reality_dest.trim().is_empty() {
        return Err(RenderError::ConfigValidation("reality dest is missing".into()));
    }
    let first = credentials.first().ok_or_else(|| {
        RenderError::ConfigValidation("entry has no credentials to authorize".into())
    })?;
    let private_key = first.private_key.as_ref().ok_or_else(|| {
        RenderError::ConfigValidation(format!("credential {} carries no private key", first.id))
    })?;
    if let Some(other) = credentials.iter().find(|c| c.public_key != first.public_key) {
        return Err(RenderError::ConfigValidation(format!(
            "credential {} was issued under a different key pair",
            other.id
        )));
    }

    let clients: Vec<_> = credentials
        .iter()
        .map(|c| json!({ "id": c.id, "flow": VISION_FLOW, "email": c.name }))
        .collect();
    let mut server_names: Vec<&str> = Vec::new();
    for c in credentials {
        if c.sni.trim().is_empty() {
            return Err(RenderError::ConfigValidation(format!("credential {} has no sni", c.id)));
        }
        if !server_names.contains(&c.sni.as_str()) {
            server_names.push(&c.sni);
        }
    }
    let short_ids: Vec<&str> = credentials.iter().map(|c| c.short_id.as_str()).collect();

    let inbound = Inbound {
        tag: TUNNEL_INBOUND_TAG.to_string(),
        listen: Some("0.0.0.0".to_string()),
        port: entry.listen_port,
        protocol: "vless".to_string(),
        settings: json!({ "clients": clients, "decryption": "none" }),
        stream_settings: Some(json!({
            "network": "tcp",
            "security": "reality",
            "realitySettings": {
                "show": false,
                "dest": entry.reality_dest,
                "xver": 0,
                "serverNames": server_names,
                "privateKey": private_key.encode(),
                "shortIds": short_ids
            }
        })),
        sniffing: Some(sniffing()),
    };

    debug!(clients = credentials.len(), port = entry.listen_port, "entry inbound assembled");

    Ok(ConfigDocument {
        log: LogSection::default(),
        inbounds: vec![inbound],
        outbounds: fallback_outbounds().into(),
        routing: Routing {
            domain_strategy: "IPIfNonMatch".to_string(),
            rules: vec![
                RoutingRule::by_ip(direct_ranges(&[]), DIRECT_TAG),
                RoutingRule::by_inbound(vec![TUNNEL_INBOUND_TAG.to_string()], DIRECT_TAG),
            ],
        },
    })
}

fn render_relay(relay: &RelayTopology, credentials: &[Credential]) -> Result<ConfigDocument> {
    let entry = relay
        .entry
        .as_ref()
        .ok_or_else(|| RenderError::ConfigValidation("entry address is missing".into()))?;
    if entry.address.trim().is_empty() {
        return Err(RenderError::ConfigValidation("entry address is missing".into()));
    }
    if entry.port == 0 {
        return Err(RenderError::ConfigValidation("entry port is missing".into()));
    }
    if relay.redirect_tcp == 0 || relay.redirect_udp == 0 {
        return Err(RenderError::ConfigValidation("redirect listener port is missing".into()));
    }

    let credential = match relay.identity {
        Some(id) => credentials.iter().find(|c| c.id == id).ok_or_else(|| {
            RenderError::ConfigValidation(format!("identity {id} is not in the registry"))
        })?,
        None => match credentials {
            [only] => only,
            [] => {
                return Err(RenderError::ConfigValidation("relay has no identity".into()));
            }
            _ => {
                return Err(RenderError::ConfigValidation(
                    "several credentials stored; pick an identity".into(),
                ));
            }
        },
    };
    if credential.sni.trim().is_empty() {
        return Err(RenderError::ConfigValidation("identity has no sni".into()));
    }

    let mut inbounds = vec![
        transparent_inbound(REDIRECT_TCP_TAG, relay.redirect_tcp, "tcp"),
        transparent_inbound(REDIRECT_UDP_TAG, relay.redirect_udp, "udp"),
    ];
    if let Some(port) = relay.probe_port {
        inbounds.push(Inbound {
            tag: PROBE_TAG.to_string(),
            listen: Some("127.0.0.1".to_string()),
            port,
            protocol: "socks".to_string(),
            settings: json!({ "auth": "noauth", "udp": false }),
            stream_settings: None,
            sniffing: Some(sniffing()),
        });
    }
    let tunneled: Vec<String> = inbounds.iter().map(|i| i.tag.clone()).collect();

    let tunnel = Outbound {
        tag: TUNNEL_TAG.to_string(),
        protocol: "vless".to_string(),
        settings: json!({
            "vnext": [{
                "address": entry.address,
                "port": entry.port,
                "users": [{ "id": credential.id, "flow": VISION_FLOW, "encryption": "none" }]
            }]
        }),
        stream_settings: Some(json!({
            "network": "tcp",
            "security": "reality",
            "realitySettings": {
                "serverName": credential.sni,
                "fingerprint": credential.fingerprint.as_str(),
                "publicKey": credential.public_key.encode(),
                "shortId": credential.short_id.as_str(),
                "spiderX": "/"
            }
        })),
    };

    let mut outbounds = vec![tunnel];
    outbounds.extend(fallback_outbounds());

    debug!(entry = %entry, identity = %credential.id, "relay outbound assembled");

    Ok(ConfigDocument {
        log: LogSection::default(),
        inbounds,
        outbounds,
        routing: Routing {
            domain_strategy: "IPIfNonMatch".to_string(),
            rules: vec![
                RoutingRule::by_ip(direct_ranges(&relay.direct_ranges), DIRECT_TAG),
                RoutingRule::by_inbound(tunneled, TUNNEL_TAG),
            ],
        },
    })
}

fn transparent_inbound(tag: &str, port: u16, network: &str) -> Inbound {
    Inbound {
        tag: tag.to_string(),
        listen: Some("0.0.0.0".to_string()),
        port,
        protocol: "dokodemo-door".to_string(),
        settings: json!({ "network": network, "followRedirect": true }),
        stream_settings: Some(json!({ "sockopt": { "tproxy": "redirect" } })),
        sniffing: Some(sniffing()),
    }
}
