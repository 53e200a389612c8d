//! The rule set implied by a routing policy.

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{NatError, Result};
use crate::policy::RoutingPolicy;
use crate::rule::Rule;
use crate::types::Table;

/// Owned nat chain holding exemptions and redirects.
pub const REDIRECT_CHAIN: &str = "HOPNET-REDIRECT";
/// Owned nat chain holding the client subnet masquerade.
pub const MASQUERADE_CHAIN: &str = "HOPNET-POSTROUTING";
/// Owned filter chain accepting control ports.
pub const BYPASS_CHAIN: &str = "HOPNET-INPUT";

/// Every owned chain as `(table, chain, built-in chain hooking it)`.
pub const OWNED_CHAINS: [(Table, &str, &str); 3] = [
    (Table::Filter, BYPASS_CHAIN, "INPUT"),
    (Table::Nat, MASQUERADE_CHAIN, "POSTROUTING"),
    (Table::Nat, REDIRECT_CHAIN, "PREROUTING"),
];

/// One owned chain plus its jump from a built-in chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRules {
    /// Table holding both chains.
    pub table: Table,
    /// Owned chain name.
    pub chain: String,
    /// Built-in chain the hook lives in.
    pub hook_chain: String,
    /// The hook; `None` when the chain must not be reachable.
    pub hook: Option<Rule>,
    /// Ordered rules of the owned chain.
    pub rules: Vec<Rule>,
}

/// Rules for a node, derived from its policy and current egress interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatRuleSet {
    /// Name of the redirect chain.
    pub chain_name: String,
    /// Exemptions then redirects.
    pub redirect: ChainRules,
    /// Client subnet masquerade.
    pub masquerade: ChainRules,
    /// Control-port accepts.
    pub bypass: ChainRules,
    /// Redirect hook confirmed present exactly once.
    pub hook_installed: bool,
    /// Masquerade rule confirmed present exactly once.
    pub masquerade_installed: bool,
    /// Interface the masquerade was bound to.
    pub egress_interface: Option<String>,
    /// Policy the rule set was built from.
    pub policy: RoutingPolicy,
    /// When the rule set was last confirmed in the kernel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
}

/// Rank of well-known exemptions: loopback first, then the RFC 1918 blocks
/// roughly by how often LAN traffic hits them.
fn exemption_rank(net: &IpNet) -> u8 {
    match net.to_string().as_str() {
        "127.0.0.0/8" => 0,
        "10.0.0.0/8" => 1,
        "172.16.0.0/12" => 2,
        "192.168.0.0/16" => 3,
        _ => 4,
    }
}

/// Deduplicate and order destination exemptions.
pub fn order_exemptions(ranges: &[IpNet]) -> Vec<IpNet> {
    let mut ordered: Vec<IpNet> = Vec::with_capacity(ranges.len());
    for net in ranges.iter().map(IpNet::trunc) {
        if !ordered.contains(&net) {
            ordered.push(net);
        }
    }
    ordered.sort_by_key(exemption_rank);
    ordered
}

impl NatRuleSet {
    /// Build the rules a policy implies. Nothing is marked installed.
    ///
    /// Every exemption precedes the redirect rules, and source exemptions
    /// precede destination exemptions.
    pub fn desired(policy: &RoutingPolicy, egress_interface: Option<&str>) -> Result<Self> {
        policy.validate()?;
        let policy = policy.clone().normalized();

        let mut redirect_rules = Vec::new();
        if !policy.redirect_ports.is_empty() {
            let mut sources: Vec<IpNet> = Vec::new();
            for net in &policy.exempt_sources {
                if !sources.contains(net) {
                    sources.push(*net);
                }
            }
            redirect_rules.extend(sources.into_iter().map(Rule::exempt_source));
            redirect_rules.extend(
                order_exemptions(&policy.exempt_ranges)
                    .into_iter()
                    .map(Rule::exempt_destination),
            );
            redirect_rules.extend(
                policy
                    .redirect_ports
                    .iter()
                    .map(|(transport, port)| Rule::redirect(transport, port)),
            );
        }
        let redirect_hook = policy
            .redirects()
            .then(|| Rule::jump(REDIRECT_CHAIN, policy.client_subnet));

        // Without a client subnet nothing is masqueraded, so POSTROUTING is
        // not hooked either.
        let masquerade_hook = policy
            .client_subnet
            .is_some()
            .then(|| Rule::jump(MASQUERADE_CHAIN, None));
        let masquerade_rules = match policy.client_subnet {
            Some(subnet) => {
                let interface = egress_interface
                    .filter(|i| !i.is_empty())
                    .ok_or(NatError::EgressUnresolved)?;
                vec![Rule::masquerade(subnet, interface)]
            }
            None => Vec::new(),
        };

        let mut bypass_rules: Vec<Rule> = Vec::new();
        for port in &policy.control_ports {
            let rule = Rule::accept_port(port.transport, port.port);
            if !bypass_rules.contains(&rule) {
                bypass_rules.push(rule);
            }
        }

        Ok(Self {
            chain_name: REDIRECT_CHAIN.to_string(),
            redirect: ChainRules {
                table: Table::Nat,
                chain: REDIRECT_CHAIN.to_string(),
                hook_chain: "PREROUTING".to_string(),
                hook: redirect_hook,
                rules: redirect_rules,
            },
            masquerade: ChainRules {
                table: Table::Nat,
                chain: MASQUERADE_CHAIN.to_string(),
                hook_chain: "POSTROUTING".to_string(),
                hook: masquerade_hook,
                rules: masquerade_rules,
            },
            bypass: ChainRules {
                table: Table::Filter,
                chain: BYPASS_CHAIN.to_string(),
                hook_chain: "INPUT".to_string(),
                hook: Some(Rule::jump(BYPASS_CHAIN, None)),
                rules: bypass_rules,
            },
            hook_installed: false,
            masquerade_installed: false,
            egress_interface: egress_interface.map(str::to_string),
            policy,
            applied_at: None,
        })
    }

    /// Owned chains in apply order: the redirect chain is filled last so
    /// its hook never points at a half-built chain.
    pub fn chains(&self) -> [&ChainRules; 3] {
        [&self.bypass, &self.masquerade, &self.redirect]
    }

    /// The redirect chain's ordered rules.
    pub fn rules(&self) -> &[Rule] {
        &self.redirect.rules
    }

    /// Whether two rule sets put the same rules in the kernel, ignoring
    /// bookkeeping.
    pub fn same_rules(&self, other: &Self) -> bool {
        self.chains() == other.chains()
    }
}
