//! Walks a synthetic packet through the owned chains.
//!
//! Only the subset of netfilter semantics the owned chains use is modelled:
//! first match wins, `RETURN` leaves the owned chain, and a built-in chain
//! falls through to its policy when nothing matches.

use std::net::IpAddr;

use serde::Serialize;

use crate::backend::RuleBackend;
use crate::error::Result;
use crate::rule::{Rule, Target};
use crate::ruleset::{MASQUERADE_CHAIN, NatRuleSet, REDIRECT_CHAIN};
use crate::types::{Table, Transport};

/// A forwarded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Source address.
    pub source: IpAddr,
    /// Destination address.
    pub destination: IpAddr,
    /// Transport.
    pub transport: Transport,
    /// Destination port.
    pub dport: u16,
    /// Interface routing picked for egress.
    pub out_interface: Option<String>,
}

/// Fate of a packet at the prerouting hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Diverted into a local listener.
    Redirected {
        /// Listener port.
        port: u16,
    },
    /// Left alone.
    Untouched,
}

/// Snapshot of the chains a packet traverses.
#[derive(Debug, Clone, Default)]
pub struct Simulator {
    prerouting: Vec<Rule>,
    redirect: Vec<Rule>,
    postrouting: Vec<Rule>,
    masquerade: Vec<Rule>,
}

impl Simulator {
    /// Simulate a rule set as if it were installed on an otherwise empty
    /// kernel.
    pub fn from_ruleset(set: &NatRuleSet) -> Self {
        Self {
            prerouting: set.redirect.hook.iter().cloned().collect(),
            redirect: set.redirect.rules.clone(),
            postrouting: set.masquerade.hook.iter().cloned().collect(),
            masquerade: set.masquerade.rules.clone(),
        }
    }

    /// Simulate whatever the backend currently holds.
    pub fn from_backend(backend: &dyn RuleBackend) -> Result<Self> {
        let list = |chain: &str| -> Result<Vec<Rule>> {
            if backend.chain_exists(Table::Nat, chain)? {
                backend.list_rules(Table::Nat, chain)
            } else {
                Ok(Vec::new())
            }
        };
        Ok(Self {
            prerouting: list("PREROUTING")?,
            redirect: list(REDIRECT_CHAIN)?,
            postrouting: list("POSTROUTING")?,
            masquerade: list(MASQUERADE_CHAIN)?,
        })
    }

    /// Where the nat prerouting hook sends the packet.
    pub fn prerouting(&self, packet: &Packet) -> Verdict {
        walk(&self.prerouting, REDIRECT_CHAIN, &self.redirect, packet, None)
            .and_then(|t| match t {
                Target::Redirect { to_port } => Some(Verdict::Redirected { port: *to_port }),
                _ => None,
            })
            .unwrap_or(Verdict::Untouched)
    }

    /// Whether the packet's source is masqueraded on egress.
    pub fn masqueraded(&self, packet: &Packet) -> bool {
        let iface = packet.out_interface.as_deref();
        walk(&self.postrouting, MASQUERADE_CHAIN, &self.masquerade, packet, iface)
            .is_some_and(|t| *t == Target::Masquerade)
    }
}

/// Terminal target reached, if any. Only jumps into `owned` are followed.
fn walk<'a>(
    builtin: &'a [Rule],
    owned: &str,
    owned_rules: &'a [Rule],
    packet: &Packet,
    out_interface: Option<&str>,
) -> Option<&'a Target> {
    let hit = |rule: &Rule| {
        rule.matches(
            packet.source,
            packet.destination,
            packet.transport,
            packet.dport,
            out_interface,
        )
    };
    for rule in builtin.iter().filter(|r| hit(r)) {
        if rule.jumps_to(owned) {
            match owned_rules.iter().find(|r| hit(r)).map(|r| &r.target) {
                None | Some(Target::Return) => continue,
                terminal => return terminal,
            }
        }
        if !matches!(rule.target, Target::Jump(_)) {
            return Some(&rule.target);
        }
    }
    None
}
