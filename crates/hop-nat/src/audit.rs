//! Installed rules versus the rules a policy implies.

use std::fmt;

use ipnet::IpNet;
use serde::Serialize;

use crate::backend::RuleBackend;
use crate::error::Result;
use crate::rule::{Rule, Target};
use crate::ruleset::{ChainRules, NatRuleSet};
use crate::types::{Table, Transport};

/// One divergence between kernel and policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Drift {
    /// An owned chain is gone.
    MissingChain {
        /// Table.
        table: Table,
        /// Chain.
        chain: String,
    },
    /// A destination exemption is missing.
    MissingExemption {
        /// Range.
        range: IpNet,
    },
    /// A source exemption is missing.
    MissingSourceExemption {
        /// Range.
        range: IpNet,
    },
    /// An exemption sits behind a redirect and never matches first.
    MisorderedExemption {
        /// The exemption rule.
        rule: String,
    },
    /// A transport's redirect is missing.
    MissingRedirect {
        /// Transport.
        transport: Transport,
        /// Listener port.
        port: u16,
    },
    /// A control-port accept is missing.
    MissingBypass {
        /// Transport.
        transport: Transport,
        /// Port.
        port: u16,
    },
    /// The client subnet masquerade is missing.
    MissingMasquerade {
        /// Client subnet.
        subnet: IpNet,
        /// Egress interface it should be bound to.
        interface: String,
    },
    /// The client subnet masquerade appears more than once.
    DuplicateMasquerade {
        /// Client subnet.
        subnet: IpNet,
        /// Copies found.
        count: usize,
    },
    /// Some other owned rule appears more than once.
    DuplicateRule {
        /// Chain.
        chain: String,
        /// The rule.
        rule: String,
        /// Copies found.
        count: usize,
    },
    /// An owned chain holds a rule the policy does not imply.
    UnexpectedRule {
        /// Chain.
        chain: String,
        /// The rule.
        rule: String,
    },
    /// The jump into an owned chain is missing.
    MissingHook {
        /// Built-in chain.
        hook_chain: String,
        /// Owned chain.
        chain: String,
    },
    /// The jump into an owned chain appears more than once.
    DuplicateHook {
        /// Built-in chain.
        hook_chain: String,
        /// Owned chain.
        chain: String,
        /// Copies found.
        count: usize,
    },
    /// A jump into an owned chain that should not be there.
    UnexpectedHook {
        /// Built-in chain.
        hook_chain: String,
        /// The jump.
        rule: String,
    },
}

impl fmt::Display for Drift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingChain { table, chain } => write!(f, "chain {table}/{chain} missing"),
            Self::MissingExemption { range } => write!(f, "exemption for {range} missing"),
            Self::MissingSourceExemption { range } => {
                write!(f, "source exemption for {range} missing")
            }
            Self::MisorderedExemption { rule } => {
                write!(f, "exemption `{rule}` follows a redirect")
            }
            Self::MissingRedirect { transport, port } => {
                write!(f, "{transport} redirect to {port} missing")
            }
            Self::MissingBypass { transport, port } => {
                write!(f, "{transport}/{port} control bypass missing")
            }
            Self::MissingMasquerade { subnet, interface } => {
                write!(f, "masquerade for {subnet} via {interface} missing")
            }
            Self::DuplicateMasquerade { subnet, count } => {
                write!(f, "masquerade for {subnet} installed {count} times")
            }
            Self::DuplicateRule { chain, rule, count } => {
                write!(f, "`{rule}` installed {count} times in {chain}")
            }
            Self::UnexpectedRule { chain, rule } => write!(f, "unexpected `{rule}` in {chain}"),
            Self::MissingHook { hook_chain, chain } => {
                write!(f, "{hook_chain} does not jump to {chain}")
            }
            Self::DuplicateHook {
                hook_chain,
                chain,
                count,
            } => write!(f, "{hook_chain} jumps to {chain} {count} times"),
            Self::UnexpectedHook { hook_chain, rule } => {
                write!(f, "unexpected hook `{rule}` in {hook_chain}")
            }
        }
    }
}

fn missing(rule: &Rule) -> Option<Drift> {
    Some(match (&rule.target, rule.source, rule.destination) {
        (Target::Return, _, Some(range)) => Drift::MissingExemption { range },
        (Target::Return, Some(range), None) => Drift::MissingSourceExemption { range },
        (Target::Redirect { to_port }, _, _) => Drift::MissingRedirect {
            transport: rule.protocol?,
            port: *to_port,
        },
        (Target::Accept, _, _) => Drift::MissingBypass {
            transport: rule.protocol?,
            port: rule.dport?,
        },
        (Target::Masquerade, Some(subnet), _) => Drift::MissingMasquerade {
            subnet,
            interface: rule.out_interface.clone().unwrap_or_default(),
        },
        _ => return None,
    })
}

fn audit_chain(spec: &ChainRules, installed: &[Rule], drift: &mut Vec<Drift>) {
    for want in &spec.rules {
        let count = installed.iter().filter(|r| *r == want).count();
        match count {
            0 => drift.extend(missing(want)),
            1 => {}
            count => drift.push(match (&want.target, want.source) {
                (Target::Masquerade, Some(subnet)) => Drift::DuplicateMasquerade { subnet, count },
                _ => Drift::DuplicateRule {
                    chain: spec.chain.clone(),
                    rule: want.to_string(),
                    count,
                },
            }),
        }
    }

    for rule in installed.iter().filter(|r| !spec.rules.contains(r)) {
        drift.push(Drift::UnexpectedRule {
            chain: spec.chain.clone(),
            rule: rule.to_string(),
        });
    }

    if let Some(first_redirect) = installed
        .iter()
        .position(|r| matches!(r.target, Target::Redirect { .. }))
    {
        for rule in installed[first_redirect..]
            .iter()
            .filter(|r| r.target == Target::Return)
        {
            drift.push(Drift::MisorderedExemption {
                rule: rule.to_string(),
            });
        }
    }
}

fn audit_hook(spec: &ChainRules, hook_chain_rules: &[Rule], drift: &mut Vec<Drift>) {
    let jumps: Vec<&Rule> = hook_chain_rules
        .iter()
        .filter(|r| r.jumps_to(&spec.chain))
        .collect();
    let matching = spec
        .hook
        .as_ref()
        .map_or(0, |h| jumps.iter().filter(|r| **r == h).count());

    match (&spec.hook, matching) {
        (Some(_), 0) => drift.push(Drift::MissingHook {
            hook_chain: spec.hook_chain.clone(),
            chain: spec.chain.clone(),
        }),
        (Some(_), 1) | (None, _) => {}
        (Some(_), count) => drift.push(Drift::DuplicateHook {
            hook_chain: spec.hook_chain.clone(),
            chain: spec.chain.clone(),
            count,
        }),
    }
    for rule in jumps
        .into_iter()
        .filter(|r| spec.hook.as_ref() != Some(*r))
    {
        drift.push(Drift::UnexpectedHook {
            hook_chain: spec.hook_chain.clone(),
            rule: rule.to_string(),
        });
    }
}

/// Compare what the backend holds against `desired`. Read-only.
pub fn audit(backend: &dyn RuleBackend, desired: &NatRuleSet) -> Result<Vec<Drift>> {
    let mut drift = Vec::new();
    for spec in desired.chains() {
        if backend.chain_exists(spec.table, &spec.chain)? {
            let installed = backend.list_rules(spec.table, &spec.chain)?;
            audit_chain(spec, &installed, &mut drift);
        } else {
            drift.push(Drift::MissingChain {
                table: spec.table,
                chain: spec.chain.clone(),
            });
        }
        let hooks = backend.list_rules(spec.table, &spec.hook_chain)?;
        audit_hook(spec, &hooks, &mut drift);
    }
    Ok(drift)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeRuleBackend;
    use crate::policy::{ControlPort, RedirectPorts, RoutingPolicy};
    use crate::ruleset::{MASQUERADE_CHAIN, REDIRECT_CHAIN};

    fn desired() -> NatRuleSet {
        let policy = RoutingPolicy {
            redirect_ports: RedirectPorts::both(11081),
            client_subnet: Some("10.0.0.0/24".parse().expect("cidr")),
            control_ports: vec![ControlPort::tcp(22)],
            tunnel_subordinate: true,
            ..RoutingPolicy::default()
        };
        NatRuleSet::desired(&policy, Some("eth0")).expect("desired")
    }

    fn install(fake: &FakeRuleBackend, set: &NatRuleSet) {
        for spec in set.chains() {
            fake.create_chain(spec.table, &spec.chain).expect("create");
            for rule in &spec.rules {
                fake.append(spec.table, &spec.chain, rule).expect("append");
            }
            if let Some(hook) = &spec.hook {
                fake.append(spec.table, &spec.hook_chain, hook).expect("hook");
            }
        }
    }

    #[test]
    fn clean_install_has_no_drift() {
        let fake = FakeRuleBackend::new();
        let set = desired();
        install(&fake, &set);
        assert!(audit(&fake, &set).expect("audit").is_empty());
    }

    #[test]
    fn empty_kernel_reports_chains_and_hooks() {
        let fake = FakeRuleBackend::new();
        let drift = audit(&fake, &desired()).expect("audit");
        assert_eq!(
            drift.iter().filter(|d| matches!(d, Drift::MissingChain { .. })).count(),
            3
        );
        assert_eq!(
            drift.iter().filter(|d| matches!(d, Drift::MissingHook { .. })).count(),
            3
        );
    }

    #[test]
    fn reports_missing_exemption_and_duplicates() {
        let fake = FakeRuleBackend::new();
        let set = desired();
        install(&fake, &set);

        fake.remove_foreign(Table::Nat, REDIRECT_CHAIN, 2);
        fake.push_foreign(Table::Nat, MASQUERADE_CHAIN, set.masquerade.rules[0].clone());
        fake.push_foreign(
            Table::Nat,
            "PREROUTING",
            set.redirect.hook.clone().expect("hook"),
        );

        let drift = audit(&fake, &set).expect("audit");
        assert!(drift.contains(&Drift::MissingExemption {
            range: "10.0.0.0/8".parse().expect("cidr")
        }));
        assert!(drift.contains(&Drift::DuplicateMasquerade {
            subnet: "10.0.0.0/24".parse().expect("cidr"),
            count: 2
        }));
        assert!(drift.iter().any(|d| matches!(d, Drift::DuplicateHook { count: 2, .. })));
    }

    #[test]
    fn exemption_behind_redirect_is_misordered() {
        let fake = FakeRuleBackend::new();
        let set = desired();
        install(&fake, &set);
        let moved = fake
            .remove_foreign(Table::Nat, REDIRECT_CHAIN, 1)
            .expect("first rule");
        fake.push_foreign(Table::Nat, REDIRECT_CHAIN, moved);

        let drift = audit(&fake, &set).expect("audit");
        assert!(drift.iter().any(|d| matches!(d, Drift::MisorderedExemption { .. })));
    }

    #[test]
    fn hook_present_while_subordinate_off_is_unexpected() {
        let fake = FakeRuleBackend::new();
        let on = desired();
        install(&fake, &on);

        let mut policy = on.policy.clone();
        policy.tunnel_subordinate = false;
        let off = NatRuleSet::desired(&policy, Some("eth0")).expect("desired");
        let drift = audit(&fake, &off).expect("audit");
        assert_eq!(drift.len(), 1);
        assert!(matches!(drift[0], Drift::UnexpectedHook { .. }));
    }
}
