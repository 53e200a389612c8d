//! Minimal mutation plans against read-back chain contents.
//!
//! Plans are make-before-break: new rules are added before stale ones are
//! removed, so a chain never passes through an emptier state than either
//! its old or new content. Positions are 1-based, as iptables counts them.

use crate::rule::Rule;

/// One chain mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Append at the end of the chain.
    Append(Rule),
    /// Insert at a position.
    Insert {
        /// 1-based position.
        position: usize,
        /// Rule to insert.
        rule: Rule,
    },
    /// Delete the rule at a position.
    Delete {
        /// 1-based position.
        position: usize,
        /// Rule expected there, for logging.
        rule: Rule,
    },
}

impl Step {
    /// The rule the step touches.
    pub fn rule(&self) -> &Rule {
        match self {
            Self::Append(rule) | Self::Insert { rule, .. } | Self::Delete { rule, .. } => rule,
        }
    }
}

/// Plan turning `current` into `desired` for an owned chain.
///
/// The common prefix is left alone; the desired suffix is appended and the
/// old suffix is then deleted from the back. Old redirects therefore leave
/// before the old exemptions ahead of them, so a destination exempt both
/// before and after is never diverted at any intermediate step.
pub fn plan_chain(current: &[Rule], desired: &[Rule]) -> Vec<Step> {
    let common = current
        .iter()
        .zip(desired)
        .take_while(|(have, want)| have == want)
        .count();
    if common == current.len() && common == desired.len() {
        return Vec::new();
    }

    let mut steps: Vec<Step> = desired[common..].iter().cloned().map(Step::Append).collect();
    steps.extend(
        current
            .iter()
            .enumerate()
            .skip(common)
            .rev()
            .map(|(i, rule)| Step::Delete {
                position: i + 1,
                rule: rule.clone(),
            }),
    );
    steps
}

/// Plan for the jump into `chain` inside a built-in chain we share with
/// other software.
///
/// Only rules jumping to `chain` are touched. When `hook` is wanted and an
/// identical jump already exists, the first one is kept where it is and any
/// duplicates or stale variants are deleted; otherwise it is inserted at the
/// top before stale variants go.
pub fn plan_hook(current: &[Rule], hook: Option<&Rule>, chain: &str) -> Vec<Step> {
    let jumps: Vec<(usize, &Rule)> = current
        .iter()
        .enumerate()
        .filter(|(_, rule)| rule.jumps_to(chain))
        .map(|(i, rule)| (i + 1, rule))
        .collect();

    let keep = hook.and_then(|h| jumps.iter().find(|(_, r)| *r == h).map(|(p, _)| *p));

    let mut steps = Vec::new();
    let mut offset = 0;
    if let (Some(rule), None) = (hook, keep) {
        steps.push(Step::Insert {
            position: 1,
            rule: rule.clone(),
        });
        offset = 1;
    }
    for (position, rule) in jumps.iter().rev() {
        if Some(*position) != keep {
            steps.push(Step::Delete {
                position: position + offset,
                rule: (*rule).clone(),
            });
        }
    }
    steps
}

/// Apply a plan to an in-memory chain, the way the kernel would.
pub fn replay(chain: &mut Vec<Rule>, steps: &[Step]) {
    for step in steps {
        match step {
            Step::Append(rule) => chain.push(rule.clone()),
            Step::Insert { position, rule } => {
                let at = position.saturating_sub(1).min(chain.len());
                chain.insert(at, rule.clone());
            }
            Step::Delete { position, .. } => {
                let at = position.saturating_sub(1);
                if at < chain.len() {
                    chain.remove(at);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Transport;
    use ipnet::IpNet;
    use proptest::prelude::*;

    fn exempt(s: &str) -> Rule {
        Rule::exempt_destination(s.parse::<IpNet>().expect("cidr"))
    }

    #[test]
    fn identical_chain_needs_no_steps() {
        let rules = vec![exempt("127.0.0.0/8"), Rule::redirect(Transport::Tcp, 11081)];
        assert!(plan_chain(&rules, &rules).is_empty());
    }

    #[test]
    fn common_prefix_is_preserved() {
        let current = vec![exempt("127.0.0.0/8"), Rule::redirect(Transport::Tcp, 1)];
        let desired = vec![
            exempt("127.0.0.0/8"),
            exempt("10.0.0.0/8"),
            Rule::redirect(Transport::Tcp, 1),
        ];
        let steps = plan_chain(&current, &desired);
        assert!(steps.iter().all(|s| !matches!(s, Step::Delete { position: 1, .. })));
        assert!(matches!(steps[0], Step::Append(_)));

        let mut chain = current;
        replay(&mut chain, &steps);
        assert_eq!(chain, desired);
    }

    #[test]
    fn appends_happen_before_deletes() {
        let current = vec![Rule::redirect(Transport::Tcp, 1)];
        let desired = vec![Rule::redirect(Transport::Tcp, 2)];
        let steps = plan_chain(&current, &desired);
        assert_eq!(steps.len(), 2);
        assert!(matches!(steps[0], Step::Append(_)));
        assert!(matches!(steps[1], Step::Delete { position: 1, .. }));
    }

    #[test]
    fn missing_hook_is_inserted_at_top() {
        let hook = Rule::jump("OWN", None);
        let current = vec![Rule::jump("DOCKER", None)];
        let steps = plan_hook(&current, Some(&hook), "OWN");
        assert_eq!(
            steps,
            vec![Step::Insert {
                position: 1,
                rule: hook.clone()
            }]
        );
    }

    #[test]
    fn duplicate_hooks_collapse_to_one() {
        let hook = Rule::jump("OWN", None);
        let mut chain = vec![
            hook.clone(),
            Rule::jump("DOCKER", None),
            hook.clone(),
            hook.clone(),
        ];
        let steps = plan_hook(&chain, Some(&hook), "OWN");
        replay(&mut chain, &steps);
        assert_eq!(chain, vec![hook, Rule::jump("DOCKER", None)]);
    }

    #[test]
    fn stale_hook_variant_is_replaced() {
        let stale = Rule::jump("OWN", Some("10.0.0.0/24".parse().expect("cidr")));
        let hook = Rule::jump("OWN", Some("10.8.0.0/24".parse().expect("cidr")));
        let mut chain = vec![Rule::jump("DOCKER", None), stale];
        let steps = plan_hook(&chain, Some(&hook), "OWN");
        assert!(matches!(steps[0], Step::Insert { .. }));
        replay(&mut chain, &steps);
        assert_eq!(chain, vec![hook, Rule::jump("DOCKER", None)]);
    }

    #[test]
    fn unwanted_hook_is_removed() {
        let mut chain = vec![Rule::jump("OWN", None), Rule::jump("DOCKER", None)];
        let steps = plan_hook(&chain, None, "OWN");
        replay(&mut chain, &steps);
        assert_eq!(chain, vec![Rule::jump("DOCKER", None)]);
    }

    #[test]
    fn old_redirects_are_deleted_before_old_exemptions() {
        let current = vec![
            exempt("127.0.0.0/8"),
            exempt("10.0.0.0/8"),
            Rule::redirect(Transport::Tcp, 11081),
            Rule::redirect(Transport::Udp, 11081),
        ];
        let mut desired = vec![Rule::exempt_source(
            "10.0.0.128/25".parse::<IpNet>().expect("cidr"),
        )];
        desired.extend(current.iter().cloned());
        let steps = plan_chain(&current, &desired);

        let deletes: Vec<usize> = steps
            .iter()
            .filter_map(|s| match s {
                Step::Delete { position, .. } => Some(*position),
                _ => None,
            })
            .collect();
        assert_eq!(deletes, vec![4, 3, 2, 1]);

        let first_hit = |chain: &[Rule], destination: &str| {
            chain
                .iter()
                .find(|r| {
                    r.matches(
                        "10.0.0.2".parse().expect("ip"),
                        destination.parse().expect("ip"),
                        Transport::Tcp,
                        443,
                        None,
                    )
                })
                .map(|r| r.target.clone())
        };
        let mut chain = current;
        for (i, step) in steps.iter().enumerate() {
            replay(&mut chain, std::slice::from_ref(step));
            for destination in ["127.0.0.1", "10.20.30.40"] {
                assert_eq!(
                    first_hit(&chain, destination),
                    Some(crate::rule::Target::Return),
                    "{destination} diverted after step {i}"
                );
            }
        }
        assert_eq!(chain, desired);
    }

    fn arb_rule() -> impl Strategy<Value = Rule> {
        prop_oneof![
            (1u16..5).prop_map(|p| Rule::redirect(Transport::Tcp, p)),
            (0u8..4).prop_map(|o| exempt(&format!("10.{o}.0.0/16"))),
        ]
    }

    proptest! {
        #[test]
        fn replaying_a_chain_plan_reaches_desired(
            current in prop::collection::vec(arb_rule(), 0..8),
            desired in prop::collection::vec(arb_rule(), 0..8),
        ) {
            let mut chain = current.clone();
            replay(&mut chain, &plan_chain(&current, &desired));
            prop_assert_eq!(chain, desired);
        }

        #[test]
        fn shared_exemptions_hold_at_every_step(
            old_extra in prop::collection::vec(0u8..4, 0..3),
            new_extra in prop::collection::vec(0u8..4, 0..3),
        ) {
            let build = |extra: &[u8]| {
                let mut rules: Vec<Rule> = extra
                    .iter()
                    .map(|o| exempt(&format!("10.{o}.0.0/16")))
                    .collect();
                rules.push(exempt("127.0.0.0/8"));
                rules.push(Rule::redirect(Transport::Tcp, 11081));
                rules
            };
            let current = build(&old_extra);
            let desired = build(&new_extra);
            let mut chain = current.clone();
            for step in plan_chain(&current, &desired) {
                replay(&mut chain, std::slice::from_ref(&step));
                let diverted = chain
                    .iter()
                    .find(|r| {
                        r.matches(
                            "10.0.0.2".parse().expect("ip"),
                            "127.0.0.1".parse().expect("ip"),
                            Transport::Tcp,
                            443,
                            None,
                        )
                    })
                    .is_some_and(|r| r.target != crate::rule::Target::Return);
                prop_assert!(!diverted, "loopback diverted after {:?}", step);
            }
            prop_assert_eq!(chain, desired);
        }

        #[test]
        fn replaying_a_hook_plan_leaves_exactly_one(
            others in prop::collection::vec(Just(Rule::jump("DOCKER", None)), 0..4),
            copies in 0usize..4,
        ) {
            let hook = Rule::jump("OWN", None);
            let mut chain = others.clone();
            for i in 0..copies {
                chain.insert(i.min(chain.len()), hook.clone());
            }
            let steps = plan_hook(&chain, Some(&hook), "OWN");
            replay(&mut chain, &steps);
            prop_assert_eq!(chain.iter().filter(|r| r.jumps_to("OWN")).count(), 1);
            prop_assert_eq!(chain.len(), others.len() + 1);
        }
    }
}
