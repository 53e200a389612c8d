//! The policy engine state machine.
//!
//! ```text
//! Absent --apply--> Building --verified--> Applied
//! Applied --interface/policy change--> Stale --reapply--> Building
//! Applied --teardown--> Absent
//! ```
//!
//! A failed step leaves the engine in `Building`; applying again converges
//! from whatever the kernel holds, so retries never duplicate rules.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use hop_persist::JsonStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::audit::{self, Drift};
use crate::backend::RuleBackend;
use crate::boot_hook::SystemdBootHook;
use crate::delta::{self, Step};
use crate::error::{NatError, Result};
use crate::lock::ChainLock;
use crate::policy::RoutingPolicy;
use crate::ruleset::{ChainRules, NatRuleSet, OWNED_CHAINS};
use crate::simulate::Simulator;
use crate::types::Table;

/// Lifecycle state of the installed rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatState {
    /// Nothing installed.
    Absent,
    /// Mutation in progress, or aborted midway.
    Building,
    /// Installed and confirmed by read-back.
    Applied,
    /// Installed, but the policy or egress interface changed since.
    Stale,
}

impl fmt::Display for NatState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Absent => "absent",
            Self::Building => "building",
            Self::Applied => "applied",
            Self::Stale => "stale",
        })
    }
}

/// Owns the node's chains and keeps them matching a [`RoutingPolicy`].
pub struct NatEngine<B: RuleBackend> {
    backend: B,
    policy: RoutingPolicy,
    egress_interface: Option<String>,
    state: NatState,
    current: Option<NatRuleSet>,
    snapshot: JsonStore,
    lock_path: PathBuf,
    boot_hook: Option<SystemdBootHook>,
}

impl<B: RuleBackend> fmt::Debug for NatEngine<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatEngine")
            .field("state", &self.state)
            .field("egress_interface", &self.egress_interface)
            .field("tunnel_subordinate", &self.policy.tunnel_subordinate)
            .finish_non_exhaustive()
    }
}

impl<B: RuleBackend> NatEngine<B> {
    /// Open the engine over `state_dir`.
    ///
    /// A snapshot left by a previous run is loaded but not trusted: the
    /// kernel may have been reset since, so the engine starts `Stale` and
    /// the next [`reapply`](Self::reapply) confirms it.
    pub fn open(backend: B, policy: RoutingPolicy, state_dir: &Path) -> Result<Self> {
        policy.validate()?;
        let snapshot = JsonStore::new(state_dir, "ruleset");
        let previous: Option<NatRuleSet> = match snapshot.try_load() {
            Ok(previous) => previous,
            Err(e) => {
                warn!(error = %e, "discarding unreadable rule set snapshot");
                None
            }
        };

        let state = if previous.is_some() {
            NatState::Stale
        } else {
            NatState::Absent
        };
        info!(state = %state, "nat engine opened");

        Ok(Self {
            backend,
            policy: policy.normalized(),
            egress_interface: previous.as_ref().and_then(|p| p.egress_interface.clone()),
            state,
            current: previous,
            snapshot,
            lock_path: state_dir.join("hopnet.lock"),
            boot_hook: None,
        })
    }

    /// Register a boot hook after every successful apply.
    #[must_use]
    pub fn with_boot_hook(mut self, hook: SystemdBootHook) -> Self {
        self.boot_hook = Some(hook);
        self
    }

    /// Current state.
    pub fn state(&self) -> NatState {
        self.state
    }

    /// Policy the next apply will install.
    pub fn policy(&self) -> &RoutingPolicy {
        &self.policy
    }

    /// Last known egress interface.
    pub fn egress_interface(&self) -> Option<&str> {
        self.egress_interface.as_deref()
    }

    /// Rule set last confirmed (or restored from snapshot).
    pub fn current(&self) -> Option<&NatRuleSet> {
        self.current.as_ref()
    }

    /// The rule backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn transition(&mut self, to: NatState) {
        if self.state != to {
            info!(from = %self.state, to = %to, "nat state transition");
            self.state = to;
        }
    }

    fn invalidate(&mut self, reason: &str) {
        if self.state == NatState::Applied {
            info!(reason, "rule set invalidated");
            self.transition(NatState::Stale);
        }
    }

    /// Record the freshly resolved egress interface. Returns whether it
    /// changed.
    pub fn observe_interface(&mut self, interface: &str) -> bool {
        if self.egress_interface.as_deref() == Some(interface) {
            return false;
        }
        info!(
            previous = self.egress_interface.as_deref().unwrap_or("-"),
            current = interface,
            "egress interface changed"
        );
        self.egress_interface = Some(interface.to_string());
        self.invalidate("egress interface changed");
        true
    }

    /// Replace the policy. Returns whether anything changed.
    pub fn update_policy(&mut self, policy: RoutingPolicy) -> Result<bool> {
        policy.validate()?;
        let policy = policy.normalized();
        if policy == self.policy {
            return Ok(false);
        }
        self.policy = policy;
        self.invalidate("routing policy changed");
        Ok(true)
    }

    /// Flip whether the client subnet goes through the tunnel.
    pub fn set_tunnel_subordinate(&mut self, on: bool) -> Result<bool> {
        let mut policy = self.policy.clone();
        policy.tunnel_subordinate = on;
        self.update_policy(policy)
    }

    /// Converge the kernel onto the current policy and confirm by
    /// read-back.
    pub fn apply(&mut self) -> Result<NatRuleSet> {
        let desired = NatRuleSet::desired(&self.policy, self.egress_interface.as_deref())?;
        let _lock = ChainLock::acquire(&self.lock_path)?;
        self.transition(NatState::Building);

        // Unhook chains that must become unreachable before touching
        // contents, then fill chains, then hook.
        let chains = desired.chains();
        for spec in chains.iter().filter(|s| s.hook.is_none()) {
            self.converge_hook(spec)?;
        }
        for spec in chains {
            self.converge_chain(spec)?;
        }
        for spec in chains.iter().filter(|s| s.hook.is_some()) {
            self.converge_hook(spec)?;
        }
        self.verify(&desired)?;

        let mut applied = desired;
        applied.hook_installed = applied.redirect.hook.is_some();
        applied.masquerade_installed = !applied.masquerade.rules.is_empty();
        applied.applied_at = Some(Utc::now());
        self.snapshot.save(&applied)?;

        if let Some(hook) = &self.boot_hook {
            if let Err(e) = hook.install() {
                warn!(error = %e, "boot restoration hook not registered");
            }
        }

        info!(
            rules = applied.rules().len(),
            hook = applied.hook_installed,
            masquerade = applied.masquerade_installed,
            egress = applied.egress_interface.as_deref().unwrap_or("-"),
            "routing policy applied"
        );
        self.current = Some(applied.clone());
        self.transition(NatState::Applied);
        Ok(applied)
    }

    /// Rebuild after invalidation. Same convergence as [`apply`](Self::apply).
    pub fn reapply(&mut self) -> Result<NatRuleSet> {
        info!(state = %self.state, "reapplying routing policy");
        self.apply()
    }

    /// Apply, retrying retryable failures up to `attempts` times in total.
    pub fn apply_with_retry(&mut self, attempts: u32, backoff: Duration) -> Result<NatRuleSet> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.apply() {
                Ok(set) => return Ok(set),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(attempt, attempts, error = %e, "apply failed, retrying");
                    std::thread::sleep(backoff);
                    attempt += 1;
                }
                Err(e) => {
                    error!(attempt, error = %e, "apply failed, giving up");
                    return Err(e);
                }
            }
        }
    }

    /// Remove every owned chain and the jumps into them. Rules in built-in
    /// chains that do not jump to an owned chain are left alone.
    pub fn teardown(&mut self) -> Result<()> {
        let _lock = ChainLock::acquire(&self.lock_path)?;
        for (table, chain, hook_chain) in OWNED_CHAINS {
            let hooks = self.backend.list_rules(table, hook_chain)?;
            self.run_steps(table, hook_chain, &delta::plan_hook(&hooks, None, chain))?;
            if self.backend.chain_exists(table, chain)? {
                self.backend.flush(table, chain)?;
                self.backend.delete_chain(table, chain)?;
                debug!(table = %table, chain, "owned chain removed");
            }
        }

        self.snapshot.remove()?;
        if let Some(hook) = &self.boot_hook {
            if let Err(e) = hook.uninstall() {
                warn!(error = %e, "boot restoration hook not removed");
            }
        }
        self.current = None;
        self.transition(NatState::Absent);
        info!("routing policy torn down");
        Ok(())
    }

    /// Compare the kernel against the current policy. Never mutates.
    pub fn audit(&self) -> Result<Vec<Drift>> {
        let desired = NatRuleSet::desired(&self.policy, self.egress_interface.as_deref())?;
        let drift = audit::audit(&self.backend, &desired)?;
        for d in &drift {
            warn!(drift = %d, "rule drift detected");
        }
        Ok(drift)
    }

    /// Packet simulator over what the kernel holds now.
    pub fn simulator(&self) -> Result<Simulator> {
        Simulator::from_backend(&self.backend)
    }

    fn converge_chain(&self, spec: &ChainRules) -> Result<()> {
        if !self.backend.chain_exists(spec.table, &spec.chain)? {
            self.backend.create_chain(spec.table, &spec.chain)?;
            debug!(table = %spec.table, chain = %spec.chain, "owned chain created");
        }
        let installed = self.backend.list_rules(spec.table, &spec.chain)?;
        let steps = delta::plan_chain(&installed, &spec.rules);
        self.run_steps(spec.table, &spec.chain, &steps)
    }

    fn converge_hook(&self, spec: &ChainRules) -> Result<()> {
        let installed = self.backend.list_rules(spec.table, &spec.hook_chain)?;
        let steps = delta::plan_hook(&installed, spec.hook.as_ref(), &spec.chain);
        self.run_steps(spec.table, &spec.hook_chain, &steps)
    }

    fn run_steps(&self, table: Table, chain: &str, steps: &[Step]) -> Result<()> {
        for step in steps {
            let result = match step {
                Step::Append(rule) => self.backend.append(table, chain, rule),
                Step::Insert { position, rule } => {
                    self.backend.insert(table, chain, *position, rule)
                }
                Step::Delete { position, .. } => self.backend.delete(table, chain, *position),
            };
            match result {
                Ok(()) => debug!(table = %table, chain, step = ?step, "rule step applied"),
                Err(NatError::RuleApply { reason, .. }) => {
                    let rule = step.rule().to_string();
                    error!(table = %table, chain, rule = %rule, reason = %reason, "rule mutation failed");
                    return Err(NatError::RuleApply {
                        table,
                        chain: chain.to_string(),
                        rule,
                        reason,
                    });
                }
                Err(e) => {
                    error!(table = %table, chain, rule = %step.rule(), error = %e, "rule mutation failed");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn verify(&self, desired: &NatRuleSet) -> Result<()> {
        for spec in desired.chains() {
            let installed = self.backend.list_rules(spec.table, &spec.chain)?;
            if installed != spec.rules {
                let at = installed
                    .iter()
                    .zip(&spec.rules)
                    .take_while(|(a, b)| a == b)
                    .count();
                return Err(NatError::Verification {
                    table: spec.table,
                    chain: spec.chain.clone(),
                    detail: format!(
                        "expected {} rules, found {}; first difference at position {}",
                        spec.rules.len(),
                        installed.len(),
                        at + 1
                    ),
                });
            }

            let hooks: Vec<_> = self
                .backend
                .list_rules(spec.table, &spec.hook_chain)?
                .into_iter()
                .filter(|r| r.jumps_to(&spec.chain))
                .collect();
            let ok = match &spec.hook {
                Some(hook) => hooks.len() == 1 && hooks[0] == *hook,
                None => hooks.is_empty(),
            };
            if !ok {
                return Err(NatError::Verification {
                    table: spec.table,
                    chain: spec.hook_chain.clone(),
                    detail: format!("{} jumps to {} found", hooks.len(), spec.chain),
                });
            }
        }
        debug!("rule set verified by read-back");
        Ok(())
    }
}
