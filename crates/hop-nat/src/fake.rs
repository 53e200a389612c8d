//! In-memory [`RuleBackend`] for tests.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::RuleBackend;
use crate::error::{NatError, Result};
use crate::rule::Rule;
use crate::types::Table;

/// Built-in chains present in a fresh fake kernel.
const BUILTIN: &[(Table, &str)] = &[
    (Table::Nat, "PREROUTING"),
    (Table::Nat, "INPUT"),
    (Table::Nat, "OUTPUT"),
    (Table::Nat, "POSTROUTING"),
    (Table::Filter, "INPUT"),
    (Table::Filter, "FORWARD"),
    (Table::Filter, "OUTPUT"),
];

/// Injected misbehaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeFailure {
    /// Reject the mutation after `after` more successful ones, once.
    FailAfter {
        /// Mutations that still succeed first.
        after: usize,
    },
    /// Reject every mutation.
    FailAll,
    /// Report appends and inserts as successful without storing them.
    DropWrites,
}

#[derive(Debug, Default)]
struct FakeState {
    chains: HashMap<(Table, String), Vec<Rule>>,
    failure: Option<FakeFailure>,
    mutations: usize,
    journal: Vec<String>,
}

/// Fake kernel rule table. Clones share state, so a test can keep a handle
/// while the engine owns another.
#[derive(Debug, Clone)]
pub struct FakeRuleBackend {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeRuleBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuleBackend {
    /// A kernel with only the built-in chains, all empty.
    pub fn new() -> Self {
        let mut state = FakeState::default();
        for (table, chain) in BUILTIN {
            state.chains.insert((*table, (*chain).to_string()), Vec::new());
        }
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Inject a failure mode.
    pub fn fail(&self, failure: FakeFailure) {
        self.state.lock().failure = Some(failure);
    }

    /// Stop injecting failures.
    pub fn heal(&self) {
        self.state.lock().failure = None;
    }

    /// Snapshot of a chain, empty if it does not exist.
    pub fn rules(&self, table: Table, chain: &str) -> Vec<Rule> {
        self.state
            .lock()
            .chains
            .get(&(table, chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Whether a chain exists.
    pub fn has_chain(&self, table: Table, chain: &str) -> bool {
        self.state.lock().chains.contains_key(&(table, chain.to_string()))
    }

    /// Add a rule the way some other tool would, bypassing failure
    /// injection and the mutation count.
    pub fn push_foreign(&self, table: Table, chain: &str, rule: Rule) {
        self.state
            .lock()
            .chains
            .entry((table, chain.to_string()))
            .or_default()
            .push(rule);
    }

    /// Remove a rule behind the engine's back.
    pub fn remove_foreign(&self, table: Table, chain: &str, position: usize) -> Option<Rule> {
        let mut state = self.state.lock();
        let rules = state.chains.get_mut(&(table, chain.to_string()))?;
        let at = position.checked_sub(1)?;
        (at < rules.len()).then(|| rules.remove(at))
    }

    /// Successful mutations so far.
    pub fn mutation_count(&self) -> usize {
        self.state.lock().mutations
    }

    /// Every successful mutation, rendered as iptables arguments.
    pub fn journal(&self) -> Vec<String> {
        self.state.lock().journal.clone()
    }

    fn mutate<F>(&self, table: Table, chain: &str, what: String, write: bool, op: F) -> Result<()>
    where
        F: FnOnce(&mut HashMap<(Table, String), Vec<Rule>>) -> std::result::Result<(), String>,
    {
        let mut state = self.state.lock();
        let reject = |reason: &str| NatError::RuleApply {
            table,
            chain: chain.to_string(),
            rule: what.clone(),
            reason: reason.to_string(),
        };
        let failure = state.failure;
        match failure {
            Some(FakeFailure::FailAll) => return Err(reject("injected failure")),
            Some(FakeFailure::FailAfter { after: 0 }) => {
                state.failure = None;
                return Err(reject("injected failure"));
            }
            Some(FakeFailure::FailAfter { after }) => {
                state.failure = Some(FakeFailure::FailAfter { after: after - 1 });
            }
            Some(FakeFailure::DropWrites) if write => {
                state.mutations += 1;
                return Ok(());
            }
            _ => {}
        }
        op(&mut state.chains).map_err(|reason| reject(&reason))?;
        state.mutations += 1;
        state.journal.push(format!("-t {table} {what}"));
        Ok(())
    }
}

fn chain_mut<'a>(
    chains: &'a mut HashMap<(Table, String), Vec<Rule>>,
    table: Table,
    chain: &str,
) -> std::result::Result<&'a mut Vec<Rule>, String> {
    chains
        .get_mut(&(table, chain.to_string()))
        .ok_or_else(|| format!("No chain/target/match by that name: {chain}"))
}

impl RuleBackend for FakeRuleBackend {
    fn chain_exists(&self, table: Table, chain: &str) -> Result<bool> {
        Ok(self.has_chain(table, chain))
    }

    fn create_chain(&self, table: Table, chain: &str) -> Result<()> {
        self.mutate(table, chain, format!("-N {chain}"), false, |chains| {
            chains.entry((table, chain.to_string())).or_default();
            Ok(())
        })
    }

    fn delete_chain(&self, table: Table, chain: &str) -> Result<()> {
        self.mutate(table, chain, format!("-X {chain}"), false, |chains| {
            if BUILTIN.iter().any(|(t, c)| *t == table && *c == chain) {
                return Err("cannot delete built-in chain".into());
            }
            if !chain_mut(chains, table, chain)?.is_empty() {
                return Err("Directory not empty".into());
            }
            let referenced = chains
                .iter()
                .any(|((t, _), rules)| *t == table && rules.iter().any(|r| r.jumps_to(chain)));
            if referenced {
                return Err("Too many links".into());
            }
            chains.remove(&(table, chain.to_string()));
            Ok(())
        })
    }

    fn list_rules(&self, table: Table, chain: &str) -> Result<Vec<Rule>> {
        self.state
            .lock()
            .chains
            .get(&(table, chain.to_string()))
            .cloned()
            .ok_or_else(|| NatError::Backend(format!("No chain/target/match by that name: {chain}")))
    }

    fn append(&self, table: Table, chain: &str, rule: &Rule) -> Result<()> {
        self.mutate(table, chain, format!("-A {chain} {rule}"), true, |chains| {
            chain_mut(chains, table, chain)?.push(rule.clone());
            Ok(())
        })
    }

    fn insert(&self, table: Table, chain: &str, position: usize, rule: &Rule) -> Result<()> {
        self.mutate(
            table,
            chain,
            format!("-I {chain} {position} {rule}"),
            true,
            |chains| {
                let rules = chain_mut(chains, table, chain)?;
                if position == 0 || position > rules.len() + 1 {
                    return Err("Index of insertion too big".into());
                }
                rules.insert(position - 1, rule.clone());
                Ok(())
            },
        )
    }

    fn delete(&self, table: Table, chain: &str, position: usize) -> Result<()> {
        self.mutate(table, chain, format!("-D {chain} {position}"), false, |chains| {
            let rules = chain_mut(chains, table, chain)?;
            if position == 0 || position > rules.len() {
                return Err("Index of deletion too big".into());
            }
            rules.remove(position - 1);
            Ok(())
        })
    }

    fn flush(&self, table: Table, chain: &str) -> Result<()> {
        self.mutate(table, chain, format!("-F {chain}"), false, |chains| {
            chain_mut(chains, table, chain)?.clear();
            Ok(())
        })
    }
}
