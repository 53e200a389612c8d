//! [`RuleBackend`] driving the `iptables` binary.

use std::path::PathBuf;
use std::process::Command;

use tracing::{debug, trace};

use crate::backend::RuleBackend;
use crate::error::{NatError, Result};
use crate::rule::Rule;
use crate::types::Table;

/// Shells out to `iptables`, always with `-w` so concurrent callers outside
/// this process wait on the xtables lock instead of failing.
#[derive(Debug, Clone)]
pub struct IptablesBackend {
    binary: PathBuf,
}

impl Default for IptablesBackend {
    fn default() -> Self {
        Self::new("iptables")
    }
}

impl IptablesBackend {
    /// Use the given binary (e.g. `iptables-legacy`).
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Whether the binary can be executed at all.
    pub fn available(&self) -> bool {
        Command::new(&self.binary)
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success())
    }

    fn run(&self, table: Table, args: &[String]) -> std::result::Result<String, String> {
        trace!(binary = %self.binary.display(), table = %table, args = ?args, "iptables");
        let output = Command::new(&self.binary)
            .args(["-w", "-t", table.as_str()])
            .args(args)
            .output()
            .map_err(|e| format!("failed to execute {}: {e}", self.binary.display()))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }

    fn mutate(&self, table: Table, chain: &str, rule: Option<&Rule>, args: Vec<String>) -> Result<()> {
        self.run(table, &args).map_err(|reason| NatError::RuleApply {
            table,
            chain: chain.to_string(),
            rule: rule.map_or_else(|| args.join(" "), ToString::to_string),
            reason,
        })?;
        debug!(table = %table, chain = %chain, args = ?args, "iptables rule mutated");
        Ok(())
    }
}

fn command(flag: &str, chain: &str) -> Vec<String> {
    vec![flag.to_string(), chain.to_string()]
}

impl RuleBackend for IptablesBackend {
    fn chain_exists(&self, table: Table, chain: &str) -> Result<bool> {
        match self.run(table, &command("-S", chain)) {
            Ok(_) => Ok(true),
            Err(stderr) if stderr.contains("No chain") || stderr.contains("does not exist") => {
                Ok(false)
            }
            Err(stderr) => Err(NatError::Backend(stderr)),
        }
    }

    fn create_chain(&self, table: Table, chain: &str) -> Result<()> {
        match self.run(table, &command("-N", chain)) {
            Ok(_) => Ok(()),
            Err(stderr) if stderr.contains("already exists") => Ok(()),
            Err(reason) => Err(NatError::RuleApply {
                table,
                chain: chain.to_string(),
                rule: format!("-N {chain}"),
                reason,
            }),
        }
    }

    fn delete_chain(&self, table: Table, chain: &str) -> Result<()> {
        self.mutate(table, chain, None, command("-X", chain))
    }

    fn list_rules(&self, table: Table, chain: &str) -> Result<Vec<Rule>> {
        let stdout = self
            .run(table, &command("-S", chain))
            .map_err(NatError::Backend)?;
        let mut rules = Vec::new();
        for line in stdout.lines() {
            if let Some((owner, rule)) = Rule::parse_spec(line)? {
                if owner == chain {
                    rules.push(rule);
                }
            }
        }
        Ok(rules)
    }

    fn append(&self, table: Table, chain: &str, rule: &Rule) -> Result<()> {
        let mut args = command("-A", chain);
        args.extend(rule.to_args());
        self.mutate(table, chain, Some(rule), args)
    }

    fn insert(&self, table: Table, chain: &str, position: usize, rule: &Rule) -> Result<()> {
        let mut args = command("-I", chain);
        args.push(position.to_string());
        args.extend(rule.to_args());
        self.mutate(table, chain, Some(rule), args)
    }

    fn delete(&self, table: Table, chain: &str, position: usize) -> Result<()> {
        let mut args = command("-D", chain);
        args.push(position.to_string());
        self.mutate(table, chain, None, args)
    }

    fn flush(&self, table: Table, chain: &str) -> Result<()> {
        self.mutate(table, chain, None, command("-F", chain))
    }
}
