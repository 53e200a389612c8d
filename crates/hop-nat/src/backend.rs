//! The seam between the engine and the kernel rule table.

use crate::error::Result;
use crate::rule::Rule;
use crate::types::Table;

/// Chain-scoped access to kernel rules.
///
/// Implementations never touch chains they are not asked about. Positions
/// are 1-based.
pub trait RuleBackend: Send + Sync {
    /// Whether `chain` exists in `table`.
    fn chain_exists(&self, table: Table, chain: &str) -> Result<bool>;

    /// Create an empty user chain.
    fn create_chain(&self, table: Table, chain: &str) -> Result<()>;

    /// Delete an empty, unreferenced user chain.
    fn delete_chain(&self, table: Table, chain: &str) -> Result<()>;

    /// Current rules of `chain`, in order.
    fn list_rules(&self, table: Table, chain: &str) -> Result<Vec<Rule>>;

    /// Append a rule.
    fn append(&self, table: Table, chain: &str, rule: &Rule) -> Result<()>;

    /// Insert a rule at `position`.
    fn insert(&self, table: Table, chain: &str, position: usize, rule: &Rule) -> Result<()>;

    /// Delete the rule at `position`.
    fn delete(&self, table: Table, chain: &str, position: usize) -> Result<()>;

    /// Remove every rule of `chain`.
    fn flush(&self, table: Table, chain: &str) -> Result<()>;
}

impl<T: RuleBackend + ?Sized> RuleBackend for Box<T> {
    fn chain_exists(&self, table: Table, chain: &str) -> Result<bool> {
        (**self).chain_exists(table, chain)
    }

    fn create_chain(&self, table: Table, chain: &str) -> Result<()> {
        (**self).create_chain(table, chain)
    }

    fn delete_chain(&self, table: Table, chain: &str) -> Result<()> {
        (**self).delete_chain(table, chain)
    }

    fn list_rules(&self, table: Table, chain: &str) -> Result<Vec<Rule>> {
        (**self).list_rules(table, chain)
    }

    fn append(&self, table: Table, chain: &str, rule: &Rule) -> Result<()> {
        (**self).append(table, chain, rule)
    }

    fn insert(&self, table: Table, chain: &str, position: usize, rule: &Rule) -> Result<()> {
        (**self).insert(table, chain, position, rule)
    }

    fn delete(&self, table: Table, chain: &str, position: usize) -> Result<()> {
        (**self).delete(table, chain, position)
    }

    fn flush(&self, table: Table, chain: &str) -> Result<()> {
        (**self).flush(table, chain)
    }
}
