//! Error types for the NAT policy engine.

use std::path::PathBuf;

use hop_persist::PersistError;
use thiserror::Error;

use crate::types::Table;

/// Result alias for NAT operations.
pub type Result<T> = std::result::Result<T, NatError>;

/// Errors raised while building, applying or auditing rules.
#[derive(Debug, Error)]
pub enum NatError {
    /// A single rule mutation was rejected. Safe to retry.
    #[error("rule apply failed in {table}/{chain}: `{rule}`: {reason}")]
    RuleApply {
        /// Table of the chain being mutated.
        table: Table,
        /// Chain being mutated.
        chain: String,
        /// The rule, rendered as iptables arguments.
        rule: String,
        /// Backend message.
        reason: String,
    },

    /// Rules read back from the kernel do not match what was applied.
    #[error("verification failed for {table}/{chain}: {detail}")]
    Verification {
        /// Table of the chain.
        table: Table,
        /// Chain that failed verification.
        chain: String,
        /// What differed.
        detail: String,
    },

    /// The rule backend itself could not be driven.
    #[error("rule backend failure: {0}")]
    Backend(String),

    /// Backend output could not be parsed into a rule.
    #[error("unparseable rule `{line}`: {reason}")]
    InvalidRule {
        /// The offending line.
        line: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The routing policy is not usable.
    #[error("invalid routing policy: {0}")]
    InvalidPolicy(String),

    /// No egress interface is known but the policy needs one.
    #[error("egress interface unresolved")]
    EgressUnresolved,

    /// The exclusive chain lock could not be taken.
    #[error("failed to lock {path}: {source}")]
    Lock {
        /// Lock file.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Boot hook installation failed.
    #[error("boot hook error on {path}: {source}")]
    BootHook {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Snapshot persistence failed.
    #[error(transparent)]
    Persist(#[from] PersistError),
}

impl NatError {
    /// Whether retrying the same apply can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RuleApply { .. } | Self::Verification { .. } | Self::Backend(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_apply_display_names_the_rule() {
        let err = NatError::RuleApply {
            table: Table::Nat,
            chain: "HOPNET-REDIRECT".into(),
            rule: "-d 10.0.0.0/8 -j RETURN".into(),
            reason: "Resource temporarily unavailable".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("nat/HOPNET-REDIRECT"));
        assert!(msg.contains("-d 10.0.0.0/8 -j RETURN"));
        assert!(err.is_retryable());
    }

    #[test]
    fn policy_errors_are_not_retryable() {
        assert!(!NatError::InvalidPolicy("x".into()).is_retryable());
        assert!(!NatError::EgressUnresolved.is_retryable());
    }
}
