//! Transparent tunnel routing and NAT policy for twinhop nodes.
//!
//! A [`RoutingPolicy`] describes what the kernel must do: which
//! destinations and sources are exempt, which local listener each transport
//! is redirected into, and which client subnet is masqueraded on egress.
//! [`NatEngine`] turns that into rules inside chains it owns exclusively,
//! diffing against what the kernel reports instead of flushing, and
//! confirming every apply by read-back.
//!
//! # Example
//!
//! ```rust,no_run
//! use hop_nat::{IptablesBackend, NatEngine, RedirectPorts, RoutingPolicy};
//!
//! # fn main() -> hop_nat::Result<()> {
//! let policy = RoutingPolicy {
//!     redirect_ports: RedirectPorts::both(11081),
//!     client_subnet: "10.0.0.0/24".parse().ok(),
//!     tunnel_subordinate: true,
//!     ..RoutingPolicy::default()
//! };
//! let mut engine = NatEngine::open(IptablesBackend::default(), policy, "/var/lib/hopnode".as_ref())?;
//! engine.observe_interface("eth0");
//! engine.apply()?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod audit;
pub mod backend;
pub mod boot_hook;
pub mod delta;
pub mod engine;
pub mod error;
pub mod fake;
pub mod iptables;
pub mod lock;
pub mod policy;
pub mod rule;
pub mod ruleset;
pub mod simulate;
pub mod types;

pub use audit::Drift;
pub use backend::RuleBackend;
pub use boot_hook::SystemdBootHook;
pub use engine::{NatEngine, NatState};
pub use error::{NatError, Result};
pub use fake::{FakeFailure, FakeRuleBackend};
pub use iptables::IptablesBackend;
pub use lock::ChainLock;
pub use policy::{ControlPort, RedirectPorts, RoutingPolicy, default_exempt_ranges};
pub use rule::{Rule, Target};
pub use ruleset::{
    BYPASS_CHAIN, ChainRules, MASQUERADE_CHAIN, NatRuleSet, OWNED_CHAINS, REDIRECT_CHAIN,
};
pub use simulate::{Packet, Simulator, Verdict};
pub use types::{Table, Transport};
