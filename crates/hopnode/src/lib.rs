//! hopnode - twinhop node agent
//!
//! Runs on both nodes of a two-node relay tunnel. On the Entry node it
//! issues credentials and keeps the tunnel listener reachable; on the Relay
//! node it renders the tunnel client, redirects a subordinate client subnet
//! into the engine's transparent listeners and masquerades its egress.
//!
//! The kernel rule work lives in [`hop_nat`]; this crate decides what the
//! policy is for a role, and in which order processes and rules come up.

#![forbid(unsafe_code)]

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod lifecycle;
pub mod node;
pub mod role;
pub mod route;
pub mod state;
pub mod supervisor;

pub use config::NodeConfig;
pub use diagnostics::{
    DiagnosticsReport, EgressProbe, EndToEndReport, FakeEgressProbe, FakeListenerProbe,
    ListenerProbe, Liveness, ProbePath, ProcListenerProbe, ReqwestEgressProbe, TunnelVerdict,
    check_drift, end_to_end_test, liveness,
};
pub use error::{NodeError, Result};
pub use lifecycle::{Lifecycle, detect_role, provision};
pub use node::Node;
pub use role::{EntryRole, RelayRole, Role};
pub use route::{ProcRouteSource, RouteSource, StaticRouteSource, resolve_egress};
pub use state::{NodeState, PolicyRecord};
pub use supervisor::{DockerSupervisor, FakeSupervisor, ProcessSupervisor};
