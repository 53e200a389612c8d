//! Tunnel engine configuration rendering for twinhop.
//!
//! Turns a node role, its peer topology and the stored credentials into the
//! JSON document the external tunnel engine consumes. Every document carries
//! a `direct` fallback outbound and IP rules keeping loopback and private
//! destinations off the tunnel, independent of kernel-level exemptions.

pub mod document;
pub mod error;
mod render;

pub use document::{
    BLOCK_TAG, ConfigDocument, DIRECT_TAG, Inbound, LogSection, NodeRole, Outbound, Routing,
    RoutingRule, TUNNEL_TAG,
};
pub use error::{RenderError, Result};
pub use render::{
    ALWAYS_DIRECT, EntryTopology, PROBE_TAG, PeerTopology, REDIRECT_TCP_TAG, REDIRECT_UDP_TAG,
    RelayTopology, TUNNEL_INBOUND_TAG, render,
};
