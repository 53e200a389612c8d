//! Tunnel credentials for twinhop.
//!
//! Issues, stores and revokes per-peer identities together with the reality
//! key material the Entry node authenticates them with.

pub mod error;
mod keys;
mod registry;

pub use error::{CredentialError, Result};
pub use keys::{Fingerprint, KEY_SIZE, KeyPair, PrivateKey, PublicKey, SHORT_ID_MAX_BYTES, ShortId};
pub use registry::{Credential, CredentialRegistry, IssueProfile, TunnelEndpoint, VISION_FLOW};
