//! End-to-end integration tests for twinhop nodes.
//!
//! These tests drive complete nodes against fake kernel, container and
//! probe adapters:
//! - Entry credential issue, share and revoke
//! - Relay import, boot and recovery ordering
//! - Subordinate toggling and exemption scenarios

#![cfg(test)]
