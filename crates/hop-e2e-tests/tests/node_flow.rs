//! End-to-end tests for the Entry/Relay pairing and node lifecycle.
//!
//! These tests verify:
//! 1. Entry issues, Relay imports, both render a matching engine config
//! 2. Revocation drops the identity at the next engine reload
//! 3. Boot ordering: processes and listeners before routing rules
//! 4. Recovery and diagnostics against a broken kernel or tunnel

mod helpers;

use std::time::Duration;

use hop_nat::{FakeFailure, NatState, REDIRECT_CHAIN, Table, Transport};
use hop_render::{ConfigDocument, NodeRole};
use hopnode::{Liveness, NodeError, ProbePath, TunnelVerdict};
use helpers::*;
use tempfile::TempDir;

/// Entry with one credential imported by a Relay.
async fn paired(dir: &TempDir) -> (TestNode, TestNode, uuid::Uuid) {
    let mut entry = TestNode::entry(dir);
    let issued = entry.node_mut().add_user("relay-1").await.expect("issue");
    let link = entry
        .node()
        .share_link(issued.id, ENTRY_ADDRESS)
        .expect("share link");

    let mut relay = TestNode::relay(dir);
    relay
        .node_mut()
        .import_credential(&link)
        .await
        .expect("import");
    (entry, relay, issued.id)
}

// ============================================================================
// Pairing
// ============================================================================

#[tokio::test]
async fn test_pairing_renders_both_sides() {
    let dir = TempDir::new().expect("tempdir");
    let (entry, relay, id) = paired(&dir).await;

    let entry_doc =
        ConfigDocument::read_from(&entry.node().config().engine_config_path).expect("entry doc");
    let relay_doc =
        ConfigDocument::read_from(&relay.node().config().engine_config_path).expect("relay doc");
    assert_eq!(entry_doc.infer_role(), Some(NodeRole::Entry));
    assert_eq!(relay_doc.infer_role(), Some(NodeRole::Relay));

    // Both sides name the same identity; only the Entry holds the private
    // key.
    assert!(entry.engine_document().contains(&id.to_string()));
    assert!(relay.engine_document().contains(&id.to_string()));
    let relay_credential = relay.node().registry().get(id).expect("imported");
    assert!(relay_credential.private_key.is_none());
    let entry_credential = entry.node().registry().get(id).expect("issued");
    assert_eq!(relay_credential.public_key, entry_credential.public_key);
    assert_eq!(relay_credential.short_id, entry_credential.short_id);

    assert_eq!(entry.supervisor.restarts(ENGINE), 1);
    assert_eq!(relay.supervisor.restarts(ENGINE), 1);
}

#[tokio::test]
async fn test_link_for_another_entry_is_refused() {
    let dir = TempDir::new().expect("tempdir");
    let mut entry = TestNode::entry(&dir);
    let issued = entry.node_mut().add_user("relay-1").await.expect("issue");
    let link = entry
        .node()
        .share_link(issued.id, "198.51.100.99")
        .expect("share link");

    let mut relay = TestNode::relay(&dir);
    let err = relay
        .node_mut()
        .import_credential(&link)
        .await
        .expect_err("mismatched entry");
    assert!(matches!(err, NodeError::CredentialMismatch(_)));
    assert!(relay.node().list_users().is_empty());
    assert_eq!(relay.supervisor.restarts(ENGINE), 0);
}

#[tokio::test]
async fn test_revoked_identity_leaves_engine_config_on_reload() {
    let dir = TempDir::new().expect("tempdir");
    let (mut entry, _relay, id) = paired(&dir).await;
    let keep = entry.node_mut().add_user("relay-2").await.expect("issue");

    entry.node_mut().revoke_user(id).await.expect("revoke");

    // The reload happened and the next engine instance no longer accepts
    // the revoked identity.
    assert_eq!(entry.supervisor.restarts(ENGINE), 3);
    let document = entry.engine_document();
    assert!(!document.contains(&id.to_string()));
    assert!(document.contains(&keep.id.to_string()));
    assert!(matches!(
        entry.node().share_link(id, ENTRY_ADDRESS),
        Err(NodeError::CredentialNotFound(_))
    ));
}

// ============================================================================
// Boot Ordering
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_relay_boot_orders_processes_before_rules() {
    let dir = TempDir::new().expect("tempdir");
    let (_entry, mut relay, _) = paired(&dir).await;
    relay.node_mut().set_tunnel_subordinate(true).expect("on");

    // Simulated reboot: processes are down and the kernel forgot the rules.
    drop(relay);
    let backend = hop_nat::FakeRuleBackend::new();
    let mut rebooted = TestNode::reopen(relay_config(&dir), NodeRole::Relay, backend);
    assert_eq!(rebooted.node().engine().state(), NatState::Stale);

    rebooted.listeners.bind_after(Transport::Tcp, 11081, 2);
    rebooted.listeners.bind_after(Transport::Udp, 11081, 0);
    rebooted.listeners.bind_after(Transport::Tcp, 10808, 0);

    let report = rebooted.lifecycle.boot().await.expect("boot");

    assert_eq!(
        rebooted.supervisor.journal(),
        vec![
            format!("inspect {ENGINE}"),
            format!("start {ENGINE}"),
            format!("inspect {VPN}"),
            format!("start {VPN}"),
        ]
    );
    assert!(rebooted.listeners.polls() >= 3);
    assert_eq!(report.nat_state, NatState::Applied);
    assert!(report.drift.is_empty());
    assert!(report.healthy());
    assert_eq!(
        report.end_to_end.as_ref().map(|r| r.verdict),
        Some(TunnelVerdict::Tunneled)
    );
    assert!(rebooted.node().tunnel_subordinate());
    assert_eq!(
        rebooted
            .backend
            .rules(Table::Nat, "PREROUTING")
            .iter()
            .filter(|r| r.jumps_to(REDIRECT_CHAIN))
            .count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_boot_never_applies_rules_without_listener() {
    let dir = TempDir::new().expect("tempdir");
    let mut relay = TestNode::relay(&dir);
    relay.listeners.never(Transport::Tcp, 11081);

    let err = relay.lifecycle.boot().await.expect_err("listener down");
    assert!(matches!(
        err,
        NodeError::ListenerNotReady {
            port: 11081,
            transport: Transport::Tcp,
            ..
        }
    ));
    // One restart was spent trying to bring the engine up.
    assert_eq!(relay.supervisor.restarts(ENGINE), 1);
    assert_eq!(relay.backend.mutation_count(), 0);
    assert_eq!(relay.node().engine().state(), NatState::Absent);
}

#[tokio::test(start_paused = true)]
async fn test_liveness_gives_up_within_budget() {
    let dir = TempDir::new().expect("tempdir");
    let relay = TestNode::relay(&dir);
    relay.listeners.never(Transport::Tcp, 10808);
    relay.listeners.bind_after(Transport::Tcp, 11081, 0);
    relay.listeners.bind_after(Transport::Udp, 11081, 0);

    let started = tokio::time::Instant::now();
    let results = relay.lifecycle.poll_listeners(5).await;
    let interval = Duration::from_millis(10);

    assert!(started.elapsed() <= interval * 5);
    assert!(
        results
            .iter()
            .any(|(t, p, l)| *t == Transport::Tcp && *p == 10808 && !l.is_ready())
    );
    assert!(results.contains(&(Transport::Udp, 11081, Liveness::Ready { attempts: 1 })));
}

// ============================================================================
// Recovery & Diagnostics
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_recover_repairs_lost_rules() {
    let dir = TempDir::new().expect("tempdir");
    let (_entry, mut relay, _) = paired(&dir).await;
    relay.bind_listeners();
    relay.node_mut().set_tunnel_subordinate(true).expect("on");

    // Someone deleted the PREROUTING hook. Positions are 1-based.
    let hook = relay
        .backend
        .rules(Table::Nat, "PREROUTING")
        .iter()
        .position(|r| r.jumps_to(REDIRECT_CHAIN))
        .expect("hook installed");
    relay
        .backend
        .remove_foreign(Table::Nat, "PREROUTING", hook + 1);
    assert!(
        !relay
            .backend
            .rules(Table::Nat, "PREROUTING")
            .iter()
            .any(|r| r.jumps_to(REDIRECT_CHAIN))
    );
    let drift = relay.node().engine().audit().expect("audit");
    assert!(!drift.is_empty());

    let report = relay.lifecycle.recover().await.expect("recover");
    assert!(report.drift.is_empty());
    assert!(report.healthy());
    assert_eq!(relay.supervisor.restarts(ENGINE), 2);
    assert_eq!(relay.supervisor.restarts(VPN), 1);
}

#[tokio::test(start_paused = true)]
async fn test_diagnostics_flag_inert_tunnel() {
    let dir = TempDir::new().expect("tempdir");
    let (_entry, mut relay, _) = paired(&dir).await;
    relay.bind_listeners();
    relay.node_mut().apply().expect("apply");

    // The probe listener answers but traffic leaves directly.
    relay.egress.set(ProbePath::Tunnel, Some("198.51.100.7"));
    let report = relay.lifecycle.diagnostics().await.expect("diagnostics");
    assert_eq!(
        report.end_to_end.as_ref().map(|r| r.verdict),
        Some(TunnelVerdict::Inert)
    );
    assert!(!report.healthy());

    relay.egress.set(ProbePath::Tunnel, None);
    let report = relay.lifecycle.end_to_end().await;
    assert_eq!(report.verdict, TunnelVerdict::Unreachable);
}

#[tokio::test]
async fn test_failed_apply_is_reported_not_hidden() {
    let dir = TempDir::new().expect("tempdir");
    let mut relay = TestNode::relay(&dir);
    let seeded = relay
        .node()
        .state()
        .policy()
        .expect("read")
        .expect("seeded by provision");
    relay.backend.fail(FakeFailure::FailAll);

    let err = relay.node_mut().apply().expect_err("kernel refuses");
    assert!(matches!(err, NodeError::RuleApply(_)));
    let after_failure = relay
        .node()
        .state()
        .policy()
        .expect("read")
        .expect("still present");
    assert_eq!(after_failure, seeded);
    assert!(after_failure.egress_interface.is_none());

    relay.backend.heal();
    relay.node_mut().apply().expect("apply after heal");
    assert_eq!(relay.node().engine().state(), NatState::Applied);
    let applied = relay
        .node()
        .state()
        .policy()
        .expect("read")
        .expect("recorded");
    assert_eq!(applied.egress_interface.as_deref(), Some("eth0"));
}
