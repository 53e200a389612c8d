//! Provisioning, boot restoration and recovery.
//!
//! Ordering is the whole point here: the tunnel engine must be confirmed
//! listening before rules redirect traffic into it, otherwise redirected
//! flows hit a closed port.

use std::path::Path;

use hop_nat::{RuleBackend, Transport};
use hop_render::{ConfigDocument, NodeRole};
use tracing::{info, warn};

use crate::config::NodeConfig;
use crate::diagnostics::{
    DiagnosticsReport, EgressProbe, EndToEndReport, ListenerProbe, Liveness, chain_audit,
    end_to_end_report, liveness,
};
use crate::error::{NodeError, Result};
use crate::node::Node;
use crate::state::{NodeState, PolicyRecord};

/// Determine the node's role.
///
/// The role marker is authoritative. Without one, the rendered engine
/// document is inspected instead and the degraded detection is logged.
pub fn detect_role(state: &NodeState, engine_config_path: &Path) -> Result<NodeRole> {
    if let Some(role) = state.role()? {
        return Ok(role);
    }

    warn!(
        path = %engine_config_path.display(),
        "role marker missing; inferring role from engine config"
    );
    let document = ConfigDocument::read_from(engine_config_path).map_err(|e| {
        NodeError::ConfigValidation(format!(
            "node is not provisioned and the engine config is unreadable: {e}"
        ))
    })?;
    let role = document.infer_role().ok_or_else(|| {
        NodeError::ConfigValidation(
            "node is not provisioned and the engine config does not reveal a role".into(),
        )
    })?;
    warn!(%role, "role inferred from engine config (degraded detection)");
    Ok(role)
}

/// Fix the node's role and seed the policy record. Re-provisioning with the
/// same role is a no-op; a different role is refused.
pub fn provision(config: &NodeConfig, role: NodeRole) -> Result<()> {
    let state = NodeState::new(&config.state_dir);
    state.write_role(role)?;
    if state.policy()?.is_none() {
        state.save_policy(&PolicyRecord {
            tunnel_subordinate: role == NodeRole::Relay && config.policy.tunnel_subordinate,
            egress_interface: None,
            updated_at: None,
        })?;
    }
    info!(%role, state_dir = %config.state_dir.display(), "node provisioned");
    Ok(())
}

/// Drives a node through boot and recovery.
pub struct Lifecycle<B: RuleBackend> {
    node: Node<B>,
    listeners: Box<dyn ListenerProbe>,
    egress: Box<dyn EgressProbe>,
}

impl<B: RuleBackend> std::fmt::Debug for Lifecycle<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}

impl<B: RuleBackend> Lifecycle<B> {
    /// Wrap `node` with the probes diagnostics use.
    pub fn new(node: Node<B>, listeners: Box<dyn ListenerProbe>, egress: Box<dyn EgressProbe>) -> Self {
        Self {
            node,
            listeners,
            egress,
        }
    }

    /// The node.
    pub fn node(&self) -> &Node<B> {
        &self.node
    }

    /// The node, mutably.
    pub fn node_mut(&mut self) -> &mut Node<B> {
        &mut self.node
    }

    /// Poll every listener the role needs, up to `max_attempts` each.
    pub async fn poll_listeners(&self, max_attempts: u32) -> Vec<(Transport, u16, Liveness)> {
        let diagnostics = &self.node.config().diagnostics;
        let mut results = Vec::new();
        for (transport, port) in self.node.controller().listeners(self.node.config()) {
            let result = liveness(
                self.listeners.as_ref(),
                port,
                transport,
                diagnostics.poll_interval(),
                max_attempts,
            )
            .await;
            results.push((transport, port, result));
        }
        results
    }

    fn first_not_ready(results: &[(Transport, u16, Liveness)]) -> Option<NodeError> {
        results.iter().find_map(|(transport, port, result)| match result {
            Liveness::NotReady { attempts } => Some(NodeError::ListenerNotReady {
                port: *port,
                transport: *transport,
                attempts: *attempts,
            }),
            Liveness::Ready { .. } => None,
        })
    }

    /// Wait for every listener. When `restart_once` is set, a listener that
    /// never binds costs one engine restart before escalating.
    async fn ensure_listening(&self, restart_once: bool) -> Result<()> {
        let attempts = self.node.config().diagnostics.max_attempts;
        let results = self.poll_listeners(attempts).await;
        let Some(err) = Self::first_not_ready(&results) else {
            return Ok(());
        };
        if !restart_once {
            return Err(err);
        }

        let engine = &self.node.config().engine.container;
        warn!(error = %err, container = %engine, "restarting tunnel engine");
        self.node.supervisor().restart(engine).await?;
        let results = self.poll_listeners(attempts).await;
        Self::first_not_ready(&results).map_or(Ok(()), Err)
    }

    /// Restore a node after reboot: start what is stopped, wait for the
    /// engine to listen, reapply rules, then run diagnostics.
    pub async fn boot(&mut self) -> Result<DiagnosticsReport> {
        info!(role = %self.node.role(), "booting node");
        for container in self.node.controller().containers(self.node.config()) {
            if !self.node.supervisor().is_running(&container).await? {
                self.node.supervisor().start(&container).await?;
            }
        }
        self.ensure_listening(true).await?;
        self.node.reapply()?;
        self.diagnostics().await
    }

    /// Restart every dependent container, wait for listeners, reapply, then
    /// run diagnostics.
    pub async fn recover(&mut self) -> Result<DiagnosticsReport> {
        info!(role = %self.node.role(), "recovering node");
        for container in self.node.controller().containers(self.node.config()) {
            self.node.supervisor().restart(&container).await?;
        }
        self.ensure_listening(false).await?;
        self.node.reapply()?;
        self.diagnostics().await
    }

    /// Snapshot of node health. Reports drift without repairing it.
    pub async fn diagnostics(&mut self) -> Result<DiagnosticsReport> {
        self.node.refresh_egress()?;
        let drift = chain_audit(self.node.engine())?;
        let listeners = self.poll_listeners(1).await;
        let end_to_end = if self.node.controller().probes_tunnel() {
            Some(self.end_to_end().await)
        } else {
            None
        };
        let report = DiagnosticsReport {
            nat_state: self.node.engine().state(),
            drift,
            listeners,
            end_to_end,
        };
        if report.healthy() {
            info!(nat_state = %report.nat_state, "node healthy");
        } else {
            warn!(
                nat_state = %report.nat_state,
                drift = report.drift.len(),
                "node unhealthy"
            );
        }
        Ok(report)
    }

    /// Probe through the tunnel and directly.
    pub async fn end_to_end(&self) -> EndToEndReport {
        end_to_end_report(self.egress.as_ref()).await
    }

    /// Reapply if the default route moved.
    pub fn check_interface(&mut self) -> Result<bool> {
        self.node.check_interface()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{FakeEgressProbe, FakeListenerProbe, TunnelVerdict};
    use crate::role::{EntryRole, Role};
    use crate::route::StaticRouteSource;
    use crate::supervisor::FakeSupervisor;
    use hop_credentials::{Fingerprint, IssueProfile};
    use hop_nat::{FakeRuleBackend, NatState};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.state_dir = dir.path().join("state");
        config.engine_config_path = dir.path().join("engine.json");
        config.policy.apply_backoff_ms = 0;
        config.diagnostics.max_attempts = 3;
        config.diagnostics.poll_interval_ms = 10;
        config
    }

    struct Harness {
        lifecycle: Lifecycle<FakeRuleBackend>,
        backend: FakeRuleBackend,
        supervisor: FakeSupervisor,
        listeners: FakeListenerProbe,
    }

    fn entry(dir: &TempDir) -> Harness {
        let config = config(dir);
        provision(&config, NodeRole::Entry).expect("provision");
        let backend = FakeRuleBackend::new();
        let supervisor = FakeSupervisor::new(["hopnode-engine"]);
        let listeners = FakeListenerProbe::new();
        let node = Node::open(
            config,
            NodeRole::Entry,
            backend.clone(),
            Box::new(StaticRouteSource::new(Some("eth0"))),
            Box::new(supervisor.clone()),
        )
        .expect("open");
        Harness {
            lifecycle: Lifecycle::new(
                node,
                Box::new(listeners.clone()),
                Box::new(FakeEgressProbe::default()),
            ),
            backend,
            supervisor,
            listeners,
        }
    }

    #[test]
    fn test_marker_wins_over_document() {
        let dir = TempDir::new().expect("tempdir");
        let config = config(&dir);
        provision(&config, NodeRole::Entry).expect("provision");
        let state = NodeState::new(&config.state_dir);
        assert_eq!(
            detect_role(&state, &config.engine_config_path).expect("detect"),
            NodeRole::Entry
        );
    }

    #[test]
    fn test_unprovisioned_without_document_fails() {
        let dir = TempDir::new().expect("tempdir");
        let config = config(&dir);
        let state = NodeState::new(&config.state_dir);
        assert!(matches!(
            detect_role(&state, &config.engine_config_path),
            Err(NodeError::ConfigValidation(_))
        ));
    }

    #[test]
    fn test_degraded_detection_reads_document() {
        let dir = TempDir::new().expect("tempdir");
        let config = config(&dir);
        let mut registry =
            hop_credentials::CredentialRegistry::open(&config.state_dir).expect("registry");
        registry
            .issue(
                "relay",
                &IssueProfile {
                    sni: "www.example.com".into(),
                    fingerprint: Fingerprint::Chrome,
                },
            )
            .expect("issue");
        let document = hop_render::render(
            NodeRole::Entry,
            &EntryRole.topology(&config),
            registry.list(),
        )
        .expect("render");
        document.write_to(&config.engine_config_path).expect("write");

        let state = NodeState::new(&config.state_dir);
        assert_eq!(
            detect_role(&state, &config.engine_config_path).expect("detect"),
            NodeRole::Entry
        );
    }

    #[test]
    fn test_provision_refuses_role_change() {
        let dir = TempDir::new().expect("tempdir");
        let config = config(&dir);
        provision(&config, NodeRole::Relay).expect("provision");
        provision(&config, NodeRole::Relay).expect("idempotent");
        assert!(provision(&config, NodeRole::Entry).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_boot_waits_for_listener_before_rules() {
        let dir = TempDir::new().expect("tempdir");
        let mut h = entry(&dir);
        h.listeners.never(Transport::Tcp, 443);

        let err = h.lifecycle.boot().await.expect_err("never listens");
        assert!(matches!(err, NodeError::ListenerNotReady { port: 443, .. }));
        assert_eq!(h.backend.mutation_count(), 0);
        assert_eq!(h.supervisor.starts("hopnode-engine"), 1);
        assert_eq!(h.supervisor.restarts("hopnode-engine"), 1);
        assert_eq!(h.lifecycle.node().engine().state(), NatState::Absent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_boot_applies_once_listening() {
        let dir = TempDir::new().expect("tempdir");
        let mut h = entry(&dir);
        h.listeners.bind_after(Transport::Tcp, 443, 2);

        let report = h.lifecycle.boot().await.expect("boot");
        assert_eq!(report.nat_state, NatState::Applied);
        assert!(report.drift.is_empty());
        assert!(report.end_to_end.is_none());
        assert!(report.healthy());
        assert_eq!(h.supervisor.restarts("hopnode-engine"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_boot_skips_running_containers() {
        let dir = TempDir::new().expect("tempdir");
        let mut h = entry(&dir);
        h.supervisor.set_running("hopnode-engine", true);
        h.listeners.bind_after(Transport::Tcp, 443, 0);

        h.lifecycle.boot().await.expect("boot");
        assert_eq!(h.supervisor.starts("hopnode-engine"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_restarts_then_reapplies() {
        let dir = TempDir::new().expect("tempdir");
        let mut h = entry(&dir);
        h.listeners.bind_after(Transport::Tcp, 443, 0);
        h.lifecycle.boot().await.expect("boot");

        h.backend.flush(hop_nat::Table::Filter, "INPUT").expect("wipe hooks");
        let drift = chain_audit(h.lifecycle.node().engine()).expect("audit");
        assert!(!drift.is_empty());

        let report = h.lifecycle.recover().await.expect("recover");
        assert_eq!(h.supervisor.restarts("hopnode-engine"), 1);
        assert!(report.drift.is_empty());
        assert_eq!(report.nat_state, NatState::Applied);
    }

    #[tokio::test]
    async fn test_relay_diagnostics_include_end_to_end() {
        let dir = TempDir::new().expect("tempdir");
        let mut config = config(&dir);
        config.policy.client_subnet = "10.0.0.0/24".parse().ok();
        provision(&config, NodeRole::Relay).expect("provision");
        let node = Node::open(
            config,
            NodeRole::Relay,
            FakeRuleBackend::new(),
            Box::new(StaticRouteSource::new(Some("eth0"))),
            Box::new(FakeSupervisor::new(["hopnode-engine"])),
        )
        .expect("open");
        let mut lifecycle = Lifecycle::new(
            node,
            Box::new(FakeListenerProbe::new()),
            Box::new(FakeEgressProbe::new(Some("198.51.100.7"), Some("198.51.100.7"))),
        );

        let report = lifecycle.diagnostics().await.expect("diagnostics");
        let e2e = report.end_to_end.as_ref().expect("relay probes");
        assert_eq!(e2e.verdict, TunnelVerdict::Inert);
        assert!(!report.healthy());
    }
}
