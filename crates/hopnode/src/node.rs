//! The node: registry, renderer and NAT engine driven by one role.

use hop_credentials::{Credential, CredentialRegistry, TunnelEndpoint};
use hop_nat::{NatEngine, NatRuleSet, NatState, RoutingPolicy, RuleBackend, SystemdBootHook};
use hop_render::{ConfigDocument, NodeRole, render};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::role::{Role, controller};
use crate::route::{RouteSource, resolve_egress};
use crate::state::{NodeState, PolicyRecord};
use crate::supervisor::ProcessSupervisor;

/// One provisioned node.
///
/// Single control-plane actor: every mutation goes through `&mut self`, and
/// the NAT engine additionally holds the chain lock while it touches the
/// kernel.
pub struct Node<B: RuleBackend> {
    config: NodeConfig,
    role: Box<dyn Role>,
    state: NodeState,
    registry: CredentialRegistry,
    engine: NatEngine<B>,
    routes: Box<dyn RouteSource>,
    supervisor: Box<dyn ProcessSupervisor>,
    tunnel_subordinate: bool,
}

impl<B: RuleBackend> std::fmt::Debug for Node<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("role", &self.role.role())
            .field("nat_state", &self.engine.state())
            .field("tunnel_subordinate", &self.tunnel_subordinate)
            .field("credentials", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl<B: RuleBackend> Node<B> {
    /// Open the node's persisted state for `role`.
    ///
    /// The subordinate toggle comes from the policy record when one exists,
    /// else from the config.
    pub fn open(
        config: NodeConfig,
        role: NodeRole,
        backend: B,
        routes: Box<dyn RouteSource>,
        supervisor: Box<dyn ProcessSupervisor>,
    ) -> Result<Self> {
        let state = NodeState::new(&config.state_dir);
        let role = controller(role);
        let record = state.policy()?;
        let tunnel_subordinate = record
            .as_ref()
            .map_or(config.policy.tunnel_subordinate, |r| r.tunnel_subordinate);

        let registry = CredentialRegistry::open(&config.state_dir)?;
        let policy = role.routing_policy(&config, tunnel_subordinate);
        let engine = NatEngine::open(backend, policy, &config.state_dir)?;

        info!(
            role = %role.role(),
            nat_state = %engine.state(),
            tunnel_subordinate,
            credentials = registry.len(),
            "node opened"
        );
        Ok(Self {
            config,
            role,
            state,
            registry,
            engine,
            routes,
            supervisor,
            tunnel_subordinate,
        })
    }

    /// Register a boot restoration hook with the NAT engine.
    #[must_use]
    pub fn with_boot_hook(mut self, hook: SystemdBootHook) -> Self {
        self.engine = self.engine.with_boot_hook(hook);
        self
    }

    /// Configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Role.
    pub fn role(&self) -> NodeRole {
        self.role.role()
    }

    /// Role controller.
    pub fn controller(&self) -> &dyn Role {
        self.role.as_ref()
    }

    /// NAT engine.
    pub fn engine(&self) -> &NatEngine<B> {
        &self.engine
    }

    /// Credential registry.
    pub fn registry(&self) -> &CredentialRegistry {
        &self.registry
    }

    /// Persisted state.
    pub fn state(&self) -> &NodeState {
        &self.state
    }

    /// Container supervisor.
    pub fn supervisor(&self) -> &dyn ProcessSupervisor {
        self.supervisor.as_ref()
    }

    /// Whether the client subnet is currently tunneled.
    pub fn tunnel_subordinate(&self) -> bool {
        self.tunnel_subordinate
    }

    /// Policy the role implies right now.
    pub fn routing_policy(&self) -> RoutingPolicy {
        self.role.routing_policy(&self.config, self.tunnel_subordinate)
    }

    /// Render the tunnel engine document and write it to
    /// `engine_config_path`. Nothing is written when rendering fails.
    pub fn render_config(&self) -> Result<ConfigDocument> {
        let document = render(
            self.role.role(),
            &self.role.topology(&self.config),
            self.registry.list(),
        )?;
        document.write_to(&self.config.engine_config_path)?;
        info!(path = %self.config.engine_config_path.display(), "engine config written");
        Ok(document)
    }

    /// Egress interface: the configured override, else the default route.
    ///
    /// Failing to resolve is fatal only when the policy masquerades.
    fn resolve_egress(&self, policy: &RoutingPolicy) -> Result<Option<String>> {
        if let Some(interface) = &self.config.policy.egress_interface {
            return Ok(Some(interface.clone()));
        }
        match resolve_egress(self.routes.as_ref()) {
            Ok(interface) => Ok(Some(interface)),
            Err(e) if policy.client_subnet.is_none() => {
                warn!(error = %e, "egress interface unknown; not needed without a client subnet");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Converge the kernel onto the role's policy and persist the policy
    /// record.
    pub fn apply(&mut self) -> Result<NatRuleSet> {
        self.refresh_egress()?;
        self.engine.update_policy(self.routing_policy())?;

        let applied = self
            .engine
            .apply_with_retry(self.config.policy.apply_attempts, self.config.policy.apply_backoff())?;

        self.state.save_policy(&PolicyRecord {
            tunnel_subordinate: self.tunnel_subordinate,
            egress_interface: applied.egress_interface.clone(),
            updated_at: None,
        })?;
        Ok(applied)
    }

    /// Rebuild rules after invalidation or reboot.
    pub fn reapply(&mut self) -> Result<NatRuleSet> {
        info!(nat_state = %self.engine.state(), "reapplying");
        self.apply()
    }

    /// Remove every rule this node owns.
    pub fn teardown(&mut self) -> Result<()> {
        Ok(self.engine.teardown()?)
    }

    /// Re-resolve the egress interface; reapply when it moved. Returns
    /// whether a reapply happened.
    pub fn check_interface(&mut self) -> Result<bool> {
        let moved = self.refresh_egress()?;
        if moved || self.engine.state() == NatState::Stale {
            info!(
                interface = self.engine.egress_interface().unwrap_or("-"),
                "egress interface changed; reapplying"
            );
            self.reapply()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Resolve the egress interface and hand it to the engine, which goes
    /// `Stale` if it moved. Returns whether it moved.
    pub fn refresh_egress(&mut self) -> Result<bool> {
        let policy = self.routing_policy();
        Ok(match self.resolve_egress(&policy)? {
            Some(interface) => self.engine.observe_interface(&interface),
            None => false,
        })
    }

    /// Send the client subnet through the tunnel (`true`) or direct.
    ///
    /// Re-runs apply, so the redirect hook is either fully present or fully
    /// absent afterwards. Relay only.
    pub fn set_tunnel_subordinate(&mut self, on: bool) -> Result<NatRuleSet> {
        if !self.role.supports_subordinate() {
            return Err(NodeError::ConfigValidation(format!(
                "{} nodes have no subordinate client subnet",
                self.role.role()
            )));
        }
        if self.config.policy.client_subnet.is_none() {
            return Err(NodeError::ConfigValidation(
                "policy.client_subnet is not configured".into(),
            ));
        }

        let previous = self.tunnel_subordinate;
        self.tunnel_subordinate = on;
        match self.apply() {
            Ok(applied) => {
                info!(tunnel_subordinate = on, "subordinate routing switched");
                Ok(applied)
            }
            Err(e) => {
                // The engine already holds the new policy; put it back too.
                self.tunnel_subordinate = previous;
                let policy = self.routing_policy();
                if let Err(restore) = self.engine.update_policy(policy) {
                    warn!(error = %restore, "engine routing policy not restored");
                }
                Err(e)
            }
        }
    }

    async fn reload_engine(&self) -> Result<()> {
        let container = &self.config.engine.container;
        if self.role.role() == NodeRole::Entry && self.registry.is_empty() {
            // An entry document needs at least one identity; with none left
            // the engine must not keep serving the last rendered one.
            warn!(%container, "no credentials left; stopping tunnel engine");
            return self.supervisor.stop(container).await;
        }
        self.render_config()?;
        self.supervisor.restart(container).await
    }

    /// Issue a credential and reload the engine so the peer is accepted.
    /// Entry only.
    pub async fn add_user(&mut self, name: &str) -> Result<Credential> {
        if self.role.role() != NodeRole::Entry {
            return Err(NodeError::ConfigValidation(
                "credentials are issued on the entry node; import them here".into(),
            ));
        }
        let credential = self.registry.issue(name, &self.config.entry.issue_profile())?;
        self.reload_engine().await?;
        Ok(credential)
    }

    /// Revoke a credential and reload the engine.
    ///
    /// New sessions for the identity are refused once the engine restarts;
    /// the restart also drops sessions that were open.
    pub async fn revoke_user(&mut self, id: Uuid) -> Result<Credential> {
        let revoked = self.registry.revoke(id)?;
        self.reload_engine().await?;
        Ok(revoked)
    }

    /// Import a credential from an Entry share link. Relay only.
    ///
    /// A link for another Entry than `[peer]` or a key differing from the
    /// trusted one is a [`NodeError::CredentialMismatch`].
    pub async fn import_credential(&mut self, link: &str) -> Result<Credential> {
        if self.role.role() != NodeRole::Relay {
            return Err(NodeError::ConfigValidation(
                "only relay nodes import credentials".into(),
            ));
        }
        let (credential, endpoint) = Credential::from_share_link(link)?;
        if let Some(peer) = &self.config.peer {
            if peer.endpoint() != endpoint {
                return Err(NodeError::CredentialMismatch(format!(
                    "link points at {endpoint} but the configured entry is {}",
                    peer.endpoint()
                )));
            }
        }
        self.registry.import(credential.clone())?;
        self.reload_engine().await?;
        Ok(credential.without_private_key())
    }

    /// All credentials.
    pub fn list_users(&self) -> &[Credential] {
        self.registry.list()
    }

    /// Share link handing credential `id` to a Relay that reaches this Entry
    /// at `address`.
    pub fn share_link(&self, id: Uuid, address: &str) -> Result<String> {
        let credential = self
            .registry
            .get(id)
            .ok_or(NodeError::CredentialNotFound(id))?;
        Ok(credential.share_link(&TunnelEndpoint::new(address, self.config.entry.listen_port)))
    }
}
