//! hopnode - twinhop node agent
//!
//! Provisions a node as Entry or Relay, keeps its tunnel routing rules in
//! place across reboots, and reports on tunnel health.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use hop_nat::{IptablesBackend, Packet, SystemdBootHook, Transport};
use hop_render::NodeRole;
use hopnode::{
    DockerSupervisor, Lifecycle, Node, NodeConfig, NodeState, ProcListenerProbe, ProcRouteSource,
    ReqwestEgressProbe, TunnelVerdict, check_drift, config::TEMPLATE, detect_role, provision,
};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "hopnode")]
#[command(about = "twinhop relay tunnel node agent")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(
        short,
        long,
        global = true,
        env = "HOPNODE_CONFIG",
        default_value = "/etc/hopnode/hopnode.toml"
    )]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    Entry,
    Relay,
}

impl From<RoleArg> for NodeRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Entry => Self::Entry,
            RoleArg::Relay => Self::Relay,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a commented default config file
    InitConfig {
        /// Where to write it (defaults to --config)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Fix this node's role; done once
    Provision {
        /// Role of this node
        #[arg(long, value_enum)]
        role: RoleArg,
    },

    /// Restore after reboot: start containers, wait for listeners, reapply rules
    Boot,

    /// Apply routing rules
    Apply,

    /// Rebuild routing rules after a change
    Reapply,

    /// Remove every rule this node owns
    Teardown,

    /// Restart containers, reapply rules, run diagnostics
    Recover,

    /// Compare installed rules with policy
    Audit {
        /// Exit non-zero on drift
        #[arg(long)]
        strict: bool,
    },

    /// End-to-end tunnel test
    Test,

    /// Wait for the tunnel engine's listeners
    Liveness,

    /// Reapply if the default route moved
    CheckInterface,

    /// Tunnel the subordinate client subnet, or send it direct
    Subordinate {
        /// on = through the tunnel, off = direct
        #[arg(value_enum)]
        state: Toggle,
    },

    /// Manage tunnel credentials
    User {
        #[command(subcommand)]
        action: UserCommand,
    },

    /// Render the tunnel engine config
    Render,

    /// Show node status
    Status,
}

#[derive(Subcommand)]
enum UserCommand {
    /// Issue a credential (Entry)
    Add {
        /// Label for the credential
        name: String,
    },

    /// Revoke a credential
    Revoke {
        /// Credential id
        id: Uuid,
    },

    /// List credentials
    List,

    /// Print a credential's share link (Entry)
    Show {
        /// Credential id
        id: Uuid,

        /// Address Relays reach this Entry at
        #[arg(long)]
        address: String,
    },

    /// Import a share link issued by the Entry (Relay)
    Import {
        /// vless:// share link
        link: String,
    },
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let mut filter = EnvFilter::from_default_env();
    for target in ["hopnode", "hop_nat", "hop_credentials", "hop_render", "hop_persist"] {
        filter = filter.add_directive(format!("{target}=info").parse()?);
    }
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    match cli.command {
        Commands::InitConfig { output, force } => {
            init_config(output.as_deref().unwrap_or(&cli.config), force)?;
        }

        Commands::Provision { role } => {
            let config = NodeConfig::from_file(&cli.config)?;
            provision(&config, role.into())?;
            println!("provisioned as {}", NodeRole::from(role));
        }

        Commands::Boot => {
            let mut lifecycle = open_lifecycle(&cli.config)?;
            let report = lifecycle.boot().await?;
            print_json(&report)?;
        }

        Commands::Apply => {
            let mut lifecycle = open_lifecycle(&cli.config)?;
            let applied = lifecycle.node_mut().apply()?;
            print_json(&applied)?;
        }

        Commands::Reapply => {
            let mut lifecycle = open_lifecycle(&cli.config)?;
            let applied = lifecycle.node_mut().reapply()?;
            print_json(&applied)?;
        }

        Commands::Teardown => {
            let mut lifecycle = open_lifecycle(&cli.config)?;
            lifecycle.node_mut().teardown()?;
            println!("routing rules removed");
        }

        Commands::Recover => {
            let mut lifecycle = open_lifecycle(&cli.config)?;
            let report = lifecycle.recover().await?;
            print_json(&report)?;
        }

        Commands::Audit { strict } => {
            let mut lifecycle = open_lifecycle(&cli.config)?;
            lifecycle.node_mut().refresh_egress()?;
            let drift = lifecycle.node().engine().audit()?;
            print_json(&drift)?;
            check_drift(&drift, strict)?;
        }

        Commands::Test => {
            let lifecycle = open_lifecycle(&cli.config)?;
            let report = lifecycle.end_to_end().await;
            print_json(&report)?;
            if report.verdict != TunnelVerdict::Tunneled {
                anyhow::bail!("tunnel test verdict: {}", report.verdict);
            }
        }

        Commands::Liveness => {
            let lifecycle = open_lifecycle(&cli.config)?;
            let attempts = lifecycle.node().config().diagnostics.max_attempts;
            let results = lifecycle.poll_listeners(attempts).await;
            print_json(&results)?;
            if let Some((transport, port, _)) = results.iter().find(|(_, _, l)| !l.is_ready()) {
                anyhow::bail!("{transport}/{port} is not listening");
            }
        }

        Commands::CheckInterface => {
            let mut lifecycle = open_lifecycle(&cli.config)?;
            let reapplied = lifecycle.check_interface()?;
            println!(
                "{}",
                if reapplied {
                    "egress interface changed; rules reapplied"
                } else {
                    "egress interface unchanged"
                }
            );
        }

        Commands::Subordinate { state } => {
            let mut lifecycle = open_lifecycle(&cli.config)?;
            let on = matches!(state, Toggle::On);
            lifecycle.node_mut().set_tunnel_subordinate(on)?;
            println!(
                "client subnet now routed {}",
                if on { "through the tunnel" } else { "direct" }
            );
        }

        Commands::User { action } => {
            user_command(&cli.config, action).await?;
        }

        Commands::Render => {
            let lifecycle = open_lifecycle(&cli.config)?;
            lifecycle.node().render_config()?;
            println!(
                "wrote {}",
                lifecycle.node().config().engine_config_path.display()
            );
        }

        Commands::Status => {
            let mut lifecycle = open_lifecycle(&cli.config)?;
            status(&mut lifecycle)?;
        }
    }

    Ok(())
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_config(output: &Path, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "{} already exists; pass --force to overwrite",
            output.display()
        );
    }
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(output, TEMPLATE)?;
    info!(path = %output.display(), "wrote default config");
    println!("wrote {}", output.display());
    Ok(())
}

fn open_lifecycle(config_path: &Path) -> anyhow::Result<Lifecycle<IptablesBackend>> {
    let config = NodeConfig::from_file(config_path)?;
    let state = NodeState::new(&config.state_dir);
    let role = detect_role(&state, &config.engine_config_path)?;

    let boot_hook = SystemdBootHook::new(&config.systemd_unit_dir, std::env::current_exe()?)
        .with_config(config_path);
    let listeners = ProcListenerProbe::new(&config.proc_root);
    let egress = ReqwestEgressProbe::new(
        config.diagnostics.probe_url.clone(),
        config.engine.probe_port,
        config.diagnostics.probe_timeout(),
    );
    let node = Node::open(
        config.clone(),
        role,
        IptablesBackend::new(&config.iptables),
        Box::new(ProcRouteSource::new(&config.proc_root)),
        Box::new(DockerSupervisor::connect()?),
    )?
    .with_boot_hook(boot_hook);

    Ok(Lifecycle::new(node, Box::new(listeners), Box::new(egress)))
}

async fn user_command(config_path: &Path, action: UserCommand) -> anyhow::Result<()> {
    let mut lifecycle = open_lifecycle(config_path)?;
    let node = lifecycle.node_mut();
    match action {
        UserCommand::Add { name } => {
            let credential = node.add_user(&name).await?;
            println!("{} {}", credential.id, credential.name);
        }
        UserCommand::Revoke { id } => {
            let credential = node.revoke_user(id).await?;
            println!("revoked {} {}", credential.id, credential.name);
        }
        UserCommand::List => {
            for credential in node.list_users() {
                println!(
                    "{}  {:<20}  sid={}  sni={}  created={}",
                    credential.id,
                    credential.name,
                    credential.short_id,
                    credential.sni,
                    credential.created_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        UserCommand::Show { id, address } => {
            println!("{}", node.share_link(id, &address)?);
        }
        UserCommand::Import { link } => {
            let credential = node.import_credential(&link).await?;
            println!("imported {} {}", credential.id, credential.name);
        }
    }
    Ok(())
}

fn status(lifecycle: &mut Lifecycle<IptablesBackend>) -> anyhow::Result<()> {
    let node = lifecycle.node_mut();
    node.refresh_egress()?;
    let node = lifecycle.node();
    let engine = node.engine();

    let mut status = serde_json::json!({
        "role": node.role(),
        "nat_state": engine.state(),
        "egress_interface": engine.egress_interface(),
        "tunnel_subordinate": node.tunnel_subordinate(),
        "credentials": node.list_users().len(),
        "policy": engine.policy(),
        "applied_at": engine.current().and_then(|c| c.applied_at),
    });

    // Where a typical client packet goes with the rules now installed.
    if let Some(subnet) = engine.policy().client_subnet
        && let Some(client) = subnet.hosts().next()
    {
        let simulator = engine.simulator()?;
        let probe = |destination: IpAddr| {
            let packet = Packet {
                source: client,
                destination,
                transport: Transport::Tcp,
                dport: 443,
                out_interface: engine.egress_interface().map(str::to_string),
            };
            serde_json::json!({
                "destination": destination,
                "verdict": simulator.prerouting(&packet),
                "masqueraded": simulator.masqueraded(&packet),
            })
        };
        status["client_traffic"] = serde_json::json!([
            probe(IpAddr::from([1, 1, 1, 1])),
            probe(IpAddr::from([192, 168, 1, 1])),
        ]);
    }

    print_json(&status)
}
