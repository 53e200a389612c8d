//! Liveness polling, rule drift auditing and end-to-end tunnel testing.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use hop_nat::{Drift, NatEngine, NatState, RuleBackend, Transport};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{NodeError, Result};

/// Observes whether something listens on a local port.
pub trait ListenerProbe: Send + Sync {
    /// Whether a socket is bound to `port` for `transport`.
    fn is_listening(&self, port: u16, transport: Transport) -> Result<bool>;
}

const TCP_LISTEN: &str = "0A";
const UDP_UNCONNECTED: &str = "07";

/// Reads the socket tables under a procfs mount.
#[derive(Debug, Clone)]
pub struct ProcListenerProbe {
    root: PathBuf,
}

impl ProcListenerProbe {
    /// Probe reading `<proc_root>/net/{tcp,tcp6,udp,udp6}`.
    pub fn new(proc_root: &Path) -> Self {
        Self {
            root: proc_root.join("net"),
        }
    }
}

/// Whether a `/proc/net/{tcp,udp}` style table has a socket on `port` in
/// `state`.
pub fn table_has_port(table: &str, port: u16, state: &str) -> bool {
    table.lines().skip(1).any(|line| {
        let mut cols = line.split_whitespace();
        let (Some(_sl), Some(local), Some(_remote), Some(st)) =
            (cols.next(), cols.next(), cols.next(), cols.next())
        else {
            return false;
        };
        let local_port = local
            .rsplit_once(':')
            .and_then(|(_, hex)| u16::from_str_radix(hex, 16).ok());
        local_port == Some(port) && st.eq_ignore_ascii_case(state)
    })
}

impl ListenerProbe for ProcListenerProbe {
    fn is_listening(&self, port: u16, transport: Transport) -> Result<bool> {
        let (files, state) = match transport {
            Transport::Tcp => (["tcp", "tcp6"], TCP_LISTEN),
            Transport::Udp => (["udp", "udp6"], UDP_UNCONNECTED),
        };
        let mut readable = false;
        for file in files {
            match fs::read_to_string(self.root.join(file)) {
                Ok(table) => {
                    readable = true;
                    if table_has_port(&table, port, state) {
                        return Ok(true);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if readable {
            Ok(false)
        } else {
            Err(NodeError::Probe(format!(
                "no {transport} socket table under {}",
                self.root.display()
            )))
        }
    }
}

/// Listener that starts listening after a number of polls.
#[derive(Debug, Clone, Default)]
pub struct FakeListenerProbe {
    pending: Arc<Mutex<HashMap<(Transport, u16), Option<u32>>>>,
    polls: Arc<Mutex<u32>>,
}

impl FakeListenerProbe {
    /// Probe where nothing listens.
    pub fn new() -> Self {
        Self::default()
    }

    /// `port` starts listening once polled `after` times.
    pub fn bind_after(&self, transport: Transport, port: u16, after: u32) {
        self.pending.lock().insert((transport, port), Some(after));
    }

    /// `port` never listens.
    pub fn never(&self, transport: Transport, port: u16) {
        self.pending.lock().insert((transport, port), None);
    }

    /// Total polls answered.
    pub fn polls(&self) -> u32 {
        *self.polls.lock()
    }
}

impl ListenerProbe for FakeListenerProbe {
    fn is_listening(&self, port: u16, transport: Transport) -> Result<bool> {
        *self.polls.lock() += 1;
        let mut pending = self.pending.lock();
        Ok(match pending.get_mut(&(transport, port)) {
            Some(Some(0)) => true,
            Some(Some(left)) => {
                *left -= 1;
                false
            }
            Some(None) | None => false,
        })
    }
}

/// Outcome of [`liveness`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Liveness {
    /// Listening; `attempts` polls were needed.
    Ready {
        /// Polls made.
        attempts: u32,
    },
    /// Not listening after the whole budget.
    NotReady {
        /// Polls made.
        attempts: u32,
    },
}

impl Liveness {
    /// Whether the listener came up.
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

/// Poll a listener until it binds or `max_attempts` polls have failed.
///
/// Returns `Ready` on the first successful poll, and `NotReady` no later
/// than `interval * max_attempts`. Probe errors count as failed polls.
pub async fn liveness(
    probe: &dyn ListenerProbe,
    port: u16,
    transport: Transport,
    interval: Duration,
    max_attempts: u32,
) -> Liveness {
    let max_attempts = max_attempts.max(1);
    for attempt in 1..=max_attempts {
        match probe.is_listening(port, transport) {
            Ok(true) => {
                info!(%transport, port, attempt, "listener ready");
                return Liveness::Ready { attempts: attempt };
            }
            Ok(false) => debug!(%transport, port, attempt, "listener not bound yet"),
            Err(e) => warn!(%transport, port, attempt, error = %e, "listener probe failed"),
        }
        if attempt < max_attempts {
            tokio::time::sleep(interval).await;
        }
    }
    warn!(%transport, port, attempts = max_attempts, "listener never became ready");
    Liveness::NotReady {
        attempts: max_attempts,
    }
}

/// Audit installed rules, logging each divergence.
pub fn chain_audit<B: RuleBackend>(engine: &NatEngine<B>) -> Result<Vec<Drift>> {
    Ok(engine.audit()?)
}

/// Escalate drift to [`NodeError::DriftDetected`] when `strict`. Drift is
/// never repaired here.
pub fn check_drift(drift: &[Drift], strict: bool) -> Result<()> {
    if drift.is_empty() {
        return Ok(());
    }
    warn!(count = drift.len(), "rule drift detected; run `hopnode reapply`");
    if strict {
        return Err(NodeError::DriftDetected { count: drift.len() });
    }
    Ok(())
}

/// Which way an egress probe leaves the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbePath {
    /// Plain egress, no proxy.
    Direct,
    /// Through the local SOCKS listener and the tunnel.
    Tunnel,
}

impl fmt::Display for ProbePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Direct => "direct",
            Self::Tunnel => "tunnel",
        })
    }
}

/// Boxed future returned by [`EgressProbe`].
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;

/// Learns the public address traffic appears from.
pub trait EgressProbe: Send + Sync {
    /// Public address seen by the probe service over `path`.
    fn public_address(&self, path: ProbePath) -> ProbeFuture<'_>;
}

/// Asks an HTTP echo service for the caller's address.
#[derive(Debug, Clone)]
pub struct ReqwestEgressProbe {
    url: String,
    probe_port: u16,
    timeout: Duration,
}

impl ReqwestEgressProbe {
    /// Probe `url`, tunneling through `127.0.0.1:probe_port`.
    pub fn new(url: impl Into<String>, probe_port: u16, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            probe_port,
            timeout,
        }
    }

    fn client(&self, path: ProbePath) -> Result<reqwest::Client> {
        let builder = reqwest::Client::builder().timeout(self.timeout);
        let builder = match path {
            ProbePath::Direct => builder.no_proxy(),
            ProbePath::Tunnel => {
                // socks5h resolves names on the far side of the tunnel.
                let proxy = reqwest::Proxy::all(format!("socks5h://127.0.0.1:{}", self.probe_port))
                    .map_err(|e| NodeError::Probe(format!("invalid probe proxy: {e}")))?;
                builder.proxy(proxy)
            }
        };
        builder
            .build()
            .map_err(|e| NodeError::Probe(format!("failed to build HTTP client: {e}")))
    }
}

impl EgressProbe for ReqwestEgressProbe {
    fn public_address(&self, path: ProbePath) -> ProbeFuture<'_> {
        Box::pin(async move {
            let client = self.client(path)?;
            let response = client
                .get(&self.url)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|e| NodeError::Probe(format!("{path} probe failed: {e}")))?;
            let body = response
                .text()
                .await
                .map_err(|e| NodeError::Probe(format!("{path} probe body unreadable: {e}")))?;
            let address = body.trim().to_string();
            if address.is_empty() {
                return Err(NodeError::Probe(format!("{path} probe returned nothing")));
            }
            debug!(%path, %address, "egress probe answered");
            Ok(address)
        })
    }
}

/// Probe with canned answers; `None` fails that path.
#[derive(Debug, Clone, Default)]
pub struct FakeEgressProbe {
    answers: Arc<Mutex<HashMap<ProbePath, String>>>,
}

impl FakeEgressProbe {
    /// Probe answering `direct` and `tunnel`.
    pub fn new(direct: Option<&str>, tunnel: Option<&str>) -> Self {
        let fake = Self::default();
        fake.set(ProbePath::Direct, direct);
        fake.set(ProbePath::Tunnel, tunnel);
        fake
    }

    /// Change one path's answer.
    pub fn set(&self, path: ProbePath, address: Option<&str>) {
        let mut answers = self.answers.lock();
        match address {
            Some(address) => answers.insert(path, address.to_string()),
            None => answers.remove(&path),
        };
    }
}

impl EgressProbe for FakeEgressProbe {
    fn public_address(&self, path: ProbePath) -> ProbeFuture<'_> {
        let answer = self.answers.lock().get(&path).cloned();
        Box::pin(async move {
            answer.ok_or_else(|| NodeError::Probe(format!("{path} probe failed")))
        })
    }
}

/// Whether traffic through the local listener really leaves via the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelVerdict {
    /// Tunnel egress differs from direct egress.
    Tunneled,
    /// Tunnel path works but exits with the node's own address.
    Inert,
    /// Nothing comes back through the tunnel path.
    Unreachable,
}

impl fmt::Display for TunnelVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tunneled => "tunneled",
            Self::Inert => "inert",
            Self::Unreachable => "unreachable",
        })
    }
}

/// Addresses seen by both probes, with the verdict drawn from them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndToEndReport {
    /// Verdict.
    pub verdict: TunnelVerdict,
    /// Address seen through the tunnel.
    pub tunnel_address: Option<String>,
    /// Address seen directly.
    pub direct_address: Option<String>,
}

/// Probe through the tunnel and directly, then compare.
///
/// A failed tunnel probe is `Unreachable`. A failed direct probe with a
/// working tunnel is `Tunneled`, since the tunnel demonstrably carries
/// traffic the node cannot send itself.
pub async fn end_to_end_report(probe: &dyn EgressProbe) -> EndToEndReport {
    let tunnel = probe.public_address(ProbePath::Tunnel).await;
    let direct = probe.public_address(ProbePath::Direct).await;

    let (verdict, tunnel_address, direct_address) = match (tunnel, direct) {
        (Err(e), direct) => {
            warn!(error = %e, "tunnel probe failed");
            (TunnelVerdict::Unreachable, None, direct.ok())
        }
        (Ok(tunnel), Err(e)) => {
            warn!(error = %e, "direct probe failed; tunnel answered");
            (TunnelVerdict::Tunneled, Some(tunnel), None)
        }
        (Ok(tunnel), Ok(direct)) if tunnel == direct => {
            (TunnelVerdict::Inert, Some(tunnel), Some(direct))
        }
        (Ok(tunnel), Ok(direct)) => (TunnelVerdict::Tunneled, Some(tunnel), Some(direct)),
    };

    info!(
        %verdict,
        tunnel = tunnel_address.as_deref().unwrap_or("-"),
        direct = direct_address.as_deref().unwrap_or("-"),
        "end-to-end test finished"
    );
    EndToEndReport {
        verdict,
        tunnel_address,
        direct_address,
    }
}

/// [`end_to_end_report`], verdict only.
pub async fn end_to_end_test(probe: &dyn EgressProbe) -> TunnelVerdict {
    end_to_end_report(probe).await.verdict
}

/// Everything diagnostics learned about a node.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsReport {
    /// Rule engine state.
    pub nat_state: NatState,
    /// Rule drift.
    pub drift: Vec<Drift>,
    /// Listener checks as `(transport, port, liveness)`.
    pub listeners: Vec<(Transport, u16, Liveness)>,
    /// End-to-end result; Relay only.
    pub end_to_end: Option<EndToEndReport>,
}

impl DiagnosticsReport {
    /// No drift, every listener ready, and the tunnel carries traffic when
    /// tested.
    pub fn healthy(&self) -> bool {
        self.drift.is_empty()
            && self.listeners.iter().all(|(_, _, l)| l.is_ready())
            && self
                .end_to_end
                .as_ref()
                .is_none_or(|r| r.verdict == TunnelVerdict::Tunneled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;
    use tokio::time::Instant;

    const TCP_TABLE: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:2A4D 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 1 1 0000000000000000 100 0 0 10 0
   1: 00000000:01BB 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 2 1 0000000000000000 100 0 0 10 0
   2: 0100007F:2B5D 0100007F:D431 01 00000000:00000000 00:00000000 00000000     0        0 3 1 0000000000000000 20 4 30 10 -1
";

    #[test_case(10829, true ; "loopback listener")]
    #[test_case(443, true ; "wildcard listener")]
    #[test_case(11101, false ; "established only")]
    #[test_case(8080, false ; "absent")]
    fn test_tcp_table_listen_state(port: u16, expected: bool) {
        assert_eq!(table_has_port(TCP_TABLE, port, TCP_LISTEN), expected);
    }

    #[test]
    fn test_proc_probe_reads_udp_table() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        fs::create_dir_all(dir.path().join("net")).expect("mkdir");
        fs::write(
            dir.path().join("net/udp"),
            "  sl  local_address rem_address   st\n   0: 00000000:2B49 00000000:0000 07 0\n",
        )
        .expect("write");
        let probe = ProcListenerProbe::new(dir.path());
        assert!(probe.is_listening(11081, Transport::Udp).expect("probe"));
        assert!(!probe.is_listening(11082, Transport::Udp).expect("probe"));
        assert!(matches!(
            probe.is_listening(11081, Transport::Tcp),
            Err(NodeError::Probe(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_ready_as_soon_as_bound() {
        let probe = FakeListenerProbe::new();
        probe.bind_after(Transport::Tcp, 11081, 3);
        let start = Instant::now();

        let result = liveness(&probe, 11081, Transport::Tcp, Duration::from_millis(100), 20).await;

        assert_eq!(result, Liveness::Ready { attempts: 4 });
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert!(start.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_not_ready_within_budget() {
        let probe = FakeListenerProbe::new();
        probe.never(Transport::Udp, 11081);
        let interval = Duration::from_millis(250);
        let start = Instant::now();

        let result = liveness(&probe, 11081, Transport::Udp, interval, 8).await;

        assert_eq!(result, Liveness::NotReady { attempts: 8 });
        assert!(start.elapsed() <= interval * 8);
        assert_eq!(probe.polls(), 8);
    }

    #[tokio::test]
    async fn test_end_to_end_distinct_is_tunneled() {
        let probe = FakeEgressProbe::new(Some("198.51.100.7"), Some("203.0.113.10"));
        let report = end_to_end_report(&probe).await;
        assert_eq!(report.verdict, TunnelVerdict::Tunneled);
        assert_eq!(report.tunnel_address.as_deref(), Some("203.0.113.10"));
    }

    #[tokio::test]
    async fn test_end_to_end_equal_is_inert() {
        let probe = FakeEgressProbe::new(Some("198.51.100.7"), Some("198.51.100.7"));
        assert_eq!(end_to_end_test(&probe).await, TunnelVerdict::Inert);
    }

    #[tokio::test]
    async fn test_end_to_end_tunnel_failure_is_unreachable() {
        let probe = FakeEgressProbe::new(Some("198.51.100.7"), None);
        assert_eq!(end_to_end_test(&probe).await, TunnelVerdict::Unreachable);
    }

    #[tokio::test]
    async fn test_end_to_end_direct_failure_with_tunnel_is_tunneled() {
        let probe = FakeEgressProbe::new(None, Some("203.0.113.10"));
        assert_eq!(end_to_end_test(&probe).await, TunnelVerdict::Tunneled);
    }

    #[test]
    fn test_check_drift_strict_escalates() {
        let drift = vec![Drift::MissingRedirect {
            transport: Transport::Tcp,
            port: 11081,
        }];
        assert!(check_drift(&drift, false).is_ok());
        assert!(matches!(
            check_drift(&drift, true),
            Err(NodeError::DriftDetected { count: 1 })
        ));
        assert!(check_drift(&[], true).is_ok());
    }
}
