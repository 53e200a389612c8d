//! Container supervision for the tunnel engine and the VPN service.
//!
//! Only two things are observed across this boundary: whether a process is
//! running, and (through [`crate::diagnostics`]) whether it listens.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bollard::Docker;
use bollard::container::{
    InspectContainerOptions, RestartContainerOptions, StopContainerOptions,
};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{NodeError, Result};

/// Boxed future returned by [`ProcessSupervisor`] methods.
pub type SupervisorFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Start, restart and observe named processes.
pub trait ProcessSupervisor: Send + Sync {
    /// Start `name` if it is stopped. Starting a running process is a no-op.
    fn start<'a>(&'a self, name: &'a str) -> SupervisorFuture<'a, ()>;

    /// Restart `name`, picking up a new configuration.
    fn restart<'a>(&'a self, name: &'a str) -> SupervisorFuture<'a, ()>;

    /// Stop `name`. Stopping a stopped process is a no-op.
    fn stop<'a>(&'a self, name: &'a str) -> SupervisorFuture<'a, ()>;

    /// Whether `name` is running.
    fn is_running<'a>(&'a self, name: &'a str) -> SupervisorFuture<'a, bool>;
}

/// Seconds Docker waits for a clean stop before killing.
const RESTART_GRACE_SECS: isize = 10;
const STOP_GRACE_SECS: i64 = 10;

fn not_found_or(name: &str, what: &str, e: bollard::errors::Error) -> NodeError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => NodeError::Container(format!("container '{name}' not found")),
        e => NodeError::Container(format!("{what} '{name}' failed: {e}")),
    }
}

/// Supervises containers through the Docker API.
pub struct DockerSupervisor {
    client: Docker,
}

impl DockerSupervisor {
    /// Connect to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be set up.
    pub fn connect() -> Result<Self> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| NodeError::Container(format!("failed to connect to Docker: {e}")))?;
        Ok(Self { client })
    }
}

impl std::fmt::Debug for DockerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerSupervisor").finish_non_exhaustive()
    }
}

impl ProcessSupervisor for DockerSupervisor {
    fn start<'a>(&'a self, name: &'a str) -> SupervisorFuture<'a, ()> {
        Box::pin(async move {
            debug!(container = %name, "starting container");
            match self.client.start_container::<String>(name, None).await {
                Ok(()) => {
                    info!(container = %name, "container started");
                    Ok(())
                }
                // Already running.
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 304, ..
                }) => Ok(()),
                Err(e) => Err(not_found_or(name, "start", e)),
            }
        })
    }

    fn restart<'a>(&'a self, name: &'a str) -> SupervisorFuture<'a, ()> {
        Box::pin(async move {
            debug!(container = %name, "restarting container");
            self.client
                .restart_container(
                    name,
                    Some(RestartContainerOptions {
                        t: RESTART_GRACE_SECS,
                    }),
                )
                .await
                .map_err(|e| not_found_or(name, "restart", e))?;
            info!(container = %name, "container restarted");
            Ok(())
        })
    }

    fn stop<'a>(&'a self, name: &'a str) -> SupervisorFuture<'a, ()> {
        Box::pin(async move {
            debug!(container = %name, "stopping container");
            match self
                .client
                .stop_container(
                    name,
                    Some(StopContainerOptions {
                        t: STOP_GRACE_SECS,
                    }),
                )
                .await
            {
                Ok(()) => {
                    info!(container = %name, "container stopped");
                    Ok(())
                }
                // Already stopped.
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 304, ..
                }) => Ok(()),
                Err(e) => Err(not_found_or(name, "stop", e)),
            }
        })
    }

    fn is_running<'a>(&'a self, name: &'a str) -> SupervisorFuture<'a, bool> {
        Box::pin(async move {
            let inspect = self
                .client
                .inspect_container(name, Some(InspectContainerOptions { size: false }))
                .await
                .map_err(|e| not_found_or(name, "inspect", e))?;
            Ok(inspect
                .state
                .and_then(|s| s.running)
                .unwrap_or(false))
        })
    }
}

#[derive(Debug, Default)]
struct FakeProcess {
    running: bool,
    starts: u32,
    restarts: u32,
}

/// In-memory supervisor for tests.
///
/// Every call is journaled as `"<op> <name>"` so tests can assert ordering
/// against other fakes.
#[derive(Debug, Clone, Default)]
pub struct FakeSupervisor {
    processes: Arc<Mutex<HashMap<String, FakeProcess>>>,
    journal: Arc<Mutex<Vec<String>>>,
}

impl FakeSupervisor {
    /// Supervisor knowing `names`, all stopped.
    pub fn new<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let fake = Self::default();
        {
            let mut processes = fake.processes.lock();
            for name in names {
                processes.insert(name.to_string(), FakeProcess::default());
            }
        }
        fake
    }

    /// Force the running flag, as if the process crashed or was started
    /// outside the agent.
    pub fn set_running(&self, name: &str, running: bool) {
        self.processes
            .lock()
            .entry(name.to_string())
            .or_default()
            .running = running;
    }

    /// Times `name` was started from stopped.
    pub fn starts(&self, name: &str) -> u32 {
        self.processes.lock().get(name).map_or(0, |p| p.starts)
    }

    /// Times `name` was restarted.
    pub fn restarts(&self, name: &str) -> u32 {
        self.processes.lock().get(name).map_or(0, |p| p.restarts)
    }

    /// Calls made so far.
    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().clone()
    }

    fn with<T>(&self, op: &str, name: &str, f: impl FnOnce(&mut FakeProcess) -> T) -> Result<T> {
        self.journal.lock().push(format!("{op} {name}"));
        let mut processes = self.processes.lock();
        let process = processes
            .get_mut(name)
            .ok_or_else(|| NodeError::Container(format!("container '{name}' not found")))?;
        Ok(f(process))
    }
}

impl ProcessSupervisor for FakeSupervisor {
    fn start<'a>(&'a self, name: &'a str) -> SupervisorFuture<'a, ()> {
        Box::pin(async move {
            self.with("start", name, |p| {
                if !p.running {
                    p.running = true;
                    p.starts += 1;
                }
            })
        })
    }

    fn restart<'a>(&'a self, name: &'a str) -> SupervisorFuture<'a, ()> {
        Box::pin(async move {
            self.with("restart", name, |p| {
                p.running = true;
                p.restarts += 1;
            })
        })
    }

    fn stop<'a>(&'a self, name: &'a str) -> SupervisorFuture<'a, ()> {
        Box::pin(async move { self.with("stop", name, |p| p.running = false) })
    }

    fn is_running<'a>(&'a self, name: &'a str) -> SupervisorFuture<'a, bool> {
        Box::pin(async move { self.with("inspect", name, |p| p.running) })
    }
}

impl<T: ProcessSupervisor + ?Sized> ProcessSupervisor for Box<T> {
    fn start<'a>(&'a self, name: &'a str) -> SupervisorFuture<'a, ()> {
        (**self).start(name)
    }

    fn restart<'a>(&'a self, name: &'a str) -> SupervisorFuture<'a, ()> {
        (**self).restart(name)
    }

    fn stop<'a>(&'a self, name: &'a str) -> SupervisorFuture<'a, ()> {
        (**self).stop(name)
    }

    fn is_running<'a>(&'a self, name: &'a str) -> SupervisorFuture<'a, bool> {
        (**self).is_running(name)
    }
}
