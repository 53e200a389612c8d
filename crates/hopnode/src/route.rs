//! Egress interface resolution.
//!
//! The egress interface is re-derived from the kernel's default route every
//! time it matters; a cached name is only a hint for detecting change.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{NodeError, Result};

/// Source of the current default route interface.
pub trait RouteSource: Send + Sync {
    /// Interface carrying the default route, `None` when there is none.
    fn default_interface(&self) -> Result<Option<String>>;
}

/// Reads `<proc_root>/net/route`.
#[derive(Debug, Clone)]
pub struct ProcRouteSource {
    path: PathBuf,
}

impl ProcRouteSource {
    /// Route table under a procfs mount.
    pub fn new(proc_root: &Path) -> Self {
        Self {
            path: proc_root.join("net").join("route"),
        }
    }
}

impl Default for ProcRouteSource {
    fn default() -> Self {
        Self::new(Path::new("/proc"))
    }
}

const RTF_UP: u32 = 0x0001;

/// Pick the default route with the lowest metric from a `net/route` table.
pub fn parse_default_route(table: &str) -> Option<String> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            let [iface, dest, _gw, flags, _refcnt, _use, metric, mask, ..] = cols.as_slice() else {
                return None;
            };
            let flags = u32::from_str_radix(flags, 16).ok()?;
            let metric: u32 = metric.parse().ok()?;
            (*dest == "00000000" && *mask == "00000000" && flags & RTF_UP != 0)
                .then(|| (metric, (*iface).to_string()))
        })
        .min_by_key(|(metric, _)| *metric)
        .map(|(_, iface)| iface)
}

impl RouteSource for ProcRouteSource {
    fn default_interface(&self) -> Result<Option<String>> {
        let table = fs::read_to_string(&self.path).map_err(|e| {
            NodeError::InterfaceResolution(format!("cannot read {}: {e}", self.path.display()))
        })?;
        Ok(parse_default_route(&table))
    }
}

/// Fixed answer, changeable at runtime. Used for operator overrides and
/// tests.
#[derive(Debug, Clone, Default)]
pub struct StaticRouteSource {
    interface: Arc<Mutex<Option<String>>>,
}

impl StaticRouteSource {
    /// Always answer `interface`.
    pub fn new(interface: Option<&str>) -> Self {
        Self {
            interface: Arc::new(Mutex::new(interface.map(str::to_string))),
        }
    }

    /// Change the answer, simulating a route change.
    pub fn set(&self, interface: Option<&str>) {
        *self.interface.lock() = interface.map(str::to_string);
    }
}

impl RouteSource for StaticRouteSource {
    fn default_interface(&self) -> Result<Option<String>> {
        Ok(self.interface.lock().clone())
    }
}

impl<T: RouteSource + ?Sized> RouteSource for Box<T> {
    fn default_interface(&self) -> Result<Option<String>> {
        (**self).default_interface()
    }
}

/// Resolve the egress interface or fail with an operator-facing error.
pub fn resolve_egress(source: &dyn RouteSource) -> Result<String> {
    let interface = source.default_interface()?.ok_or_else(|| {
        NodeError::InterfaceResolution(
            "no default route; set policy.egress_interface in the config".into(),
        )
    })?;
    debug!(%interface, "resolved egress interface");
    Ok(interface)
}
