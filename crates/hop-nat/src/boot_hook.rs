//! Boot-time restoration via a systemd oneshot unit.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{NatError, Result};

/// Unit file name.
pub const UNIT_NAME: &str = "hopnode-restore.service";

/// Writes and enables a unit that runs `<binary> boot` once networking and
/// the container runtime are up.
#[derive(Debug, Clone)]
pub struct SystemdBootHook {
    unit_dir: PathBuf,
    binary: PathBuf,
    config: Option<PathBuf>,
}

impl SystemdBootHook {
    /// Hook installing into `unit_dir` (normally `/etc/systemd/system`).
    pub fn new(unit_dir: impl Into<PathBuf>, binary: impl Into<PathBuf>) -> Self {
        Self {
            unit_dir: unit_dir.into(),
            binary: binary.into(),
            config: None,
        }
    }

    /// Pass `--config <path>` to the restore run.
    #[must_use]
    pub fn with_config(mut self, config: impl Into<PathBuf>) -> Self {
        self.config = Some(config.into());
        self
    }

    /// Whether this platform has a systemd unit directory.
    pub fn supported(&self) -> bool {
        self.unit_dir.is_dir()
    }

    fn unit_path(&self) -> PathBuf {
        self.unit_dir.join(UNIT_NAME)
    }

    fn wants_link(&self) -> PathBuf {
        self.unit_dir.join("multi-user.target.wants").join(UNIT_NAME)
    }

    /// Unit file content.
    pub fn unit(&self) -> String {
        let mut exec = self.binary.display().to_string();
        if let Some(config) = &self.config {
            exec.push_str(&format!(" --config {}", config.display()));
        }
        format!(
            "[Unit]\n\
             Description=Restore twinhop tunnel routing policy\n\
             After=network-online.target docker.service\n\
             Wants=network-online.target\n\
             \n\
             [Service]\n\
             Type=oneshot\n\
             ExecStart={exec} boot\n\
             RemainAfterExit=yes\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n"
        )
    }

    /// Write and enable the unit. Returns `false` when the platform has no
    /// unit directory and nothing was done.
    pub fn install(&self) -> Result<bool> {
        if !self.supported() {
            debug!(dir = %self.unit_dir.display(), "no systemd unit directory, boot hook skipped");
            return Ok(false);
        }

        let unit_path = self.unit_path();
        let unit = self.unit();
        if fs::read_to_string(&unit_path).ok().as_deref() != Some(unit.as_str()) {
            fs::write(&unit_path, unit).map_err(|source| hook_err(&unit_path, source))?;
            info!(unit = %unit_path.display(), "boot restoration unit written");
        }

        let link = self.wants_link();
        if fs::read_link(&link).ok().as_deref() != Some(unit_path.as_path()) {
            if let Some(parent) = link.parent() {
                fs::create_dir_all(parent).map_err(|source| hook_err(parent, source))?;
            }
            let _ = fs::remove_file(&link);
            std::os::unix::fs::symlink(&unit_path, &link)
                .map_err(|source| hook_err(&link, source))?;
            debug!(link = %link.display(), "boot restoration unit enabled");
        }
        Ok(true)
    }

    /// Disable and remove the unit. Missing files are fine.
    pub fn uninstall(&self) -> Result<()> {
        for path in [self.wants_link(), self.unit_path()] {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(hook_err(&path, source)),
            }
        }
        Ok(())
    }

    /// Whether the unit is written and enabled.
    pub fn installed(&self) -> bool {
        self.unit_path().is_file() && fs::symlink_metadata(self.wants_link()).is_ok()
    }
}

fn hook_err(path: &Path, source: std::io::Error) -> NatError {
    NatError::BootHook {
        path: path.to_path_buf(),
        source,
    }
}
