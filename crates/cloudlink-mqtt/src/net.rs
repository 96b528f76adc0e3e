use std::fs;
use std::path::{Path, PathBuf};

use cloudlink::error::{Error, ErrorKind, Result};

use tracing::debug;

// Root directory for network interfaces metadata on Linux.
const SYSFS_NET: &str = "/sys/class/net";

// Interfaces created by software, which never carry device traffic.
const VIRTUAL_PREFIXES: &[&str] = &["docker", "br-", "veth", "tun", "tap", "vmnet", "virbr"];

fn is_virtual_interface(iface_path: &Path) -> bool {
    // An interface without a "device" entry is not backed by hardware.
    if !iface_path.join("device").exists() {
        return true;
    }

    let Some(name) = iface_path.file_name().and_then(|n| n.to_str()) else {
        return true;
    };

    name == "lo" || VIRTUAL_PREFIXES.iter().any(|p| name.starts_with(p))
}

fn is_up(iface_path: &Path) -> bool {
    // The operational state is stored in the "operstate" file.
    fs::read_to_string(iface_path.join("operstate")).is_ok_and(|state| state.trim() == "up")
}

/// Checks the network readiness through the Linux `sysfs` interfaces
/// metadata.
///
/// The network is ready when at least one physical interface is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysfsProbe {
    root: PathBuf,
}

impl Default for SysfsProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SysfsProbe {
    /// Creates a [`SysfsProbe`] reading `/sys/class/net`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_root(SYSFS_NET)
    }

    /// Creates a [`SysfsProbe`] reading the given directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the name of the first physical interface which is up.
    ///
    /// # Errors
    ///
    /// The interfaces directory cannot be read.
    pub fn active_interface(&self) -> Result<Option<String>> {
        let entries = fs::read_dir(&self.root).map_err(|e| {
            Error::new(
                ErrorKind::Io,
                format!("Unable to read {}: {e}", self.root.display()),
            )
        })?;

        for entry in entries.flatten() {
            let iface_path = entry.path();

            if is_virtual_interface(&iface_path) {
                continue;
            }

            if is_up(&iface_path) {
                let name = entry.file_name().to_string_lossy().into_owned();
                debug!("Interface `{name}` is up");
                return Ok(Some(name));
            }
        }

        Ok(None)
    }

    /// Checks whether at least one physical interface is up.
    ///
    /// # Errors
    ///
    /// The interfaces directory cannot be read.
    pub fn networking_ready(&self) -> Result<bool> {
        self.active_interface().map(|iface| iface.is_some())
    }
}
