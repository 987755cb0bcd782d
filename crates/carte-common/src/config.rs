//! Global configuration model for the carte engine.
//!
//! Every field has a default; a JSON file may override any subset of them.
//! `$CARTE_DATA_DIR` wins over the file for the data directory so tests and
//! unprivileged users can relocate all state with one variable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{CarteError, Result};

/// How the container's root filesystem is switched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RootStrategy {
    /// Bind-mount, `pivot_root`, then detach the old root.
    #[default]
    Pivot,
    /// Plain `chroot`; the host root stays reachable through open handles.
    Chroot,
}

/// Which cgroup hierarchy layout to write to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CgroupVersion {
    /// Detect from the mounted hierarchy.
    #[default]
    Auto,
    /// Per-controller hierarchies (`cpu/`, `memory/`).
    V1,
    /// Unified hierarchy.
    V2,
}

/// How containers get network connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Host bridge plus one veth pair per container.
    #[default]
    Bridge,
    /// Delegate to CNI plugins.
    Cni,
    /// Isolated network namespace with loopback only.
    None,
}

/// Optional namespaces; UTS, PID, mount, and network are always created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceOptions {
    /// Isolate System V IPC and POSIX message queues.
    pub ipc: bool,
    /// Map the container's root to the invoking user.
    pub user: bool,
}

impl Default for NamespaceOptions {
    fn default() -> Self {
        Self {
            ipc: true,
            user: false,
        }
    }
}

/// Bridge network settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Host bridge interface name.
    pub name: String,
    /// Container subnet in CIDR notation.
    pub subnet: String,
    /// Install the MASQUERADE rule and enable forwarding on bridge creation.
    pub masquerade: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: constants::DEFAULT_BRIDGE.into(),
            subnet: constants::DEFAULT_SUBNET.into(),
            masquerade: true,
        }
    }
}

impl BridgeConfig {
    /// Parses the configured subnet.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the subnet is malformed or too small to
    /// hold a gateway and one container.
    pub fn network(&self) -> Result<Ipv4Network> {
        let net: Ipv4Network = self.subnet.parse().map_err(|e| {
            CarteError::validation(format!("invalid bridge subnet '{}': {e}", self.subnet))
        })?;
        if net.prefix() > 29 {
            return Err(CarteError::validation(format!(
                "bridge subnet {net} is too small"
            )));
        }
        Ok(net)
    }
}

/// CNI plugin settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CniConfig {
    /// Directory scanned for `.conf` and `.conflist` files.
    pub conf_dir: PathBuf,
    /// Directory holding plugin binaries.
    pub bin_dir: PathBuf,
}

impl Default for CniConfig {
    fn default() -> Self {
        Self {
            conf_dir: PathBuf::from(constants::DEFAULT_CNI_CONF_DIR),
            bin_dir: PathBuf::from(constants::DEFAULT_CNI_BIN_DIR),
        }
    }
}

/// Root configuration for the carte engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CarteConfig {
    /// Base directory for images, layers, containers, and state.
    pub data_dir: PathBuf,
    /// Mount point of the cgroup filesystem.
    pub cgroup_root: PathBuf,
    /// Cgroup layout to target.
    pub cgroup_version: CgroupVersion,
    /// Root filesystem switching strategy for builds and containers.
    pub root_strategy: RootStrategy,
    /// Optional namespaces.
    pub namespaces: NamespaceOptions,
    /// Give `RUN` steps their own network namespace (no connectivity).
    pub isolate_build_network: bool,
    /// Container networking mode.
    pub network_mode: NetworkMode,
    /// Bridge settings.
    pub bridge: BridgeConfig,
    /// CNI settings.
    pub cni: CniConfig,
    /// Seconds between SIGTERM and SIGKILL.
    pub stop_grace_secs: u64,
}

impl Default for CarteConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(constants::DEFAULT_DATA_DIR),
            cgroup_root: PathBuf::from(constants::CGROUP_ROOT),
            cgroup_version: CgroupVersion::Auto,
            root_strategy: RootStrategy::Pivot,
            namespaces: NamespaceOptions::default(),
            isolate_build_network: false,
            network_mode: NetworkMode::Bridge,
            bridge: BridgeConfig::default(),
            cni: CniConfig::default(),
            stop_grace_secs: constants::DEFAULT_STOP_GRACE_SECS,
        }
    }
}

impl CarteConfig {
    /// Creates a default configuration rooted at `data_dir`.
    #[must_use]
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Loads configuration from an optional file, then applies environment
    /// overrides.
    ///
    /// Without an explicit path, `$CARTE_CONFIG` is consulted; without either,
    /// defaults are used.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var_os(constants::CONFIG_ENV).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(env_path) {
            Some(p) => Self::from_file(&p)?,
            None => Self::default(),
        };
        if let Some(dir) = std::env::var_os(constants::DATA_DIR_ENV) {
            config.data_dir = PathBuf::from(dir);
        }
        Ok(config)
    }

    /// Reads a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CarteError::io(path, e))?;
        let config: Self = serde_json::from_str(&content)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Directory holding packaged images and the catalog.
    #[must_use]
    pub fn images_dir(&self) -> PathBuf {
        self.data_dir.join("images")
    }

    /// Directory holding the layer cache.
    #[must_use]
    pub fn layers_dir(&self) -> PathBuf {
        self.data_dir.join("layers")
    }

    /// Directory holding per-container root filesystems and logs.
    #[must_use]
    pub fn containers_dir(&self) -> PathBuf {
        self.data_dir.join("containers")
    }

    /// Directory holding container records.
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    /// Directory holding network allocation state.
    #[must_use]
    pub fn network_dir(&self) -> PathBuf {
        self.data_dir.join("network")
    }

    /// Scratch directory for builds and extractions.
    #[must_use]
    pub fn tmp_dir(&self) -> PathBuf {
        self.data_dir.join("tmp")
    }

    /// Grace period between SIGTERM and SIGKILL.
    #[must_use]
    pub const fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}
