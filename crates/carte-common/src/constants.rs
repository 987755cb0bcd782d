//! System-wide constants and default paths.

/// Default base directory for carte data.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/carte";

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "CARTE_DATA_DIR";

/// Environment variable pointing at a JSON configuration file.
pub const CONFIG_ENV: &str = "CARTE_CONFIG";

/// Cgroup filesystem mount point.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Sub-hierarchy under each controller that holds carte's groups.
pub const CGROUP_PARENT: &str = "carte";

/// CFS period written alongside every CPU quota, in microseconds.
pub const CPU_PERIOD_US: u64 = 100_000;

/// Upper bound accepted for CPU percentages (64 cores).
pub const MAX_CPU_PERCENT: u32 = 6400;

/// Default name of the build manifest inside a build context.
pub const MANIFEST_FILE: &str = "Cartefile";

/// Ignore-pattern file read from the build context root.
pub const IGNORE_FILE: &str = ".carteignore";

/// Tag applied when an image reference omits one.
pub const DEFAULT_TAG: &str = "latest";

/// SHA-256 digest length in hex characters.
pub const SHA256_HEX_LENGTH: usize = 64;

/// Maximum number of layers in an image.
pub const MAX_IMAGE_LAYERS: usize = 128;

/// Default host bridge interface name.
pub const DEFAULT_BRIDGE: &str = "carte0";

/// Default container subnet; the first host address is the gateway.
pub const DEFAULT_SUBNET: &str = "10.88.0.0/16";

/// Default CNI configuration directory.
pub const DEFAULT_CNI_CONF_DIR: &str = "/etc/cni/net.d";

/// Default CNI plugin directory.
pub const DEFAULT_CNI_BIN_DIR: &str = "/opt/cni/bin";

/// Interface name given to the container side of the network.
pub const CONTAINER_IFNAME: &str = "eth0";

/// Seconds between SIGTERM and SIGKILL during `stop`.
pub const DEFAULT_STOP_GRACE_SECS: u64 = 5;

/// Size bound of the in-memory `/dev` filesystem.
pub const DEV_TMPFS_OPTIONS: &str = "mode=755,size=65536k";

/// `PATH` used when an image does not define one.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Application name used in log output and state files.
pub const APP_NAME: &str = "carte";
