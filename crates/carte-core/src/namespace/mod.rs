//! Linux namespace selection for container isolation.
//!
//! Namespaces are created by passing flags to `clone(2)` in
//! [`crate::spawn`]; this module decides which ones and provides the
//! per-namespace helpers run on either side of the clone.

pub mod user;
pub mod uts;

use std::path::PathBuf;

use carte_common::config::NamespaceOptions;

/// Configuration for which namespaces to create.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceConfig {
    /// Isolate PID namespace.
    pub pid: bool,
    /// Isolate mount namespace.
    pub mount: bool,
    /// Isolate network namespace.
    pub network: bool,
    /// Isolate user namespace.
    pub user: bool,
    /// Isolate IPC namespace.
    pub ipc: bool,
    /// Isolate UTS (hostname) namespace.
    pub uts: bool,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            pid: true,
            mount: true,
            network: true,
            user: false,
            ipc: true,
            uts: true,
        }
    }
}

impl NamespaceConfig {
    /// Namespaces for a long-running container.
    #[must_use]
    pub const fn container(options: &NamespaceOptions) -> Self {
        Self {
            pid: true,
            mount: true,
            network: true,
            user: options.user,
            ipc: options.ipc,
            uts: true,
        }
    }

    /// Namespaces for a build `RUN` step.
    ///
    /// Build steps share the host network unless `isolate_network` is set,
    /// so package managers inside the step can reach the outside world.
    #[must_use]
    pub const fn build(options: &NamespaceOptions, isolate_network: bool) -> Self {
        Self {
            network: isolate_network,
            ..Self::container(options)
        }
    }

    /// Translates the selection into `clone(2)` flags.
    #[cfg(target_os = "linux")]
    #[must_use]
    pub fn clone_flags(&self) -> nix::sched::CloneFlags {
        use nix::sched::CloneFlags;

        let mut flags = CloneFlags::empty();
        let table = [
            (self.pid, CloneFlags::CLONE_NEWPID),
            (self.mount, CloneFlags::CLONE_NEWNS),
            (self.network, CloneFlags::CLONE_NEWNET),
            (self.user, CloneFlags::CLONE_NEWUSER),
            (self.ipc, CloneFlags::CLONE_NEWIPC),
            (self.uts, CloneFlags::CLONE_NEWUTS),
        ];
        for (enabled, flag) in table {
            if enabled {
                flags |= flag;
            }
        }
        flags
    }
}

/// Path of the network namespace handle of a process.
#[must_use]
pub fn netns_path(pid: u32) -> PathBuf {
    PathBuf::from(format!("/proc/{pid}/ns/net"))
}
