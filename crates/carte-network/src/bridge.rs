//! Bridge + veth networking.
//!
//! The host bridge carries the subnet's gateway address. Each container gets
//! a veth pair: the host end `vp<id8>` is enslaved to the bridge, the peer
//! `vc<id8>` moves into the container's namespace, which is named `c<id8>`
//! with `ip netns attach` so the `ip` tool can address it.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use carte_common::config::BridgeConfig;
use carte_common::error::Result;

use crate::command::{self, HostCommand, Invocation};
use crate::state::AllocationStore;
use crate::{Attachment, NetworkAttacher, short_id};

/// Interface and namespace names derived from a container ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethNames {
    /// Host end, attached to the bridge.
    pub host: String,
    /// Container end.
    pub peer: String,
    /// Named network namespace.
    pub netns: String,
}

impl VethNames {
    /// Names for `container_id`.
    #[must_use]
    pub fn for_container(container_id: &str) -> Self {
        let id8 = short_id(container_id);
        Self {
            host: format!("vp{id8}"),
            peer: format!("vc{id8}"),
            netns: format!("c{id8}"),
        }
    }
}

/// Bridge strategy for [`NetworkAttacher`].
pub struct BridgeNetwork {
    bridge: String,
    masquerade: bool,
    allocations: AllocationStore,
    commands: Arc<dyn HostCommand>,
}

impl std::fmt::Debug for BridgeNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeNetwork")
            .field("bridge", &self.bridge)
            .field("masquerade", &self.masquerade)
            .field("allocations", &self.allocations)
            .finish_non_exhaustive()
    }
}

/// What an attach attempt has created so far.
#[derive(Default)]
struct Progress {
    veth: bool,
    netns: bool,
}

impl BridgeNetwork {
    /// Creates the strategy; the bridge itself is created lazily on attach.
    #[must_use]
    pub fn new(config: &BridgeConfig, allocations: AllocationStore, commands: Arc<dyn HostCommand>) -> Self {
        Self {
            bridge: config.name.clone(),
            masquerade: config.masquerade,
            allocations,
            commands,
        }
    }

    fn ip(&self, args: &[&str]) -> Result<()> {
        let _ = self.commands.run(&Invocation::new("ip", args))?;
        Ok(())
    }

    fn gateway(&self) -> Ipv4Addr {
        let base = u32::from(self.allocations.network().network());
        Ipv4Addr::from(base + 1)
    }

    /// Creates the bridge if missing and brings it up.
    ///
    /// Forwarding and the MASQUERADE rule are installed only when the bridge
    /// is created, so repeated calls never stack duplicate rules.
    ///
    /// # Errors
    ///
    /// Returns a network error if a command fails.
    pub fn ensure_bridge(&self) -> Result<()> {
        if self.ip(&["link", "show", &self.bridge]).is_ok() {
            return self.ip(&["link", "set", &self.bridge, "up"]);
        }

        let network = self.allocations.network();
        let gateway = format!("{}/{}", self.gateway(), network.prefix());
        self.ip(&["link", "add", "name", &self.bridge, "type", "bridge"])?;
        self.ip(&["addr", "add", &gateway, "dev", &self.bridge])?;
        self.ip(&["link", "set", &self.bridge, "up"])?;
        if self.masquerade {
            let subnet = network.to_string();
            let _ = self
                .commands
                .run(&Invocation::new("sysctl", &["-w", "net.ipv4.ip_forward=1"]))?;
            let _ = self.commands.run(&Invocation::new(
                "iptables",
                &["-t", "nat", "-A", "POSTROUTING", "-s", &subnet, "!", "-o", &self.bridge, "-j", "MASQUERADE"],
            ))?;
        }
        tracing::info!(bridge = %self.bridge, gateway = %gateway, "bridge created");
        Ok(())
    }

    fn wire(&self, names: &VethNames, pid: u32, ip: Ipv4Addr, progress: &mut Progress) -> Result<()> {
        let pid = pid.to_string();
        let address = format!("{ip}/{}", self.allocations.network().prefix());
        let gateway = self.gateway().to_string();

        self.ip(&["link", "add", &names.host, "type", "veth", "peer", "name", &names.peer])?;
        progress.veth = true;
        self.ip(&["link", "set", &names.host, "master", &self.bridge])?;
        self.ip(&["link", "set", &names.host, "up"])?;
        self.ip(&["netns", "attach", &names.netns, &pid])?;
        progress.netns = true;
        self.ip(&["link", "set", &names.peer, "netns", &names.netns])?;
        self.ip(&["-n", &names.netns, "addr", "add", &address, "dev", &names.peer])?;
        self.ip(&["-n", &names.netns, "link", "set", "lo", "up"])?;
        self.ip(&["-n", &names.netns, "link", "set", &names.peer, "up"])?;
        self.ip(&["-n", &names.netns, "route", "add", "default", "via", &gateway])
    }

    fn teardown(&self, names: &VethNames, progress: &Progress) {
        if progress.veth {
            command::run_best_effort(self.commands.as_ref(), &Invocation::new("ip", &["link", "delete", &names.host]));
        }
        if progress.netns {
            command::run_best_effort(self.commands.as_ref(), &Invocation::new("ip", &["netns", "delete", &names.netns]));
        }
    }
}

impl NetworkAttacher for BridgeNetwork {
    fn attach(&self, container_id: &str, pid: u32, preferred: Option<Ipv4Addr>) -> Result<Attachment> {
        self.ensure_bridge()?;
        let ip = self.allocations.reserve(container_id, preferred)?;
        let names = VethNames::for_container(container_id);

        let mut progress = Progress::default();
        if let Err(e) = self.wire(&names, pid, ip, &mut progress) {
            tracing::warn!(container = container_id, error = %e, "network wiring failed, rolling back");
            self.teardown(&names, &progress);
            if let Err(release_err) = self.allocations.release(container_id) {
                tracing::warn!(container = container_id, error = %release_err, "failed to release address");
            }
            return Err(e);
        }

        tracing::info!(container = container_id, address = %ip, veth = %names.host, "container attached to bridge");
        Ok(Attachment {
            ip_address: Some(ip),
            prefix_len: Some(self.allocations.network().prefix()),
            gateway: Some(self.gateway()),
            netns: Some(PathBuf::from("/run/netns").join(&names.netns)),
        })
    }

    fn detach(&self, container_id: &str, _attachment: &Attachment) -> Result<()> {
        let names = VethNames::for_container(container_id);
        self.teardown(&names, &Progress { veth: true, netns: true });
        let released = self.allocations.release(container_id)?;
        tracing::info!(container = container_id, address = ?released, "container detached from bridge");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_fit_interface_limit() {
        let names = VethNames::for_container("0123456789abcdef0123");
        assert_eq!(names.host, "vp01234567");
        assert_eq!(names.peer, "vc01234567");
        assert_eq!(names.netns, "c01234567");
        assert!(names.host.len() <= 15);
    }
}
