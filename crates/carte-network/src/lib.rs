//! # carte-network
//!
//! Gives each container a network namespace with connectivity.
//!
//! Two strategies implement [`NetworkAttacher`]:
//! - [`bridge::BridgeNetwork`]: a host bridge, one veth pair per container,
//!   and addresses from a persisted [`pool::AddressPool`].
//! - [`cni::CniNetwork`]: delegates to the CNI plugin chain of the first
//!   configuration file found.
//!
//! [`NoNetwork`] leaves the namespace with loopback only.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod bridge;
pub mod cni;
pub mod command;
pub mod pool;
pub mod state;

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use carte_common::config::{CarteConfig, NetworkMode};
use carte_common::error::Result;

use crate::command::HostCommand;

/// Network assigned to one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attachment {
    /// Container address, if the strategy assigns one.
    pub ip_address: Option<Ipv4Addr>,
    /// Prefix length of the container subnet.
    pub prefix_len: Option<u8>,
    /// Default gateway.
    pub gateway: Option<Ipv4Addr>,
    /// Network namespace the container was wired into.
    pub netns: Option<PathBuf>,
}

/// Connects container network namespaces to the host.
pub trait NetworkAttacher: Send + Sync {
    /// Wires the network namespace of `pid` for `container_id`.
    ///
    /// `preferred` is the address the container held before, reused when
    /// still free. On failure nothing created by the attempt is left behind.
    ///
    /// # Errors
    ///
    /// Returns an error if any step of the wiring fails.
    fn attach(&self, container_id: &str, pid: u32, preferred: Option<Ipv4Addr>) -> Result<Attachment>;

    /// Tears down what `attach` created and releases the address.
    ///
    /// Safe to call after the container has exited.
    ///
    /// # Errors
    ///
    /// Returns an error if the allocation state cannot be updated.
    fn detach(&self, container_id: &str, attachment: &Attachment) -> Result<()>;
}

/// Loopback-only networking.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoNetwork;

impl NetworkAttacher for NoNetwork {
    fn attach(&self, _container_id: &str, pid: u32, _preferred: Option<Ipv4Addr>) -> Result<Attachment> {
        Ok(Attachment {
            netns: Some(carte_core::namespace::netns_path(pid)),
            ..Attachment::default()
        })
    }

    fn detach(&self, _container_id: &str, _attachment: &Attachment) -> Result<()> {
        Ok(())
    }
}

/// Builds the attacher selected by `config.network_mode`.
///
/// # Errors
///
/// Returns an error if the bridge subnet is invalid or the allocation
/// directory cannot be created.
pub fn from_config(config: &CarteConfig, commands: Arc<dyn HostCommand>) -> Result<Arc<dyn NetworkAttacher>> {
    Ok(match config.network_mode {
        NetworkMode::Bridge => {
            let allocations = state::AllocationStore::open(&config.network_dir(), config.bridge.network()?)?;
            Arc::new(bridge::BridgeNetwork::new(&config.bridge, allocations, commands))
        }
        NetworkMode::Cni => Arc::new(cni::CniNetwork::new(&config.cni, commands)),
        NetworkMode::None => Arc::new(NoNetwork),
    })
}

/// First eight characters of a container ID, used in interface names.
///
/// Linux caps interface names at 15 bytes; `vp` plus eight fits.
#[must_use]
pub fn short_id(container_id: &str) -> &str {
    container_id
        .char_indices()
        .nth(8)
        .map_or(container_id, |(idx, _)| &container_id[..idx])
}
