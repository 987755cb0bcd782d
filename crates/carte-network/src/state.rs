//! Persisted address allocations.
//!
//! `network/allocations.json` maps each container to its address and keeps
//! the pool cursor. Every read-modify-write holds an in-process mutex and an
//! exclusive `flock` on `network/allocations.lock`, so concurrent engine
//! invocations never hand out the same address.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use carte_common::error::{CarteError, Result};
use carte_core::filesystem::lock::FileLock;

use crate::pool::AddressPool;

#[derive(Debug, Default, Serialize, Deserialize)]
struct AllocationFile {
    subnet: String,
    cursor: Option<Ipv4Addr>,
    allocations: BTreeMap<String, Ipv4Addr>,
}

/// Address allocations shared by every engine invocation on a host.
#[derive(Debug)]
pub struct AllocationStore {
    path: PathBuf,
    lock_path: PathBuf,
    network: Ipv4Network,
    guard: Mutex<()>,
}

impl AllocationStore {
    /// Opens the store under `dir` for `network`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the subnet is
    /// too small.
    pub fn open(dir: &Path, network: Ipv4Network) -> Result<Self> {
        let _ = AddressPool::new(network)?;
        std::fs::create_dir_all(dir).map_err(|e| CarteError::io(dir, e))?;
        Ok(Self {
            path: dir.join("allocations.json"),
            lock_path: dir.join("allocations.lock"),
            network,
            guard: Mutex::new(()),
        })
    }

    /// Subnet the allocations come from.
    #[must_use]
    pub const fn network(&self) -> Ipv4Network {
        self.network
    }

    /// Reserves an address for `owner`.
    ///
    /// An owner that already holds an address keeps it. Otherwise `preferred`
    /// is used when free, and the next pool address when not.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool is exhausted or the state cannot be
    /// persisted.
    pub fn reserve(&self, owner: &str, preferred: Option<Ipv4Addr>) -> Result<Ipv4Addr> {
        self.update(|pool, allocations| {
            if let Some(ip) = allocations.get(owner) {
                return Ok(*ip);
            }
            let ip = match preferred {
                Some(ip) if pool.reserve(ip) => ip,
                Some(ip) => {
                    let fresh = pool.allocate()?;
                    tracing::warn!(owner, previous = %ip, address = %fresh, "previous address taken, allocated a new one");
                    fresh
                }
                None => pool.allocate()?,
            };
            let _ = allocations.insert(owner.to_string(), ip);
            tracing::debug!(owner, address = %ip, "address reserved");
            Ok(ip)
        })
    }

    /// Releases the address held by `owner`, returning it if there was one.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read or written.
    pub fn release(&self, owner: &str) -> Result<Option<Ipv4Addr>> {
        self.update(|pool, allocations| {
            let released = allocations.remove(owner);
            if let Some(ip) = released {
                pool.release(ip);
                tracing::debug!(owner, address = %ip, "address released");
            }
            Ok(released)
        })
    }

    /// Current allocations by owner.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read.
    pub fn allocations(&self) -> Result<BTreeMap<String, Ipv4Addr>> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let _lock = FileLock::exclusive(&self.lock_path)?;
        Ok(self.read()?.allocations)
    }

    fn update<T>(
        &self,
        f: impl FnOnce(&mut AddressPool, &mut BTreeMap<String, Ipv4Addr>) -> Result<T>,
    ) -> Result<T> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let _lock = FileLock::exclusive(&self.lock_path)?;
        let mut file = self.read()?;
        let mut pool = AddressPool::new(self.network)?;

        let subnet = self.network.to_string();
        if !file.subnet.is_empty() && file.subnet != subnet {
            tracing::warn!(from = %file.subnet, to = %subnet, "bridge subnet changed, dropping stale allocations");
        }
        file.allocations.retain(|owner, ip| {
            let kept = pool.reserve(*ip);
            if !kept {
                tracing::warn!(owner = %owner, address = %ip, "dropping allocation outside the pool");
            }
            kept
        });
        if let Some(cursor) = file.cursor {
            pool.set_cursor(cursor);
        }

        let result = f(&mut pool, &mut file.allocations)?;
        file.subnet = subnet;
        file.cursor = Some(pool.cursor());
        self.write(&file)?;
        Ok(result)
    }

    fn read(&self) -> Result<AllocationFile> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AllocationFile::default()),
            Err(e) => Err(CarteError::io(&self.path, e)),
        }
    }

    fn write(&self, file: &AllocationFile) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(file)?).map_err(|e| CarteError::io(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| CarteError::io(&self.path, e))
    }
}
