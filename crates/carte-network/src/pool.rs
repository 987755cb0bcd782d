//! Container address pool.
//!
//! Hands out host addresses of a subnet sequentially. The first host address
//! is reserved for the gateway; the network and broadcast addresses are never
//! handed out. The cursor wraps once the range is exhausted, and an explicit
//! in-use set keeps a wrapped cursor from reissuing a live address.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

use carte_common::error::{CarteError, Result};

/// Sequential allocator over the host range of one subnet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPool {
    network: Ipv4Network,
    gateway: Ipv4Addr,
    /// First assignable address.
    start: u32,
    /// Last assignable address (inclusive).
    end: u32,
    in_use: BTreeSet<u32>,
    /// Next address to try.
    next: u32,
}

impl AddressPool {
    /// Creates an empty pool for `network`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the subnet has no room for a gateway
    /// and at least one container.
    pub fn new(network: Ipv4Network) -> Result<Self> {
        let base = u32::from(network.network());
        let broadcast = u32::from(network.broadcast());
        if broadcast.saturating_sub(base) < 3 {
            return Err(CarteError::validation(format!(
                "subnet {network} has no room for containers"
            )));
        }
        Ok(Self {
            network,
            gateway: Ipv4Addr::from(base + 1),
            start: base + 2,
            end: broadcast - 1,
            in_use: BTreeSet::new(),
            next: base + 2,
        })
    }

    /// Subnet the pool covers.
    #[must_use]
    pub const fn network(&self) -> Ipv4Network {
        self.network
    }

    /// Gateway address, the first host of the subnet.
    #[must_use]
    pub const fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    /// Prefix length of the subnet.
    #[must_use]
    pub fn prefix(&self) -> u8 {
        self.network.prefix()
    }

    /// Allocates the next free address.
    ///
    /// # Errors
    ///
    /// Returns a network error when every address is in use.
    pub fn allocate(&mut self) -> Result<Ipv4Addr> {
        let range_size = u64::from(self.end - self.start) + 1;
        for _ in 0..range_size {
            let candidate = self.next;
            self.next = if self.next >= self.end { self.start } else { self.next + 1 };
            if self.in_use.insert(candidate) {
                return Ok(Ipv4Addr::from(candidate));
            }
        }
        Err(CarteError::Network {
            message: format!("address pool {} is exhausted", self.network),
        })
    }

    /// Marks `ip` as in use; `false` if it is taken or outside the range.
    pub fn reserve(&mut self, ip: Ipv4Addr) -> bool {
        let raw = u32::from(ip);
        (self.start..=self.end).contains(&raw) && self.in_use.insert(raw)
    }

    /// Returns `ip` to the pool.
    pub fn release(&mut self, ip: Ipv4Addr) {
        let _ = self.in_use.remove(&u32::from(ip));
    }

    /// True if `ip` is in range and free.
    #[must_use]
    pub fn is_available(&self, ip: Ipv4Addr) -> bool {
        let raw = u32::from(ip);
        (self.start..=self.end).contains(&raw) && !self.in_use.contains(&raw)
    }

    /// Next address the cursor will try.
    #[must_use]
    pub fn cursor(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.next)
    }

    /// Moves the cursor, ignoring addresses outside the range.
    pub fn set_cursor(&mut self, ip: Ipv4Addr) {
        let raw = u32::from(ip);
        if (self.start..=self.end).contains(&raw) {
            self.next = raw;
        }
    }

    /// Number of addresses in use.
    #[must_use]
    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(cidr: &str) -> AddressPool {
        AddressPool::new(cidr.parse().unwrap()).unwrap()
    }

    #[test]
    fn first_host_is_gateway() {
        let mut p = pool("10.88.0.0/16");
        assert_eq!(p.gateway(), Ipv4Addr::new(10, 88, 0, 1));
        assert_eq!(p.allocate().unwrap(), Ipv4Addr::new(10, 88, 0, 2));
        assert_eq!(p.allocate().unwrap(), Ipv4Addr::new(10, 88, 0, 3));
        assert_eq!(p.prefix(), 16);
    }

    #[test]
    fn exhausted_pool_is_an_error() {
        // /29: .1 gateway, .2-.6 assignable
        let mut p = pool("192.168.5.0/29");
        for _ in 0..5 {
            let _ = p.allocate().unwrap();
        }
        assert!(matches!(p.allocate(), Err(CarteError::Network { .. })));
    }

    #[test]
    fn wrapped_cursor_skips_live_addresses() {
        let mut p = pool("192.168.5.0/29");
        let addrs: Vec<_> = (0..5).map(|_| p.allocate().unwrap()).collect();
        p.release(addrs[2]);
        assert_eq!(p.allocate().unwrap(), addrs[2]);
        p.release(addrs[0]);
        p.release(addrs[4]);
        assert_eq!(p.allocate().unwrap(), addrs[4]);
        assert_eq!(p.allocate().unwrap(), addrs[0]);
    }

    #[test]
    fn reserve_rejects_taken_and_foreign_addresses() {
        let mut p = pool("10.0.0.0/24");
        assert!(p.reserve(Ipv4Addr::new(10, 0, 0, 50)));
        assert!(!p.reserve(Ipv4Addr::new(10, 0, 0, 50)));
        assert!(!p.reserve(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(!p.reserve(Ipv4Addr::new(10, 0, 1, 7)));
        assert!(!p.is_available(Ipv4Addr::new(10, 0, 0, 50)));
    }

    #[test]
    fn tiny_subnets_are_rejected() {
        assert!(AddressPool::new("10.0.0.0/31".parse().unwrap()).is_err());
    }
}
