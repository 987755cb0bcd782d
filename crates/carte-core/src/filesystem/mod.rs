//! Filesystem management for container isolation.
//!
//! Provides root filesystem switching (`pivot_root` or `chroot`), the
//! pseudo-filesystem and device-node layout every container sees, and
//! advisory locks for shared on-disk state.

pub mod lock;
pub mod mount;
pub mod rootfs;
