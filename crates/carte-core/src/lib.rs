//! # carte-core
//!
//! Low-level Linux isolation primitives for the carte runtime.
//!
//! This crate provides safe abstractions over:
//! - **Namespaces**: PID, mount, network, IPC, UTS, and optional user isolation.
//! - **Root switching**: `pivot_root` with old-root detach, or `chroot`.
//! - **Pseudo-filesystems**: `/proc`, `/sys`, a tmpfs `/dev` and its device nodes.
//! - **Cgroups**: CPU and memory limits on v1 and v2 hierarchies.
//! - **Spawning**: `clone(2)` into fresh namespaces with a two-phase release.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! proper error handling and `// SAFETY:` documentation.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cgroup;
pub mod filesystem;
pub mod namespace;
pub mod spawn;
