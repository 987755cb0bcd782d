//! Root filesystem switching.
//!
//! `pivot_root(2)` is preferred because it actually changes the root mount
//! and lets the old root be detached; `chroot(2)` only changes the process's
//! view of `/` and is kept as an opt-in fallback for hosts where the rootfs
//! cannot be made a mount point.

use std::path::Path;

use carte_common::config::RootStrategy;
use carte_common::error::{CarteError, Result};

/// Directory inside the new root that temporarily holds the old root.
pub const PIVOT_OLD_DIR: &str = ".pivot_old";

/// Switches the calling process's root to `new_root`.
///
/// Must run inside a private mount namespace. After return the working
/// directory is `/`.
///
/// # Errors
///
/// Returns an error if any mount, pivot, or chroot step fails.
#[cfg(target_os = "linux")]
pub fn switch_root(new_root: &Path, strategy: RootStrategy) -> Result<()> {
    match strategy {
        RootStrategy::Pivot => pivot_into(new_root),
        RootStrategy::Chroot => chroot_into(new_root),
    }
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; root switching requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn switch_root(_new_root: &Path, _strategy: RootStrategy) -> Result<()> {
    Err(CarteError::Resource {
        message: "Linux required for native container operations".into(),
    })
}

/// Marks every mount in the namespace private so nothing propagates to the host.
///
/// # Errors
///
/// Returns an error if the remount fails.
#[cfg(target_os = "linux")]
pub fn make_mounts_private() -> Result<()> {
    use nix::mount::{MsFlags, mount};

    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| resource("make / private", e))
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; mount namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn make_mounts_private() -> Result<()> {
    Err(CarteError::Resource {
        message: "Linux required for native container operations".into(),
    })
}

#[cfg(target_os = "linux")]
fn pivot_into(new_root: &Path) -> Result<()> {
    use nix::mount::{MntFlags, MsFlags, mount, umount2};
    use nix::unistd::{chdir, pivot_root};

    // pivot_root requires the new root to be a mount point.
    mount(
        Some(new_root),
        new_root,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| resource("bind-mount new root", e))?;

    let put_old = new_root.join(PIVOT_OLD_DIR);
    std::fs::create_dir_all(&put_old).map_err(|e| CarteError::io(&put_old, e))?;
    pivot_root(new_root, &put_old).map_err(|e| resource("pivot_root", e))?;
    chdir("/").map_err(|e| resource("chdir /", e))?;

    let old = Path::new("/").join(PIVOT_OLD_DIR);
    umount2(&old, MntFlags::MNT_DETACH).map_err(|e| resource("detach old root", e))?;
    std::fs::remove_dir(&old).map_err(|e| CarteError::io(&old, e))?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn chroot_into(new_root: &Path) -> Result<()> {
    use nix::unistd::{chdir, chroot};

    chroot(new_root).map_err(|e| resource("chroot", e))?;
    chdir("/").map_err(|e| resource("chdir /", e))?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn resource(step: &str, err: nix::Error) -> CarteError {
    CarteError::Resource {
        message: format!("{step} failed: {err}"),
    }
}
