//! Pseudo-filesystems and device nodes inside the container.
//!
//! Runs after the root switch, so paths are relative to the container's own
//! `/`. The one exception is a user-namespaced container: its `/dev` is
//! bind-mounted from the host before the switch, while the host's `/dev` is
//! still reachable.

use std::path::Path;

use carte_common::constants::DEV_TMPFS_OPTIONS;
use carte_common::error::{CarteError, Result};

#[cfg(target_os = "linux")]
const HOST_DEV: &str = "/dev";

/// A character device created under `/dev`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceNode {
    /// File name under `/dev`.
    pub name: &'static str,
    /// Major device number.
    pub major: u64,
    /// Minor device number.
    pub minor: u64,
    /// Permission bits.
    pub mode: u32,
}

/// Device nodes every container receives.
pub const DEVICES: [DeviceNode; 6] = [
    DeviceNode { name: "null", major: 1, minor: 3, mode: 0o666 },
    DeviceNode { name: "zero", major: 1, minor: 5, mode: 0o666 },
    DeviceNode { name: "random", major: 1, minor: 8, mode: 0o666 },
    DeviceNode { name: "urandom", major: 1, minor: 9, mode: 0o666 },
    DeviceNode { name: "tty", major: 5, minor: 0, mode: 0o666 },
    DeviceNode { name: "console", major: 5, minor: 1, mode: 0o620 },
];

/// How `/dev` entries are provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    /// `mknod(2)` each device. Requires the initial user namespace.
    Create,
    /// Bind-mount the host's device files onto empty files. Works inside a
    /// user namespace, where `mknod(2)` is refused.
    BindHost,
}

impl DeviceMode {
    /// `BindHost` when the container gets its own user namespace, `Create` otherwise.
    #[must_use]
    pub const fn for_user_namespace(user: bool) -> Self {
        if user { Self::BindHost } else { Self::Create }
    }
}

/// Mounts a tmpfs on `dev_dir` and fills it with [`DEVICES`].
///
/// # Errors
///
/// Returns an error if the mount or any device entry fails.
#[cfg(target_os = "linux")]
pub fn populate_dev(dev_dir: &Path, mode: DeviceMode) -> Result<()> {
    use nix::mount::MsFlags;

    mount_fs(
        "tmpfs",
        dev_dir,
        MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
        Some(DEV_TMPFS_OPTIONS),
    )?;
    match mode {
        DeviceMode::Create => create_device_nodes(dev_dir),
        DeviceMode::BindHost => bind_device_nodes(dev_dir, Path::new(HOST_DEV)),
    }
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; device setup requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn populate_dev(_dev_dir: &Path, _mode: DeviceMode) -> Result<()> {
    Err(CarteError::Resource {
        message: "Linux required for native container operations".into(),
    })
}

/// Mounts `/proc` and `/sys`, and for [`DeviceMode::Create`] a populated
/// `/dev`. A [`DeviceMode::BindHost`] `/dev` was set up before the switch.
///
/// # Errors
///
/// Returns an error if any mount or `mknod(2)` call fails.
#[cfg(target_os = "linux")]
pub fn mount_pseudo_filesystems(devices: DeviceMode) -> Result<()> {
    use nix::mount::MsFlags;

    let hardened = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;
    mount_fs("proc", Path::new("/proc"), hardened, None)?;
    mount_fs("sysfs", Path::new("/sys"), hardened | MsFlags::MS_RDONLY, None)?;
    match devices {
        DeviceMode::Create => populate_dev(Path::new("/dev"), DeviceMode::Create),
        DeviceMode::BindHost => Ok(()),
    }
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; pseudo-filesystems require Linux.
#[cfg(not(target_os = "linux"))]
pub fn mount_pseudo_filesystems(_devices: DeviceMode) -> Result<()> {
    Err(CarteError::Resource {
        message: "Linux required for native container operations".into(),
    })
}

#[cfg(target_os = "linux")]
fn mount_fs(
    fstype: &str,
    target: &Path,
    flags: nix::mount::MsFlags,
    data: Option<&str>,
) -> Result<()> {
    std::fs::create_dir_all(target).map_err(|e| CarteError::io(target, e))?;
    nix::mount::mount(Some(fstype), target, Some(fstype), flags, data).map_err(|e| {
        CarteError::Resource {
            message: format!("mount {fstype} on {} failed: {e}", target.display()),
        }
    })
}

/// Creates the standard character devices in `dev_dir`.
///
/// Permissions are set explicitly afterwards so the process umask does not
/// narrow them.
///
/// # Errors
///
/// Returns an error if `mknod(2)` or `chmod(2)` fails.
#[cfg(target_os = "linux")]
pub fn create_device_nodes(dev_dir: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    use nix::sys::stat::{Mode, SFlag, makedev, mknod};

    for dev in DEVICES {
        let path = dev_dir.join(dev.name);
        mknod(
            &path,
            SFlag::S_IFCHR,
            Mode::from_bits_truncate(dev.mode),
            makedev(dev.major, dev.minor),
        )
        .map_err(|e| CarteError::Resource {
            message: format!("mknod {} failed: {e}", path.display()),
        })?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(dev.mode))
            .map_err(|e| CarteError::io(&path, e))?;
    }
    Ok(())
}

/// Bind-mounts `host_dev/<name>` onto an empty file in `dev_dir` for each device.
///
/// # Errors
///
/// Returns an error if a target file cannot be created or a bind mount fails.
#[cfg(target_os = "linux")]
pub fn bind_device_nodes(dev_dir: &Path, host_dev: &Path) -> Result<()> {
    use nix::mount::{MsFlags, mount};

    for dev in DEVICES {
        let source = host_dev.join(dev.name);
        let target = dev_dir.join(dev.name);
        let _ = std::fs::File::create(&target).map_err(|e| CarteError::io(&target, e))?;
        mount(
            Some(&source),
            &target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| CarteError::Resource {
            message: format!("bind {} on {} failed: {e}", source.display(), target.display()),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_table_matches_linux_numbers() {
        let find = |name: &str| DEVICES.iter().find(|d| d.name == name).copied().unwrap();
        assert_eq!((find("null").major, find("null").minor), (1, 3));
        assert_eq!((find("urandom").major, find("urandom").minor), (1, 9));
        assert_eq!(find("console").mode, 0o620);
        assert!(DEVICES.iter().filter(|d| d.name != "console").all(|d| d.mode == 0o666));
    }

    #[test]
    fn device_mode_follows_user_namespace() {
        assert_eq!(DeviceMode::for_user_namespace(false), DeviceMode::Create);
        assert_eq!(DeviceMode::for_user_namespace(true), DeviceMode::BindHost);
    }

    /// Runs in a forked child: joins fresh user and mount namespaces, maps
    /// root to the caller, and populates `dev_dir` the way a user-namespaced
    /// container does. Returns the exit code for the parent to check.
    #[cfg(target_os = "linux")]
    fn populate_as_namespaced_root(dev_dir: &Path, uid: u32, gid: u32) -> i32 {
        use std::os::unix::fs::{FileTypeExt, MetadataExt};

        use nix::sched::{CloneFlags, unshare};
        use nix::sys::stat::makedev;

        if unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS).is_err() {
            return SKIPPED;
        }
        if crate::namespace::user::write_id_maps(std::process::id(), uid, gid).is_err() {
            return 3;
        }
        if crate::filesystem::rootfs::make_mounts_private().is_err() {
            return 4;
        }
        if populate_dev(dev_dir, DeviceMode::BindHost).is_err() {
            return 5;
        }
        let Ok(null) = std::fs::metadata(dev_dir.join("null")) else {
            return 6;
        };
        if !null.file_type().is_char_device() || null.rdev() != makedev(1, 3) {
            return 7;
        }
        if std::fs::write(dev_dir.join("null"), b"discarded").is_err() {
            return 8;
        }
        0
    }

    #[cfg(target_os = "linux")]
    const SKIPPED: i32 = 2;

    #[cfg(target_os = "linux")]
    #[allow(unsafe_code)]
    #[test]
    fn bind_host_devices_inside_user_namespace() {
        use nix::sys::wait::{WaitStatus, waitpid};
        use nix::unistd::{ForkResult, fork, getgid, getuid};

        let dir = tempfile::tempdir().unwrap();
        let dev_dir = dir.path().join("dev");
        let (uid, gid) = (getuid().as_raw(), getgid().as_raw());

        // SAFETY: the child only makes syscalls and exits with `_exit`.
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let code = populate_as_namespaced_root(&dev_dir, uid, gid);
                // SAFETY: terminates the forked child without running the
                // parent's destructors or test harness.
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => match waitpid(child, None).unwrap() {
                // SKIPPED: unprivileged user namespaces are disabled on this host.
                WaitStatus::Exited(_, 0 | SKIPPED) => {}
                other => panic!("device setup in user namespace failed: {other:?}"),
            },
        }
    }
}
