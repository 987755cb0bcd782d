//! User namespace identity mapping.
//!
//! Maps the container's root to the invoking host user so the container
//! can run without host privileges.

use std::path::PathBuf;

use carte_common::error::{CarteError, Result};

/// Writes a single-range UID/GID mapping for a child's user namespace.
///
/// Must be called by the parent after `clone(2)` and before the child
/// performs privileged setup. `setgroups` is denied first, as required
/// for unprivileged writers of `gid_map`.
///
/// # Errors
///
/// Returns an error if writing to `/proc/[pid]/uid_map`,
/// `/proc/[pid]/gid_map`, or `/proc/[pid]/setgroups` fails.
pub fn write_id_maps(pid: u32, host_uid: u32, host_gid: u32) -> Result<()> {
    let proc_dir = PathBuf::from(format!("/proc/{pid}"));
    write_id_maps_at(&proc_dir, host_uid, host_gid)?;
    tracing::debug!(pid, host_uid, host_gid, "wrote UID/GID map");
    Ok(())
}

fn write_id_maps_at(proc_dir: &std::path::Path, host_uid: u32, host_gid: u32) -> Result<()> {
    let setgroups = proc_dir.join("setgroups");
    if setgroups.exists() {
        std::fs::write(&setgroups, "deny").map_err(|e| CarteError::io(&setgroups, e))?;
    }
    let uid_map = proc_dir.join("uid_map");
    std::fs::write(&uid_map, format!("0 {host_uid} 1")).map_err(|e| CarteError::io(&uid_map, e))?;
    let gid_map = proc_dir.join("gid_map");
    std::fs::write(&gid_map, format!("0 {host_gid} 1")).map_err(|e| CarteError::io(&gid_map, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_root_to_host_ids() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("setgroups"), "allow").unwrap();

        write_id_maps_at(dir.path(), 1000, 100).unwrap();

        let read = |f: &str| std::fs::read_to_string(dir.path().join(f)).unwrap();
        assert_eq!(read("setgroups"), "deny");
        assert_eq!(read("uid_map"), "0 1000 1");
        assert_eq!(read("gid_map"), "0 100 1");
    }
}
