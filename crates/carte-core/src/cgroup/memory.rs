//! Memory limit control.

use std::path::Path;

use carte_common::error::{CarteError, Result};

/// Writes the hard limit to `memory.limit_in_bytes` (cgroup v1).
///
/// # Errors
///
/// Returns an error if writing the control file fails.
pub fn set_limit_in_bytes(cgroup_path: &Path, bytes: u64) -> Result<()> {
    write_limit(&cgroup_path.join("memory.limit_in_bytes"), bytes)
}

/// Writes the hard limit to `memory.max` (cgroup v2).
///
/// # Errors
///
/// Returns an error if writing the control file fails.
pub fn set_memory_max(cgroup_path: &Path, bytes: u64) -> Result<()> {
    write_limit(&cgroup_path.join("memory.max"), bytes)
}

fn write_limit(file: &Path, bytes: u64) -> Result<()> {
    std::fs::write(file, bytes.to_string()).map_err(|e| CarteError::io(file, e))?;
    tracing::debug!(bytes, file = %file.display(), "memory limit set");
    Ok(())
}
