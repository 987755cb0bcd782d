//! CPU bandwidth control.
//!
//! A limit of `P` percent grants `P × period / 100` microseconds of CPU time
//! per scheduling period, so `50%` is half a core and `200%` two cores.

use std::path::Path;

use carte_common::constants::CPU_PERIOD_US;
use carte_common::error::{CarteError, Result};

/// Quota in microseconds per [`CPU_PERIOD_US`] for a percentage.
#[must_use]
pub fn quota_us(percent: u32) -> u64 {
    u64::from(percent) * CPU_PERIOD_US / 100
}

/// Writes `cpu.cfs_period_us` and `cpu.cfs_quota_us` (cgroup v1).
///
/// # Errors
///
/// Returns an error if writing either control file fails.
pub fn set_cfs_quota(cgroup_path: &Path, percent: u32) -> Result<()> {
    write_value(&cgroup_path.join("cpu.cfs_period_us"), &CPU_PERIOD_US.to_string())?;
    let quota = quota_us(percent);
    write_value(&cgroup_path.join("cpu.cfs_quota_us"), &quota.to_string())?;
    tracing::debug!(quota_us = quota, period_us = CPU_PERIOD_US, "CFS quota set");
    Ok(())
}

/// Writes `cpu.max` as `"<quota> <period>"` (cgroup v2).
///
/// # Errors
///
/// Returns an error if writing to `cpu.max` fails.
pub fn set_cpu_max(cgroup_path: &Path, percent: u32) -> Result<()> {
    let quota = quota_us(percent);
    write_value(&cgroup_path.join("cpu.max"), &format!("{quota} {CPU_PERIOD_US}"))?;
    tracing::debug!(quota_us = quota, period_us = CPU_PERIOD_US, "CPU max quota set");
    Ok(())
}

fn write_value(file: &Path, value: &str) -> Result<()> {
    std::fs::write(file, value).map_err(|e| CarteError::io(file, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_scales_with_period() {
        assert_eq!(quota_us(50), 50_000);
        assert_eq!(quota_us(100), 100_000);
        assert_eq!(quota_us(250), 250_000);
    }
}
