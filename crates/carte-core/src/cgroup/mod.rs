//! Cgroup resource management.
//!
//! Provides a handle for creating a container's cgroup, writing CPU and
//! memory limits, attaching processes, and removing the group again. Both
//! the per-controller v1 layout (`<root>/cpu/carte/<id>`,
//! `<root>/memory/carte/<id>`) and the unified v2 layout
//! (`<root>/carte/<id>`) are supported.

pub mod cpu;
pub mod memory;

use std::path::{Path, PathBuf};

use carte_common::config::CgroupVersion;
use carte_common::constants::CGROUP_PARENT;
use carte_common::error::{CarteError, Result};
use carte_common::types::ResourceLimits;

/// Concrete hierarchy layout after auto-detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hierarchy {
    /// One hierarchy per controller.
    V1,
    /// Unified hierarchy.
    V2,
}

/// Detects the layout mounted at `root`.
///
/// The unified hierarchy exposes `cgroup.controllers` at its root; v1
/// controller mounts never do.
#[must_use]
pub fn detect(root: &Path) -> Hierarchy {
    if root.join("cgroup.controllers").exists() {
        Hierarchy::V2
    } else {
        Hierarchy::V1
    }
}

/// Handle to a cgroup for a specific container.
#[derive(Debug, Clone)]
pub struct CgroupManager {
    hierarchy: Hierarchy,
    root: PathBuf,
    cpu_dir: PathBuf,
    memory_dir: PathBuf,
}

impl CgroupManager {
    /// Resolves the cgroup directories for `container_id` without touching disk.
    #[must_use]
    pub fn new(root: &Path, version: CgroupVersion, container_id: &str) -> Self {
        let hierarchy = match version {
            CgroupVersion::V1 => Hierarchy::V1,
            CgroupVersion::V2 => Hierarchy::V2,
            CgroupVersion::Auto => detect(root),
        };
        let (cpu_dir, memory_dir) = match hierarchy {
            Hierarchy::V1 => (
                root.join("cpu").join(CGROUP_PARENT).join(container_id),
                root.join("memory").join(CGROUP_PARENT).join(container_id),
            ),
            Hierarchy::V2 => {
                let dir = root.join(CGROUP_PARENT).join(container_id);
                (dir.clone(), dir)
            }
        };
        Self {
            hierarchy,
            root: root.to_path_buf(),
            cpu_dir,
            memory_dir,
        }
    }

    /// Returns the resolved hierarchy layout.
    #[must_use]
    pub const fn hierarchy(&self) -> Hierarchy {
        self.hierarchy
    }

    /// Directory holding the CPU controller files.
    #[must_use]
    pub fn cpu_dir(&self) -> &Path {
        &self.cpu_dir
    }

    /// Directory holding the memory controller files.
    #[must_use]
    pub fn memory_dir(&self) -> &Path {
        &self.memory_dir
    }

    /// Creates the cgroup directories. Existing directories are reused.
    ///
    /// On v2 the `cpu` and `memory` controllers are delegated to the
    /// `carte` parent first; a refusal there surfaces when the limits are
    /// written.
    ///
    /// # Errors
    ///
    /// Returns an error if a cgroup directory cannot be created.
    pub fn create(&self) -> Result<()> {
        for dir in self.dirs() {
            std::fs::create_dir_all(dir).map_err(|e| CarteError::io(dir, e))?;
        }
        if self.hierarchy == Hierarchy::V2 {
            for dir in [self.root.clone(), self.root.join(CGROUP_PARENT)] {
                let file = dir.join("cgroup.subtree_control");
                if let Err(e) = std::fs::write(&file, "+cpu +memory") {
                    tracing::debug!(path = %file.display(), error = %e, "controller delegation skipped");
                }
            }
        }
        tracing::info!(path = %self.cpu_dir.display(), hierarchy = ?self.hierarchy, "cgroup created");
        Ok(())
    }

    /// Writes CPU and memory limits.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to a cgroup control file fails.
    pub fn apply(&self, limits: &ResourceLimits) -> Result<()> {
        match self.hierarchy {
            Hierarchy::V1 => {
                cpu::set_cfs_quota(&self.cpu_dir, limits.cpu_percent)?;
                memory::set_limit_in_bytes(&self.memory_dir, limits.memory_bytes)?;
            }
            Hierarchy::V2 => {
                cpu::set_cpu_max(&self.cpu_dir, limits.cpu_percent)?;
                memory::set_memory_max(&self.memory_dir, limits.memory_bytes)?;
            }
        }
        Ok(())
    }

    /// Adds a process to this cgroup by writing its PID.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to `cgroup.procs` fails.
    pub fn add_process(&self, pid: u32) -> Result<()> {
        for dir in self.dirs() {
            let procs_path = dir.join("cgroup.procs");
            std::fs::write(&procs_path, pid.to_string())
                .map_err(|e| CarteError::io(&procs_path, e))?;
        }
        tracing::debug!(pid, "added process to cgroup");
        Ok(())
    }

    /// Removes the cgroup directories. Missing directories are ignored.
    ///
    /// Only empty groups can be removed; callers destroy after the
    /// container's processes have exited.
    ///
    /// # Errors
    ///
    /// Returns an error if a cgroup directory cannot be removed.
    pub fn destroy(&self) -> Result<()> {
        for dir in self.dirs() {
            match std::fs::remove_dir(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CarteError::io(dir, e)),
            }
        }
        tracing::info!(path = %self.cpu_dir.display(), "cgroup destroyed");
        Ok(())
    }

    fn dirs(&self) -> Vec<&Path> {
        if self.cpu_dir == self.memory_dir {
            vec![&self.cpu_dir]
        } else {
            vec![&self.cpu_dir, &self.memory_dir]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ResourceLimits {
        ResourceLimits {
            cpu_percent: 50,
            memory_bytes: 104_857_600,
        }
    }

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[test]
    fn auto_detects_unified_hierarchy() {
        let root = tempfile::tempdir().unwrap();
        assert_eq!(detect(root.path()), Hierarchy::V1);
        std::fs::write(root.path().join("cgroup.controllers"), "cpu memory").unwrap();
        let cg = CgroupManager::new(root.path(), CgroupVersion::Auto, "abc");
        assert_eq!(cg.hierarchy(), Hierarchy::V2);
        assert_eq!(cg.cpu_dir(), root.path().join("carte/abc"));
    }

    #[test]
    fn v1_limits_land_in_controller_dirs() {
        let root = tempfile::tempdir().unwrap();
        let cg = CgroupManager::new(root.path(), CgroupVersion::V1, "abc");
        cg.create().unwrap();
        cg.apply(&limits()).unwrap();
        cg.add_process(4242).unwrap();

        let cpu = root.path().join("cpu/carte/abc");
        let mem = root.path().join("memory/carte/abc");
        assert_eq!(read(&cpu.join("cpu.cfs_quota_us")), "50000");
        assert_eq!(read(&cpu.join("cpu.cfs_period_us")), "100000");
        assert_eq!(read(&mem.join("memory.limit_in_bytes")), "104857600");
        assert_eq!(read(&cpu.join("cgroup.procs")), "4242");
        assert_eq!(read(&mem.join("cgroup.procs")), "4242");
    }

    #[test]
    fn v2_limits_use_unified_files() {
        let root = tempfile::tempdir().unwrap();
        let cg = CgroupManager::new(root.path(), CgroupVersion::V2, "abc");
        cg.create().unwrap();
        cg.apply(&limits()).unwrap();

        let dir = root.path().join("carte/abc");
        assert_eq!(read(&dir.join("cpu.max")), "50000 100000");
        assert_eq!(read(&dir.join("memory.max")), "104857600");
    }

    #[test]
    fn create_and_apply_are_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let cg = CgroupManager::new(root.path(), CgroupVersion::V1, "abc");
        cg.create().unwrap();
        cg.apply(&limits()).unwrap();
        cg.create().unwrap();
        cg.apply(&limits()).unwrap();
        assert_eq!(
            read(&root.path().join("memory/carte/abc/memory.limit_in_bytes")),
            "104857600"
        );
    }

    #[test]
    fn destroy_removes_empty_groups_and_tolerates_missing() {
        let root = tempfile::tempdir().unwrap();
        let cg = CgroupManager::new(root.path(), CgroupVersion::V1, "abc");
        cg.create().unwrap();
        cg.destroy().unwrap();
        assert!(!cg.cpu_dir().exists());
        assert!(!cg.memory_dir().exists());
        cg.destroy().unwrap();
    }
}
