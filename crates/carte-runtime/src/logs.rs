//! Container log management.
//!
//! A container's stdout and stderr go to `containers/<name>/container.log`.
//! Restarts append to the same file.

use std::path::{Path, PathBuf};

use carte_common::error::{CarteError, Result};

/// Returns the log file path for a container.
#[must_use]
pub fn log_path(containers_dir: &Path, name: &str) -> PathBuf {
    containers_dir.join(name).join("container.log")
}

/// Reads container logs from disk.
///
/// Returns an empty string if the log file does not exist yet.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub fn read_logs(containers_dir: &Path, name: &str) -> Result<String> {
    let path = log_path(containers_dir, name);
    match std::fs::read(&path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(CarteError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_path_is_constructed_correctly() {
        let p = log_path(Path::new("/var/lib/carte/containers"), "web");
        assert_eq!(p.to_str().unwrap(), "/var/lib/carte/containers/web/container.log");
    }

    #[test]
    fn read_logs_missing_file_returns_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let content = read_logs(dir.path(), "nonexistent").expect("should succeed");
        assert!(content.is_empty());
    }

    #[test]
    fn separate_containers_have_separate_logs() {
        let dir = tempfile::tempdir().expect("tempdir");
        for (name, line) in [("a", "from a"), ("b", "from b")] {
            let path = log_path(dir.path(), name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, line).unwrap();
        }

        let a_logs = read_logs(dir.path(), "a").expect("read a");
        let b_logs = read_logs(dir.path(), "b").expect("read b");
        assert_eq!(a_logs, "from a");
        assert_eq!(b_logs, "from b");
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = log_path(dir.path(), "bin");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, [b'o', b'k', 0xff]).unwrap();
        assert!(read_logs(dir.path(), "bin").unwrap().starts_with("ok"));
    }
}
