//! Container State Store.
//!
//! One JSON file per container at `state/<name>.json`, replaced atomically
//! via a temporary file and rename. Operations on the same container are
//! serialized by `state/<name>.lock`; different containers never contend.

use std::path::{Path, PathBuf};

use carte_common::error::{CarteError, Result};
use carte_core::filesystem::lock::FileLock;

use crate::container::ContainerRecord;

/// Persists container records.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Opens the store, creating its directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| CarteError::io(&dir, e))?;
        Ok(Self { dir })
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    /// Takes the per-container lock; hold it across load, modify, and save.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be opened or locked.
    pub fn lock(&self, name: &str) -> Result<FileLock> {
        FileLock::exclusive(&self.dir.join(format!("{name}.lock")))
    }

    /// Loads a record if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn try_load(&self, name: &str) -> Result<Option<ContainerRecord>> {
        let path = self.record_path(name);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CarteError::io(path, e)),
        }
    }

    /// Loads a record.
    ///
    /// # Errors
    ///
    /// Returns [`CarteError::NotFound`] if no record exists.
    pub fn load(&self, name: &str) -> Result<ContainerRecord> {
        self.try_load(name)?.ok_or_else(|| CarteError::NotFound {
            kind: "container",
            id: name.to_string(),
        })
    }

    /// Writes a record atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, record: &ContainerRecord) -> Result<()> {
        let path = self.record_path(&record.name);
        let tmp = self.dir.join(format!(".{}.json.tmp", record.name));
        std::fs::write(&tmp, serde_json::to_vec_pretty(record)?).map_err(|e| CarteError::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| CarteError::io(&path, e))?;
        tracing::debug!(container = %record.name, status = %record.status, "record saved");
        Ok(())
    }

    /// Deletes a record; a missing record is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn delete(&self, name: &str) -> Result<()> {
        let path = self.record_path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CarteError::io(path, e)),
        }
    }

    /// All records, sorted by name.
    ///
    /// Unreadable records are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub fn list(&self) -> Result<Vec<ContainerRecord>> {
        let listing = std::fs::read_dir(&self.dir).map_err(|e| CarteError::io(&self.dir, e))?;
        let mut records = Vec::new();
        for entry in listing {
            let path = entry.map_err(|e| CarteError::io(&self.dir, e))?.path();
            if !is_record_file(&path) {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(|e| CarteError::io(&path, e))
                .and_then(|content| Ok(serde_json::from_str::<ContainerRecord>(&content)?))
            {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable record"),
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }
}

fn is_record_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
        && path
            .file_name()
            .is_some_and(|name| !name.to_string_lossy().starts_with('.'))
}

#[cfg(test)]
mod tests {
    use carte_common::types::{ContainerId, ResourceGrant};

    use super::*;

    fn record(name: &str) -> ContainerRecord {
        ContainerRecord::running(
            ContainerId::generate(),
            name,
            "img:latest",
            1,
            ResourceGrant::new("10%", "1M"),
            None,
        )
    }

    #[test]
    fn save_load_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let r = record("web");
        store.save(&r).unwrap();
        assert_eq!(store.load("web").unwrap(), r);

        store.delete("web").unwrap();
        assert!(matches!(store.load("web"), Err(CarteError::NotFound { .. })));
        store.delete("web").unwrap();
    }

    #[test]
    fn list_is_sorted_and_skips_junk() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        store.save(&record("zeta")).unwrap();
        store.save(&record("alpha")).unwrap();
        std::fs::write(dir.path().join("broken.json"), "{").unwrap();
        let _lock = store.lock("alpha").unwrap();

        let names: Vec<_> = store.list().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, ["alpha", "zeta"]);
    }

    #[test]
    fn lock_is_exclusive_per_container() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let held = store.lock("a").unwrap();
        assert!(FileLock::try_exclusive(held.path()).unwrap().is_none());
        assert!(FileLock::try_exclusive(&dir.path().join("b.lock")).unwrap().is_some());
    }
}
