//! Layer Store: content-addressed cache of instruction-produced layers.
//!
//! Entries live under `layers/<key>/` as `layer.tar` plus `layer.json`.
//! An entry is assembled in a private temporary directory and renamed into
//! place, so readers never observe a partial entry and a key is written at
//! most once.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use carte_common::error::{CarteError, Result};
use carte_common::types::Sha256Hash;

use crate::layer::Layer;

const LAYER_FILE: &str = "layer.tar";
const META_FILE: &str = "layer.json";

/// Metadata stored next to a cached layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedLayer {
    /// Cache key the layer was stored under.
    pub key: String,
    /// Digest of `layer.tar`.
    pub digest: Sha256Hash,
    /// Size of `layer.tar` in bytes.
    pub size_bytes: u64,
    /// Instruction text that produced the layer.
    pub instruction: String,
    /// Creation timestamp (RFC 3339).
    pub created_at: String,
    /// Absolute path of the archive; derived, not persisted.
    #[serde(skip)]
    pub path: PathBuf,
}

/// Manages the on-disk layer cache.
#[derive(Debug, Clone)]
pub struct LayerStore {
    /// Root directory for all cached layers.
    root: PathBuf,
}

impl LayerStore {
    /// Opens or initializes the store at the given directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| CarteError::io(&root, e))?;
        tracing::debug!(path = %root.display(), "opened layer store");
        Ok(Self { root })
    }

    /// Returns the root storage path.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the directory of an entry.
    #[must_use]
    pub fn layer_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Looks up a cached layer.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed keys or unreadable metadata.
    pub fn lookup(&self, key: &str) -> Result<Option<CachedLayer>> {
        let key = validate_key(key)?;
        let dir = self.layer_path(key);
        let meta_path = dir.join(META_FILE);
        let content = match std::fs::read_to_string(&meta_path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CarteError::io(meta_path, e)),
        };
        let mut cached: CachedLayer = serde_json::from_str(&content)?;
        cached.path = dir.join(LAYER_FILE);
        Ok(Some(cached))
    }

    /// Stores `layer_tar` under `key`, consuming the source file.
    ///
    /// If another writer stored the key first, its entry is returned and the
    /// source file is discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be written.
    pub fn store(&self, key: &str, instruction: &str, layer_tar: &Path) -> Result<CachedLayer> {
        let key = validate_key(key)?;
        if let Some(existing) = self.lookup(key)? {
            remove_file_quietly(layer_tar);
            return Ok(existing);
        }

        let staging = self.root.join(format!(".tmp-{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&staging).map_err(|e| CarteError::io(&staging, e))?;
        let result = self.stage_and_commit(key, instruction, layer_tar, &staging);
        if staging.exists() {
            let _ = std::fs::remove_dir_all(&staging);
        }
        result
    }

    fn stage_and_commit(
        &self,
        key: &str,
        instruction: &str,
        layer_tar: &Path,
        staging: &Path,
    ) -> Result<CachedLayer> {
        let staged_tar = staging.join(LAYER_FILE);
        if std::fs::rename(layer_tar, &staged_tar).is_err() {
            let _ = std::fs::copy(layer_tar, &staged_tar).map_err(|e| CarteError::io(layer_tar, e))?;
            remove_file_quietly(layer_tar);
        }
        let layer = Layer::from_archive(&staged_tar)?;
        let mut cached = CachedLayer {
            key: key.to_string(),
            digest: layer.hash,
            size_bytes: layer.size_bytes,
            instruction: instruction.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            path: PathBuf::new(),
        };
        let meta_path = staging.join(META_FILE);
        std::fs::write(&meta_path, serde_json::to_vec_pretty(&cached)?)
            .map_err(|e| CarteError::io(&meta_path, e))?;

        let dest = self.layer_path(key);
        match std::fs::rename(staging, &dest) {
            Ok(()) => {
                tracing::debug!(key, digest = %cached.digest, "layer cached");
                cached.path = dest.join(LAYER_FILE);
                Ok(cached)
            }
            Err(e) if dest.join(META_FILE).exists() => {
                tracing::debug!(key, error = %e, "layer cached concurrently, adopting existing entry");
                self.lookup(key)?.ok_or_else(|| CarteError::io(&dest, e))
            }
            Err(e) => Err(CarteError::io(dest, e)),
        }
    }
}

fn validate_key(key: &str) -> Result<&str> {
    Sha256Hash::from_hex(key).map(|_| key).map_err(|_| {
        CarteError::validation(format!("invalid layer cache key: {key}"))
    })
}

fn remove_file_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::debug!(path = %path.display(), error = %e, "could not remove staged layer");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(c: char) -> String {
        std::iter::repeat_n(c, 64).collect()
    }

    fn make_layer(dir: &Path, name: &str) -> PathBuf {
        let root = dir.join(format!("{name}-root"));
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join(name), name).unwrap();
        let out = dir.join(format!("{name}.tar"));
        let _ = crate::layer::write_tree(&root, &out).unwrap();
        out
    }

    #[test]
    fn lookup_misses_on_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = LayerStore::open(dir.path().join("layers")).unwrap();
        assert!(store.lookup(&key('a')).unwrap().is_none());
    }

    #[test]
    fn store_then_lookup_returns_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = LayerStore::open(dir.path().join("layers")).unwrap();
        let tar = make_layer(dir.path(), "one");

        let stored = store.store(&key('a'), "RUN echo hi", &tar).unwrap();
        assert!(!tar.exists());
        assert!(stored.path.exists());

        let found = store.lookup(&key('a')).unwrap().unwrap();
        assert_eq!(found.digest, stored.digest);
        assert_eq!(found.instruction, "RUN echo hi");
        assert_eq!(found.path, store.layer_path(&key('a')).join(LAYER_FILE));
    }

    #[test]
    fn second_store_keeps_first_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = LayerStore::open(dir.path().join("layers")).unwrap();
        let first = store.store(&key('b'), "RUN a", &make_layer(dir.path(), "first")).unwrap();
        let second = store.store(&key('b'), "RUN a", &make_layer(dir.path(), "second")).unwrap();
        assert_eq!(first.digest, second.digest);
    }

    #[test]
    fn malformed_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = LayerStore::open(dir.path()).unwrap();
        assert!(store.lookup("../escape").is_err());
    }

    #[test]
    fn no_staging_directories_survive() {
        let dir = tempfile::tempdir().unwrap();
        let store = LayerStore::open(dir.path().join("layers")).unwrap();
        let _ = store.store(&key('c'), "RUN x", &make_layer(dir.path(), "x")).unwrap();
        let leftovers = std::fs::read_dir(store.root())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().starts_with(".tmp-"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
