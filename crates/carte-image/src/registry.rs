//! Local image catalog management.
//!
//! Maintains an index of available images, keyed by `name:tag`, in
//! `images/catalog.json`. Packages live at `images/<name>/<tag>/package.tar`.
//! Every read-modify-write of the catalog holds `images/catalog.lock`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use carte_common::error::{CarteError, Result};
use carte_common::types::{ImageId, ImageRef};
use carte_core::filesystem::lock::FileLock;

/// Entry in the local image catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageEntry {
    /// Unique identifier for this image.
    pub id: ImageId,
    /// Repository name.
    pub name: String,
    /// Tag.
    pub tag: String,
    /// Ordered list of layer digests (bottom to top).
    pub layers: Vec<String>,
    /// Package size in bytes.
    pub size_bytes: u64,
    /// Creation timestamp (ISO-8601).
    pub created_at: String,
    /// Path of the package archive.
    pub package: PathBuf,
}

impl ImageEntry {
    /// Reference of this entry.
    #[must_use]
    pub fn reference(&self) -> ImageRef {
        ImageRef::new(&self.name, &self.tag)
    }
}

/// Image catalog backed by a JSON file.
#[derive(Debug, Clone)]
pub struct ImageCatalog {
    images_dir: PathBuf,
    catalog_path: PathBuf,
    lock_path: PathBuf,
}

impl ImageCatalog {
    /// Opens or creates an image catalog in the given images directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(images_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(images_dir).map_err(|e| CarteError::io(images_dir, e))?;
        Ok(Self {
            images_dir: images_dir.to_path_buf(),
            catalog_path: images_dir.join("catalog.json"),
            lock_path: images_dir.join("catalog.lock"),
        })
    }

    /// Where the package for `image` is stored.
    #[must_use]
    pub fn package_path(&self, image: &ImageRef) -> PathBuf {
        self.images_dir
            .join(&image.name)
            .join(&image.tag)
            .join("package.tar")
    }

    /// Lists all images in the catalog, sorted by reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog file cannot be read or parsed.
    pub fn list(&self) -> Result<Vec<ImageEntry>> {
        let mut entries = self.read_entries()?;
        entries.sort_by(|a, b| (&a.name, &a.tag).cmp(&(&b.name, &b.tag)));
        Ok(entries)
    }

    /// Finds an image by reference.
    ///
    /// # Errors
    ///
    /// Returns [`CarteError::NotFound`] if the image is not in the catalog.
    pub fn get(&self, image: &ImageRef) -> Result<ImageEntry> {
        self.read_entries()?
            .into_iter()
            .find(|e| e.name == image.name && e.tag == image.tag)
            .ok_or_else(|| CarteError::NotFound {
                kind: "image",
                id: image.to_string(),
            })
    }

    /// Registers an image, replacing any entry with the same reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be read or written.
    pub fn register(&self, entry: ImageEntry) -> Result<()> {
        let _lock = FileLock::exclusive(&self.lock_path)?;
        let mut entries = self.read_entries()?;
        entries.retain(|e| !(e.name == entry.name && e.tag == entry.tag));
        tracing::info!(image = %entry.reference(), id = %entry.id.short(), "image registered");
        entries.push(entry);
        self.write_entries(&entries)
    }

    /// Removes an image by reference.
    ///
    /// # Errors
    ///
    /// Returns [`CarteError::NotFound`] if no such image exists.
    pub fn remove(&self, image: &ImageRef) -> Result<()> {
        let _lock = FileLock::exclusive(&self.lock_path)?;
        let mut entries = self.read_entries()?;
        let before = entries.len();
        entries.retain(|e| !(e.name == image.name && e.tag == image.tag));
        if entries.len() == before {
            return Err(CarteError::NotFound {
                kind: "image",
                id: image.to_string(),
            });
        }
        self.write_entries(&entries)
    }

    fn read_entries(&self) -> Result<Vec<ImageEntry>> {
        let content = match std::fs::read_to_string(&self.catalog_path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CarteError::io(&self.catalog_path, e)),
        };
        Ok(serde_json::from_str(&content)?)
    }

    fn write_entries(&self, entries: &[ImageEntry]) -> Result<()> {
        let json = serde_json::to_string_pretty(entries)?;
        let tmp = self.catalog_path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| CarteError::io(&tmp, e))?;
        std::fs::rename(&tmp, &self.catalog_path).map_err(|e| CarteError::io(&self.catalog_path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_entry(id: &str, name: &str, tag: &str) -> ImageEntry {
        ImageEntry {
            id: ImageId::new(id),
            name: name.into(),
            tag: tag.into(),
            layers: vec!["sha256:abc123".into()],
            size_bytes: 1024,
            created_at: "2026-01-01T00:00:00Z".into(),
            package: PathBuf::from(format!("/images/{name}/{tag}/package.tar")),
        }
    }

    #[test]
    fn catalog_empty_on_first_open() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let catalog = ImageCatalog::open(dir.path()).expect("open failed");
        assert!(catalog.list().expect("list failed").is_empty());
    }

    #[test]
    fn catalog_register_and_get() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let catalog = ImageCatalog::open(dir.path()).expect("open failed");

        catalog
            .register(make_entry("img-1", "alpine", "latest"))
            .expect("register failed");

        let entry = catalog.get(&ImageRef::parse("alpine").unwrap()).expect("get failed");
        assert_eq!(entry.id, ImageId::new("img-1"));
        assert_eq!(entry.size_bytes, 1024);
    }

    #[test]
    fn register_replaces_same_reference() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let catalog = ImageCatalog::open(dir.path()).expect("open failed");

        catalog.register(make_entry("img-1", "web", "v1")).unwrap();
        catalog.register(make_entry("img-2", "web", "v1")).unwrap();
        catalog.register(make_entry("img-3", "web", "v2")).unwrap();

        let entries = catalog.list().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, ImageId::new("img-2"));
        assert_eq!(entries[1].tag, "v2");
    }

    #[test]
    fn catalog_remove_existing_image() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let catalog = ImageCatalog::open(dir.path()).expect("open failed");

        catalog.register(make_entry("img-1", "alpine", "latest")).unwrap();
        catalog.remove(&ImageRef::new("alpine", "latest")).expect("remove failed");
        assert!(catalog.list().expect("list failed").is_empty());
    }

    #[test]
    fn missing_image_is_not_found() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let catalog = ImageCatalog::open(dir.path()).expect("open failed");
        let missing = ImageRef::new("nonexistent", "latest");
        assert!(matches!(catalog.get(&missing), Err(CarteError::NotFound { .. })));
        assert!(catalog.remove(&missing).is_err());
    }

    #[test]
    fn package_path_follows_layout() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let catalog = ImageCatalog::open(dir.path()).expect("open failed");
        let path = catalog.package_path(&ImageRef::new("web", "v1"));
        assert!(path.ends_with("web/v1/package.tar"));
    }
}
