//! Base image import from local sources.
//!
//! Supports `file://` (a root filesystem directory) and `tar://` (a root
//! filesystem archive, optionally gzip-compressed). Remote registries are
//! not contacted; base images must be imported before they can be named
//! in `FROM`.

use std::path::{Path, PathBuf};

use carte_common::error::{CarteError, Result};
use carte_common::types::{ImageRef, Sha256Hash};

use crate::layer;
use crate::package::{self, ImageConfig};
use crate::registry::{ImageCatalog, ImageEntry};

/// Supported image source protocols.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Local directory (`file:///path/to/rootfs`).
    File(PathBuf),
    /// Local tar archive (`tar:///path/to/rootfs.tar[.gz]`).
    Tar(PathBuf),
}

/// Resolves an image source URI into an `ImageSource`.
///
/// # Errors
///
/// Returns an error if the URI scheme is unsupported or the path is missing.
pub fn resolve_source(uri: &str) -> Result<ImageSource> {
    if let Some(path_str) = uri.strip_prefix("file://") {
        let path = PathBuf::from(path_str);
        if !path.is_dir() {
            return Err(CarteError::NotFound {
                kind: "image directory",
                id: path_str.to_string(),
            });
        }
        tracing::debug!(path = %path.display(), "resolved file:// source");
        Ok(ImageSource::File(path))
    } else if let Some(path_str) = uri.strip_prefix("tar://") {
        let path = PathBuf::from(path_str);
        if !path.is_file() {
            return Err(CarteError::NotFound {
                kind: "tar archive",
                id: path_str.to_string(),
            });
        }
        tracing::debug!(path = %path.display(), "resolved tar:// source");
        Ok(ImageSource::Tar(path))
    } else {
        Err(CarteError::validation(format!(
            "unsupported image source '{uri}': use file:// or tar://"
        )))
    }
}

/// Imports a base image from `uri` and registers it as `image`.
///
/// The source becomes the single layer of the new image. `tmp_dir` holds
/// intermediate archives and is left empty afterwards.
///
/// # Errors
///
/// Returns an error if the source cannot be read or the package written.
pub fn import_image(
    catalog: &ImageCatalog,
    tmp_dir: &Path,
    image: &ImageRef,
    uri: &str,
) -> Result<ImageEntry> {
    let source = resolve_source(uri)?;
    std::fs::create_dir_all(tmp_dir).map_err(|e| CarteError::io(tmp_dir, e))?;
    let layer_tar = tmp_dir.join(format!("import-{}.tar", uuid::Uuid::new_v4().simple()));

    let result = stage_layer(&source, &layer_tar).and_then(|()| {
        let config = ImageConfig {
            workdir: "/".into(),
            ..ImageConfig::default()
        };
        let out = catalog.package_path(image);
        let written = package::write_package(&out, image, &config, std::slice::from_ref(&layer_tar))?;
        Ok(ImageEntry {
            id: written.id,
            name: image.name.clone(),
            tag: image.tag.clone(),
            layers: written.layers.iter().map(Sha256Hash::to_string).collect(),
            size_bytes: written.size_bytes,
            created_at: chrono::Utc::now().to_rfc3339(),
            package: out,
        })
    });
    if layer_tar.exists() {
        let _ = std::fs::remove_file(&layer_tar);
    }

    let entry = result?;
    catalog.register(entry.clone())?;
    tracing::info!(image = %image, source = uri, "base image imported");
    Ok(entry)
}

fn stage_layer(source: &ImageSource, out: &Path) -> Result<()> {
    match source {
        ImageSource::File(dir) => {
            let _ = layer::write_tree(dir, out)?;
        }
        ImageSource::Tar(archive) if is_gzip(archive) => {
            let input = std::fs::File::open(archive).map_err(|e| CarteError::io(archive, e))?;
            let mut decoder = flate2::read::GzDecoder::new(input);
            let mut output = std::fs::File::create(out).map_err(|e| CarteError::io(out, e))?;
            let _ = std::io::copy(&mut decoder, &mut output).map_err(|e| CarteError::io(archive, e))?;
        }
        ImageSource::Tar(archive) => {
            let _ = std::fs::copy(archive, out).map_err(|e| CarteError::io(archive, e))?;
        }
    }
    Ok(())
}

fn is_gzip(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz") || ext.eq_ignore_ascii_case("tgz"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_file_source_existing_dir_returns_file() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let uri = format!("file://{}", dir.path().display());
        let source = resolve_source(&uri).expect("resolve failed");
        assert!(matches!(source, ImageSource::File(_)));
    }

    #[test]
    fn resolve_tar_source_existing_file_returns_tar() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let tar_path = dir.path().join("test.tar");
        std::fs::write(&tar_path, b"fake tar").expect("failed to write");
        let uri = format!("tar://{}", tar_path.display());
        let source = resolve_source(&uri).expect("resolve failed");
        assert!(matches!(source, ImageSource::Tar(_)));
    }

    #[test]
    fn remote_sources_are_refused() {
        assert!(resolve_source("https://example.com/image.tar").unwrap_err().is_validation());
        assert!(resolve_source("ftp://example.com/image").is_err());
    }

    #[test]
    fn resolve_missing_paths_return_error() {
        assert!(resolve_source("file:///nonexistent/path").is_err());
        assert!(resolve_source("tar:///nonexistent/archive.tar").is_err());
    }

    #[test]
    fn directory_import_registers_single_layer_image() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("rootfs");
        std::fs::create_dir_all(rootfs.join("etc")).unwrap();
        std::fs::write(rootfs.join("etc/os-release"), "ID=test\n").unwrap();

        let catalog = ImageCatalog::open(&dir.path().join("images")).unwrap();
        let image = ImageRef::new("base", "latest");
        let uri = format!("file://{}", rootfs.display());
        let entry = import_image(&catalog, &dir.path().join("tmp"), &image, &uri).unwrap();

        assert_eq!(entry.layers.len(), 1);
        assert_eq!(catalog.get(&image).unwrap().id, entry.id);
        let package = package::read_package(&entry.package).unwrap();
        assert_eq!(package.config.config.workdir, "/");
        assert_eq!(std::fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
    }
}
