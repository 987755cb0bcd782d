//! Image packages: self-describing tar archives of an image.
//!
//! A package holds `manifest.json`, `config.json`, and one
//! `<digest-hex>/layer.tar` per distinct layer. The manifest lists layers in
//! apply order (a digest may repeat, e.g. for empty layers); the image ID is
//! the digest of `config.json`.

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use carte_common::error::{CarteError, Result};
use carte_common::types::{ImageId, ImageRef, Sha256Hash};

use crate::hash;
use crate::layer::{self, Layer};

const MANIFEST_ENTRY: &str = "manifest.json";
const CONFIG_ENTRY: &str = "config.json";

/// Runtime defaults carried by an image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ImageConfig {
    /// Working directory for the container process.
    pub workdir: String,
    /// Entrypoint argv.
    pub entrypoint: Vec<String>,
    /// Default command; appended to the entrypoint when both are set.
    pub cmd: Vec<String>,
    /// Documented ports.
    pub exposed_ports: Vec<String>,
    /// Environment as `KEY=VALUE`.
    pub env_vars: Vec<String>,
    /// Reference of the image this one was built from.
    pub base_image: String,
}

impl ImageConfig {
    /// Sets `key`, replacing an earlier definition.
    pub fn set_env(&mut self, key: &str, value: &str) {
        let prefix = format!("{key}=");
        self.env_vars.retain(|kv| !kv.starts_with(&prefix));
        self.env_vars.push(format!("{key}={value}"));
    }

    /// The argv a container runs: entrypoint followed by command.
    #[must_use]
    pub fn process_args(&self) -> Vec<String> {
        self.entrypoint.iter().chain(&self.cmd).cloned().collect()
    }
}

/// Layer list of the root filesystem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    /// Always `layers`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Layer digests in apply order.
    pub diff_ids: Vec<String>,
}

/// Contents of `config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    /// CPU architecture.
    pub architecture: String,
    /// Operating system.
    pub os: String,
    /// Creation timestamp (RFC 3339).
    pub created: String,
    /// Runtime defaults.
    pub config: ImageConfig,
    /// Layer list.
    pub rootfs: RootFs,
}

/// Contents of `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PackageManifest {
    /// Entry name of the config file.
    pub config: String,
    /// `name:tag` references.
    pub repo_tags: Vec<String>,
    /// Entry names of the layer archives, in apply order.
    pub layers: Vec<String>,
}

/// Metadata of a package read back from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePackage {
    /// Digest of `config.json`.
    pub id: ImageId,
    /// Parsed manifest.
    pub manifest: PackageManifest,
    /// Parsed config.
    pub config: ConfigFile,
}

impl ImagePackage {
    /// Layer digests in apply order.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed layer entries.
    pub fn layer_digests(&self) -> Result<Vec<Sha256Hash>> {
        self.manifest.layers.iter().map(|entry| digest_of_entry(entry)).collect()
    }
}

/// Summary of a freshly written package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenPackage {
    /// Image ID.
    pub id: ImageId,
    /// Layer digests in apply order.
    pub layers: Vec<Sha256Hash>,
    /// Package size in bytes.
    pub size_bytes: u64,
}

/// Writes a package for `image` to `out`, atomically.
///
/// The archive is assembled next to `out` and renamed over it only once
/// complete.
///
/// # Errors
///
/// Returns an error if a layer cannot be read or the archive written.
pub fn write_package(
    out: &Path,
    image: &ImageRef,
    config: &ImageConfig,
    layer_tars: &[PathBuf],
) -> Result<WrittenPackage> {
    if layer_tars.len() > carte_common::constants::MAX_IMAGE_LAYERS {
        return Err(CarteError::validation(format!(
            "image {image} has {} layers; the maximum is {}",
            layer_tars.len(),
            carte_common::constants::MAX_IMAGE_LAYERS
        )));
    }
    let layers: Vec<Layer> = layer_tars
        .iter()
        .map(|p| Layer::from_archive(p))
        .collect::<Result<_>>()?;

    let config_file = ConfigFile {
        architecture: std::env::consts::ARCH.to_string(),
        os: std::env::consts::OS.to_string(),
        created: chrono::Utc::now().to_rfc3339(),
        config: config.clone(),
        rootfs: RootFs {
            kind: "layers".into(),
            diff_ids: layers.iter().map(|l| l.hash.to_string()).collect(),
        },
    };
    let config_bytes = serde_json::to_vec_pretty(&config_file)?;
    let id = ImageId::new(hash::hash_bytes(&config_bytes).as_hex());

    let manifest = PackageManifest {
        config: CONFIG_ENTRY.into(),
        repo_tags: vec![image.to_string()],
        layers: layers.iter().map(|l| layer_entry(&l.hash)).collect(),
    };
    let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;

    let parent = out.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| CarteError::io(parent, e))?;
    let staging = parent.join(format!(".package-{}.tmp", uuid::Uuid::new_v4().simple()));
    let result = write_archive(&staging, &manifest_bytes, &config_bytes, &layers, layer_tars)
        .and_then(|()| std::fs::rename(&staging, out).map_err(|e| CarteError::io(out, e)));
    if let Err(e) = result {
        let _ = std::fs::remove_file(&staging);
        return Err(e);
    }

    let size_bytes = std::fs::metadata(out).map_err(|e| CarteError::io(out, e))?.len();
    tracing::info!(image = %image, id = %id.short(), layers = layers.len(), "image package written");
    Ok(WrittenPackage {
        id,
        layers: layers.into_iter().map(|l| l.hash).collect(),
        size_bytes,
    })
}

fn write_archive(
    path: &Path,
    manifest: &[u8],
    config: &[u8],
    layers: &[Layer],
    layer_tars: &[PathBuf],
) -> Result<()> {
    let file = File::create(path).map_err(|e| CarteError::io(path, e))?;
    let mut builder = tar::Builder::new(file);
    let io_err = |e: std::io::Error| CarteError::io(path, e);

    append_bytes(&mut builder, MANIFEST_ENTRY, manifest).map_err(io_err)?;
    append_bytes(&mut builder, CONFIG_ENTRY, config).map_err(io_err)?;
    let mut written = HashSet::new();
    for (layer, tar_path) in layers.iter().zip(layer_tars) {
        if written.insert(layer.hash.clone()) {
            let mut src = File::open(tar_path).map_err(|e| CarteError::io(tar_path, e))?;
            builder
                .append_file(layer_entry(&layer.hash), &mut src)
                .map_err(io_err)?;
        }
    }
    let file = builder.into_inner().map_err(io_err)?;
    file.sync_all().map_err(io_err)
}

fn append_bytes<W: std::io::Write>(builder: &mut tar::Builder<W>, name: &str, data: &[u8]) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    builder.append_data(&mut header, name, data)
}

fn layer_entry(digest: &Sha256Hash) -> String {
    format!("{}/layer.tar", digest.as_hex())
}

fn digest_of_entry(entry: &str) -> Result<Sha256Hash> {
    entry
        .strip_suffix("/layer.tar")
        .ok_or_else(|| CarteError::validation(format!("malformed layer entry: {entry}")))
        .and_then(Sha256Hash::from_hex)
}

/// Reads `manifest.json` and `config.json` from a package.
///
/// # Errors
///
/// Returns an error if the archive is unreadable or lacks either file.
pub fn read_package(path: &Path) -> Result<ImagePackage> {
    let file = File::open(path).map_err(|e| CarteError::io(path, e))?;
    let mut archive = tar::Archive::new(file);
    let io_err = |e: std::io::Error| CarteError::io(path, e);

    let mut manifest = None;
    let mut config = None;
    for entry in archive.entries().map_err(io_err)? {
        let mut entry = entry.map_err(io_err)?;
        let name = entry.path().map_err(io_err)?.to_string_lossy().into_owned();
        if name == MANIFEST_ENTRY || name == CONFIG_ENTRY {
            let mut buf = Vec::new();
            let _ = entry.read_to_end(&mut buf).map_err(io_err)?;
            if name == MANIFEST_ENTRY {
                manifest = Some(buf);
            } else {
                config = Some(buf);
            }
        }
        if manifest.is_some() && config.is_some() {
            break;
        }
    }

    let missing = |what: &str| CarteError::validation(format!("{} has no {what}", path.display()));
    let manifest_bytes = manifest.ok_or_else(|| missing(MANIFEST_ENTRY))?;
    let config_bytes = config.ok_or_else(|| missing(CONFIG_ENTRY))?;
    Ok(ImagePackage {
        id: ImageId::new(hash::hash_bytes(&config_bytes).as_hex()),
        manifest: serde_json::from_slice(&manifest_bytes)?,
        config: serde_json::from_slice(&config_bytes)?,
    })
}

/// Unpacks a package's layer archives into `dest`, verifying each digest.
///
/// Returns the archive paths in apply order.
///
/// # Errors
///
/// Returns an error on unreadable archives or digest mismatches.
pub fn unpack_layers(path: &Path, dest: &Path) -> Result<(ImagePackage, Vec<PathBuf>)> {
    let package = read_package(path)?;
    std::fs::create_dir_all(dest).map_err(|e| CarteError::io(dest, e))?;
    let file = File::open(path).map_err(|e| CarteError::io(path, e))?;
    let mut archive = tar::Archive::new(file);
    archive
        .unpack(dest)
        .map_err(|e| CarteError::io(dest, e))?;

    let mut tars = Vec::with_capacity(package.manifest.layers.len());
    for (entry, digest) in package.manifest.layers.iter().zip(package.layer_digests()?) {
        let tar_path = dest.join(entry);
        hash::validate_hash(&tar_path, &digest)?;
        tars.push(tar_path);
    }
    Ok((package, tars))
}

/// Materializes a package's root filesystem at `target`.
///
/// `scratch` receives the unpacked layer archives and is removed afterwards.
///
/// # Errors
///
/// Returns an error if unpacking or applying a layer fails.
pub fn extract_rootfs(path: &Path, target: &Path, scratch: &Path) -> Result<ImagePackage> {
    let result = unpack_layers(path, scratch).and_then(|(package, tars)| {
        for tar_path in &tars {
            let _ = layer::extract_layer(tar_path, target)?;
        }
        Ok(package)
    });
    if let Err(e) = std::fs::remove_dir_all(scratch) {
        tracing::warn!(path = %scratch.display(), error = %e, "failed to remove scratch directory");
    }
    let package = result?;
    tracing::info!(id = %package.id.short(), target = %target.display(), "root filesystem extracted");
    Ok(package)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer_with(dir: &Path, name: &str, content: &str) -> PathBuf {
        let root = dir.join(format!("src-{name}"));
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join(name), content).unwrap();
        let out = dir.join(format!("{name}.tar"));
        let _ = layer::write_tree(&root, &out).unwrap();
        out
    }

    fn sample_config() -> ImageConfig {
        ImageConfig {
            workdir: "/app".into(),
            entrypoint: vec!["/bin/sh".into()],
            cmd: vec!["-c".into(), "echo hi".into()],
            exposed_ports: vec!["80".into()],
            env_vars: vec!["X=1".into()],
            base_image: "base:latest".into(),
        }
    }

    #[test]
    fn config_serializes_with_pascal_case_keys() {
        let json = serde_json::to_value(sample_config()).unwrap();
        assert_eq!(json["EnvVars"][0], "X=1");
        assert_eq!(json["Workdir"], "/app");
        assert_eq!(json["BaseImage"], "base:latest");
    }

    #[test]
    fn set_env_replaces_existing_key() {
        let mut config = ImageConfig::default();
        config.set_env("X", "1");
        config.set_env("Y", "2");
        config.set_env("X", "3");
        assert_eq!(config.env_vars, ["Y=2", "X=3"]);
    }

    #[test]
    fn package_round_trips_config_and_layers() {
        let dir = tempfile::tempdir().unwrap();
        let a = layer_with(dir.path(), "a.txt", "alpha");
        let empty = dir.path().join("empty.tar");
        let _ = layer::write_empty(&empty).unwrap();
        let b = layer_with(dir.path(), "b.txt", "beta");
        let empty2 = dir.path().join("empty2.tar");
        let _ = layer::write_empty(&empty2).unwrap();

        let out = dir.path().join("images/web/v1/package.tar");
        let image = ImageRef::new("web", "v1");
        let written =
            write_package(&out, &image, &sample_config(), &[a, empty, b, empty2]).unwrap();
        assert_eq!(written.layers.len(), 4);
        assert_eq!(written.layers[1], written.layers[3]);

        let package = read_package(&out).unwrap();
        assert_eq!(package.id, written.id);
        assert_eq!(package.config.config, sample_config());
        assert_eq!(package.manifest.repo_tags, ["web:v1"]);
        assert_eq!(package.config.rootfs.diff_ids.len(), 4);
        assert_eq!(package.layer_digests().unwrap(), written.layers);

        let rootfs = dir.path().join("rootfs");
        let _ = extract_rootfs(&out, &rootfs, &dir.path().join("scratch")).unwrap();
        assert_eq!(std::fs::read_to_string(rootfs.join("a.txt")).unwrap(), "alpha");
        assert_eq!(std::fs::read_to_string(rootfs.join("b.txt")).unwrap(), "beta");
        assert!(!dir.path().join("scratch").exists());
    }

    #[test]
    fn read_rejects_archives_without_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = layer_with(dir.path(), "x", "y");
        assert!(read_package(&bogus).unwrap_err().is_validation());
    }

    #[test]
    fn failed_write_leaves_no_package() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("package.tar");
        let missing = dir.path().join("missing.tar");
        let image = ImageRef::new("web", "v1");
        assert!(write_package(&out, &image, &ImageConfig::default(), &[missing]).is_err());
        assert!(!out.exists());
    }
}
