//! Filesystem layer archives.
//!
//! A layer is an uncompressed tar of the entries an instruction added or
//! changed. Deletions are recorded as empty `.wh.<name>` whiteout files next
//! to the removed entry. Layers are produced by diffing two [`Snapshot`]s of
//! the build root and applied in order with [`extract_layer`].

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};

use carte_common::error::{CarteError, Result};
use carte_common::types::Sha256Hash;

/// Prefix marking a deleted entry.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Whiteout clearing every pre-existing entry of its directory.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Paths never captured in a snapshot.
const EXCLUDED: [&str; 1] = [carte_core::filesystem::rootfs::PIVOT_OLD_DIR];

/// A single filesystem layer archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    /// Content-addressed hash of the archive.
    pub hash: Sha256Hash,
    /// Size of the archive in bytes.
    pub size_bytes: u64,
}

impl Layer {
    /// Describes an existing archive on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the archive cannot be read.
    pub fn from_archive(path: &Path) -> Result<Self> {
        let size_bytes = std::fs::metadata(path)
            .map_err(|e| CarteError::io(path, e))?
            .len();
        Ok(Self {
            hash: crate::hash::hash_file(path)?,
            size_bytes,
        })
    }
}

/// Applies a layer archive onto `target`.
///
/// Supports both plain `.tar` and gzip-compressed `.tar.gz` / `.tgz`
/// archives. Whiteouts remove the named entry; entries whose type differs
/// from what is on disk replace it.
///
/// # Errors
///
/// Returns an error if the archive cannot be read or an entry cannot be
/// written.
pub fn extract_layer(archive_path: &Path, target: &Path) -> Result<Layer> {
    tracing::debug!(
        archive = %archive_path.display(),
        target = %target.display(),
        "extracting layer"
    );

    std::fs::create_dir_all(target).map_err(|e| CarteError::io(target, e))?;
    let file = File::open(archive_path).map_err(|e| CarteError::io(archive_path, e))?;

    if is_gzip_archive(archive_path) {
        apply_entries(tar::Archive::new(flate2::read::GzDecoder::new(file)), target)?;
    } else {
        apply_entries(tar::Archive::new(file), target)?;
    }

    let layer = Layer::from_archive(archive_path)?;
    tracing::debug!(hash = %layer.hash, size = layer.size_bytes, "layer applied");
    Ok(layer)
}

fn apply_entries<R: Read>(mut archive: tar::Archive<R>, target: &Path) -> Result<()> {
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);
    archive.set_preserve_ownerships(nix::unistd::geteuid().is_root());

    let io_err = |e: std::io::Error| CarteError::io(target, e);
    for entry in archive.entries().map_err(io_err)? {
        let mut entry = entry.map_err(io_err)?;
        let rel = entry.path().map_err(io_err)?.into_owned();
        let Some(rel) = sanitize(&rel) else {
            tracing::warn!(path = %rel.display(), "skipping layer entry outside root");
            continue;
        };
        let name = rel.file_name().and_then(|n| n.to_str()).unwrap_or_default();

        if name == OPAQUE_WHITEOUT {
            let dir = target.join(rel.parent().unwrap_or(Path::new("")));
            clear_dir(&dir)?;
        } else if let Some(deleted) = name.strip_prefix(WHITEOUT_PREFIX) {
            let victim = target.join(rel.with_file_name(deleted));
            remove_any(&victim)?;
        } else {
            let dest = target.join(&rel);
            let is_dir = entry.header().entry_type().is_dir();
            match std::fs::symlink_metadata(&dest) {
                Ok(meta) if meta.is_dir() && !is_dir => remove_any(&dest)?,
                Ok(meta) if !meta.is_dir() && is_dir => remove_any(&dest)?,
                _ => {}
            }
            let _ = entry.unpack_in(target).map_err(io_err)?;
        }
    }
    Ok(())
}

/// Strips leading `/` and `.`; rejects `..`.
fn sanitize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(p) => out.push(p),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    (!out.as_os_str().is_empty()).then_some(out)
}

fn remove_any(path: &Path) -> Result<()> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    };
    result.map_err(|e| CarteError::io(path, e))
}

fn clear_dir(dir: &Path) -> Result<()> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Ok(());
    };
    for entry in entries {
        let entry = entry.map_err(|e| CarteError::io(dir, e))?;
        remove_any(&entry.path())?;
    }
    Ok(())
}

/// Determines whether the archive is gzip-compressed based on extension.
fn is_gzip_archive(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz") || ext.eq_ignore_ascii_case("tgz"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    File,
    Dir,
    Symlink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    kind: EntryKind,
    size: u64,
    mode: u32,
    uid: u32,
    gid: u32,
    ino: u64,
    mtime: (i64, i64),
    ctime: (i64, i64),
}

/// Metadata of every entry under a root, used to compute layer diffs.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    entries: BTreeMap<PathBuf, Stamp>,
}

impl Snapshot {
    /// Walks `root` without following symlinks.
    ///
    /// Sockets, FIFOs, and device nodes are not captured.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be read.
    pub fn capture(root: &Path) -> Result<Self> {
        let mut snapshot = Self::default();
        snapshot.walk(root, Path::new(""))?;
        Ok(snapshot)
    }

    /// Number of captured entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn walk(&mut self, root: &Path, rel: &Path) -> Result<()> {
        let dir = root.join(rel);
        let entries = std::fs::read_dir(&dir).map_err(|e| CarteError::io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| CarteError::io(&dir, e))?;
            let child = rel.join(entry.file_name());
            if rel.as_os_str().is_empty() && EXCLUDED.iter().any(|x| entry.file_name() == *x) {
                continue;
            }
            let path = entry.path();
            let meta = std::fs::symlink_metadata(&path).map_err(|e| CarteError::io(&path, e))?;
            let file_type = meta.file_type();
            let kind = if file_type.is_dir() {
                EntryKind::Dir
            } else if file_type.is_symlink() {
                EntryKind::Symlink
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                tracing::debug!(path = %path.display(), "skipping special file");
                continue;
            };
            let _ = self.entries.insert(
                child.clone(),
                Stamp {
                    kind,
                    size: meta.size(),
                    mode: meta.mode(),
                    uid: meta.uid(),
                    gid: meta.gid(),
                    ino: meta.ino(),
                    mtime: (meta.mtime(), meta.mtime_nsec()),
                    ctime: (meta.ctime(), meta.ctime_nsec()),
                },
            );
            if kind == EntryKind::Dir {
                self.walk(root, &child)?;
            }
        }
        Ok(())
    }
}

/// Writes the changes between `before` and `after` (both taken of `root`)
/// as a layer archive at `out`.
///
/// # Errors
///
/// Returns an error if the archive cannot be written or an entry read.
pub fn write_diff(root: &Path, before: &Snapshot, after: &Snapshot, out: &Path) -> Result<Layer> {
    let file = File::create(out).map_err(|e| CarteError::io(out, e))?;
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(false);
    let io_err = |e: std::io::Error| CarteError::io(out, e);

    let mut added = 0usize;
    for (rel, stamp) in &after.entries {
        if before.entries.get(rel) != Some(stamp) {
            builder
                .append_path_with_name(root.join(rel), rel)
                .map_err(io_err)?;
            added += 1;
        }
    }

    let mut deleted = 0usize;
    for rel in before.entries.keys() {
        if after.entries.contains_key(rel) {
            continue;
        }
        let parent_also_gone = rel
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .is_some_and(|p| before.entries.contains_key(p) && !after.entries.contains_key(p));
        if parent_also_gone {
            continue;
        }
        let Some(name) = rel.file_name() else {
            continue;
        };
        let mut whiteout_name = std::ffi::OsString::from(WHITEOUT_PREFIX);
        whiteout_name.push(name);
        append_empty_file(&mut builder, &rel.with_file_name(whiteout_name)).map_err(io_err)?;
        deleted += 1;
    }

    let _ = builder.into_inner().map_err(io_err)?;
    let layer = Layer::from_archive(out)?;
    tracing::debug!(added, deleted, hash = %layer.hash, "layer diff written");
    Ok(layer)
}

/// Writes an archive containing every entry under `root`.
///
/// # Errors
///
/// Returns an error if the tree cannot be read or the archive written.
pub fn write_tree(root: &Path, out: &Path) -> Result<Layer> {
    write_diff(root, &Snapshot::default(), &Snapshot::capture(root)?, out)
}

/// Writes a layer with no entries, used by metadata-only instructions.
///
/// # Errors
///
/// Returns an error if the archive cannot be written.
pub fn write_empty(out: &Path) -> Result<Layer> {
    let file = File::create(out).map_err(|e| CarteError::io(out, e))?;
    let _ = tar::Builder::new(file)
        .into_inner()
        .map_err(|e| CarteError::io(out, e))?;
    Layer::from_archive(out)
}

fn append_empty_file<W: std::io::Write>(builder: &mut tar::Builder<W>, path: &Path) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(0);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    builder.append_data(&mut header, path, std::io::empty())
}
