//! Resolving image paths on the host without escaping the image root.
//!
//! Image filesystems routinely contain absolute symlinks (`/bin -> /usr/bin`).
//! Following them from the host would land outside the scratch root, so
//! every symlink met while walking a path is re-rooted at the image root
//! and `..` never climbs above it.

use std::path::{Component, Path, PathBuf};

use carte_common::error::{CarteError, Result};

const MAX_SYMLINKS: usize = 40;

/// Joins `path` (absolute or relative to `/`) onto `root`, following
/// symlinks as the container would see them.
///
/// Components that do not exist yet are appended literally.
///
/// # Errors
///
/// Returns a validation error on symlink loops.
pub fn resolve_in_root(root: &Path, path: &Path) -> Result<PathBuf> {
    let mut resolved = PathBuf::new();
    let mut pending: Vec<PathBuf> = components_rev(path);
    let mut hops = 0;

    while let Some(part) = pending.pop() {
        if part.as_os_str() == ".." {
            let _ = resolved.pop();
            continue;
        }
        let candidate = resolved.join(&part);
        let on_host = root.join(&candidate);
        match std::fs::symlink_metadata(&on_host) {
            Ok(meta) if meta.file_type().is_symlink() => {
                hops += 1;
                if hops > MAX_SYMLINKS {
                    return Err(CarteError::validation(format!(
                        "too many symlinks resolving {}",
                        path.display()
                    )));
                }
                let target = std::fs::read_link(&on_host).map_err(|e| CarteError::io(&on_host, e))?;
                if target.is_absolute() {
                    resolved = PathBuf::new();
                }
                pending.extend(components_rev(&target));
            }
            _ => resolved = candidate,
        }
    }
    Ok(root.join(resolved))
}

/// Lexically joins `path` onto `base` inside the image, clamping `..` at `/`.
///
/// Used for `WORKDIR` and `COPY` destinations, which are image-absolute.
#[must_use]
pub fn join_image_path(base: &str, path: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    let start = if path.starts_with('/') { "" } else { base };
    for piece in start.split('/').chain(path.split('/')) {
        match piece {
            "" | "." => {}
            ".." => {
                let _ = parts.pop();
            }
            other => parts.push(other.to_string()),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Normal components of `path` in reverse order, ready to pop.
fn components_rev(path: &Path) -> Vec<PathBuf> {
    let mut parts: Vec<PathBuf> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(p) => Some(PathBuf::from(p)),
            Component::ParentDir => Some(PathBuf::from("..")),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => None,
        })
        .collect();
    parts.reverse();
    parts
}
