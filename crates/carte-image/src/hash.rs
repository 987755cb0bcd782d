//! SHA-256 content addressing and verification.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use carte_common::error::{CarteError, Result};
use carte_common::types::Sha256Hash;

/// Hashes an in-memory buffer.
#[must_use]
pub fn hash_bytes(data: &[u8]) -> Sha256Hash {
    to_hash(Sha256::digest(data).as_slice())
}

/// Computes the SHA-256 hash of a file, streaming its contents.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn hash_file(path: &Path) -> Result<Sha256Hash> {
    let mut file = std::fs::File::open(path).map_err(|e| CarteError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| CarteError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let hash = to_hash(hasher.finalize().as_slice());
    tracing::debug!(path = %path.display(), hash = %hash, "computed SHA-256 hash");
    Ok(hash)
}

/// Validates that a file matches the expected SHA-256 hash.
///
/// # Errors
///
/// Returns [`CarteError::HashMismatch`] if the hashes do not match.
pub fn validate_hash(path: &Path, expected: &Sha256Hash) -> Result<()> {
    let actual = hash_file(path)?;
    if &actual != expected {
        return Err(CarteError::HashMismatch {
            resource: path.display().to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

/// Hashes a set of files by relative path, mode, and content.
///
/// The map's ordering makes the digest independent of directory
/// iteration order. Directories contribute their path and mode only.
///
/// # Errors
///
/// Returns an error if a file cannot be read.
pub fn hash_entries(entries: &BTreeMap<String, std::path::PathBuf>) -> Result<Sha256Hash> {
    use std::os::unix::fs::PermissionsExt;

    let mut hasher = Sha256::new();
    for (rel, path) in entries {
        let meta = std::fs::symlink_metadata(path).map_err(|e| CarteError::io(path, e))?;
        hasher.update(rel.as_bytes());
        hasher.update(format!("\0{:o}\0", meta.permissions().mode()).as_bytes());
        if meta.file_type().is_symlink() {
            let target = std::fs::read_link(path).map_err(|e| CarteError::io(path, e))?;
            hasher.update(target.as_os_str().as_encoded_bytes());
        } else if meta.is_file() {
            hasher.update(hash_file(path)?.as_hex().as_bytes());
        }
        hasher.update(b"\n");
    }
    Ok(to_hash(hasher.finalize().as_slice()))
}

fn to_hash(digest: &[u8]) -> Sha256Hash {
    use std::fmt::Write;

    let hex = digest.iter().fold(String::with_capacity(64), |mut acc, b| {
        let _ = write!(acc, "{b:02x}");
        acc
    });
    Sha256Hash::from_hex(hex).unwrap_or_else(|_| unreachable!("sha256 digests are 32 bytes"))
}
