//! UTS namespace isolation.
//!
//! Allows the container to have its own hostname and domain name.

use carte_common::error::{CarteError, Result};

/// Sets the hostname inside the UTS namespace.
///
/// # Errors
///
/// Returns an error if `sethostname(2)` fails.
#[cfg(target_os = "linux")]
pub fn set_hostname(hostname: &str) -> Result<()> {
    nix::unistd::sethostname(hostname).map_err(|e| CarteError::Resource {
        message: format!("sethostname {hostname} failed: {e}"),
    })
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; UTS namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn set_hostname(_hostname: &str) -> Result<()> {
    Err(CarteError::Resource {
        message: "Linux required for native container operations".into(),
    })
}
