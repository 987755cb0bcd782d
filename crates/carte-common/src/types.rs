//! Domain primitive types used across the carte workspace.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CarteError, Result};

/// Unique identifier for a container instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a new container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random container ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the first eight characters, used for interface and cgroup names.
    #[must_use]
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(8).map_or(self.0.len(), |(i, _)| i);
        &self.0[..end]
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content identifier of a built image (hex digest of its config).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(String);

impl ImageId {
    /// Creates a new image ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the 12-character abbreviation shown in listings.
    #[must_use]
    pub fn short(&self) -> &str {
        let hex = self.0.strip_prefix("sha256:").unwrap_or(&self.0);
        &hex[..hex.len().min(12)]
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Human-facing image reference: `name[:tag]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    /// Repository name.
    pub name: String,
    /// Tag, `latest` when omitted.
    pub tag: String,
}

impl ImageRef {
    /// Creates a reference from its parts.
    #[must_use]
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
        }
    }

    /// Parses `name[:tag]`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for empty names or names containing path
    /// separators.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        let (name, tag) = match reference.rsplit_once(':') {
            Some((name, tag)) => (name, tag),
            None => (reference, crate::constants::DEFAULT_TAG),
        };
        validate_name("image name", name)?;
        validate_name("image tag", tag)?;
        Ok(Self::new(name, tag))
    }
}

impl FromStr for ImageRef {
    type Err = CarteError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

/// Checks that a user-chosen name is usable as a single path component.
///
/// # Errors
///
/// Returns a validation error describing the offending value.
pub fn validate_name(kind: &str, value: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value.len() <= 128
        && value != "."
        && value != ".."
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(CarteError::validation(format!(
            "invalid {kind} '{value}': use 1-128 characters from [A-Za-z0-9._-]"
        )))
    }
}

/// SHA-256 hash digest used for content verification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sha256Hash(String);

impl Sha256Hash {
    /// Creates a hash from a hex-encoded string, with or without `sha256:`.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not a valid 64-character hex string.
    pub fn from_hex(hex: impl Into<String>) -> Result<Self> {
        let hex = hex.into();
        let hex = hex.strip_prefix("sha256:").map(str::to_owned).unwrap_or(hex);
        if hex.len() != crate::constants::SHA256_HEX_LENGTH
            || !hex.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(CarteError::validation(format!(
                "invalid SHA-256 hex string: {hex}"
            )));
        }
        Ok(Self(hex.to_ascii_lowercase()))
    }

    /// Returns the hex-encoded hash string.
    #[must_use]
    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.0)
    }
}

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Container has been created but not yet started.
    Created,
    /// Container is actively running.
    Running,
    /// Container has been stopped or its process exited.
    Stopped,
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Resource grant as requested by the user and recorded with the container.
///
/// The original strings are kept verbatim so that listings show exactly what
/// was asked for; [`ResourceGrant::limits`] yields the parsed values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGrant {
    /// CPU limit, e.g. `50%`.
    pub cpu: String,
    /// Memory limit, e.g. `104857600` or `128MiB`.
    pub memory: String,
}

impl ResourceGrant {
    /// Creates a grant from the user's strings.
    #[must_use]
    pub fn new(cpu: impl Into<String>, memory: impl Into<String>) -> Self {
        Self {
            cpu: cpu.into(),
            memory: memory.into(),
        }
    }

    /// Parses the grant into numeric limits.
    ///
    /// # Errors
    ///
    /// Returns a validation error if either value cannot be parsed.
    pub fn limits(&self) -> Result<ResourceLimits> {
        Ok(ResourceLimits {
            cpu_percent: parse_cpu_percent(&self.cpu)?,
            memory_bytes: parse_memory(&self.memory)?,
        })
    }
}

/// Numeric resource limits written to the cgroup controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// CPU share of one core, in percent (may exceed 100 on multi-core hosts).
    pub cpu_percent: u32,
    /// Memory ceiling in bytes.
    pub memory_bytes: u64,
}

/// Parses a CPU limit such as `50%` or `150`.
///
/// # Errors
///
/// Returns a validation error for zero, non-numeric, or out-of-range values.
pub fn parse_cpu_percent(s: &str) -> Result<u32> {
    let trimmed = s.trim();
    let digits = trimmed.strip_suffix('%').unwrap_or(trimmed).trim();
    match digits.parse::<u32>() {
        Ok(pct) if (1..=crate::constants::MAX_CPU_PERCENT).contains(&pct) => Ok(pct),
        _ => Err(CarteError::validation(format!(
            "invalid CPU limit '{s}': expected a percentage between 1% and {}%",
            crate::constants::MAX_CPU_PERCENT
        ))),
    }
}

/// Parses memory strings like "128MiB", "256MB", "1G", or plain bytes.
///
/// # Errors
///
/// Returns a validation error for unparsable or zero values.
pub fn parse_memory(s: &str) -> Result<u64> {
    const UNITS: [(&str, u64); 9] = [
        ("GiB", 1024 * 1024 * 1024),
        ("MiB", 1024 * 1024),
        ("KiB", 1024),
        ("GB", 1_000_000_000),
        ("MB", 1_000_000),
        ("KB", 1000),
        ("G", 1024 * 1024 * 1024),
        ("M", 1024 * 1024),
        ("K", 1024),
    ];
    let trimmed = s.trim();
    let (num_str, multiplier) = UNITS
        .iter()
        .find_map(|(suffix, mult)| trimmed.strip_suffix(suffix).map(|n| (n, *mult)))
        .unwrap_or((trimmed, 1));
    num_str
        .trim()
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .filter(|bytes| *bytes > 0)
        .ok_or_else(|| CarteError::validation(format!("invalid memory limit '{s}'")))
}
