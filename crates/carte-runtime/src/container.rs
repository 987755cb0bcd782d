//! Container records and their lifecycle transitions.
//!
//! A record is the persisted truth about a container. Transitions check
//! their precondition and return [`CarteError::InvalidState`] otherwise, so
//! the record is never left half-updated.

use serde::{Deserialize, Serialize};

use carte_common::error::{CarteError, Result};
use carte_common::types::{ContainerId, ContainerStatus, ResourceGrant};

/// Network details recorded with a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// Container address; empty when the container has none.
    #[serde(default)]
    pub ip_address: String,
}

/// Persisted state of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Unique identifier.
    pub id: ContainerId,
    /// User-chosen name, unique on the host.
    pub name: String,
    /// Image reference the container was created from.
    pub image: String,
    /// Host PID of the container process; meaningful only while running.
    #[serde(default)]
    pub pid: Option<u32>,
    /// Kernel start time of `pid`, so a reused PID is not mistaken for the container.
    #[serde(default)]
    pub pid_start_time: Option<u64>,
    /// Lifecycle state.
    pub status: ContainerStatus,
    /// Network details.
    #[serde(default)]
    pub network: NetworkInfo,
    /// Resource grant as requested.
    pub resources: ResourceGrant,
    /// Creation timestamp (RFC 3339).
    pub created_at: String,
    /// Timestamp of the latest start (RFC 3339).
    #[serde(default)]
    pub started_at: Option<String>,
    /// Exit code of the last run, once stopped.
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl ContainerRecord {
    /// Creates a record for a container that is already running.
    #[must_use]
    pub fn running(
        id: ContainerId,
        name: impl Into<String>,
        image: impl Into<String>,
        pid: u32,
        resources: ResourceGrant,
        ip_address: Option<String>,
    ) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id,
            name: name.into(),
            image: image.into(),
            pid: Some(pid),
            pid_start_time: None,
            status: ContainerStatus::Running,
            network: NetworkInfo {
                ip_address: ip_address.unwrap_or_default(),
            },
            resources,
            created_at: now.clone(),
            started_at: Some(now),
            exit_code: None,
        }
    }

    /// True while the container is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }

    /// Recorded address, if any.
    #[must_use]
    pub fn ip_address(&self) -> Option<&str> {
        Some(self.network.ip_address.as_str()).filter(|ip| !ip.is_empty())
    }

    fn refuse(&self, operation: &'static str, reason: &str) -> CarteError {
        CarteError::InvalidState {
            id: self.name.clone(),
            operation,
            reason: reason.to_string(),
        }
    }

    /// Fails unless the container may be started.
    ///
    /// # Errors
    ///
    /// Returns [`CarteError::InvalidState`] if the container is running.
    pub fn ensure_startable(&self) -> Result<()> {
        if self.is_running() {
            return Err(self.refuse("start", "container is already running"));
        }
        Ok(())
    }

    /// Fails unless the container is running.
    ///
    /// # Errors
    ///
    /// Returns [`CarteError::InvalidState`] if the container is not running.
    pub fn ensure_running(&self, operation: &'static str) -> Result<u32> {
        match (self.status, self.pid) {
            (ContainerStatus::Running, Some(pid)) => Ok(pid),
            (status, _) => Err(self.refuse(operation, &format!("container is {status}"))),
        }
    }

    /// Fails if the container is running.
    ///
    /// # Errors
    ///
    /// Returns [`CarteError::InvalidState`] if the container is running.
    pub fn ensure_removable(&self) -> Result<()> {
        if self.is_running() {
            return Err(self.refuse("remove", "container is running; stop it first"));
        }
        Ok(())
    }

    /// `created`/`stopped` → `running` with a fresh PID.
    ///
    /// Keeps `created_at`, refreshes `started_at`, and clears the previous
    /// exit code.
    ///
    /// # Errors
    ///
    /// Returns [`CarteError::InvalidState`] if the container is running.
    pub fn mark_running(&mut self, pid: u32, ip_address: Option<String>) -> Result<()> {
        self.ensure_startable()?;
        self.status = ContainerStatus::Running;
        self.pid = Some(pid);
        self.pid_start_time = None;
        self.network.ip_address = ip_address.unwrap_or_default();
        self.started_at = Some(chrono::Utc::now().to_rfc3339());
        self.exit_code = None;
        Ok(())
    }

    /// `running` → `stopped`.
    ///
    /// The address stays recorded so a later start can ask for it again.
    ///
    /// # Errors
    ///
    /// Returns [`CarteError::InvalidState`] if the container is not running.
    pub fn mark_stopped(&mut self, exit_code: Option<i32>) -> Result<()> {
        let _ = self.ensure_running("stop")?;
        self.status = ContainerStatus::Stopped;
        self.pid = None;
        self.pid_start_time = None;
        self.exit_code = exit_code;
        Ok(())
    }

    /// Listing view of this record.
    #[must_use]
    pub fn summary(&self) -> ContainerSummary {
        ContainerSummary {
            name: self.name.clone(),
            image: self.image.clone(),
            status: self.status,
            pid: self.pid,
            created_at: self.created_at.clone(),
            ip_address: self.network.ip_address.clone(),
            resources: self.resources.clone(),
            exit_code: self.exit_code,
        }
    }
}

/// One row of `list_containers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerSummary {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Lifecycle state.
    pub status: ContainerStatus,
    /// PID while running.
    pub pid: Option<u32>,
    /// Creation timestamp.
    pub created_at: String,
    /// Address, empty when none.
    pub ip_address: String,
    /// Resource grant.
    pub resources: ResourceGrant,
    /// Exit code of the last run.
    pub exit_code: Option<i32>,
}
