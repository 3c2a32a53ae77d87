//! Observed container and the agent's cached view of it.

use chrono::{DateTime, Utc};
use fleet_id::{ContainerName, DockerImage, HostName};
use fleet_reconcile::ContainerResources;

/// Runtime-assigned container id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Run state reported by the container runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Exited,
    Dead,
}

impl ContainerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerStatus::Running)
    }
}

/// A container as observed in the runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct Container {
    pub id: ContainerId,
    pub name: ContainerName,
    pub hostname: HostName,
    pub image: DockerImage,
    pub status: ContainerStatus,
    pub resources: ContainerResources,
    pub created_at: DateTime<Utc>,
}

impl Container {
    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }
}

/// Handle to a created, not yet started container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerData {
    pub id: ContainerId,
}

/// What the agent believes about its container between ticks.
///
/// Once `Absent`, no container exists until the agent starts one itself, so
/// the runtime is not queried. `Starting` is set before create/start and
/// replaced by `Unknown` once the start is confirmed; a container found while
/// still `Starting` is presumed to have failed to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Absent,
    Starting,
    Unknown,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerState::Absent => "ABSENT",
            ContainerState::Starting => "STARTING",
            ContainerState::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}
