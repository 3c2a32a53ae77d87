//! Desired node specification as supplied by the node repository.
//!
//! A fresh `NodeSpec` arrives with every tick. The agent never keeps one
//! across ticks; whatever it needs to remember lives in the agent state.

use std::collections::BTreeMap;

use fleet_id::{DockerImage, HostName};
use serde::{Deserialize, Serialize};

/// Node lifecycle state in the node repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Provisioned,
    Ready,
    Reserved,
    Active,
    Inactive,
    Dirty,
    Failed,
    Parked,
    Deprovisioned,
    Breakfixed,
    /// Any state this agent does not know about.
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeState::Provisioned => "provisioned",
            NodeState::Ready => "ready",
            NodeState::Reserved => "reserved",
            NodeState::Active => "active",
            NodeState::Inactive => "inactive",
            NodeState::Dirty => "dirty",
            NodeState::Failed => "failed",
            NodeState::Parked => "parked",
            NodeState::Deprovisioned => "deprovisioned",
            NodeState::Breakfixed => "breakfixed",
            NodeState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Orchestrator view of the node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorStatus {
    #[default]
    NoRemarks,
    AllowedToBeDown,
    PermanentlyDown,
}

impl OrchestratorStatus {
    pub fn is_suspended(&self) -> bool {
        !matches!(self, OrchestratorStatus::NoRemarks)
    }
}

/// Wanted resource envelope.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeResources {
    pub vcpu: f64,
    pub memory_gb: f64,
    pub disk_gb: f64,
}

/// Application owning an allocated node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationId {
    pub tenant: String,
    pub application: String,
    pub instance: String,
}

impl std::fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.tenant, self.application, self.instance)
    }
}

/// Cluster membership of an allocated node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub cluster_type: String,
    pub cluster_id: String,
    pub group: Option<String>,
    pub index: u32,
    pub retired: bool,
}

// =============================================================================
// Reports
// =============================================================================

/// Structured side-channel signals attached to a node, keyed by report id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reports(BTreeMap<String, serde_json::Value>);

impl Reports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, id: impl Into<String>, value: serde_json::Value) {
        self.0.insert(id.into(), value);
    }

    /// Typed access to a report. A report that does not deserialize is treated
    /// as absent.
    pub fn get_report<T: serde::de::DeserializeOwned>(&self, id: &str) -> Option<T> {
        self.0
            .get(id)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn drop_documents(&self) -> Option<DropDocumentsReport> {
        self.get_report(DropDocumentsReport::REPORT_ID)
    }
}

/// Request to wipe the documents directory before the container is started
/// again.
///
/// Phases: requested (all empty) → dropped (agent) → readied (external) →
/// started (agent).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropDocumentsReport {
    /// Epoch millis when the agent removed the container and the documents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dropped_at: Option<i64>,

    /// Epoch millis when the node was cleared to start again.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readied_at: Option<i64>,

    /// Epoch millis when the agent started the container again.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
}

impl DropDocumentsReport {
    pub const REPORT_ID: &'static str = "dropDocuments";

    pub fn with_dropped_at(self, at: i64) -> Self {
        Self {
            dropped_at: Some(at),
            ..self
        }
    }

    pub fn with_started_at(self, at: i64) -> Self {
        Self {
            started_at: Some(at),
            ..self
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        // A struct of optional integers always serializes.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

// =============================================================================
// Node Spec
// =============================================================================

/// Desired and observed specification of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub hostname: HostName,
    /// Host the node runs on.
    #[serde(default)]
    pub parent_hostname: Option<HostName>,
    pub state: NodeState,

    pub wanted_docker_image: Option<DockerImage>,
    pub current_docker_image: Option<DockerImage>,

    pub wanted_reboot_generation: u64,
    pub current_reboot_generation: u64,

    /// Present only while the node is allocated.
    pub wanted_restart_generation: Option<u64>,
    pub current_restart_generation: Option<u64>,

    pub resources: NodeResources,

    pub owner: Option<ApplicationId>,
    pub membership: Option<Membership>,

    #[serde(default)]
    pub orchestrator_status: OrchestratorStatus,

    #[serde(default)]
    pub reports: Reports,
}

impl NodeSpec {
    /// Minimal unallocated spec, the starting point for builders and tests.
    pub fn new(hostname: HostName, state: NodeState, resources: NodeResources) -> Self {
        Self {
            hostname,
            parent_hostname: None,
            state,
            wanted_docker_image: None,
            current_docker_image: None,
            wanted_reboot_generation: 0,
            current_reboot_generation: 0,
            wanted_restart_generation: None,
            current_restart_generation: None,
            resources,
            owner: None,
            membership: None,
            orchestrator_status: OrchestratorStatus::NoRemarks,
            reports: Reports::new(),
        }
    }

    pub fn with_parent_hostname(mut self, parent: HostName) -> Self {
        self.parent_hostname = Some(parent);
        self
    }

    pub fn is_allocated(&self) -> bool {
        self.owner.is_some()
    }
}

// =============================================================================
// Attributes
// =============================================================================

/// Attributes the agent writes back to the node repository.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeAttributes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_generation: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reboot_generation: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<DockerImage>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub vespa_version: Option<String>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub reports: BTreeMap<String, serde_json::Value>,
}

impl NodeAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_restart_generation(mut self, generation: Option<u64>) -> Self {
        self.restart_generation = generation;
        self
    }

    pub fn with_reboot_generation(mut self, generation: u64) -> Self {
        self.reboot_generation = Some(generation);
        self
    }

    /// Sets the image and the version derived from its tag. An empty image
    /// clears the version.
    pub fn with_docker_image(mut self, image: DockerImage) -> Self {
        self.vespa_version = Some(image.tag_as_version().unwrap_or_default().to_string());
        self.docker_image = Some(image);
        self
    }

    pub fn with_report(mut self, id: impl Into<String>, value: serde_json::Value) -> Self {
        self.reports.insert(id.into(), value);
        self
    }
}

impl std::fmt::Display for NodeAttributes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{self:?}"),
        }
    }
}
