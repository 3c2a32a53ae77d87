//! Node repository interface and in-memory implementation.
//!
//! The node repository is the source of desired node specs and the sink
//! for the attributes the agent reports back.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use fleet_id::HostName;
use tracing::debug;

use crate::spec::{NodeAttributes, NodeSpec, NodeState};

/// Node repository as seen from one host.
#[async_trait]
pub trait NodeRepository: Send + Sync {
    /// Specs of all nodes `host` should run.
    async fn get_nodes(&self, host: &HostName) -> Result<Vec<NodeSpec>>;

    async fn get_node(&self, hostname: &HostName) -> Result<Option<NodeSpec>>;

    async fn update_node_attributes(
        &self,
        hostname: &HostName,
        attributes: NodeAttributes,
    ) -> Result<()>;

    async fn set_node_state(&self, hostname: &HostName, state: NodeState) -> Result<()>;
}

#[derive(Default)]
struct RepositoryState {
    nodes: BTreeMap<HostName, NodeSpec>,
    attribute_updates: Vec<(HostName, NodeAttributes)>,
    state_changes: Vec<(HostName, NodeState)>,
}

/// In-memory node repository for testing and development.
///
/// Attribute updates and state changes are applied to the stored specs and
/// also recorded for inspection.
#[derive(Default)]
pub struct InMemoryNodeRepository {
    state: Mutex<RepositoryState>,
}

impl InMemoryNodeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RepositoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add or replace a node.
    pub fn put_node(&self, spec: NodeSpec) {
        self.lock().nodes.insert(spec.hostname.clone(), spec);
    }

    pub fn remove_node(&self, hostname: &HostName) -> Option<NodeSpec> {
        self.lock().nodes.remove(hostname)
    }

    pub fn attribute_updates(&self) -> Vec<(HostName, NodeAttributes)> {
        self.lock().attribute_updates.clone()
    }

    pub fn state_changes(&self) -> Vec<(HostName, NodeState)> {
        self.lock().state_changes.clone()
    }

    pub fn clear_recorded(&self) {
        let mut state = self.lock();
        state.attribute_updates.clear();
        state.state_changes.clear();
    }
}

fn apply_attributes(spec: &mut NodeSpec, attributes: &NodeAttributes) {
    if attributes.restart_generation.is_some() {
        spec.current_restart_generation = attributes.restart_generation;
    }
    if let Some(generation) = attributes.reboot_generation {
        spec.current_reboot_generation = generation;
    }
    if let Some(image) = &attributes.docker_image {
        spec.current_docker_image = (!image.is_empty()).then(|| image.clone());
    }
    for (id, report) in &attributes.reports {
        spec.reports.set(id.clone(), report.clone());
    }
}

#[async_trait]
impl NodeRepository for InMemoryNodeRepository {
    async fn get_nodes(&self, host: &HostName) -> Result<Vec<NodeSpec>> {
        Ok(self
            .lock()
            .nodes
            .values()
            .filter(|spec| spec.parent_hostname.as_ref() == Some(host))
            .cloned()
            .collect())
    }

    async fn get_node(&self, hostname: &HostName) -> Result<Option<NodeSpec>> {
        Ok(self.lock().nodes.get(hostname).cloned())
    }

    async fn update_node_attributes(
        &self,
        hostname: &HostName,
        attributes: NodeAttributes,
    ) -> Result<()> {
        debug!(hostname = %hostname, attributes = %attributes, "Updating node attributes");
        let mut state = self.lock();
        if let Some(spec) = state.nodes.get_mut(hostname) {
            apply_attributes(spec, &attributes);
        }
        state.attribute_updates.push((hostname.clone(), attributes));
        Ok(())
    }

    async fn set_node_state(&self, hostname: &HostName, node_state: NodeState) -> Result<()> {
        debug!(hostname = %hostname, state = %node_state, "Setting node state");
        let mut state = self.lock();
        if let Some(spec) = state.nodes.get_mut(hostname) {
            spec.state = node_state;
        }
        state.state_changes.push((hostname.clone(), node_state));
        Ok(())
    }
}
