//! Container runtime interface and mock implementation.
//!
//! The runtime interface abstracts container lifecycle operations:
//! - Creating, starting, updating and removing the node's container
//! - Pulling images in the background
//! - Running service commands inside the container
//!
//! A mock implementation is provided for testing and development.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use fleet_id::{ContainerName, DockerImage};
use fleet_reconcile::ContainerResources;
use thiserror::Error;
use tracing::{debug, info};

use crate::container::{Container, ContainerData, ContainerId, ContainerStatus};
use crate::context::NodeAgentContext;

/// Errors from the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The node's container does not exist (anymore).
    #[error("container {0} not found")]
    NotFound(ContainerName),

    /// Any other runtime failure.
    #[error("container runtime failure: {0:#}")]
    Failed(#[from] anyhow::Error),
}

/// Credentials for pulling from the image registry.
#[derive(Clone, Default)]
pub struct RegistryCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl std::fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Container operations for one node's container.
#[async_trait]
pub trait ContainerOperations: Send + Sync {
    /// Create (but do not start) the node's container.
    async fn create_container(
        &self,
        context: &NodeAgentContext,
        resources: ContainerResources,
    ) -> Result<ContainerData, RuntimeError>;

    async fn start_container(&self, context: &NodeAgentContext) -> Result<(), RuntimeError>;

    async fn remove_container(
        &self,
        context: &NodeAgentContext,
        container: &Container,
    ) -> Result<(), RuntimeError>;

    /// Change the resource allocation of a running container in place.
    async fn update_container(
        &self,
        context: &NodeAgentContext,
        id: &ContainerId,
        resources: ContainerResources,
    ) -> Result<(), RuntimeError>;

    async fn get_container(
        &self,
        context: &NodeAgentContext,
    ) -> Result<Option<Container>, RuntimeError>;

    /// Start pulling `image` unless it is already present.
    ///
    /// Returns true while the pull is still in progress.
    async fn pull_image_async_if_needed(
        &self,
        context: &NodeAgentContext,
        image: &DockerImage,
        credentials: &RegistryCredentials,
    ) -> Result<bool, RuntimeError>;

    async fn start_services(&self, context: &NodeAgentContext) -> Result<String, RuntimeError>;

    async fn stop_services(&self, context: &NodeAgentContext) -> Result<String, RuntimeError>;

    /// Tell the node it may serve again.
    async fn resume_node(&self, context: &NodeAgentContext) -> Result<String, RuntimeError>;

    /// Tell the node to stop serving ahead of a stop.
    async fn suspend_node(&self, context: &NodeAgentContext) -> Result<String, RuntimeError>;

    /// Restart the services inside the running container.
    async fn restart_vespa(&self, context: &NodeAgentContext) -> Result<String, RuntimeError>;
}

// =============================================================================
// Mock
// =============================================================================

#[derive(Default)]
struct MockState {
    container: Option<Container>,
    calls: Vec<String>,
    pending_pulls: HashSet<DockerImage>,
    boot_counter: u64,
    fail_starts: bool,
}

/// Mock runtime for testing and development.
///
/// Holds at most one container and records every call by name.
#[derive(Default)]
pub struct MockContainerOperations {
    state: Mutex<MockState>,
}

impl MockContainerOperations {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock runtime where container starts fail.
    pub fn failing() -> Self {
        let mock = Self::new();
        mock.lock().fail_starts = true;
        mock
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: &str) -> std::sync::MutexGuard<'_, MockState> {
        let mut state = self.lock();
        state.calls.push(call.to_string());
        state
    }

    /// Replace the observed container.
    pub fn set_container(&self, container: Option<Container>) {
        self.lock().container = container;
    }

    pub fn container(&self) -> Option<Container> {
        self.lock().container.clone()
    }

    /// Mark a pull of `image` as still in progress (or finished).
    pub fn set_pull_in_progress(&self, image: &DockerImage, in_progress: bool) {
        let mut state = self.lock();
        if in_progress {
            state.pending_pulls.insert(image.clone());
        } else {
            state.pending_pulls.remove(image);
        }
    }

    /// Names of the calls made so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, call: &str) -> usize {
        self.lock().calls.iter().filter(|c| *c == call).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    fn require_container(
        state: &MockState,
        context: &NodeAgentContext,
    ) -> Result<(), RuntimeError> {
        if state.container.is_none() {
            return Err(RuntimeError::NotFound(context.container_name().clone()));
        }
        Ok(())
    }

    fn service_command(
        &self,
        call: &str,
        context: &NodeAgentContext,
    ) -> Result<String, RuntimeError> {
        let state = self.record(call);
        Self::require_container(&state, context)?;
        debug!(hostname = %context.hostname(), call, "[MOCK] Service command");
        Ok(String::new())
    }
}

#[async_trait]
impl ContainerOperations for MockContainerOperations {
    async fn create_container(
        &self,
        context: &NodeAgentContext,
        resources: ContainerResources,
    ) -> Result<ContainerData, RuntimeError> {
        let mut state = self.record("create_container");
        if state.container.is_some() {
            return Err(anyhow::anyhow!("container {} already exists", context.container_name()).into());
        }
        let image = context
            .node()
            .wanted_docker_image
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no wanted image for {}", context.hostname()))?;

        state.boot_counter += 1;
        let id = ContainerId::new(format!("ctr_{:016x}", state.boot_counter));

        info!(
            hostname = %context.hostname(),
            image = %image,
            resources = %resources,
            "[MOCK] Creating container"
        );

        state.container = Some(Container {
            id: id.clone(),
            name: context.container_name().clone(),
            hostname: context.hostname().clone(),
            image,
            status: ContainerStatus::Created,
            resources,
            created_at: Utc::now(),
        });

        Ok(ContainerData { id })
    }

    async fn start_container(&self, context: &NodeAgentContext) -> Result<(), RuntimeError> {
        let mut state = self.record("start_container");
        if state.fail_starts {
            return Err(anyhow::anyhow!("Mock runtime configured to fail").into());
        }
        let container = state
            .container
            .as_mut()
            .ok_or_else(|| RuntimeError::NotFound(context.container_name().clone()))?;
        container.status = ContainerStatus::Running;
        Ok(())
    }

    async fn remove_container(
        &self,
        context: &NodeAgentContext,
        container: &Container,
    ) -> Result<(), RuntimeError> {
        let mut state = self.record("remove_container");
        info!(
            hostname = %context.hostname(),
            id = %container.id,
            "[MOCK] Removing container"
        );
        if state.container.as_ref().map(|c| &c.id) == Some(&container.id) {
            state.container = None;
        }
        Ok(())
    }

    async fn update_container(
        &self,
        context: &NodeAgentContext,
        id: &ContainerId,
        resources: ContainerResources,
    ) -> Result<(), RuntimeError> {
        let mut state = self.record("update_container");
        match state.container.as_mut() {
            Some(container) if &container.id == id => {
                container.resources = resources;
                Ok(())
            }
            _ => Err(RuntimeError::NotFound(context.container_name().clone())),
        }
    }

    async fn get_container(
        &self,
        _context: &NodeAgentContext,
    ) -> Result<Option<Container>, RuntimeError> {
        Ok(self.record("get_container").container.clone())
    }

    async fn pull_image_async_if_needed(
        &self,
        _context: &NodeAgentContext,
        image: &DockerImage,
        _credentials: &RegistryCredentials,
    ) -> Result<bool, RuntimeError> {
        Ok(self.record("pull_image").pending_pulls.contains(image))
    }

    async fn start_services(&self, context: &NodeAgentContext) -> Result<String, RuntimeError> {
        self.service_command("start_services", context)
    }

    async fn stop_services(&self, context: &NodeAgentContext) -> Result<String, RuntimeError> {
        self.service_command("stop_services", context)
    }

    async fn resume_node(&self, context: &NodeAgentContext) -> Result<String, RuntimeError> {
        self.service_command("resume_node", context)
    }

    async fn suspend_node(&self, context: &NodeAgentContext) -> Result<String, RuntimeError> {
        self.service_command("suspend_node", context)
    }

    async fn restart_vespa(&self, context: &NodeAgentContext) -> Result<String, RuntimeError> {
        self.service_command("restart_vespa", context)
    }
}
