//! Shared fixtures for the node agent integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use fleet_id::{DockerImage, HostName};
use fleet_node_agent::clock::ManualClock;
use fleet_node_agent::context::NodeAgentContext;
use fleet_node_agent::converge::{AgentState, Collaborators, Converger};
use fleet_node_agent::error::ConvergenceError;
use fleet_node_agent::maintainers::MockMaintainers;
use fleet_node_agent::orchestrator::MockOrchestrator;
use fleet_node_agent::repository::{InMemoryNodeRepository, NodeRepository};
use fleet_node_agent::runtime::MockContainerOperations;
use fleet_node_agent::spec::{ApplicationId, NodeResources, NodeSpec, NodeState};

pub const HOSTNAME: &str = "host1.example.com";

pub fn hostname() -> HostName {
    HostName::parse(HOSTNAME).unwrap()
}

pub fn image(version: &str) -> DockerImage {
    DockerImage::parse(&format!("registry.example.com:5000/fleet/node:{version}")).unwrap()
}

pub fn resources() -> NodeResources {
    NodeResources {
        vcpu: 2.0,
        memory_gb: 4.0,
        disk_gb: 50.0,
    }
}

/// An allocated active node that has never run a container.
pub fn active_node() -> NodeSpec {
    let mut node = NodeSpec::new(hostname(), NodeState::Active, resources());
    node.wanted_docker_image = Some(image("8.1.0"));
    node.wanted_reboot_generation = 1;
    node.current_reboot_generation = 1;
    node.wanted_restart_generation = Some(1);
    node.current_restart_generation = Some(1);
    node.owner = Some(ApplicationId {
        tenant: "tenant".to_string(),
        application: "app".to_string(),
        instance: "default".to_string(),
    });
    node
}

/// Mocks, a manual clock and the converger wired to them.
pub struct Harness {
    pub runtime: Arc<MockContainerOperations>,
    pub repository: Arc<InMemoryNodeRepository>,
    pub orchestrator: Arc<MockOrchestrator>,
    pub maintainers: Arc<MockMaintainers>,
    pub clock: Arc<ManualClock>,
    pub converger: Converger,
    pub data_dir: PathBuf,
    pub warm_up: Duration,
}

impl Harness {
    pub fn new(node: NodeSpec) -> Self {
        Self::build(node, false, Path::new("/tmp/fleet-node-agent-test"), Duration::ZERO)
    }

    /// With a health checker and a warm-up window.
    pub fn with_warm_up(node: NodeSpec, warm_up: Duration) -> Self {
        Self::build(node, true, Path::new("/tmp/fleet-node-agent-test"), warm_up)
    }

    /// With a warm-up window but nothing to anchor it.
    pub fn with_unanchored_warm_up(node: NodeSpec, warm_up: Duration) -> Self {
        Self::build(node, false, Path::new("/tmp/fleet-node-agent-test"), warm_up)
    }

    pub fn with_data_dir(node: NodeSpec, data_dir: &Path) -> Self {
        Self::build(node, false, data_dir, Duration::ZERO)
    }

    fn build(node: NodeSpec, health_checker: bool, data_dir: &Path, warm_up: Duration) -> Self {
        let runtime = Arc::new(MockContainerOperations::new());
        let repository = Arc::new(InMemoryNodeRepository::new());
        let orchestrator = Arc::new(MockOrchestrator::new());
        let maintainers = Arc::new(MockMaintainers::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));

        repository.put_node(node);

        let mut collaborators = Collaborators::new(
            runtime.clone(),
            repository.clone(),
            orchestrator.clone(),
            maintainers.clone(),
        )
        .with_credentials_maintainer(maintainers.clone())
        .with_acl_maintainer(maintainers.clone())
        .with_wireguard_task(maintainers.clone())
        .with_service_dumper(maintainers.clone())
        .with_clock(clock.clone());
        if health_checker {
            collaborators = collaborators.with_health_checker(maintainers.clone());
        }

        Self {
            runtime,
            repository,
            orchestrator,
            maintainers,
            clock,
            converger: Converger::new(collaborators),
            data_dir: data_dir.to_path_buf(),
            warm_up,
        }
    }

    /// Context built from the node as currently stored in the repository.
    pub async fn context(&self) -> NodeAgentContext {
        let node = self
            .repository
            .get_node(&hostname())
            .await
            .unwrap()
            .expect("node in repository");
        NodeAgentContext::new(node, &self.data_dir).with_warm_up(self.warm_up)
    }

    /// Change the stored node.
    pub async fn update_node(&self, update: impl FnOnce(&mut NodeSpec)) {
        let mut node = self.context().await.node().clone();
        update(&mut node);
        self.repository.put_node(node);
    }

    pub async fn converge(&self, state: &mut AgentState) -> Result<(), ConvergenceError> {
        let context = self.context().await;
        self.converger.converge(state, &context).await
    }

    /// Converge until the node is fully up, then forget the calls made.
    pub async fn converged(&self) -> AgentState {
        let mut state = AgentState::default();
        self.converge(&mut state).await.unwrap();
        self.clear_calls();
        state
    }

    pub fn clear_calls(&self) {
        self.runtime.clear_calls();
        self.orchestrator.clear_calls();
        self.maintainers.clear_calls();
        self.repository.clear_recorded();
    }
}
