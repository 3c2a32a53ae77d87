//! Integration tests for the convergence algorithm.
//!
//! Every test drives a `Converger` against in-memory collaborators and checks
//! the calls it made and the state it left behind.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{active_node, hostname, image, Harness};
use fleet_id::DockerImage;
use fleet_node_agent::clock::Clock;
use fleet_node_agent::container::{
    Container, ContainerData, ContainerId, ContainerState, ContainerStatus,
};
use fleet_node_agent::context::NodeAgentContext;
use fleet_node_agent::converge::{AgentState, Collaborators, Converger};
use fleet_node_agent::error::{ConvergenceError, OutcomeKind};
use fleet_node_agent::maintainers::MockMaintainers;
use fleet_node_agent::orchestrator::{MockOrchestrator, OrchestratorError};
use fleet_node_agent::repository::{InMemoryNodeRepository, NodeRepository};
use fleet_node_agent::runtime::{
    ContainerOperations, MockContainerOperations, RegistryCredentials, RuntimeError,
};
use fleet_node_agent::spec::{DropDocumentsReport, NodeState, OrchestratorStatus};
use fleet_node_agent::NodeSpec;
use fleet_reconcile::ContainerResources;
use rstest::rstest;

const CONTAINER_CHANGES: [&str; 5] = [
    "create_container",
    "start_container",
    "update_container",
    "remove_container",
    "resume_node",
];

fn transient_message(result: Result<(), ConvergenceError>) -> String {
    let err = result.unwrap_err();
    assert_eq!(err.kind(), OutcomeKind::Transient, "unexpected outcome: {err}");
    err.to_string()
}

#[tokio::test]
async fn test_fresh_node_is_started() {
    let harness = Harness::new(active_node());
    let mut state = AgentState::default();

    harness.converge(&mut state).await.unwrap();

    let container = harness.runtime.container().expect("container created");
    assert_eq!(container.image, image("8.1.0"));
    assert_eq!(container.status, ContainerStatus::Running);
    assert_eq!(container.resources.cpus, 2.0);
    assert_eq!(state.container_state, ContainerState::Unknown);
    assert!(state.has_started_services);
    assert!(state.has_resumed_node);

    let stored = harness.repository.get_node(&hostname()).await.unwrap().unwrap();
    assert_eq!(stored.current_docker_image, Some(image("8.1.0")));
}

#[tokio::test]
async fn test_converged_node_is_left_alone() {
    let harness = Harness::new(active_node());
    let mut state = harness.converged().await;

    harness.converge(&mut state).await.unwrap();

    for call in CONTAINER_CHANGES {
        assert_eq!(harness.runtime.call_count(call), 0, "unexpected {call}");
    }
    assert!(harness.orchestrator.calls().is_empty());
    assert!(harness.repository.attribute_updates().is_empty());
    assert_eq!(harness.maintainers.call_count("sync_logs"), 1);
}

#[derive(Debug, Clone, Copy)]
enum Removal {
    NewImage,
    NotRunning,
    RebootWanted,
    MemoryChanged,
    FailedStart,
}

#[rstest]
#[case::new_image(Removal::NewImage)]
#[case::not_running(Removal::NotRunning)]
#[case::reboot_wanted(Removal::RebootWanted)]
#[case::memory_changed(Removal::MemoryChanged)]
#[case::failed_start(Removal::FailedStart)]
#[tokio::test]
async fn test_removal_reason_replaces_container(#[case] removal: Removal) {
    let harness = Harness::new(active_node());
    let mut state = harness.converged().await;

    match removal {
        Removal::NewImage => {
            harness
                .update_node(|node| node.wanted_docker_image = Some(image("8.2.0")))
                .await
        }
        Removal::NotRunning => {
            let mut container = harness.runtime.container().unwrap();
            container.status = ContainerStatus::Exited;
            harness.runtime.set_container(Some(container));
        }
        Removal::RebootWanted => harness.update_node(|node| node.wanted_reboot_generation = 2).await,
        Removal::MemoryChanged => harness.update_node(|node| node.resources.memory_gb = 8.0).await,
        Removal::FailedStart => state.container_state = ContainerState::Starting,
    }

    harness.converge(&mut state).await.unwrap();

    assert_eq!(harness.runtime.call_count("remove_container"), 1);
    assert_eq!(harness.runtime.call_count("create_container"), 1);
    let calls = harness.runtime.calls();
    let removed = calls.iter().position(|c| c == "remove_container").unwrap();
    let created = calls.iter().position(|c| c == "create_container").unwrap();
    assert!(removed < created);
    assert_eq!(state.container_state, ContainerState::Unknown);
}

#[tokio::test]
async fn test_image_change_waits_for_pull() {
    let harness = Harness::new(active_node());
    let mut state = harness.converged().await;

    harness
        .update_node(|node| node.wanted_docker_image = Some(image("8.2.0")))
        .await;
    harness.runtime.set_pull_in_progress(&image("8.2.0"), true);

    let message = transient_message(harness.converge(&mut state).await);
    assert!(message.contains("Waiting for image to download"));
    assert_eq!(harness.runtime.call_count("pull_image"), 1);
    for call in ["create_container", "start_container", "remove_container"] {
        assert_eq!(harness.runtime.call_count(call), 0, "unexpected {call}");
    }

    harness.runtime.set_pull_in_progress(&image("8.2.0"), false);
    harness.converge(&mut state).await.unwrap();

    assert_eq!(harness.runtime.call_count("remove_container"), 1);
    assert_eq!(harness.runtime.container().unwrap().image, image("8.2.0"));
    // Suspended for the removal, resumed once running again.
    assert_eq!(harness.orchestrator.calls(), vec!["suspend", "resume"]);

    let stored = harness.repository.get_node(&hostname()).await.unwrap().unwrap();
    assert_eq!(stored.current_docker_image, Some(image("8.2.0")));
}

#[tokio::test]
async fn test_restart_without_removal() {
    let mut node = active_node();
    node.wanted_restart_generation = Some(4);
    node.current_restart_generation = Some(4);
    let harness = Harness::new(node);
    let mut state = harness.converged().await;
    assert_eq!(state.generations.restart, Some(4));

    harness
        .update_node(|node| node.wanted_restart_generation = Some(5))
        .await;
    harness.converge(&mut state).await.unwrap();

    assert_eq!(harness.orchestrator.call_count("suspend"), 1);
    assert_eq!(harness.runtime.call_count("restart_vespa"), 1);
    assert_eq!(harness.runtime.call_count("remove_container"), 0);
    assert_eq!(state.generations.restart, Some(5));

    let stored = harness.repository.get_node(&hostname()).await.unwrap().unwrap();
    assert_eq!(stored.current_restart_generation, Some(5));
    assert_eq!(harness.orchestrator.call_count("resume"), 1);
}

#[tokio::test]
async fn test_restart_starts_new_warm_up() {
    let harness = Harness::with_warm_up(active_node(), Duration::from_secs(60));
    let mut state = AgentState::default();
    transient_message(harness.converge(&mut state).await);
    harness.clock.advance(chrono::Duration::seconds(61));
    harness.converge(&mut state).await.unwrap();
    let warmed_up_at = state.first_successful_health_check;
    assert!(!harness.runtime.container().unwrap().resources.is_cpu_unlimited());
    harness.clear_calls();

    harness
        .update_node(|node| node.wanted_restart_generation = Some(2))
        .await;
    harness.clock.advance(chrono::Duration::seconds(10));
    let message = transient_message(harness.converge(&mut state).await);

    // CPU is uncapped for the restart and stays so through the new window.
    assert!(message.contains("Refusing to resume until warm up period ends (in 60s)"));
    assert_eq!(
        harness.runtime.calls(),
        vec!["get_container", "update_container", "restart_vespa"]
    );
    assert!(harness.runtime.container().unwrap().resources.is_cpu_unlimited());
    assert_eq!(state.generations.restart, Some(2));
    assert_ne!(state.first_successful_health_check, warmed_up_at);
    assert_eq!(state.first_successful_health_check, Some(harness.clock.now()));
    assert_eq!(harness.orchestrator.calls(), vec!["suspend"]);

    harness.clock.advance(chrono::Duration::seconds(30));
    transient_message(harness.converge(&mut state).await);
    assert_eq!(harness.orchestrator.call_count("resume"), 0);

    harness.clock.advance(chrono::Duration::seconds(31));
    harness.converge(&mut state).await.unwrap();

    assert_eq!(harness.runtime.call_count("update_container"), 2);
    assert_eq!(harness.runtime.container().unwrap().resources.cpus, 2.0);
    assert_eq!(harness.orchestrator.calls(), vec!["suspend", "resume"]);
    let stored = harness.repository.get_node(&hostname()).await.unwrap().unwrap();
    assert_eq!(stored.current_restart_generation, Some(2));
}

#[tokio::test]
async fn test_restart_waits_for_orchestrator() {
    let harness = Harness::new(active_node());
    let mut state = harness.converged().await;
    harness
        .orchestrator
        .set_deny_suspend(Some("too many nodes down"));
    harness
        .maintainers
        .set_wireguard_failure(Some("peer out of date"));
    harness
        .update_node(|node| node.wanted_restart_generation = Some(2))
        .await;

    let err = harness.converge(&mut state).await.unwrap_err();

    assert_eq!(err.kind(), OutcomeKind::Transient);
    match &err {
        ConvergenceError::Orchestrator { source, suppressed } => {
            assert!(matches!(source, OrchestratorError::Denied { .. }));
            assert_eq!(suppressed, &vec!["wireguard: peer out of date".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(harness.runtime.call_count("restart_vespa"), 0);
    assert_eq!(harness.maintainers.call_count("acl_converge"), 1);
    assert_eq!(harness.maintainers.call_count("wireguard_converge"), 1);
    assert_eq!(state.generations.restart, Some(1));
    assert!(!state.suspended_in_orchestrator);
}

#[tokio::test]
async fn test_unanchored_warm_up_keeps_cpu_capped() {
    let harness = Harness::with_unanchored_warm_up(active_node(), Duration::from_secs(600));
    let mut state = AgentState::default();
    harness.converge(&mut state).await.unwrap();
    assert_eq!(harness.runtime.container().unwrap().resources.cpus, 2.0);
    harness.clear_calls();

    harness
        .update_node(|node| node.wanted_restart_generation = Some(2))
        .await;
    harness.converge(&mut state).await.unwrap();

    assert_eq!(harness.runtime.call_count("restart_vespa"), 1);
    assert_eq!(harness.runtime.call_count("update_container"), 0);
    assert_eq!(harness.runtime.container().unwrap().resources.cpus, 2.0);
}

#[tokio::test]
async fn test_warm_up_holds_back_resume() {
    let mut node = active_node();
    node.orchestrator_status = OrchestratorStatus::AllowedToBeDown;
    let harness = Harness::with_warm_up(node, Duration::from_secs(60));
    let mut state = AgentState::default();

    let message = transient_message(harness.converge(&mut state).await);
    assert!(message.contains("Refusing to resume until warm up period ends (in 60s)"));
    assert!(harness.runtime.container().unwrap().resources.is_cpu_unlimited());
    assert!(state.first_successful_health_check.is_some());

    harness.clock.advance(chrono::Duration::seconds(30));
    transient_message(harness.converge(&mut state).await);
    assert_eq!(harness.runtime.call_count("update_container"), 0);
    assert_eq!(harness.orchestrator.call_count("resume"), 0);

    harness.clock.advance(chrono::Duration::seconds(31));
    harness.converge(&mut state).await.unwrap();

    assert_eq!(harness.runtime.call_count("update_container"), 1);
    let resources = harness.runtime.container().unwrap().resources;
    assert_eq!(resources.cpus, 2.0);
    assert_eq!(resources.memory_bytes, 4 * 1024 * 1024 * 1024);
    assert_eq!(harness.orchestrator.call_count("resume"), 1);
}

#[tokio::test]
async fn test_unhealthy_node_is_transient() {
    let harness = Harness::with_warm_up(active_node(), Duration::from_secs(60));
    harness.maintainers.set_unhealthy(Some("services down"));
    let mut state = AgentState::default();

    let message = transient_message(harness.converge(&mut state).await);

    assert!(message.contains("services down"));
    assert!(state.first_successful_health_check.is_none());
}

#[tokio::test]
async fn test_dirty_node_is_cleaned() {
    let harness = Harness::new(active_node());
    let mut state = harness.converged().await;

    harness.update_node(|node| node.state = NodeState::Dirty).await;
    harness.converge(&mut state).await.unwrap();

    assert_eq!(harness.runtime.call_count("remove_container"), 1);
    assert_eq!(harness.runtime.call_count("create_container"), 0);
    assert!(harness.runtime.container().is_none());
    assert_eq!(harness.maintainers.call_count("clear_credentials"), 1);
    assert_eq!(harness.maintainers.call_count("archive_node_storage"), 1);
    assert!(harness.orchestrator.calls().is_empty());
    assert_eq!(
        harness.repository.state_changes(),
        vec![(hostname(), NodeState::Ready)]
    );

    let stored = harness.repository.get_node(&hostname()).await.unwrap().unwrap();
    assert_eq!(stored.current_docker_image, None);
}

#[tokio::test]
async fn test_provisioned_node_becomes_ready() {
    let node = NodeSpec::new(hostname(), NodeState::Provisioned, common::resources());
    let harness = Harness::new(node);
    let mut state = AgentState::default();

    harness.converge(&mut state).await.unwrap();

    assert_eq!(harness.runtime.calls(), vec!["get_container"]);
    assert_eq!(
        harness.repository.state_changes(),
        vec![(hostname(), NodeState::Ready)]
    );
}

#[rstest]
#[case::deprovisioned(NodeState::Deprovisioned, "UNKNOWN STATE DEPROVISIONED")]
#[case::breakfixed(NodeState::Breakfixed, "UNKNOWN STATE BREAKFIXED")]
#[case::unknown(NodeState::Unknown, "UNKNOWN STATE UNKNOWN")]
#[tokio::test]
async fn test_unhandled_state_is_error(#[case] node_state: NodeState, #[case] expected: &str) {
    let node = NodeSpec::new(hostname(), node_state, common::resources());
    let harness = Harness::new(node);
    let mut state = AgentState::default();

    let err = harness.converge(&mut state).await.unwrap_err();

    assert_eq!(err.kind(), OutcomeKind::Error);
    assert_eq!(err.to_string(), expected);
}

#[tokio::test]
async fn test_unallocated_node_stops_services() {
    let harness = Harness::new(active_node());
    let mut state = harness.converged().await;

    harness
        .update_node(|node| {
            node.state = NodeState::Ready;
            node.owner = None;
            node.wanted_restart_generation = None;
        })
        .await;
    harness.converge(&mut state).await.unwrap();

    assert_eq!(harness.runtime.call_count("stop_services"), 1);
    assert_eq!(harness.runtime.call_count("remove_container"), 0);
    assert_eq!(harness.maintainers.call_count("sync_logs_final"), 1);
    assert!(!state.has_started_services);

    harness.converge(&mut state).await.unwrap();
    assert_eq!(harness.runtime.call_count("stop_services"), 1);
}

#[tokio::test]
async fn test_reserved_node_pre_pulls_image() {
    let mut node = NodeSpec::new(hostname(), NodeState::Reserved, common::resources());
    node.wanted_docker_image = Some(image("8.1.0"));
    let harness = Harness::new(node);
    harness.runtime.set_pull_in_progress(&image("8.1.0"), true);
    let mut state = AgentState::default();

    harness.converge(&mut state).await.unwrap();

    assert_eq!(harness.runtime.call_count("pull_image"), 1);
    assert_eq!(harness.runtime.call_count("create_container"), 0);
}

#[tokio::test]
async fn test_suspend_denied_refreshes_configuration() {
    let harness = Harness::new(active_node());
    let mut state = harness.converged().await;

    harness
        .orchestrator
        .set_deny_suspend(Some("another node in the cluster is down"));
    harness.maintainers.set_acl_failure(Some("stale rules"));
    harness
        .update_node(|node| node.wanted_docker_image = Some(image("8.2.0")))
        .await;

    let err = harness.converge(&mut state).await.unwrap_err();

    assert_eq!(err.kind(), OutcomeKind::Transient);
    match &err {
        ConvergenceError::Orchestrator { source, suppressed } => {
            assert!(matches!(source, OrchestratorError::Denied { .. }));
            assert_eq!(suppressed, &vec!["acl: stale rules".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(harness.maintainers.call_count("acl_converge"), 1);
    assert_eq!(harness.maintainers.call_count("wireguard_converge"), 1);
    assert_eq!(harness.runtime.call_count("remove_container"), 0);
    assert!(harness.runtime.container().unwrap().is_running());
}

#[tokio::test]
async fn test_resume_failure_is_error_after_attributes() {
    let mut node = active_node();
    node.orchestrator_status = OrchestratorStatus::AllowedToBeDown;
    let harness = Harness::new(node);
    harness.orchestrator.set_fail_resume(Some("timeout"));
    let mut state = AgentState::default();

    let err = harness.converge(&mut state).await.unwrap_err();

    assert_eq!(err.kind(), OutcomeKind::Error);
    // Attributes were published before the orchestrator was asked.
    let stored = harness.repository.get_node(&hostname()).await.unwrap().unwrap();
    assert_eq!(stored.current_docker_image, Some(image("8.1.0")));
}

#[tokio::test]
async fn test_drop_documents() {
    let data_dir = tempfile::tempdir().unwrap();
    let harness = Harness::with_data_dir(active_node(), data_dir.path());
    let mut state = harness.converged().await;

    let documents = harness.context().await.paths().documents_dir();
    std::fs::create_dir_all(&documents).unwrap();
    std::fs::write(documents.join("index.dat"), b"documents").unwrap();

    harness
        .update_node(|node| {
            node.reports
                .set(DropDocumentsReport::REPORT_ID, DropDocumentsReport::default().to_json())
        })
        .await;

    // Dropped: container removed, documents deleted, timestamp recorded.
    let message = transient_message(harness.converge(&mut state).await);
    assert!(message.contains("waiting for signal to start the container"));
    assert!(!documents.exists());
    assert!(harness.runtime.container().is_none());
    assert!(harness.orchestrator.calls().is_empty());

    let now_millis = harness.clock.now().timestamp_millis();
    let report = harness.context().await.node().reports.drop_documents().unwrap();
    assert_eq!(report.dropped_at, Some(now_millis));

    // Waiting for the readied signal.
    transient_message(harness.converge(&mut state).await);
    assert_eq!(harness.runtime.call_count("create_container"), 0);

    harness
        .update_node(|node| {
            let readied = DropDocumentsReport {
                readied_at: Some(now_millis + 1000),
                ..report
            };
            node.reports.set(DropDocumentsReport::REPORT_ID, readied.to_json());
        })
        .await;

    harness.converge(&mut state).await.unwrap();
    assert_eq!(harness.runtime.call_count("create_container"), 1);

    let report = harness.context().await.node().reports.drop_documents().unwrap();
    assert!(report.started_at.is_some());

    // Started: the gate stays open.
    harness.clear_calls();
    harness.converge(&mut state).await.unwrap();
    assert_eq!(harness.runtime.call_count("remove_container"), 0);
}

#[tokio::test]
async fn test_observed_reboot_generation_is_adopted() {
    let harness = Harness::new(active_node());
    let mut state = harness.converged().await;

    harness
        .update_node(|node| {
            node.wanted_reboot_generation = 3;
            node.current_reboot_generation = 3;
        })
        .await;
    harness.converge(&mut state).await.unwrap();

    assert_eq!(state.generations.reboot, 3);
    assert_eq!(harness.runtime.call_count("remove_container"), 0);
}

#[tokio::test]
async fn test_stop_for_host_suspension_removes_container() {
    let harness = Harness::new(active_node());
    let mut state = harness.converged().await;
    let context = harness.context().await;

    harness
        .converger
        .stop_for_host_suspension(&mut state, &context)
        .await
        .unwrap();

    assert!(harness.runtime.container().is_none());
    assert!(harness.orchestrator.calls().is_empty());
    assert_eq!(state.container_state, ContainerState::Absent);
    assert!(!state.has_started_services);
}

/// Runtime where another container takes the node's place right after the
/// first start.
struct ReplacingRuntime {
    inner: Arc<MockContainerOperations>,
    replaced: AtomicBool,
}

#[async_trait]
impl ContainerOperations for ReplacingRuntime {
    async fn create_container(
        &self,
        context: &NodeAgentContext,
        resources: ContainerResources,
    ) -> Result<ContainerData, RuntimeError> {
        self.inner.create_container(context, resources).await
    }

    async fn start_container(&self, context: &NodeAgentContext) -> Result<(), RuntimeError> {
        self.inner.start_container(context).await?;
        if !self.replaced.swap(true, Ordering::SeqCst) {
            let stranger = self.inner.container().map(|container| Container {
                id: ContainerId::new("ctr_stranger"),
                ..container
            });
            self.inner.set_container(stranger);
        }
        Ok(())
    }

    async fn remove_container(
        &self,
        context: &NodeAgentContext,
        container: &Container,
    ) -> Result<(), RuntimeError> {
        self.inner.remove_container(context, container).await
    }

    async fn update_container(
        &self,
        context: &NodeAgentContext,
        id: &ContainerId,
        resources: ContainerResources,
    ) -> Result<(), RuntimeError> {
        self.inner.update_container(context, id, resources).await
    }

    async fn get_container(
        &self,
        context: &NodeAgentContext,
    ) -> Result<Option<Container>, RuntimeError> {
        self.inner.get_container(context).await
    }

    async fn pull_image_async_if_needed(
        &self,
        context: &NodeAgentContext,
        image: &DockerImage,
        credentials: &RegistryCredentials,
    ) -> Result<bool, RuntimeError> {
        self.inner
            .pull_image_async_if_needed(context, image, credentials)
            .await
    }

    async fn start_services(&self, context: &NodeAgentContext) -> Result<String, RuntimeError> {
        self.inner.start_services(context).await
    }

    async fn stop_services(&self, context: &NodeAgentContext) -> Result<String, RuntimeError> {
        self.inner.stop_services(context).await
    }

    async fn resume_node(&self, context: &NodeAgentContext) -> Result<String, RuntimeError> {
        self.inner.resume_node(context).await
    }

    async fn suspend_node(&self, context: &NodeAgentContext) -> Result<String, RuntimeError> {
        self.inner.suspend_node(context).await
    }

    async fn restart_vespa(&self, context: &NodeAgentContext) -> Result<String, RuntimeError> {
        self.inner.restart_vespa(context).await
    }
}

#[tokio::test]
async fn test_container_replaced_while_starting_is_removed() {
    let runtime = Arc::new(MockContainerOperations::new());
    let converger = Converger::new(Collaborators::new(
        Arc::new(ReplacingRuntime {
            inner: runtime.clone(),
            replaced: AtomicBool::new(false),
        }),
        Arc::new(InMemoryNodeRepository::new()),
        Arc::new(MockOrchestrator::new()),
        Arc::new(MockMaintainers::new()),
    ));
    let context = NodeAgentContext::new(active_node(), "/tmp/fleet-node-agent-test");
    let mut state = AgentState::default();

    let err = converger.converge(&mut state, &context).await.unwrap_err();

    assert_eq!(err.kind(), OutcomeKind::Error);
    assert!(err.to_string().contains("found ctr_stranger"));
    assert_eq!(state.container_state, ContainerState::Starting);

    converger.converge(&mut state, &context).await.unwrap();

    assert_eq!(runtime.call_count("remove_container"), 1);
    assert_eq!(runtime.call_count("create_container"), 2);
    let container = runtime.container().unwrap();
    assert_ne!(container.id, ContainerId::new("ctr_stranger"));
    assert!(container.is_running());
    assert_eq!(state.container_state, ContainerState::Unknown);
}
