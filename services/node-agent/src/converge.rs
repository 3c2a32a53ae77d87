//! Convergence algorithm.
//!
//! One call to [`Converger::converge`] inspects the node's lifecycle state
//! and the observed container, and issues the actions needed to close the
//! gap. An attempt that cannot finish yet returns a [`ConvergenceError`];
//! the next tick simply tries again.
//!
//! Everything the agent remembers between ticks lives in [`AgentState`],
//! which the agent loop owns and threads through each call.

use std::sync::Arc;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use fleet_id::DockerImage;
use fleet_reconcile::{ContainerResources, Generations, RemovalReasons};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::container::{Container, ContainerState};
use crate::context::NodeAgentContext;
use crate::error::ConvergenceError;
use crate::maintainers::{
    AclMaintainer, CredentialsMaintainer, HealthChecker, ServiceDumper, StorageMaintainer,
    WireguardTask,
};
use crate::orchestrator::Orchestrator;
use crate::repository::NodeRepository;
use crate::runtime::{ContainerOperations, RegistryCredentials, RuntimeError};
use crate::spec::{DropDocumentsReport, NodeAttributes, NodeState};

type Result<T> = std::result::Result<T, ConvergenceError>;

/// State carried from one convergence attempt to the next.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentState {
    pub container_state: ContainerState,
    pub generations: Generations,
    /// Services start with the container, so this starts out true.
    pub has_started_services: bool,
    pub has_resumed_node: bool,
    pub suspended_in_orchestrator: bool,
    /// Anchor of the warm-up window.
    pub first_successful_health_check: Option<DateTime<Utc>>,
}

impl Default for AgentState {
    fn default() -> Self {
        Self {
            container_state: ContainerState::Unknown,
            generations: Generations::default(),
            has_started_services: true,
            has_resumed_node: false,
            suspended_in_orchestrator: false,
            first_successful_health_check: None,
        }
    }
}

/// External systems one node's convergence talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub container_operations: Arc<dyn ContainerOperations>,
    pub node_repository: Arc<dyn NodeRepository>,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub storage_maintainer: Arc<dyn StorageMaintainer>,
    pub health_checker: Option<Arc<dyn HealthChecker>>,
    pub credentials_maintainers: Vec<Arc<dyn CredentialsMaintainer>>,
    pub acl_maintainer: Option<Arc<dyn AclMaintainer>>,
    pub wireguard_tasks: Vec<Arc<dyn WireguardTask>>,
    pub service_dumper: Option<Arc<dyn ServiceDumper>>,
    pub registry_credentials: RegistryCredentials,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    pub fn new(
        container_operations: Arc<dyn ContainerOperations>,
        node_repository: Arc<dyn NodeRepository>,
        orchestrator: Arc<dyn Orchestrator>,
        storage_maintainer: Arc<dyn StorageMaintainer>,
    ) -> Self {
        Self {
            container_operations,
            node_repository,
            orchestrator,
            storage_maintainer,
            health_checker: None,
            credentials_maintainers: Vec::new(),
            acl_maintainer: None,
            wireguard_tasks: Vec::new(),
            service_dumper: None,
            registry_credentials: RegistryCredentials::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_health_checker(mut self, health_checker: Arc<dyn HealthChecker>) -> Self {
        self.health_checker = Some(health_checker);
        self
    }

    pub fn with_credentials_maintainer(mut self, maintainer: Arc<dyn CredentialsMaintainer>) -> Self {
        self.credentials_maintainers.push(maintainer);
        self
    }

    pub fn with_acl_maintainer(mut self, maintainer: Arc<dyn AclMaintainer>) -> Self {
        self.acl_maintainer = Some(maintainer);
        self
    }

    pub fn with_wireguard_task(mut self, task: Arc<dyn WireguardTask>) -> Self {
        self.wireguard_tasks.push(task);
        self
    }

    pub fn with_service_dumper(mut self, service_dumper: Arc<dyn ServiceDumper>) -> Self {
        self.service_dumper = Some(service_dumper);
        self
    }

    pub fn with_registry_credentials(mut self, credentials: RegistryCredentials) -> Self {
        self.registry_credentials = credentials;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Runs convergence attempts for one node.
pub struct Converger {
    collaborators: Collaborators,
}

impl Converger {
    pub fn new(collaborators: Collaborators) -> Self {
        Self { collaborators }
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Run one convergence attempt.
    pub async fn converge(&self, state: &mut AgentState, context: &NodeAgentContext) -> Result<()> {
        let node = context.node();
        let container = self.get_container(state, context).await?;

        if state
            .generations
            .adopt_observed(node.current_reboot_generation, node.current_restart_generation)
        {
            debug!(
                reboot = state.generations.reboot,
                restart = ?state.generations.restart,
                "Adopted generations from node repository"
            );
        }

        match node.state {
            NodeState::Ready
            | NodeState::Reserved
            | NodeState::Failed
            | NodeState::Inactive
            | NodeState::Parked => {
                self.storage().sync_logs(context, true).await?;
                if node.state == NodeState::Reserved {
                    self.download_image_if_needed(context, container.as_ref()).await?;
                }
                self.remove_container_if_needed(state, context, container)
                    .await?;
                self.update_node_repo_with_current_attributes(state, context, None)
                    .await?;
                self.stop_services_if_needed(state, context).await?;
            }
            NodeState::Active => self.converge_active(state, context, container).await?,
            NodeState::Provisioned => {
                self.collaborators
                    .node_repository
                    .set_node_state(context.hostname(), NodeState::Ready)
                    .await?;
            }
            NodeState::Dirty => {
                self.remove_container_if_needed(state, context, container)
                    .await?;
                info!(
                    state = %node.state,
                    "Will delete application storage and mark node as ready"
                );
                for maintainer in &self.collaborators.credentials_maintainers {
                    maintainer.clear_credentials(context).await?;
                }
                self.storage().sync_logs(context, false).await?;
                self.storage().archive_node_storage(context).await?;
                self.update_node_repo_with_current_attributes(state, context, None)
                    .await?;
                self.collaborators
                    .node_repository
                    .set_node_state(context.hostname(), NodeState::Ready)
                    .await?;
            }
            NodeState::Deprovisioned | NodeState::Breakfixed | NodeState::Unknown => {
                return Err(ConvergenceError::error(format!(
                    "UNKNOWN STATE {}",
                    node.state.to_string().to_uppercase()
                )));
            }
        }

        Ok(())
    }

    /// Remove the container, if any, ahead of a host suspension. The caller
    /// has already dealt with the orchestrator.
    pub async fn stop_for_host_suspension(
        &self,
        state: &mut AgentState,
        context: &NodeAgentContext,
    ) -> Result<()> {
        if let Some(container) = self.get_container(state, context).await? {
            self.remove_container(
                state,
                context,
                &container,
                &RemovalReasons::from("Suspending host"),
                true,
            )
            .await?;
        }
        Ok(())
    }

    async fn converge_active(
        &self,
        state: &mut AgentState,
        context: &NodeAgentContext,
        container: Option<Container>,
    ) -> Result<()> {
        let node = context.node();

        self.storage().sync_logs(context, false).await?;
        self.storage().clean_disk_if_full(context).await?;
        self.storage()
            .handle_core_dumps_for_container(context, container.as_ref(), false)
            .await?;

        if self.download_image_if_needed(context, container.as_ref()).await? {
            let wanted = node
                .wanted_docker_image
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            return Err(ConvergenceError::transient(format!(
                "Waiting for image to download {wanted}"
            )));
        }

        let container = self.drop_documents_if_needed(state, context, container).await?;
        let container = self
            .remove_container_if_needed(state, context, container)
            .await?;

        for maintainer in &self.collaborators.credentials_maintainers {
            maintainer.converge(context).await?;
        }

        let container = match container {
            None => {
                state.container_state = ContainerState::Starting;
                let container = self.start_container(state, context).await?;
                state.container_state = ContainerState::Unknown;
                container
            }
            Some(container) => self.update_container_if_needed(state, context, container).await?,
        };

        if let Some(acl_maintainer) = &self.collaborators.acl_maintainer {
            acl_maintainer.converge(context).await?;
        }
        for task in &self.collaborators.wireguard_tasks {
            task.converge(context).await?;
        }

        self.start_services_if_needed(state, context).await?;
        self.resume_node_if_needed(state, context).await?;

        if let Some(health_checker) = &self.collaborators.health_checker {
            health_checker
                .verify_health(context)
                .await
                .map_err(|e| ConvergenceError::transient(format!("Health check failed: {e:#}")))?;

            let now = self.collaborators.clock.now();
            let first = *state.first_successful_health_check.get_or_insert(now);

            if !container.resources.equals_cpu(&context.capped_resources()) {
                let left = warm_up_end(context, first)
                    .map(|end| end - now)
                    .filter(|left| *left > chrono::Duration::zero());
                let when = match left {
                    Some(left) => format!("in {}s", left.num_seconds()),
                    None => "next tick".to_string(),
                };
                return Err(ConvergenceError::transient(format!(
                    "Refusing to resume until warm up period ends ({when})"
                )));
            }
        }

        if let Some(service_dumper) = &self.collaborators.service_dumper {
            if let Err(e) = service_dumper.process_service_dump_request(context).await {
                warn!(error = %e, "Failed to process service dump request");
            }
        }

        // The rollout pipeline watches these attributes; a failing
        // orchestrator resume below must not hide a successful start.
        self.update_node_repo_with_current_attributes(state, context, Some(container.created_at))
            .await?;

        if state.suspended_in_orchestrator || node.orchestrator_status.is_suspended() {
            info!("Call resume against orchestrator");
            self.collaborators
                .orchestrator
                .resume(context.hostname())
                .await
                .map_err(|source| ConvergenceError::Orchestrator {
                    source,
                    suppressed: Vec::new(),
                })?;
            state.suspended_in_orchestrator = false;
        }

        Ok(())
    }

    fn storage(&self) -> &dyn StorageMaintainer {
        self.collaborators.storage_maintainer.as_ref()
    }

    async fn get_container(
        &self,
        state: &mut AgentState,
        context: &NodeAgentContext,
    ) -> Result<Option<Container>> {
        if state.container_state == ContainerState::Absent {
            return Ok(None);
        }
        let container = self
            .collaborators
            .container_operations
            .get_container(context)
            .await?;
        if container.is_none() {
            state.container_state = ContainerState::Absent;
        }
        Ok(container)
    }

    /// Start pulling the wanted image unless the container already runs it.
    ///
    /// Returns true while the pull is in progress.
    async fn download_image_if_needed(
        &self,
        context: &NodeAgentContext,
        container: Option<&Container>,
    ) -> Result<bool> {
        let Some(wanted) = &context.node().wanted_docker_image else {
            return Ok(false);
        };
        if container.map(|c| &c.image) == Some(wanted) {
            return Ok(false);
        }
        let in_progress = self
            .collaborators
            .container_operations
            .pull_image_async_if_needed(context, wanted, &self.collaborators.registry_credentials)
            .await?;
        Ok(in_progress)
    }

    /// Gate on a pending drop-documents report.
    ///
    /// Until the report is readied the container stays down: the first tick
    /// removes it, wipes the documents and records `droppedAt`, later ticks
    /// just wait.
    async fn drop_documents_if_needed(
        &self,
        state: &mut AgentState,
        context: &NodeAgentContext,
        container: Option<Container>,
    ) -> Result<Option<Container>> {
        let Some(report) = context.node().reports.drop_documents() else {
            return Ok(container);
        };
        if report.readied_at.is_some() {
            return Ok(container);
        }

        if report.dropped_at.is_none() {
            if let Some(container) = &container {
                self.remove_container(
                    state,
                    context,
                    container,
                    &RemovalReasons::from("Dropping documents"),
                    true,
                )
                .await?;
            }

            let documents = context.paths().documents_dir();
            match tokio::fs::remove_dir_all(&documents).await {
                Ok(()) => info!(path = %documents.display(), "Deleted documents"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(anyhow::Error::new(e)
                        .context(format!("failed to delete {}", documents.display()))
                        .into())
                }
            }

            let dropped_at = self.collaborators.clock.now().timestamp_millis();
            self.collaborators
                .node_repository
                .update_node_attributes(
                    context.hostname(),
                    NodeAttributes::new().with_report(
                        DropDocumentsReport::REPORT_ID,
                        report.with_dropped_at(dropped_at).to_json(),
                    ),
                )
                .await
                .context("failed to record dropped documents")?;
        }

        Err(ConvergenceError::transient(
            "Documents already dropped, waiting for signal to start the container",
        ))
    }

    /// Remove the container if any removal reason applies, otherwise restart
    /// its services in place if a restart is wanted.
    ///
    /// Returns the container still standing, if any.
    async fn remove_container_if_needed(
        &self,
        state: &mut AgentState,
        context: &NodeAgentContext,
        container: Option<Container>,
    ) -> Result<Option<Container>> {
        let Some(container) = container else {
            return Ok(None);
        };

        let reasons = self.removal_reasons(state, context, &container);
        if !reasons.is_empty() {
            self.remove_container(state, context, &container, &reasons, false)
                .await?;
            return Ok(None);
        }

        match restart_reason(state, context, &container) {
            Some(reason) => {
                let container = self.restart_services(state, context, container, &reason).await?;
                Ok(Some(container))
            }
            None => Ok(Some(container)),
        }
    }

    fn removal_reasons(
        &self,
        state: &AgentState,
        context: &NodeAgentContext,
        container: &Container,
    ) -> RemovalReasons {
        let node = context.node();
        let mut reasons = RemovalReasons::new();

        reasons.add_if(
            matches!(node.state, NodeState::Dirty | NodeState::Provisioned),
            || format!("Node in state {}, container should no longer be running", node.state),
        );

        if let Some(wanted) = &node.wanted_docker_image {
            reasons.add_if(&container.image != wanted, || {
                format!(
                    "The node is supposed to run a new Docker image: {} -> {}",
                    container.image, wanted
                )
            });
        }

        reasons.add_if(!container.is_running(), || "Container no longer running".to_string());

        reasons.add_if(
            state.generations.reboot_behind(node.wanted_reboot_generation),
            || {
                format!(
                    "Container reboot wanted. Current: {}, Wanted: {}",
                    state.generations.reboot, node.wanted_reboot_generation
                )
            },
        );

        let wanted = self.wanted_resources(state, context);
        reasons.add_if(!wanted.equals_memory(&container.resources), || {
            format!(
                "Container should be running with different memory allocation, wanted: {}, actual: {}",
                wanted.to_string_memory(),
                container.resources.to_string_memory()
            )
        });

        reasons.add_if(state.container_state == ContainerState::Starting, || {
            "Container failed to start".to_string()
        });

        reasons
    }

    async fn restart_services(
        &self,
        state: &mut AgentState,
        context: &NodeAgentContext,
        container: Container,
        reason: &str,
    ) -> Result<Container> {
        info!(reason, "Restarting services");
        self.orchestrator_suspend_node(state, context).await?;

        let mut container = container;
        if self.warm_up_enabled(context) && !container.resources.is_cpu_unlimited() {
            let resources = container.resources.with_unlimited_cpus();
            info!(
                from = %container.resources.to_string_cpu(),
                to = %resources.to_string_cpu(),
                "Updating container resources for restart"
            );
            self.collaborators
                .container_operations
                .update_container(context, &container.id, resources)
                .await?;
            container.resources = resources;
        }

        let output = self
            .collaborators
            .container_operations
            .restart_vespa(context)
            .await?;
        if !output.trim().is_empty() {
            info!(output = %output.trim(), "Restart output");
        }

        state.generations.restart = context.node().wanted_restart_generation;
        state.first_successful_health_check = None;
        Ok(container)
    }

    async fn remove_container(
        &self,
        state: &mut AgentState,
        context: &NodeAgentContext,
        container: &Container,
        reasons: &RemovalReasons,
        already_suspended: bool,
    ) -> Result<()> {
        info!(reasons = %reasons, "Will remove container");

        if container.is_running() {
            if !already_suspended {
                self.orchestrator_suspend_node(state, context).await?;
            }
            if context.node().state != NodeState::Dirty {
                self.suspend(state, context).await;
            }
            if let Err(e) = self.stop_services(state, context).await {
                warn!(error = %e, "Failed stopping services, ignoring");
            }
        }

        self.storage()
            .handle_core_dumps_for_container(context, Some(container), true)
            .await?;
        self.collaborators
            .container_operations
            .remove_container(context, container)
            .await?;

        state.container_state = ContainerState::Absent;
        state.has_started_services = false;
        state.has_resumed_node = false;
        state.first_successful_health_check = None;
        info!(
            container_state = %state.container_state,
            "Container successfully removed"
        );
        Ok(())
    }

    async fn start_container(
        &self,
        state: &mut AgentState,
        context: &NodeAgentContext,
    ) -> Result<Container> {
        let node = context.node();
        let image = node.wanted_docker_image.as_ref().ok_or_else(|| {
            ConvergenceError::error(format!("No wanted docker image for active node {}", node.hostname))
        })?;

        let resources = self.wanted_resources(state, context);
        info!(image = %image, resources = %resources, "Starting container");

        let operations = &self.collaborators.container_operations;
        let created = operations.create_container(context, resources).await?;
        operations.start_container(context).await?;

        state
            .generations
            .satisfy(node.wanted_reboot_generation, node.wanted_restart_generation);
        state.has_started_services = true;
        state.has_resumed_node = false;

        // Status, resources and creation time are only known to the runtime.
        let container = operations
            .get_container(context)
            .await?
            .ok_or_else(|| RuntimeError::NotFound(context.container_name().clone()))?;
        if container.id != created.id {
            // Left in STARTING, so the next tick removes the stranger.
            return Err(ConvergenceError::error(format!(
                "Container {} was replaced while starting: created {}, found {}",
                context.container_name(),
                created.id,
                container.id
            )));
        }
        Ok(container)
    }

    /// Bring the CPU allocation of a running container in line, unless the
    /// node is still warming up. Memory is left alone; a memory change
    /// replaces the container instead.
    async fn update_container_if_needed(
        &self,
        state: &AgentState,
        context: &NodeAgentContext,
        container: Container,
    ) -> Result<Container> {
        if self.in_warm_up(state, context) {
            return Ok(container);
        }
        let wanted = self.wanted_resources(state, context);
        if wanted.equals_cpu(&container.resources) {
            return Ok(container);
        }

        info!(
            wanted = %wanted.to_string_cpu(),
            current = %container.resources.to_string_cpu(),
            "Container should be running with different CPU allocation"
        );
        let resources = wanted.with_memory_bytes(container.resources.memory_bytes);
        self.collaborators
            .container_operations
            .update_container(context, &container.id, resources)
            .await?;

        Ok(Container {
            resources,
            ..container
        })
    }

    /// Ask the orchestrator for permission to take an active node down.
    ///
    /// A denial may stem from stale ACL or wireguard configuration on this
    /// node blocking some other node, so both are refreshed before the
    /// error is returned.
    async fn orchestrator_suspend_node(
        &self,
        state: &mut AgentState,
        context: &NodeAgentContext,
    ) -> Result<()> {
        if context.node().state != NodeState::Active {
            return Ok(());
        }

        info!("Ask orchestrator for permission to suspend node");
        match self.collaborators.orchestrator.suspend(context.hostname()).await {
            Ok(()) => {
                state.suspended_in_orchestrator = true;
                Ok(())
            }
            Err(source) => {
                let suppressed = self.converge_acl_and_wireguard(context).await;
                for failure in &suppressed {
                    warn!(error = %failure, "Suppressing configuration refresh failure");
                }
                Err(ConvergenceError::Orchestrator { source, suppressed })
            }
        }
    }

    /// Best-effort ACL and wireguard refresh. Returns the failures.
    async fn converge_acl_and_wireguard(&self, context: &NodeAgentContext) -> Vec<String> {
        let mut failures = Vec::new();
        if let Some(acl_maintainer) = &self.collaborators.acl_maintainer {
            if let Err(e) = acl_maintainer.converge(context).await {
                failures.push(format!("{e:#}"));
            }
        }
        for task in &self.collaborators.wireguard_tasks {
            if let Err(e) = task.converge(context).await {
                failures.push(format!("{e:#}"));
            }
        }
        failures
    }

    async fn start_services_if_needed(
        &self,
        state: &mut AgentState,
        context: &NodeAgentContext,
    ) -> Result<()> {
        if state.has_started_services {
            return Ok(());
        }
        info!("Starting services");
        let output = self
            .collaborators
            .container_operations
            .start_services(context)
            .await?;
        log_output("start services", &output);
        state.has_started_services = true;
        Ok(())
    }

    async fn resume_node_if_needed(
        &self,
        state: &mut AgentState,
        context: &NodeAgentContext,
    ) -> Result<()> {
        if state.has_resumed_node {
            return Ok(());
        }
        info!("Resuming services");
        let output = self
            .collaborators
            .container_operations
            .resume_node(context)
            .await?;
        log_output("resume", &output);
        state.has_resumed_node = true;
        Ok(())
    }

    async fn stop_services_if_needed(
        &self,
        state: &mut AgentState,
        context: &NodeAgentContext,
    ) -> Result<()> {
        if state.has_started_services && !context.node().is_allocated() {
            self.stop_services(state, context).await?;
        }
        Ok(())
    }

    async fn stop_services(&self, state: &mut AgentState, context: &NodeAgentContext) -> Result<()> {
        if state.container_state == ContainerState::Absent {
            return Ok(());
        }
        info!("Stopping services");
        state.has_started_services = false;
        state.has_resumed_node = false;
        state.first_successful_health_check = None;
        match self
            .collaborators
            .container_operations
            .stop_services(context)
            .await
        {
            Ok(output) => {
                log_output("stop services", &output);
                Ok(())
            }
            Err(RuntimeError::NotFound(_)) => {
                state.container_state = ContainerState::Absent;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Tell the node to stop serving. Failures are logged and ignored.
    async fn suspend(&self, state: &mut AgentState, context: &NodeAgentContext) {
        if state.container_state == ContainerState::Absent {
            return;
        }
        state.has_resumed_node = false;
        info!("Suspending services on node");
        match self
            .collaborators
            .container_operations
            .suspend_node(context)
            .await
        {
            Ok(output) => log_output("suspend", &output),
            Err(RuntimeError::NotFound(_)) => state.container_state = ContainerState::Absent,
            Err(e) => warn!(error = %e, "Failed trying to suspend container"),
        }
    }

    /// Publish generations, image and completed report transitions, if they
    /// differ from what the node repository already has.
    async fn update_node_repo_with_current_attributes(
        &self,
        state: &AgentState,
        context: &NodeAgentContext,
        container_created_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let node = context.node();
        let mut current = NodeAttributes::new();
        let mut wanted = NodeAttributes::new();

        if node.wanted_restart_generation.is_some()
            && node.current_restart_generation != state.generations.restart
        {
            current = current.with_restart_generation(node.current_restart_generation);
            wanted = wanted.with_restart_generation(state.generations.restart);
        }

        if node.current_reboot_generation != state.generations.reboot {
            current = current.with_reboot_generation(node.current_reboot_generation);
            wanted = wanted.with_reboot_generation(state.generations.reboot);
        }

        let actual_image = node
            .wanted_docker_image
            .clone()
            .filter(|_| state.container_state == ContainerState::Unknown);
        if node.current_docker_image != actual_image {
            current = current.with_docker_image(
                node.current_docker_image
                    .clone()
                    .unwrap_or_else(DockerImage::empty),
            );
            wanted = wanted.with_docker_image(actual_image.unwrap_or_else(DockerImage::empty));
        }

        if let (Some(created_at), Some(report)) = (container_created_at, node.reports.drop_documents()) {
            if report.readied_at.is_some() && report.started_at.is_none() {
                wanted = wanted.with_report(
                    DropDocumentsReport::REPORT_ID,
                    report.with_started_at(created_at.timestamp_millis()).to_json(),
                );
            }
        }

        if current != wanted {
            info!(from = %current, to = %wanted, "Publishing new set of attributes to node repo");
            self.collaborators
                .node_repository
                .update_node_attributes(context.hostname(), wanted)
                .await
                .context("failed to publish node attributes")?;
        }
        Ok(())
    }

    /// Resources the container should have right now: capped, except while
    /// warming up.
    fn wanted_resources(&self, state: &AgentState, context: &NodeAgentContext) -> ContainerResources {
        let resources = context.capped_resources();
        if self.in_warm_up(state, context) {
            resources.with_unlimited_cpus()
        } else {
            resources
        }
    }

    /// The warm-up window is anchored on the first successful health check,
    /// so a window configured without a health checker is ignored.
    fn warm_up_enabled(&self, context: &NodeAgentContext) -> bool {
        context.warm_up_duration().is_some() && self.collaborators.health_checker.is_some()
    }

    /// True from container start (or in-place restart) until the warm-up
    /// window after the first successful health check has passed.
    fn in_warm_up(&self, state: &AgentState, context: &NodeAgentContext) -> bool {
        if !self.warm_up_enabled(context) {
            return false;
        }
        match state.first_successful_health_check {
            None => true,
            Some(first) => warm_up_end(context, first)
                .map_or(true, |end| self.collaborators.clock.now() < end),
        }
    }
}

fn warm_up_end(context: &NodeAgentContext, first: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let warm_up = chrono::Duration::from_std(context.warm_up_duration()?).ok()?;
    first.checked_add_signed(warm_up)
}

fn restart_reason(state: &AgentState, context: &NodeAgentContext, container: &Container) -> Option<String> {
    let node = context.node();
    if !container.is_running() || node.state != NodeState::Active {
        return None;
    }
    if !state.generations.restart_behind(node.wanted_restart_generation) {
        return None;
    }
    Some(format!(
        "Restart requested - wanted restart generation has been bumped: {} -> {}",
        state.generations.restart.unwrap_or_default(),
        node.wanted_restart_generation.unwrap_or_default()
    ))
}

fn log_output(action: &str, output: &str) {
    let output = output.trim();
    if !output.is_empty() {
        debug!(action, output, "Command output");
    }
}
