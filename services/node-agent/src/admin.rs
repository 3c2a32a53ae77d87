//! Node admin: owns the agents of every node on this host.
//!
//! Each tick the admin fetches node specs, starts agents for new nodes,
//! stops agents whose node went away, and hands every agent a fresh
//! context.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fleet_id::HostName;
use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentError, NodeAgent};
use crate::context::NodeAgentContext;
use crate::converge::{Collaborators, Converger};
use crate::repository::NodeRepository;
use crate::scheduler::ContextScheduler;
use crate::spec::NodeSpec;

#[derive(Debug, Error)]
pub enum AdminError {
    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("all agents must be frozen before suspending the host")]
    NotFrozen,

    #[error("failed to suspend host: {}", .0.join("; "))]
    HostSuspension(Vec<String>),
}

/// Builds the collaborators for a newly discovered node.
pub type CollaboratorsFactory = Box<dyn Fn(&HostName) -> Collaborators + Send + Sync>;

/// Settings shared by all agents on the host.
#[derive(Debug, Clone)]
pub struct AdminSettings {
    /// The host whose nodes this admin runs.
    pub hostname: HostName,
    pub data_dir: PathBuf,
    pub warm_up: Duration,
    pub tick_interval: Duration,
}

pub struct NodeAdmin {
    settings: AdminSettings,
    collaborators: CollaboratorsFactory,
    agents: Mutex<BTreeMap<HostName, Arc<NodeAgent>>>,
    frozen: Mutex<bool>,
}

impl NodeAdmin {
    pub fn new(settings: AdminSettings, collaborators: CollaboratorsFactory) -> Self {
        Self {
            settings,
            collaborators,
            agents: Mutex::new(BTreeMap::new()),
            frozen: Mutex::new(false),
        }
    }

    fn context_for(&self, spec: NodeSpec) -> NodeAgentContext {
        NodeAgentContext::new(spec, &self.settings.data_dir).with_warm_up(self.settings.warm_up)
    }

    /// Bring the set of agents in line with `specs` and schedule a tick for
    /// every node.
    pub async fn refresh(&self, specs: Vec<NodeSpec>) -> Result<(), AdminError> {
        let frozen = *self.frozen.lock().await;
        let mut agents = self.agents.lock().await;

        let wanted: BTreeMap<HostName, NodeSpec> = specs
            .into_iter()
            .map(|spec| (spec.hostname.clone(), spec))
            .collect();

        let removed: Vec<HostName> = agents
            .keys()
            .filter(|hostname| !wanted.contains_key(*hostname))
            .cloned()
            .collect();
        for hostname in removed {
            if let Some(agent) = agents.remove(&hostname) {
                info!(hostname = %hostname, "Node no longer on host, stopping agent");
                let context = agent.scheduler().current_context();
                if let Err(e) = agent.stop_for_removal(&context).await {
                    warn!(hostname = %hostname, error = %e, "Failed to stop agent");
                }
            }
        }

        for (hostname, spec) in wanted {
            let context = self.context_for(spec);
            match agents.get(&hostname) {
                Some(agent) => agent
                    .scheduler()
                    .schedule_tick_with(context, Instant::now()),
                None => {
                    info!(hostname = %hostname, "New node on host, starting agent");
                    let scheduler = Arc::new(ContextScheduler::new(context.clone()));
                    if frozen {
                        // Records the request; the loop acknowledges it on
                        // its first wait.
                        scheduler.set_frozen(true, Duration::ZERO).await;
                    }
                    let converger = Arc::new(Converger::new((self.collaborators)(&hostname)));
                    let agent = Arc::new(NodeAgent::new(scheduler, converger));
                    agent.start(&context)?;
                    agents.insert(hostname, agent);
                }
            }
        }

        debug!(agents = agents.len(), "Refreshed node agents");
        Ok(())
    }

    /// Freeze or unfreeze every agent. True only if all of them
    /// acknowledged within `timeout`.
    pub async fn set_frozen(&self, frozen: bool, timeout: Duration) -> bool {
        *self.frozen.lock().await = frozen;
        let agents: Vec<Arc<NodeAgent>> = self.agents.lock().await.values().cloned().collect();

        let results = join_all(
            agents
                .iter()
                .map(|agent| agent.scheduler().set_frozen(frozen, timeout)),
        )
        .await;

        let converged = results.iter().all(|reached| *reached);
        if converged {
            info!(frozen, agents = agents.len(), "All agents reached freeze state");
        } else {
            debug!(
                frozen,
                pending = results.iter().filter(|reached| !**reached).count(),
                "Waiting for agents to reach freeze state"
            );
        }
        converged
    }

    /// Remove every node's container ahead of host maintenance. All agents
    /// must be frozen first.
    pub async fn stop_for_host_suspension(&self) -> Result<(), AdminError> {
        let agents: Vec<Arc<NodeAgent>> = self.agents.lock().await.values().cloned().collect();
        if agents.iter().any(|agent| !agent.scheduler().is_frozen()) {
            return Err(AdminError::NotFrozen);
        }

        let mut failures = Vec::new();
        for agent in agents {
            let context = agent.scheduler().current_context();
            if let Err(e) = agent.stop_for_host_suspension(&context).await {
                error!(hostname = %context.hostname(), error = %e, "Failed to stop node for host suspension");
                failures.push(format!("{}: {}", context.hostname(), e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(AdminError::HostSuspension(failures))
        }
    }

    /// Sum of unhandled exceptions across agents since the last call.
    pub async fn total_unhandled_exceptions(&self) -> u64 {
        self.agents
            .lock()
            .await
            .values()
            .map(|agent| agent.get_and_reset_number_of_unhandled_exceptions())
            .sum()
    }

    pub async fn hostnames(&self) -> Vec<HostName> {
        self.agents.lock().await.keys().cloned().collect()
    }

    pub async fn agent(&self, hostname: &HostName) -> Option<Arc<NodeAgent>> {
        self.agents.lock().await.get(hostname).cloned()
    }

    /// Stop every agent.
    pub async fn stop_all(&self) {
        let agents = std::mem::take(&mut *self.agents.lock().await);
        for (hostname, agent) in agents {
            let context = agent.scheduler().current_context();
            if let Err(e) = agent.stop_for_removal(&context).await {
                warn!(hostname = %hostname, error = %e, "Failed to stop agent");
            }
        }
    }

    /// Refresh from the nodes `repository` lists for this host every tick
    /// until shutdown, then stop all agents.
    pub async fn run(
        &self,
        repository: Arc<dyn NodeRepository>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            host = %self.settings.hostname,
            tick_interval_secs = self.settings.tick_interval.as_secs(),
            "Starting node admin loop"
        );

        let mut interval = tokio::time::interval(self.settings.tick_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match repository.get_nodes(&self.settings.hostname).await {
                        Ok(specs) => {
                            if let Err(e) = self.refresh(specs).await {
                                error!(error = %e, "Failed to refresh node agents");
                            }
                        }
                        Err(e) => warn!(error = %e, "Failed to fetch node specs, will retry"),
                    }

                    let unhandled = self.total_unhandled_exceptions().await;
                    if unhandled > 0 {
                        warn!(count = unhandled, "Unhandled exceptions since last tick");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Node admin shutting down");
                        break;
                    }
                }
            }
        }

        self.stop_all().await;
    }
}
