//! Fleet Node Agent
//!
//! Runs on each host and converges every node on it toward the state the
//! node repository wants.
//!
//! ## Architecture
//!
//! - **Node Admin**: Fetches node specs every tick and keeps one agent per node
//! - **Node Agent**: Runs one convergence attempt per scheduled context
//! - **Collaborators**: Container runtime, node repository, orchestrator and
//!   maintainers (in-memory in development)

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fleet_node_agent::admin::{AdminSettings, NodeAdmin};
use fleet_node_agent::config::Config;
use fleet_node_agent::converge::Collaborators;
use fleet_node_agent::maintainers::MockMaintainers;
use fleet_node_agent::orchestrator::MockOrchestrator;
use fleet_node_agent::repository::{InMemoryNodeRepository, NodeRepository};
use fleet_node_agent::runtime::MockContainerOperations;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleet node agent");
    info!(
        hostname = %config.hostname,
        data_dir = %config.data_dir.display(),
        tick_interval_secs = config.tick_interval_secs,
        warm_up_secs = config.warm_up_secs,
        "Configuration loaded"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // In-memory collaborators for now
    let repository = Arc::new(InMemoryNodeRepository::new());
    let orchestrator = Arc::new(MockOrchestrator::new());

    let collaborators = {
        let repository: Arc<dyn NodeRepository> = repository.clone();
        Box::new(move |_: &fleet_id::HostName| {
            let maintainers = Arc::new(MockMaintainers::new());
            Collaborators::new(
                Arc::new(MockContainerOperations::new()),
                Arc::clone(&repository),
                orchestrator.clone(),
                maintainers.clone(),
            )
            .with_health_checker(maintainers.clone())
            .with_credentials_maintainer(maintainers.clone())
            .with_acl_maintainer(maintainers.clone())
            .with_wireguard_task(maintainers.clone())
            .with_service_dumper(maintainers)
        })
    };

    let admin = Arc::new(NodeAdmin::new(
        AdminSettings {
            hostname: config.hostname.clone(),
            data_dir: config.data_dir.clone(),
            warm_up: config.warm_up(),
            tick_interval: config.tick_interval(),
        },
        collaborators,
    ));

    // Start the admin loop
    let mut admin_handle = tokio::spawn({
        let admin = Arc::clone(&admin);
        let repository: Arc<dyn NodeRepository> = repository.clone();
        async move { admin.run(repository, shutdown_rx).await }
    });

    // Wait for shutdown signal
    let mut admin_exited = false;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut admin_handle => {
            admin_exited = true;
            if let Err(e) = result {
                error!(error = %e, "Node admin task panicked");
            }
        }
    }

    // Freeze the agents, then stop them
    if !admin.set_frozen(true, config.freeze_timeout()).await {
        info!("Not all agents acknowledged freeze before timeout");
    }
    let _ = shutdown_tx.send(true);
    if !admin_exited {
        if let Err(e) = admin_handle.await {
            error!(error = %e, "Node admin task panicked");
        }
    }

    info!("Node agent shutdown complete");
    Ok(())
}
