//! Maintainer capabilities invoked during convergence.
//!
//! These cover storage housekeeping, health checking, credentials, ACLs,
//! wireguard and service dumps. Their internals live elsewhere; the agent
//! only needs the calls below. `MockMaintainers` implements all of them.

use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::container::Container;
use crate::context::NodeAgentContext;

#[async_trait]
pub trait StorageMaintainer: Send + Sync {
    /// Ship container logs. `is_final` is set for the last sync before
    /// the node's storage goes away.
    async fn sync_logs(&self, context: &NodeAgentContext, is_final: bool) -> Result<()>;

    async fn clean_disk_if_full(&self, context: &NodeAgentContext) -> Result<()>;

    async fn handle_core_dumps_for_container(
        &self,
        context: &NodeAgentContext,
        container: Option<&Container>,
        is_final: bool,
    ) -> Result<()>;

    /// Archive and remove the node's storage.
    async fn archive_node_storage(&self, context: &NodeAgentContext) -> Result<()>;
}

/// Verifies that services in the container are healthy.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn verify_health(&self, context: &NodeAgentContext) -> Result<()>;
}

#[async_trait]
pub trait CredentialsMaintainer: Send + Sync {
    async fn converge(&self, context: &NodeAgentContext) -> Result<()>;

    async fn clear_credentials(&self, context: &NodeAgentContext) -> Result<()>;
}

#[async_trait]
pub trait AclMaintainer: Send + Sync {
    async fn converge(&self, context: &NodeAgentContext) -> Result<()>;
}

#[async_trait]
pub trait WireguardTask: Send + Sync {
    async fn converge(&self, context: &NodeAgentContext) -> Result<()>;
}

#[async_trait]
pub trait ServiceDumper: Send + Sync {
    /// Handle a pending service dump request, if any.
    async fn process_service_dump_request(&self, context: &NodeAgentContext) -> Result<()>;
}

// =============================================================================
// Mock
// =============================================================================

#[derive(Default)]
struct MockState {
    calls: Vec<String>,
    unhealthy: Option<String>,
    acl_failure: Option<String>,
    wireguard_failure: Option<String>,
}

/// Records every maintainer call by name.
///
/// Health checks pass and ACL/wireguard converge unless a failure is set.
#[derive(Default)]
pub struct MockMaintainers {
    state: Mutex<MockState>,
}

impl MockMaintainers {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: &str, context: &NodeAgentContext) {
        debug!(hostname = %context.hostname(), call, "[MOCK] Maintainer call");
        self.lock().calls.push(call.to_string());
    }

    pub fn set_unhealthy(&self, reason: Option<&str>) {
        self.lock().unhealthy = reason.map(str::to_string);
    }

    pub fn set_acl_failure(&self, reason: Option<&str>) {
        self.lock().acl_failure = reason.map(str::to_string);
    }

    pub fn set_wireguard_failure(&self, reason: Option<&str>) {
        self.lock().wireguard_failure = reason.map(str::to_string);
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, call: &str) -> usize {
        self.lock().calls.iter().filter(|c| *c == call).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }
}

#[async_trait]
impl StorageMaintainer for MockMaintainers {
    async fn sync_logs(&self, context: &NodeAgentContext, is_final: bool) -> Result<()> {
        let call = if is_final { "sync_logs_final" } else { "sync_logs" };
        self.record(call, context);
        Ok(())
    }

    async fn clean_disk_if_full(&self, context: &NodeAgentContext) -> Result<()> {
        self.record("clean_disk_if_full", context);
        Ok(())
    }

    async fn handle_core_dumps_for_container(
        &self,
        context: &NodeAgentContext,
        _container: Option<&Container>,
        _is_final: bool,
    ) -> Result<()> {
        self.record("handle_core_dumps", context);
        Ok(())
    }

    async fn archive_node_storage(&self, context: &NodeAgentContext) -> Result<()> {
        self.record("archive_node_storage", context);
        Ok(())
    }
}

#[async_trait]
impl HealthChecker for MockMaintainers {
    async fn verify_health(&self, context: &NodeAgentContext) -> Result<()> {
        self.record("verify_health", context);
        if let Some(reason) = &self.lock().unhealthy {
            bail!("{} is unhealthy: {}", context.hostname(), reason);
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialsMaintainer for MockMaintainers {
    async fn converge(&self, context: &NodeAgentContext) -> Result<()> {
        self.record("credentials_converge", context);
        Ok(())
    }

    async fn clear_credentials(&self, context: &NodeAgentContext) -> Result<()> {
        self.record("clear_credentials", context);
        Ok(())
    }
}

#[async_trait]
impl AclMaintainer for MockMaintainers {
    async fn converge(&self, context: &NodeAgentContext) -> Result<()> {
        self.record("acl_converge", context);
        if let Some(reason) = &self.lock().acl_failure {
            bail!("acl: {}", reason);
        }
        Ok(())
    }
}

#[async_trait]
impl WireguardTask for MockMaintainers {
    async fn converge(&self, context: &NodeAgentContext) -> Result<()> {
        self.record("wireguard_converge", context);
        if let Some(reason) = &self.lock().wireguard_failure {
            bail!("wireguard: {}", reason);
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceDumper for MockMaintainers {
    async fn process_service_dump_request(&self, context: &NodeAgentContext) -> Result<()> {
        self.record("service_dump", context);
        Ok(())
    }
}
