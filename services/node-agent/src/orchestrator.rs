//! Orchestrator interface and mock implementation.
//!
//! The orchestrator decides whether a node may be taken out of service
//! without violating the availability of the cluster it belongs to.

use std::sync::Mutex;

use async_trait::async_trait;
use fleet_id::HostName;
use thiserror::Error;
use tracing::debug;

/// Orchestrator failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    /// Suspending or resuming the node is not permitted right now.
    #[error("orchestrator denied {operation} of {hostname}: {reason}")]
    Denied {
        operation: &'static str,
        hostname: HostName,
        reason: String,
    },

    /// The orchestrator could not be reached or failed.
    #[error("orchestrator unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Ask for permission to take the node out of service.
    async fn suspend(&self, hostname: &HostName) -> Result<(), OrchestratorError>;

    /// Declare the node back in service.
    async fn resume(&self, hostname: &HostName) -> Result<(), OrchestratorError>;
}

#[derive(Default)]
struct MockState {
    deny_suspend: Option<String>,
    fail_resume: Option<String>,
    calls: Vec<String>,
}

/// Orchestrator that grants everything unless told otherwise.
#[derive(Default)]
pub struct MockOrchestrator {
    state: Mutex<MockState>,
}

impl MockOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deny suspension with `reason`, or grant it again with `None`.
    pub fn set_deny_suspend(&self, reason: Option<&str>) {
        self.lock().deny_suspend = reason.map(str::to_string);
    }

    /// Fail resume as unavailable with `reason`, or succeed again with `None`.
    pub fn set_fail_resume(&self, reason: Option<&str>) {
        self.lock().fail_resume = reason.map(str::to_string);
    }

    /// Calls made so far, as `suspend` / `resume`.
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
impl Orchestrator for MockOrchestrator {
    async fn suspend(&self, hostname: &HostName) -> Result<(), OrchestratorError> {
        let mut state = self.lock();
        state.calls.push("suspend".to_string());
        debug!(hostname = %hostname, "[MOCK] Suspend requested");
        match &state.deny_suspend {
            Some(reason) => Err(OrchestratorError::Denied {
                operation: "suspend",
                hostname: hostname.clone(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn resume(&self, hostname: &HostName) -> Result<(), OrchestratorError> {
        let mut state = self.lock();
        state.calls.push("resume".to_string());
        debug!(hostname = %hostname, "[MOCK] Resume requested");
        match &state.fail_resume {
            Some(reason) => Err(OrchestratorError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }
}
