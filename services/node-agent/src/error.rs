//! Convergence outcomes.
//!
//! A convergence attempt that cannot finish yet returns an error; the agent
//! loop inspects its [`OutcomeKind`] to decide whether to count it.

use thiserror::Error;

use crate::orchestrator::OrchestratorError;
use crate::runtime::RuntimeError;

/// Why a convergence attempt stopped short.
#[derive(Debug, Error)]
pub enum ConvergenceError {
    /// Not converged yet; retried next tick without counting.
    #[error("{0}")]
    Transient(String),

    /// Unexpected state; retried next tick and counted.
    #[error("{0}")]
    Error(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// Suspend or resume was refused or failed. `suppressed` holds the
    /// failures of the configuration refresh attempted afterwards.
    #[error("{source}{}", format_suppressed(.suppressed))]
    Orchestrator {
        source: OrchestratorError,
        suppressed: Vec<String>,
    },

    /// Any other collaborator failure.
    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

fn format_suppressed(suppressed: &[String]) -> String {
    if suppressed.is_empty() {
        String::new()
    } else {
        format!(" (suppressed: {})", suppressed.join("; "))
    }
}

/// How the agent loop treats a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    /// Logged only.
    Transient,
    /// Logged and counted.
    Error,
    /// The container disappeared underneath the agent.
    ContainerGone,
    /// Logged at the highest severity and counted.
    Unhandled,
}

impl ConvergenceError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::Transient(_) => OutcomeKind::Transient,
            Self::Error(_) => OutcomeKind::Error,
            Self::Runtime(RuntimeError::NotFound(_)) => OutcomeKind::ContainerGone,
            Self::Runtime(RuntimeError::Failed(_)) => OutcomeKind::Unhandled,
            Self::Orchestrator {
                source: OrchestratorError::Denied { .. },
                ..
            } => OutcomeKind::Transient,
            Self::Orchestrator { .. } => OutcomeKind::Error,
            Self::Other(_) => OutcomeKind::Unhandled,
        }
    }
}
