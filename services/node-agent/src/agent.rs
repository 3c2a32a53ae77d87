//! Agent loop for one node.
//!
//! The loop waits for the next context, runs exactly one convergence attempt
//! with it, classifies the outcome and waits again. Nothing else converges
//! the node concurrently: the agent state is only borrowed by the loop for
//! the duration of an attempt, and by a host suspension in between.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use fleet_id::HostName;
use futures_util::FutureExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn, Instrument};

use crate::container::ContainerState;
use crate::context::NodeAgentContext;
use crate::converge::{AgentState, Converger};
use crate::error::{ConvergenceError, OutcomeKind};
use crate::scheduler::{ContextScheduler, SchedulerError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("agent for {hostname} already started")]
    AlreadyStarted { hostname: HostName },

    #[error("agent for {hostname} already stopped")]
    AlreadyStopped { hostname: HostName },
}

enum Lifecycle {
    NotStarted,
    Running(JoinHandle<()>),
    Stopped,
}

/// Owns the convergence loop of one node.
pub struct NodeAgent {
    scheduler: Arc<ContextScheduler>,
    converger: Arc<Converger>,
    state: Arc<tokio::sync::Mutex<AgentState>>,
    unhandled_exceptions: Arc<AtomicU64>,
    lifecycle: Mutex<Lifecycle>,
}

impl NodeAgent {
    pub fn new(scheduler: Arc<ContextScheduler>, converger: Arc<Converger>) -> Self {
        Self {
            scheduler,
            converger,
            state: Arc::new(tokio::sync::Mutex::new(AgentState::default())),
            unhandled_exceptions: Arc::new(AtomicU64::new(0)),
            lifecycle: Mutex::new(Lifecycle::NotStarted),
        }
    }

    pub fn scheduler(&self) -> &Arc<ContextScheduler> {
        &self.scheduler
    }

    /// Spawn the loop and schedule `context` for an immediate first tick.
    pub fn start(&self, context: &NodeAgentContext) -> Result<(), AgentError> {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        if !matches!(*lifecycle, Lifecycle::NotStarted) {
            return Err(AgentError::AlreadyStarted {
                hostname: context.hostname().clone(),
            });
        }

        info!(hostname = %context.hostname(), "Starting node agent");
        self.scheduler
            .schedule_tick_with(context.clone(), Instant::now());

        let span = tracing::info_span!("agent", hostname = %context.hostname());
        let handle = tokio::spawn(
            run_loop(
                Arc::clone(&self.scheduler),
                Arc::clone(&self.converger),
                Arc::clone(&self.state),
                Arc::clone(&self.unhandled_exceptions),
            )
            .instrument(span),
        );
        *lifecycle = Lifecycle::Running(handle);
        Ok(())
    }

    /// Stop the loop for good and wait for it to exit. No convergence
    /// happens after this returns.
    pub async fn stop_for_removal(&self, context: &NodeAgentContext) -> Result<(), AgentError> {
        let previous = {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *lifecycle, Lifecycle::Stopped)
        };

        self.scheduler.interrupt();
        match previous {
            Lifecycle::Stopped => {
                return Err(AgentError::AlreadyStopped {
                    hostname: context.hostname().clone(),
                })
            }
            Lifecycle::NotStarted => {}
            Lifecycle::Running(handle) => {
                if let Err(e) = handle.await {
                    error!(hostname = %context.hostname(), error = %e, "Agent loop task failed");
                }
            }
        }

        info!(hostname = %context.hostname(), "Stopped node agent");
        Ok(())
    }

    /// Remove the container right away for host maintenance. The loop
    /// itself keeps running.
    pub async fn stop_for_host_suspension(
        &self,
        context: &NodeAgentContext,
    ) -> Result<(), ConvergenceError> {
        let mut state = self.state.lock().await;
        self.converger
            .stop_for_host_suspension(&mut state, context)
            .instrument(context.span().clone())
            .await
    }

    /// Errors and unexpected failures since the last call.
    pub fn get_and_reset_number_of_unhandled_exceptions(&self) -> u64 {
        self.unhandled_exceptions.swap(0, Ordering::SeqCst)
    }

    /// Snapshot of the state carried between attempts.
    pub async fn state(&self) -> AgentState {
        self.state.lock().await.clone()
    }
}

async fn run_loop(
    scheduler: Arc<ContextScheduler>,
    converger: Arc<Converger>,
    state: Arc<tokio::sync::Mutex<AgentState>>,
    unhandled_exceptions: Arc<AtomicU64>,
) {
    loop {
        let context = match scheduler.next_context().await {
            Ok(context) => context,
            Err(SchedulerError::Interrupted) => break,
        };

        let mut agent_state = state.lock().await;
        let outcome = AssertUnwindSafe(converger.converge(&mut agent_state, &context))
            .catch_unwind()
            .instrument(context.span().clone())
            .await;

        context
            .span()
            .in_scope(|| record_outcome(outcome, &mut agent_state, &unhandled_exceptions));
    }

    info!("Agent loop stopped");
}

type Outcome = Result<Result<(), ConvergenceError>, Box<dyn std::any::Any + Send>>;

fn record_outcome(outcome: Outcome, state: &mut AgentState, unhandled_exceptions: &AtomicU64) {
    match outcome {
        Ok(Ok(())) => info!("Converged"),
        Ok(Err(e)) => match e.kind() {
            OutcomeKind::Transient => info!(reason = %e, "Not converged yet"),
            OutcomeKind::Error => {
                warn!(error = %e, "Convergence failed");
                unhandled_exceptions.fetch_add(1, Ordering::SeqCst);
            }
            OutcomeKind::ContainerGone => {
                state.container_state = ContainerState::Absent;
                warn!(
                    error = %e,
                    container_state = %state.container_state,
                    "Container removed unexpectedly, resetting container state"
                );
            }
            OutcomeKind::Unhandled => {
                error!(error = %e, "Unhandled exception, ignoring");
                unhandled_exceptions.fetch_add(1, Ordering::SeqCst);
            }
        },
        Err(panic) => {
            error!(panic = %panic_message(panic.as_ref()), "Convergence attempt panicked");
            unhandled_exceptions.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
