//! Hands contexts to one node's agent loop.
//!
//! A single producer (whoever drives the fleet) schedules contexts and asks
//! for freezes; a single consumer (the agent loop) pulls contexts. All shared
//! fields sit behind one mutex, and a [`Notify`] plays the condition
//! variable: every change wakes all waiters, who then re-check the state.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::info;

use crate::context::NodeAgentContext;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    /// `interrupt()` was called. Permanent.
    #[error("context scheduler interrupted")]
    Interrupted,
}

struct SchedulerState {
    next_context: Option<Arc<NodeAgentContext>>,
    next_eligible_at: Instant,
    current_context: Arc<NodeAgentContext>,
    want_frozen: bool,
    is_frozen: bool,
    interrupted: bool,
}

/// Context supplier for one node.
pub struct ContextScheduler {
    state: Mutex<SchedulerState>,
    changed: Notify,
}

impl ContextScheduler {
    /// `initial` is reported by [`current_context`](Self::current_context)
    /// until the first context is handed out. Nothing is scheduled yet.
    pub fn new(initial: NodeAgentContext) -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                next_context: None,
                next_eligible_at: Instant::now(),
                current_context: Arc::new(initial),
                want_frozen: false,
                is_frozen: false,
                interrupted: false,
            }),
            changed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the pending context. It is handed out no earlier than
    /// `not_before`.
    pub fn schedule_tick_with(&self, context: NodeAgentContext, not_before: Instant) {
        {
            let mut state = self.lock();
            state.next_context = Some(Arc::new(context));
            state.next_eligible_at = not_before;
        }
        self.changed.notify_waiters();
    }

    /// Ask the agent loop to stop (or resume) ticking and wait until it has
    /// acknowledged, at most `timeout`.
    ///
    /// Returns whether the loop reached the requested state.
    pub async fn set_frozen(&self, frozen: bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        let requested = {
            let mut state = self.lock();
            let requested = state.want_frozen != frozen;
            state.want_frozen = frozen;
            requested
        };
        if requested {
            info!(frozen, "Requesting agent freeze state");
            self.changed.notify_waiters();
        }

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.lock().is_frozen == frozen {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.lock().is_frozen == frozen;
            }
        }
    }

    /// Wait for the next context.
    ///
    /// Returns once the loop is not frozen, a context is scheduled, and its
    /// eligibility time has passed. Acknowledges a requested freeze change
    /// once per wait cycle.
    pub async fn next_context(&self) -> Result<Arc<NodeAgentContext>, SchedulerError> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (wait_until, freeze_changed) = {
                let mut state = self.lock();
                if state.interrupted {
                    return Err(SchedulerError::Interrupted);
                }

                let freeze_changed = state.is_frozen != state.want_frozen;
                if freeze_changed {
                    state.is_frozen = state.want_frozen;
                    info!(frozen = state.is_frozen, "Agent freeze state changed");
                }

                if state.is_frozen || state.next_context.is_none() {
                    (None, freeze_changed)
                } else if Instant::now() >= state.next_eligible_at {
                    if let Some(context) = state.next_context.take() {
                        state.current_context = Arc::clone(&context);
                        drop(state);
                        if freeze_changed {
                            self.changed.notify_waiters();
                        }
                        return Ok(context);
                    }
                    (None, freeze_changed)
                } else {
                    (Some(state.next_eligible_at), freeze_changed)
                }
            };

            if freeze_changed {
                self.changed.notify_waiters();
            }

            match wait_until {
                Some(at) => {
                    let _ = tokio::time::timeout_at(at, notified).await;
                }
                None => notified.await,
            }
        }
    }

    /// Wake any waiter and make every current and future
    /// [`next_context`](Self::next_context) call fail.
    pub fn interrupt(&self) {
        self.lock().interrupted = true;
        self.changed.notify_waiters();
    }

    /// The context most recently handed out.
    pub fn current_context(&self) -> Arc<NodeAgentContext> {
        Arc::clone(&self.lock().current_context)
    }

    /// Frozen state as acknowledged by the agent loop.
    pub fn is_frozen(&self) -> bool {
        self.lock().is_frozen
    }
}
