//! Fleet Node Agent Library
//!
//! The node agent runs on each host and drives every node on it toward the
//! state the node repository wants. It creates, updates and removes the
//! node's container, coordinates with the orchestrator before taking a node
//! down, and reports what it achieved back to the node repository.
//!
//! ## Architecture
//!
//! ```text
//! NodeAdmin
//! └── NodeAgent(hostname)       (one loop per node)
//!     ├── ContextScheduler      (hands out contexts, freeze, interrupt)
//!     └── Converger             (one convergence attempt per context)
//! ```
//!
//! ## Modules
//!
//! - `admin`: Starts, ticks, freezes and stops the agents on a host
//! - `agent`: The per-node loop and outcome classification
//! - `scheduler`: Context handoff between the admin and an agent loop
//! - `converge`: The convergence algorithm and the agent state it carries
//! - `runtime`, `repository`, `orchestrator`, `maintainers`: Collaborator
//!   interfaces with in-memory implementations

pub mod admin;
pub mod agent;
pub mod clock;
pub mod config;
pub mod container;
pub mod context;
pub mod converge;
pub mod error;
pub mod maintainers;
pub mod orchestrator;
pub mod repository;
pub mod runtime;
pub mod scheduler;
pub mod spec;

// Re-export commonly used types
pub use admin::{AdminSettings, NodeAdmin};
pub use agent::{AgentError, NodeAgent};
pub use context::NodeAgentContext;
pub use converge::{AgentState, Collaborators, Converger};
pub use error::{ConvergenceError, OutcomeKind};
pub use scheduler::{ContextScheduler, SchedulerError};
pub use spec::{NodeSpec, NodeState};
