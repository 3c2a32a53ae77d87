//! Convergence primitives for the node agent.
//!
//! This library holds the small value types the convergence algorithm
//! compares desired and observed state with:
//!
//! - **Resources**: CPU and memory allocation of a container, compared
//!   independently so CPU can be updated in place while memory cannot.
//! - **Generations**: reboot/restart counters the agent has satisfied,
//!   compared against the wanted counters from the node repository.
//! - **Removal reasons**: why an existing container must be replaced.
//!
//! # Invariants
//!
//! - Tracked generations never decrease except when adopting a changed
//!   allocation (restart generation appearing or disappearing)
//! - Resource comparisons are exact for memory and tolerant for CPU

mod generation;
mod reasons;
mod resources;

pub use generation::Generations;
pub use reasons::RemovalReasons;
pub use resources::ContainerResources;
