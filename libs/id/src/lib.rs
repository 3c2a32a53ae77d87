//! # fleet-id
//!
//! Validated identifiers used by the node agent.
//!
//! ## Design Principles
//!
//! - Names arrive as strings from the node repository and are parsed once
//! - A parsed name is always valid; there is no unchecked constructor
//! - Names serialize as plain strings
//!
//! ## Types
//!
//! - `HostName`: fully qualified DNS name of a node, e.g. `host1.prod.example.com`
//! - `ContainerName`: first label of the hostname, e.g. `host1`
//! - `DockerImage`: `repository[:tag]`, e.g. `registry.example.com/node:8.123.4`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;
