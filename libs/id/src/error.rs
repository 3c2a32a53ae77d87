//! Error types for identifier parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The input string is empty.
    #[error("{kind} cannot be empty")]
    Empty { kind: &'static str },

    /// The input is longer than the type allows.
    #[error("{kind} too long: {len} > {max}")]
    TooLong {
        kind: &'static str,
        len: usize,
        max: usize,
    },

    /// A DNS label is malformed.
    #[error("invalid label '{label}' in {kind}: {message}")]
    InvalidLabel {
        kind: &'static str,
        label: String,
        message: &'static str,
    },

    /// The overall format is invalid.
    #[error("invalid {kind}: {message}")]
    InvalidFormat {
        kind: &'static str,
        message: String,
    },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty { .. })
    }
}
