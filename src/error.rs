//! Error types for qpsgate.

use thiserror::Error;

/// Main error type for qpsgate operations.
///
/// Only construction and configuration can fail. Rejecting a request is a
/// regular [`EntryContext`](crate::ratelimit::EntryContext) outcome.
#[derive(Error, Debug)]
pub enum GateError {
    /// A rule or window shape that cannot be partitioned into buckets
    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for qpsgate operations.
pub type Result<T> = std::result::Result<T, GateError>;
