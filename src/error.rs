//! Error types for the Tokenhive service.

use std::time::Duration;
use thiserror::Error;

use crate::mesh::ClusterError;
use crate::store::StoreError;

/// Errors surfaced by the bucket engine and the rate-limit facade.
///
/// `StoreUnavailable` is distinct from a rejected verdict; the
/// caller decides whether to fail open or closed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LimiterError {
    /// The request asks for more tokens than the bucket can ever hold.
    #[error("Invalid request: cannot consume {requested} tokens from a bucket of capacity {capacity}")]
    InvalidRequest { requested: u64, capacity: u64 },

    /// The backing store could not be reached, timed out, or the call was cancelled.
    #[error("Rate limiter unavailable: {0}")]
    StoreUnavailable(String),
}

impl From<StoreError> for LimiterError {
    fn from(err: StoreError) -> Self {
        LimiterError::StoreUnavailable(err.to_string())
    }
}

impl LimiterError {
    /// Build the unavailable error reported when a store call exceeds its deadline.
    pub fn timed_out(after: Duration) -> Self {
        LimiterError::StoreUnavailable(StoreError::Timeout(after).to_string())
    }
}

/// Main error type for Tokenhive operations.
#[derive(Error, Debug)]
pub enum TokenhiveError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rate limiting errors
    #[error("Rate limit error: {0}")]
    Limiter(#[from] LimiterError),

    /// Cluster membership and gossip errors
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tokenhive operations.
pub type Result<T> = std::result::Result<T, TokenhiveError>;
