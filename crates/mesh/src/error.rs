//! Error types for Murmur mesh operations.
//!
//! Registry mutations and queries are infallible by contract (unknown peers
//! are no-ops), so only the sweeper lifecycle can fail.

use thiserror::Error;

/// Errors that can occur in mesh operations.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Staleness sweeper already running for this registry
    #[error("Staleness sweeper already running")]
    SweeperRunning,

    /// No Tokio runtime available to host the sweeper
    #[error("No async runtime available: {0}")]
    NoRuntime(String),
}

/// Result type for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;
