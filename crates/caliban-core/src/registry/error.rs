//! Error types for the registry layer.

use crate::registry::types::JobStatus;
use thiserror::Error;

/// Errors that can occur in the registry layer.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Database connection or statement error.
    #[error("Registry database error: {0}")]
    Connection(#[from] rusqlite::Error),

    /// Row not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization error for a JSON column.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A status update that the transition graph forbids.
    #[error("Invalid status transition for job {job_id}: {from} -> {to}")]
    InvalidTransition { job_id: i64, from: JobStatus, to: JobStatus },

    /// Stored data that no longer parses.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for registry operations.
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;
