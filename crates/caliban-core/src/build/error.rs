//! Error types for build planning and image building.

use thiserror::Error;

/// Errors raised while planning a build recipe or driving the builder.
#[derive(Error, Debug)]
pub enum RecipeError {
    /// A declared directory does not exist.
    #[error("Directory '{0}' does not exist")]
    MissingDirectory(String),

    /// A mandatory file is missing from the project.
    #[error("Missing required file: {0}")]
    MissingFile(String),

    /// A `.dockerignore` pattern failed to parse.
    #[error("Invalid exclusion pattern: {0}")]
    InvalidExclusion(String),

    /// The external builder failed.
    #[error("Builder failed with code {code}: {stderr}")]
    BuildFailed { code: i32, stderr: String },

    /// The builder's output could not be interpreted.
    #[error("Could not parse an image id from builder output")]
    UnparseableOutput,

    /// I/O error while reading project inputs.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for build operations.
pub type RecipeResult<T> = std::result::Result<T, RecipeError>;
