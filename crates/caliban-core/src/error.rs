//! Error types for Caliban Core.

use crate::backend::BackendError;
use crate::build::RecipeError;
use crate::config::ConfigError;
use crate::experiment::ExpansionError;
use crate::registry::RegistryError;
use thiserror::Error;

/// Core error type for Caliban operations.
#[derive(Error, Debug)]
pub enum CalibanError {
    /// Project or CLI configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Experiment config expansion errors
    #[error("Experiment config error: {0}")]
    Expansion(#[from] ExpansionError),

    /// Build recipe planning errors
    #[error("Build recipe error: {0}")]
    Recipe(#[from] RecipeError),

    /// The requested mode cannot run on this host
    #[error("Platform unsupported: {0}")]
    PlatformUnsupported(String),

    /// Backend submission, query, or stop errors
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Registry storage errors
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// User-initiated cancellation
    #[error("Cancelled by user")]
    Cancelled,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CalibanError {
    /// Maps the error onto the process exit code contract.
    ///
    /// Validation and configuration failures exit with 2, user cancellation
    /// with 130, and everything else with 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            CalibanError::Config(_)
            | CalibanError::Expansion(_)
            | CalibanError::Recipe(_)
            | CalibanError::PlatformUnsupported(_)
            | CalibanError::Backend(BackendError::Validation { .. }) => 2,
            CalibanError::Cancelled => 130,
            _ => 1,
        }
    }
}

/// Result type alias for Caliban operations.
pub type Result<T> = std::result::Result<T, CalibanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_validation_failure() {
        let err = CalibanError::Backend(BackendError::Validation {
            field: "gpu_count".to_string(),
            message: "3 is not a valid count".to_string(),
        });
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_cancelled() {
        assert_eq!(CalibanError::Cancelled.exit_code(), 130);
    }

    #[test]
    fn test_exit_code_backend_failure() {
        let err = CalibanError::Backend(BackendError::Terminal("rejected".to_string()));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_exit_code_config_failure() {
        let err = CalibanError::Config(ConfigError::Invalid("bad json".to_string()));
        assert_eq!(err.exit_code(), 2);
    }
}
