// src/error.rs

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value for setting: {0}")]
    InvalidValue(String),

    #[error("Invalid governor: {0}")]
    InvalidGovernor(String),

    /// The control file or driver needed for this action was never resolved on this host.
    #[error("Control action not supported: {0}")]
    NotSupported(String),

    #[error("No threads selected")]
    NothingSelected,
}

impl ControlError {
    /// Validation failures are the caller's fault and carry no system state.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ControlError::InvalidValue(_)
                | ControlError::InvalidGovernor(_)
                | ControlError::NothingSelected
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error("Failed to read {path}: {source}")]
    Read { path: String, source: io::Error },

    #[error("Failed to parse {path}: {value:?}")]
    Parse { path: String, value: String },
}
