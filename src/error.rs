use std::path::PathBuf;

use crate::core::model::ArtifactFormat;

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors surfaced by the runtime's public API.
///
/// The type is `Clone` so that every caller waiting on the same in-flight
/// load observes the identical outcome.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeError {
    #[error("insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("artifact invalid: {0}")]
    ArtifactInvalid(#[from] ValidationFailure),

    #[error("backend load failed: {0}")]
    BackendLoadFailed(String),

    #[error("session not ready")]
    SessionNotReady,

    #[error("invalid sample parameter `{0}`")]
    InvalidSampleParams(&'static str),

    #[error("backend step failed: {0}")]
    BackendStepFailed(String),

    #[error("generation cancelled")]
    Cancelled,
}

impl RuntimeError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RuntimeError::Cancelled)
    }

    /// Failures that leave the slot usable for a later retry without
    /// the caller freeing anything first.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RuntimeError::BackendLoadFailed(_) | RuntimeError::BackendStepFailed(_)
        )
    }
}

/// Why an artifact was rejected by the validator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationFailure {
    #[error("{} not found or unreadable: {detail}", path.display())]
    NotFound { path: PathBuf, detail: String },

    #[error("{} is {actual} bytes, {format} artifacts need at least {minimum}", path.display())]
    TooSmall {
        path: PathBuf,
        format: ArtifactFormat,
        actual: u64,
        minimum: u64,
    },

    #[error("{} does not look like {format}: {detail}", path.display())]
    FormatMismatch {
        path: PathBuf,
        format: ArtifactFormat,
        detail: String,
    },

    #[error("trial load of {} failed: {detail}", path.display())]
    LoadTestFailed { path: PathBuf, detail: String },
}
