//! Error types for the trainjob client.

use crate::local::EngineError;
use crate::types::Framework;
use thiserror::Error;

/// Result type for trainjob operations.
pub type Result<T> = std::result::Result<T, TrainerError>;

/// Errors surfaced by the trainjob client.
///
/// Validation variants are raised at the point of detection and are never
/// retried. Remote calls collapse into exactly two kinds, [`TrainerError::Timeout`]
/// and [`TrainerError::Operation`].
#[derive(Debug, Error)]
pub enum TrainerError {
    /// A recognized resource key carries a value that is not a count.
    #[error("invalid resource quantity for '{key}': {value}")]
    InvalidResourceQuantity {
        /// Resource key (e.g. `nvidia.com/gpu`).
        key: String,
        /// The raw value.
        value: String,
    },

    /// The runtime has no container identifiable as the trainer.
    #[error("runtime '{0}' doesn't have a trainer container")]
    MissingTrainerContainer(String),

    /// The runtime object is present but internally inconsistent.
    #[error("invalid runtime: {0}")]
    InvalidRuntime(String),

    /// A pod belonging to a train job breaks the labelling contract.
    #[error("invalid train job pod: {0}")]
    InvalidPod(String),

    /// A train job object is missing required fields.
    #[error("invalid train job: {0}")]
    InvalidTrainJob(String),

    /// The local runner does not support this framework.
    #[error("framework '{0}' is not currently supported")]
    UnsupportedFramework(Framework),

    /// The training function payload cannot be turned into a launcher script.
    #[error("invalid training function: {0}")]
    InvalidTrainFunction(String),

    /// A local job request is invalid.
    #[error("invalid job spec: {0}")]
    InvalidJobSpec(String),

    /// Configuration value is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No runtime with this name exists.
    #[error("runtime not found: {0}")]
    RuntimeNotFound(String),

    /// No job with this name exists.
    #[error("could not find job '{0}'")]
    JobNotFound(String),

    /// A remote call exceeded its time budget.
    #[error("{0}")]
    Timeout(String),

    /// A remote call failed.
    #[error("{0}")]
    Operation(String),

    /// A log source failed while being followed.
    #[error("log stream for '{step}' failed: {reason}")]
    LogStream {
        /// Step whose stream failed.
        step: String,
        /// Failure reported by the source.
        reason: String,
    },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Local execution engine failure.
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl TrainerError {
    /// True for the bounded-wait failure kind.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
