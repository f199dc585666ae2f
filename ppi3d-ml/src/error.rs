//! Error types for the ppi3d-ml crate.

use thiserror::Error;

/// Top-level error type for training and evaluation.
///
/// Stream exhaustion has no variant: a batch source that runs dry
/// returns `Ok(None)` and the loop ends normally.
#[derive(Debug, Error)]
pub enum PpiError {
    /// Fatal configuration problem (non-positive sampling policy, missing paths, ...).
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Model error: {0}")]
    Model(String),

    /// A classification metric has no defined value for the given results.
    #[error("Metric {metric} is undefined: {reason}")]
    MetricUndefined { metric: &'static str, reason: String },

    /// A referenced checkpoint or run-info record is missing or corrupt.
    #[error("Checkpoint restore failed: {0}")]
    CheckpointRestore(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Figment(#[from] Box<figment::Error>),
}

impl PpiError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }

    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    pub fn metric_undefined(metric: &'static str, reason: impl Into<String>) -> Self {
        Self::MetricUndefined {
            metric,
            reason: reason.into(),
        }
    }

    pub fn checkpoint_restore(msg: impl Into<String>) -> Self {
        Self::CheckpointRestore(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether the process should abort rather than continue with the next phase.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Figment(_) | Self::CheckpointRestore(_))
    }
}
