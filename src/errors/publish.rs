use thiserror::Error;

use super::TransportError;

/// Errors raised while publishing a layer, its style or its metadata to a
/// target server.
#[derive(Error, Debug)]
pub enum PublishError {
    /// Invalid or missing settings while constructing or using a target.
    /// Never escapes the construction boundary: the caller logs it and
    /// treats the instance as unavailable.
    #[error("target configuration error: {0}")]
    Config(String),

    /// HTTP failure talking to the target
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Soft failure of the server-side import workflow; collected as a
    /// per-layer error, the run continues with the next layer
    #[error("import workflow failed: {0}")]
    ImportWorkflow(String),

    /// Layer metadata did not validate
    #[error("invalid metadata: {0}")]
    Validation(String),

    /// The target cannot perform the requested operation
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Local artifact production failed (export, style or metadata file)
    #[error("artifact error: {0}")]
    Artifact(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PublishError {
    /// True for failures that should be recorded against the layer without
    /// aborting the surrounding step sequence.
    pub fn is_soft(&self) -> bool {
        matches!(self, PublishError::ImportWorkflow(_))
    }
}
