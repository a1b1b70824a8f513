use crate::subprocess::ProcessError;
use std::time::Duration;

/// Errors reported by a node's container runtime
#[derive(Debug, thiserror::Error)]
pub enum CriError {
    #[error("image {0} not found")]
    NotFound(String),

    #[error("image {image} is in use: {message}")]
    InUse { image: String, message: String },

    #[error("runtime on node {node} is unavailable: {message}")]
    Unavailable { node: String, message: String },

    #[error("runtime on node {node} rejected the call: {message}")]
    Runtime { node: String, message: String },

    #[error("runtime call on node {node} timed out after {timeout:?}")]
    Timeout { node: String, timeout: Duration },

    #[error("could not parse runtime output: {0}")]
    Malformed(String),

    #[error("runtime command failed: {0}")]
    Process(#[from] ProcessError),
}

impl CriError {
    /// Removal of an absent image counts as success for idempotent callers
    pub fn is_not_found(&self) -> bool {
        matches!(self, CriError::NotFound(_))
    }

    /// Whether the same call could succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            CriError::Unavailable { .. } | CriError::Timeout { .. } => true,
            CriError::Process(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub type CriResult<T> = Result<T, CriError>;
