use std::time::Duration;

/// Failure to run a command at all, as opposed to the command failing
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("{0} not found on PATH")]
    CommandNotFound(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("output was not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("unexpected command: {0}")]
    MockExpectationNotMet(String),
}

impl ProcessError {
    /// Whether the same command may succeed on a later attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, ProcessError::Timeout(_) | ProcessError::Io(_))
    }
}
