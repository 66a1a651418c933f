use thiserror::Error;

/// Failure carried by a completed [`Operation`](crate::Operation)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("operation {0} was not handled by any stage")]
    Unhandled(&'static str),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("an operation is already in progress")]
    InProgress,

    #[error("connect failed: {0}")]
    Connect(Box<PipelineError>),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("pipeline is no longer running")]
    Shutdown,
}

impl PipelineError {
    /// Wrap a failure as a connect failure, unless it already is one
    pub fn into_connect(self) -> Self {
        match self {
            err @ PipelineError::Connect(_) => err,
            err => PipelineError::Connect(Box::new(err)),
        }
    }
}
