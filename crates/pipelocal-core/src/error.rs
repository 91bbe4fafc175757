//! Error types for pipelocal.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("engine error: {0}")]
    Engine(String),

    #[error("exitcode '{code}': failure")]
    NonZeroExit { code: i64 },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("cancelled")]
    Cancelled,

    #[error("error in task finally: {0}")]
    Cleanup(#[source] Box<Error>),

    #[error("artifact error: {0}")]
    Artifact(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the error came from a deadline or cancellation rather than the work itself.
    pub fn is_interrupted(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::DeadlineExceeded | Error::Cancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
