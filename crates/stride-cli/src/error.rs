//! Errors surfaced by `stride` commands

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failure reported by the orchestrator libraries
    #[error(transparent)]
    Stride(#[from] stride_common::Error),

    #[error("cannot read input file {path}: {source}")]
    Input {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed JSON document: {0}")]
    Document(#[from] serde_json::Error),

    /// Command-line arguments that do not fit together
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },
}

impl Error {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            message: message.into(),
        }
    }
}
