use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("queue region mapping failed: {0}")]
    Mmap(#[from] io::Error),
    #[error("ring setup failed: {0}")]
    Setup(&'static str),
    #[error("control plane protocol mismatch: {0}")]
    ProtocolMismatch(String),
    #[error("no free buffer slot")]
    ResourceExhausted,
    #[error("opcode not supported on this transport")]
    Unsupported,
    #[error("malformed work request: {0}")]
    InvalidArgument(&'static str),
    #[error("destroy rejected: {0}")]
    Teardown(String),
    #[error("control plane request failed: {0}")]
    Control(String),
}

impl Error {
    /// Folds a failed destroy exchange into the teardown taxonomy.
    pub(crate) fn teardown(self) -> Error {
        Error::Teardown(self.to_string())
    }
}

/// A data-path batch stopped at `index`. Requests before `index` were
/// published to the device and remain submitted.
#[derive(Debug, Error)]
#[error("posting stopped at request {index}: {error}")]
pub struct PostError {
    pub index: usize,
    #[source]
    pub error: Error,
}
