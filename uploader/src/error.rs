use thiserror::Error;
use tokio::io;

use crate::service::TransportError;

/// Errors terminating an upload session.
///
/// Retryable transport errors never surface here individually: they are absorbed by the transfer engine until a block
/// exhausts its retry budget, at which point the last one is reported through [`Error::Block`].
#[derive(Debug, Error)]
pub enum Error {
    /// The local source file could not be read. Never retried.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// A block hit a terminal transport error or exhausted its retries.
    #[error("block #{index} failed after {retries} retries: {source}")]
    Block {
        index: u64,
        retries: u32,
        #[source]
        source: TransportError,
    },

    #[error("failed to initialize asset: {0}")]
    Initialize(#[source] TransportError),

    #[error("failed to commit asset after {attempts} attempt(s): {source}")]
    Commit {
        attempts: u32,
        #[source]
        source: TransportError,
    },

    /// The remote pending set does not match the local block plan.
    #[error("invalid upload progress: {0}")]
    InvalidProgress(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}
