//! The remote upload service boundary.

use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use reqwest::StatusCode;
use thiserror::Error;

use crate::block::{Block, BlockManifest};

/// Errors reported by an [`UploadService`].
///
/// Errors are either retryable (timeouts, transient network errors, server errors, throttling) or terminal
/// (any other client error), see [`TransportError::is_retryable()`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// A transient failure worth retrying.
    #[error("transient transport error: {0}")]
    Transient(String),

    /// A failure that retrying cannot fix.
    #[error("terminal transport error: {0}")]
    Terminal(String),

    #[error("server responded with `{status}`: {message}")]
    Status { status: StatusCode, message: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// The server response could not be understood.
    #[error("malformed response: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether the failed request can be retried as is.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient(_) | Self::Timeout(_) => true,
            Self::Terminal(_) | Self::Protocol(_) => false,
            Self::Status { status, .. } => is_retryable_status(*status),
            Self::Http(err) => match err.status() {
                Some(status) => is_retryable_status(status),
                None => err.is_timeout() || err.is_connect() || err.is_request() || err.is_body(),
            },
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS
}

/// The remote state of an asset upload, as returned on (re-)initialization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadProgress {
    /// Blocks the server has not durably received yet.
    pub pending_blocks: Vec<Block>,
    /// Fingerprints of the previously committed version, when requested in delta mode and such a version exists.
    pub baseline: Option<BlockManifest>,
}

/// Upload service interface.
///
/// Implementors are shared by all transfer workers of a session and must therefore be `Send + Sync`.
pub trait UploadService: Send + Sync {
    /// Initialize (or resume) the upload of an asset.
    ///
    /// This operation must be idempotent: it always returns the blocks still outstanding for `asset_id`, which is
    /// what allows a session to be re-run after a failure or a process restart without re-sending received blocks.
    fn initialize_asset<'a>(
        &'a self,
        asset_id: &'a str,
        total_size: u64,
        block_size: u64,
        delta_mode: bool,
    ) -> BoxFuture<'a, Result<UploadProgress, TransportError>>;

    /// Transmit the bytes of a single block.
    fn upload_block<'a>(&'a self, asset_id: &'a str, block: &'a Block, data: Bytes) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Finalize the asset once all its blocks have been received.
    fn commit_asset<'a>(&'a self, asset_id: &'a str) -> BoxFuture<'a, Result<(), TransportError>>;
}
