//! This module provides upload session orchestration.

use std::fmt;
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::block::SourceFile;
use crate::progress::{ByteSize, ProgressReporter, ProgressSnapshot};
use crate::service::UploadService;
use crate::{Error, UploadConfig};

mod state;
use state::{Context, State, Step};

/// How blocks to transfer are selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    /// Every block not received yet is transferred.
    Full,
    /// Only blocks differing from the previously committed version are transferred.
    Delta,
}

impl fmt::Display for UploadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadMode::Full => f.write_str("full"),
            UploadMode::Delta => f.write_str("delta"),
        }
    }
}

/// The successful end of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The asset has been committed.
    Completed(ProgressSnapshot),
    /// The session was cancelled before committing the asset; blocks uploaded so far remain received.
    Cancelled(ProgressSnapshot),
}

/// A failed upload session, together with the progress made before failing.
#[derive(Debug, Error)]
#[error("upload failed with {progress} uploaded: {source}")]
pub struct SessionError {
    pub source: Error,
    pub progress: ProgressSnapshot,
}

/// One end-to-end attempt to upload a local file to an asset.
#[derive(Debug)]
struct UploadSession {
    asset_id: Arc<str>,
    source: SourceFile,
    block_size: NonZeroU64,
    /// Chosen once the asset has been initialized.
    mode: Option<UploadMode>,
    progress: ProgressReporter,
}

/// Upload session orchestrator.
///
/// Drives an upload session state machine to completion: the mode is selected first (a delta upload falls back to a
/// full upload when no baseline exists for the asset), then pending blocks are transferred and the asset is finally
/// committed.
///
/// A session is never retried as a whole. Since asset initialization is idempotent, a failed or cancelled session can
/// simply be run again with a new `Uploader`, which only sends the blocks still pending on the remote side.
#[derive(Debug)]
pub struct Uploader<S: ?Sized> {
    service: Arc<S>,
    config: UploadConfig,
    asset_id: Arc<str>,
    path: PathBuf,
    progress: ProgressReporter,
}

impl<S: UploadService + ?Sized + 'static> Uploader<S> {
    pub fn new(service: Arc<S>, config: UploadConfig, asset_id: impl Into<Arc<str>>, path: impl Into<PathBuf>) -> Self {
        Self {
            service,
            config,
            asset_id: asset_id.into(),
            path: path.into(),
            progress: ProgressReporter::default(),
        }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    #[inline]
    pub fn asset_id(&self) -> &str {
        &self.asset_id
    }

    /// Return a handle on the session progress, which can be read while the session is running.
    #[inline]
    pub fn progress(&self) -> ProgressReporter {
        self.progress.clone()
    }

    /// Run the upload session until the asset is committed, the session fails, or `cancel` is triggered.
    pub async fn run(self, cancel: CancellationToken) -> Result<Outcome, SessionError> {
        let progress = self.progress;
        let fail = |source: Error| SessionError {
            source,
            progress: progress.snapshot(),
        };

        self.config.validate().map_err(fail)?;

        let source = SourceFile::open(&self.path).await.map_err(|err| fail(err.into()))?;

        tracing::info!(
            "Uploading `{}` ({}) to asset `{}`...",
            self.path.display(),
            ByteSize(source.len()),
            self.asset_id
        );

        let mut ctx = Context {
            service: self.service,
            session: UploadSession {
                asset_id: self.asset_id,
                source,
                block_size: self.config.block_size,
                mode: None,
                progress: progress.clone(),
            },
            config: self.config,
        };

        let mut state = State::SelectMode;

        loop {
            tracing::debug!("Entering {} state", state.name());

            state = match state.advance(&mut ctx, &cancel).await {
                Step::Next(next) => next,
                Step::Done(snapshot) => {
                    match ctx.session.mode {
                        Some(mode) => tracing::info!("Asset `{}` uploaded in {mode} mode: {snapshot}", ctx.session.asset_id),
                        None => tracing::info!("Asset `{}` uploaded: {snapshot}", ctx.session.asset_id),
                    }

                    return Ok(Outcome::Completed(snapshot));
                }
                Step::Cancelled(snapshot) => {
                    tracing::info!("Upload to asset `{}` cancelled: {snapshot}", ctx.session.asset_id);

                    return Ok(Outcome::Cancelled(snapshot));
                }
                Step::Failed(err) => {
                    tracing::error!("Upload to asset `{}` failed: {err}", ctx.session.asset_id);

                    return Err(fail(err));
                }
            };
        }
    }
}
