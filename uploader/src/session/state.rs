use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{UploadMode, UploadSession};
use crate::block::{self, Block};
use crate::progress::{ByteSize, ProgressSnapshot};
use crate::service::{TransportError, UploadProgress, UploadService};
use crate::transfer::{TransferEngine, TransferOutcome};
use crate::{Error, UploadConfig};

/// Upload session state.
///
/// States are strictly sequenced: `SelectMode -> (FullUpload | DeltaUpload) -> Commit`, each of them either advancing
/// to the next one or ending the session with a terminal [`Step`].
#[derive(Debug)]
pub(super) enum State {
    /// Choose between a full and a delta upload.
    SelectMode,
    /// Upload every pending block.
    FullUpload,
    /// Upload the pending blocks differing from the baseline.
    ///
    /// The state context is the upload progress returned when initializing the asset in delta mode, which carries
    /// the baseline manifest.
    DeltaUpload(UploadProgress),
    /// Finalize the asset, retrying on transient errors.
    Commit,
}

/// The result of advancing a [`State`].
#[derive(Debug)]
pub(super) enum Step {
    Next(State),
    Done(ProgressSnapshot),
    Failed(Error),
    Cancelled(ProgressSnapshot),
}

/// What states operate on.
#[derive(Debug)]
pub(super) struct Context<S: ?Sized> {
    pub service: Arc<S>,
    pub config: UploadConfig,
    pub session: UploadSession,
}

impl State {
    pub(super) fn name(&self) -> &'static str {
        match self {
            State::SelectMode => "select-mode",
            State::FullUpload => "full-upload",
            State::DeltaUpload(_) => "delta-upload",
            State::Commit => "commit",
        }
    }

    pub(super) async fn advance<S>(self, ctx: &mut Context<S>, cancel: &CancellationToken) -> Step
    where
        S: UploadService + ?Sized + 'static,
    {
        let step = match self {
            State::SelectMode => ctx.select_mode(cancel).await,
            State::FullUpload => ctx.full_upload(cancel).await,
            State::DeltaUpload(progress) => ctx.delta_upload(progress, cancel).await,
            State::Commit => ctx.commit(cancel).await,
        };

        step.unwrap_or_else(Step::Failed)
    }
}

impl<S: UploadService + ?Sized + 'static> Context<S> {
    fn cancelled(&self) -> Step {
        Step::Cancelled(self.session.progress.snapshot())
    }

    /// Initialize the asset upload, or return `None` if cancelled in the meantime.
    async fn initialize(&self, delta_mode: bool, cancel: &CancellationToken) -> Result<Option<UploadProgress>, Error> {
        let session = &self.session;
        let timeout = self.config.http_timeout();

        let call = self
            .service
            .initialize_asset(&session.asset_id, session.source.len(), session.block_size.get(), delta_mode);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(None),
            result = tokio::time::timeout(timeout, call) => {
                let progress = result.unwrap_or(Err(TransportError::Timeout(timeout))).map_err(Error::Initialize)?;

                tracing::debug!(
                    "Asset `{}` initialized: {} pending block(s), baseline {}",
                    session.asset_id,
                    progress.pending_blocks.len(),
                    if progress.baseline.is_some() { "found" } else { "not found" },
                );

                Ok(Some(progress))
            }
        }
    }

    async fn select_mode(&mut self, cancel: &CancellationToken) -> Result<Step, Error> {
        if cancel.is_cancelled() {
            return Ok(self.cancelled());
        }

        if !self.config.delta_upload {
            return Ok(Step::Next(State::FullUpload));
        }

        let Some(progress) = self.initialize(true, cancel).await? else {
            return Ok(self.cancelled());
        };

        if progress.baseline.is_none() {
            tracing::info!("No baseline found for asset `{}`, falling back to a full upload", self.session.asset_id);

            return Ok(Step::Next(State::FullUpload));
        }

        Ok(Step::Next(State::DeltaUpload(progress)))
    }

    async fn full_upload(&mut self, cancel: &CancellationToken) -> Result<Step, Error> {
        let Some(progress) = self.initialize(false, cancel).await? else {
            return Ok(self.cancelled());
        };

        self.session.mode = Some(UploadMode::Full);

        let pending = block::validate_pending(progress.pending_blocks, self.session.source.len(), self.session.block_size)?;

        self.transfer(pending, cancel).await
    }

    async fn delta_upload(&mut self, progress: UploadProgress, cancel: &CancellationToken) -> Result<Step, Error> {
        self.session.mode = Some(UploadMode::Delta);

        let baseline = progress.baseline.unwrap_or_default();
        let pending = block::validate_pending(progress.pending_blocks, self.session.source.len(), self.session.block_size)?;

        tracing::info!("Fingerprinting {} pending block(s)...", pending.len());

        let concurrency: usize = self.config.max_parallelism.get().into();
        let fingerprints = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(self.cancelled()),
            fingerprints = self.session.source.fingerprints(&pending, concurrency) => fingerprints?,
        };

        let count = pending.len();
        let changed = block::diff(pending, &fingerprints, &baseline);

        tracing::info!(
            "{} of {count} pending block(s) changed since the baseline of {} block(s)",
            changed.len(),
            baseline.len()
        );

        self.transfer(changed, cancel).await
    }

    async fn transfer(&self, blocks: Vec<Block>, cancel: &CancellationToken) -> Result<Step, Error> {
        let session = &self.session;
        let total_bytes: u64 = blocks.iter().map(Block::length).sum();

        session.progress.reset(total_bytes, blocks.len() as u64);

        tracing::info!(
            "Asset `{}` initialized. Will upload {} across {} block(s).",
            session.asset_id,
            ByteSize(total_bytes),
            blocks.len()
        );

        let engine = TransferEngine::new(
            Arc::clone(&self.service),
            session.source.clone(),
            Arc::clone(&session.asset_id),
            self.config.clone(),
            session.progress.clone(),
        );

        let logging = CancellationToken::new();
        let _ = session.progress.log_every(self.config.progress_interval(), logging.clone());
        let _logging = logging.drop_guard();

        match engine.run(blocks, cancel).await? {
            TransferOutcome::Completed => {
                tracing::info!("Upload complete. Total uploaded: {}", ByteSize(session.progress.snapshot().bytes_uploaded));

                Ok(Step::Next(State::Commit))
            }
            TransferOutcome::Cancelled => Ok(self.cancelled()),
        }
    }

    async fn commit(&self, cancel: &CancellationToken) -> Result<Step, Error> {
        if cancel.is_cancelled() {
            return Ok(self.cancelled());
        }

        let snapshot = self.session.progress.snapshot();

        if !snapshot.is_complete() {
            return Err(Error::InvalidProgress(format!("cannot commit an incomplete upload: {snapshot}")));
        }

        let timeout = self.config.http_timeout();
        let mut attempts = 0;

        loop {
            attempts += 1;

            let call = tokio::time::timeout(timeout, self.service.commit_asset(&self.session.asset_id));

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(self.cancelled()),
                result = call => result.unwrap_or(Err(TransportError::Timeout(timeout))),
            };

            match result {
                Ok(()) => {
                    tracing::info!("Asset `{}` committed", self.session.asset_id);

                    return Ok(Step::Done(self.session.progress.snapshot()));
                }
                Err(err) if err.is_retryable() && attempts <= self.config.max_commit_retries => {
                    let delay = self.config.backoff(attempts);

                    tracing::warn!(
                        "Asset commit failed ({err}), retrying in {delay:?} ({attempts}/{})...",
                        self.config.max_commit_retries
                    );

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(self.cancelled()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(Error::Commit { attempts, source: err }),
            }
        }
    }
}
