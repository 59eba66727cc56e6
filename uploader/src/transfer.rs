//! This module provides the concurrent block transfer engine.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::block::{Block, BlockStatus, SourceFile};
use crate::progress::ProgressReporter;
use crate::service::{TransportError, UploadService};
use crate::{Error, UploadConfig};

/// How a transfer ended, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Every block has been uploaded.
    Completed,
    /// The transfer was cancelled before every block could be uploaded.
    Cancelled,
}

/// Block status changes, sent by workers to the engine.
#[derive(Debug)]
enum BlockEvent {
    /// `Pending -> InFlight`
    Started(u64),
    /// `InFlight -> Pending`, when a block is to be retried or its attempt got aborted.
    Released(u64),
    /// `InFlight -> Uploaded`
    Uploaded(u64),
    /// `InFlight -> Failed`
    Failed(u64, Error),
}

/// Result of a block upload that did not fail.
#[derive(Debug, PartialEq, Eq)]
enum Upload {
    Done,
    Aborted,
}

/// A bounded pool of workers uploading the blocks of a local file to an asset.
///
/// # Workers
/// Up to `max_parallelism` workers pull blocks from a shared queue. Each worker reads its block from the local file,
/// uploads it with a per-attempt timeout and retries it with exponential backoff on retryable errors. Status changes
/// are reported to the engine through a completion channel, while successful uploads are accounted immediately in the
/// shared [`ProgressReporter`].
///
/// # Failures
/// The first block hitting a terminal error, exhausting its retries or failing to be read aborts all other workers:
/// blocks cannot be skipped independently. Blocks already uploaded remain accounted.
///
/// # Cancellation
/// Cancellation is checked before starting each block and before each retry backoff. An in-flight attempt is aborted
/// by dropping its request, and its block returns to the pending state.
#[derive(Debug)]
pub struct TransferEngine<S: ?Sized> {
    ctx: Arc<Context<S>>,
}

#[derive(Debug)]
struct Context<S: ?Sized> {
    service: Arc<S>,
    source: SourceFile,
    asset_id: Arc<str>,
    config: UploadConfig,
    progress: ProgressReporter,
}

impl<S: UploadService + ?Sized + 'static> TransferEngine<S> {
    pub fn new(
        service: Arc<S>,
        source: SourceFile,
        asset_id: impl Into<Arc<str>>,
        config: UploadConfig,
        progress: ProgressReporter,
    ) -> Self {
        Self {
            ctx: Arc::new(Context {
                service,
                source,
                asset_id: asset_id.into(),
                config,
                progress,
            }),
        }
    }

    /// Upload all `blocks`, returning once every block is uploaded, the transfer is cancelled, or a block failed.
    ///
    /// Blocks may complete in any order.
    pub async fn run(&self, blocks: Vec<Block>, cancel: &CancellationToken) -> Result<TransferOutcome, Error> {
        let mut statuses: BTreeMap<u64, BlockStatus> = blocks.iter().map(|block| (block.index(), BlockStatus::Pending)).collect();

        if statuses.is_empty() {
            return Ok(TransferOutcome::Completed);
        }

        let (queue, receiver) = mpsc::unbounded_channel();

        for block in blocks {
            let _ = queue.send(block); // receiver is still alive
        }
        drop(queue);

        let receiver = Arc::new(Mutex::new(receiver));
        let (events, mut completions) = mpsc::unbounded_channel();

        // triggered by the caller or by the first failed block
        let abort = cancel.child_token();
        // workers stop if this future is dropped before they are done
        let _abort = abort.clone().drop_guard();

        static WORKER_ID: AtomicUsize = AtomicUsize::new(0);
        let size = usize::from(self.ctx.config.max_parallelism.get()).min(statuses.len());
        let id = WORKER_ID.fetch_add(size, Ordering::Relaxed);

        let workers: Vec<_> = (0..size)
            .map(|i| {
                Worker::new(
                    id.wrapping_add(i),
                    Arc::clone(&self.ctx),
                    Arc::clone(&receiver),
                    events.clone(),
                    abort.clone(),
                )
            })
            .collect();

        drop(events);

        let mut failure = None;

        // the channel closes once every worker has shut down
        while let Some(event) = completions.recv().await {
            match event {
                BlockEvent::Started(index) => transition(&mut statuses, index, BlockStatus::InFlight),
                BlockEvent::Released(index) => transition(&mut statuses, index, BlockStatus::Pending),
                BlockEvent::Uploaded(index) => transition(&mut statuses, index, BlockStatus::Uploaded),
                BlockEvent::Failed(index, err) => {
                    transition(&mut statuses, index, BlockStatus::Failed);
                    abort.cancel();
                    failure.get_or_insert(err);
                }
            }
        }

        for worker in workers {
            let id = worker.id;
            worker.await?;
            tracing::debug!("Worker {id} joined.");
        }

        if let Some(err) = failure {
            return Err(err);
        }

        let remaining = statuses.values().filter(|&&status| status != BlockStatus::Uploaded).count();

        match remaining {
            0 => Ok(TransferOutcome::Completed),
            _ if cancel.is_cancelled() => {
                tracing::info!("Transfer cancelled with {remaining} block(s) left");
                Ok(TransferOutcome::Cancelled)
            }
            _ => Err(Error::InvalidProgress(format!("{remaining} block(s) left without being uploaded"))),
        }
    }
}

fn transition(statuses: &mut BTreeMap<u64, BlockStatus>, index: u64, next: BlockStatus) {
    let Some(status) = statuses.get_mut(&index) else {
        tracing::warn!("Ignoring unknown block #{index}");
        return;
    };

    if !status.transition(next) {
        tracing::warn!("Ignoring block #{index} transition from {status:?} to {next:?}");
    }
}

impl<S: UploadService + ?Sized> Context<S> {
    /// Upload a single block, retrying it on retryable errors.
    async fn upload(&self, block: &Block, events: &mpsc::UnboundedSender<BlockEvent>, abort: &CancellationToken) -> Result<Upload, Error> {
        let index = block.index();
        let timeout = self.config.http_timeout();
        let data = self.source.read_block(block).await?;

        let mut retries = 0;

        loop {
            let attempt = tokio::time::timeout(timeout, self.service.upload_block(&self.asset_id, block, data.clone()));

            let result = tokio::select! {
                biased;
                _ = abort.cancelled() => {
                    let _ = events.send(BlockEvent::Released(index));
                    return Ok(Upload::Aborted);
                }
                result = attempt => result.unwrap_or(Err(TransportError::Timeout(timeout))),
            };

            let err = match result {
                Ok(()) => return Ok(Upload::Done),
                Err(err) => err,
            };

            if !err.is_retryable() || retries >= self.config.max_block_retries {
                return Err(Error::Block { index, retries, source: err });
            }

            retries += 1;
            let delay = self.config.backoff(retries);

            tracing::warn!(
                "Block #{index} upload failed ({err}), retrying in {delay:?} ({retries}/{})...",
                self.config.max_block_retries
            );

            let _ = events.send(BlockEvent::Released(index));

            tokio::select! {
                biased;
                _ = abort.cancelled() => return Ok(Upload::Aborted),
                _ = tokio::time::sleep(delay) => {}
            }

            let _ = events.send(BlockEvent::Started(index));
        }
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    handle: tokio::task::JoinHandle<()>,
}

impl Worker {
    fn new<S: UploadService + ?Sized + 'static>(
        id: usize,
        ctx: Arc<Context<S>>,
        receiver: Arc<Mutex<mpsc::UnboundedReceiver<Block>>>,
        events: mpsc::UnboundedSender<BlockEvent>,
        abort: CancellationToken,
    ) -> Worker {
        tracing::debug!("Starting worker {id}...");

        let task = async move {
            loop {
                if abort.is_cancelled() {
                    tracing::debug!("Transfer aborted, shutting down worker {id}.");
                    break;
                }

                let message = receiver.lock().await.recv().await;

                let Some(block) = message else {
                    tracing::debug!("All blocks exhausted, shutting down worker {id}.");
                    break;
                };

                if abort.is_cancelled() {
                    tracing::debug!("Transfer aborted, shutting down worker {id}.");
                    break;
                }

                let index = block.index();
                let _ = events.send(BlockEvent::Started(index));

                tracing::debug!("Uploading block #{index} on worker {id}...");

                match ctx.upload(&block, &events, &abort).await {
                    Ok(Upload::Done) => {
                        let snapshot = ctx.progress.record_uploaded(block.length());
                        let _ = events.send(BlockEvent::Uploaded(index));

                        tracing::debug!("Uploaded block #{index} on worker {id}: {snapshot}");
                    }
                    Ok(Upload::Aborted) => {
                        tracing::debug!("Block #{index} aborted, shutting down worker {id}.");
                        break;
                    }
                    Err(err) => {
                        ctx.progress.record_failed();
                        tracing::error!("Block #{index} failed on worker {id}: {err}");

                        abort.cancel();
                        let _ = events.send(BlockEvent::Failed(index, err));
                        break;
                    }
                }
            }
        };

        Worker {
            id,
            handle: tokio::spawn(task.in_current_span()),
        }
    }
}

impl Future for Worker {
    type Output = Result<(), tokio::task::JoinError>;

    #[inline]
    fn poll(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Self::Output> {
        self.handle.poll_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU8;
    use std::time::Duration;

    use super::*;
    use crate::block::plan;
    use crate::testing::{temp_file, StubService};

    fn config(parallelism: u8) -> UploadConfig {
        UploadConfig::default()
            .with_max_parallelism(NonZeroU8::new(parallelism).unwrap())
            .with_backoff(Duration::from_millis(1), Duration::from_millis(10))
            .with_http_timeout(Duration::from_secs(5))
    }

    type Fixture = (TransferEngine<StubService>, Vec<Block>, ProgressReporter, tempfile::NamedTempFile);

    async fn engine(service: &Arc<StubService>, len: usize, config: UploadConfig) -> Fixture {
        let (file, _) = temp_file(len);
        let source = SourceFile::open(file.path()).await.unwrap();
        let blocks = plan(source.len(), 4.try_into().unwrap());

        let progress = ProgressReporter::default();
        progress.reset(source.len(), blocks.len() as u64);

        let engine = TransferEngine::new(Arc::clone(service), source, "asset", config, progress.clone());

        (engine, blocks, progress, file)
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_parallelism_is_bounded() {
        let service = Arc::new(StubService::default().with_delay(Duration::from_millis(20)));
        let (engine, blocks, progress, _file) = engine(&service, 64, config(3)).await;

        let outcome = engine.run(blocks, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, TransferOutcome::Completed);
        assert_eq!(service.state().upload_calls.len(), 16);
        assert!(service.max_in_flight() <= 3);
        assert!(service.max_in_flight() > 1);
        assert!(progress.snapshot().is_complete());
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_transient_errors_are_retried() {
        let service = Arc::new(StubService::default());
        service.fail_block(1, [TransportError::Transient("reset".into()), TransportError::Transient("reset".into())]);
        let (engine, blocks, progress, _file) = engine(&service, 10, config(2).with_max_block_retries(3)).await;

        let outcome = engine.run(blocks, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, TransferOutcome::Completed);
        assert_eq!(service.upload_calls_for(1), 3);
        assert_eq!(progress.snapshot().bytes_uploaded, 10);
        assert!(logs_contain("retrying in"));
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail() {
        let service = Arc::new(StubService::default());
        service.fail_block(0, (0..3).map(|_| TransportError::Timeout(Duration::from_secs(1))));
        let (engine, blocks, progress, _file) = engine(&service, 4, config(1).with_max_block_retries(2)).await;

        let err = engine.run(blocks, &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, Error::Block { index: 0, retries: 2, .. }));
        assert_eq!(service.upload_calls_for(0), 3);
        assert_eq!(progress.snapshot().blocks_failed, 1);
        assert_eq!(progress.snapshot().bytes_uploaded, 0);
    }

    #[tokio::test]
    async fn test_terminal_error_is_not_retried() {
        let service = Arc::new(StubService::default());
        service.fail_block(2, [TransportError::Terminal("forbidden".into())]);
        let (engine, blocks, _, _file) = engine(&service, 12, config(1)).await;

        let err = engine.run(blocks, &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, Error::Block { index: 2, retries: 0, .. }));
        assert_eq!(service.upload_calls_for(2), 1);
    }

    #[tokio::test]
    async fn test_unreadable_block_fails() {
        let service = Arc::new(StubService::default());
        let (engine, _, _, _file) = engine(&service, 4, config(1)).await;

        // past the end of the local file
        let err = engine.run(vec![Block::new(1, 4, 4)], &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, Error::Io(_)));
        assert!(service.state().upload_calls.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_in_flight() {
        let service = Arc::new(StubService::default().with_delay(Duration::from_secs(60)));
        let (engine, blocks, progress, _file) = engine(&service, 12, config(2)).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let outcome = tokio::time::timeout(Duration::from_secs(5), engine.run(blocks, &cancel)).await.unwrap().unwrap();

        assert_eq!(outcome, TransferOutcome::Cancelled);
        assert_eq!(progress.snapshot().bytes_uploaded, 0);
        assert!(service.state().upload_calls.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_run_stops_workers() {
        let service = Arc::new(StubService::default().with_delay(Duration::from_millis(30)));
        let (engine, blocks, _, _file) = engine(&service, 64, config(2)).await;

        let result = tokio::time::timeout(Duration::from_millis(45), engine.run(blocks, &CancellationToken::new())).await;
        assert!(result.is_err());

        let calls = service.state().upload_calls.len();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(calls < 16);
        assert_eq!(service.state().upload_calls.len(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let service = Arc::new(StubService::default());
        service.fail_block(0, [TransportError::Transient("reset".into())]);
        let config = config(1).with_backoff(Duration::from_secs(10), Duration::from_secs(10));
        let (engine, blocks, progress, _file) = engine(&service, 4, config).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let start = tokio::time::Instant::now();
        let outcome = engine.run(blocks, &cancel).await.unwrap();

        assert_eq!(outcome, TransferOutcome::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(service.upload_calls_for(0), 1);
        assert_eq!(progress.snapshot().bytes_uploaded, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_retried() {
        let service = Arc::new(StubService::default().with_delay(Duration::from_secs(10)));
        let config = config(1).with_http_timeout(Duration::from_secs(1)).with_max_block_retries(1);
        let (engine, blocks, progress, _file) = engine(&service, 4, config).await;

        let err = engine.run(blocks, &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(
            err,
            Error::Block {
                index: 0,
                retries: 1,
                source: TransportError::Timeout(_)
            }
        ));
        // timed out attempts never reach the service
        assert!(service.state().upload_calls.is_empty());
        assert_eq!(progress.snapshot().blocks_failed, 1);
    }

    #[tokio::test]
    async fn test_empty_transfer() {
        let service = Arc::new(StubService::default());
        let (engine, _, _, _file) = engine(&service, 4, config(1)).await;

        assert_eq!(engine.run(vec![], &CancellationToken::new()).await.unwrap(), TransferOutcome::Completed);
    }
}
