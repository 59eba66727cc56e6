//! In-memory upload service for tests.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io::Write;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use tokio_util::sync::CancellationToken;

use crate::block::{plan, Block, BlockManifest};
use crate::service::{TransportError, UploadProgress, UploadService};

/// Write a temporary file of `len` pseudo-random bytes, returning it together with its content.
pub fn temp_file(len: usize) -> (tempfile::NamedTempFile, Vec<u8>) {
    let data: Vec<u8> = (0..len).map(|i| (i.wrapping_mul(31) ^ (i >> 8)) as u8).collect();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&data).unwrap();
    file.flush().unwrap();

    (file, data)
}

#[derive(Debug, Default)]
pub struct StubState {
    /// Blocks durably received, across sessions.
    pub received: BTreeSet<u64>,
    /// Block index of every upload call, in call order.
    pub upload_calls: Vec<u64>,
    /// Delta mode of every initialize call, in call order.
    pub initialize_calls: Vec<bool>,
    pub commit_calls: usize,
    pub baseline: Option<BlockManifest>,
    pub block_failures: HashMap<u64, VecDeque<TransportError>>,
    pub commit_failures: VecDeque<TransportError>,
    pub initialize_failures: VecDeque<TransportError>,
    /// Pending set returned by every initialize call instead of the blocks not received yet.
    pub pending_override: Option<Vec<Block>>,
    /// Cancel a token once a given block has been received.
    pub cancel_on: Option<(u64, CancellationToken)>,
}

/// An upload service keeping track of received blocks in memory.
///
/// Initialization is idempotent: it always returns the blocks not received yet.
#[derive(Debug, Default)]
pub struct StubService {
    state: Mutex<StubState>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl StubService {
    /// Make every upload call last `delay`.
    pub fn with_delay(self, delay: Duration) -> Self {
        Self { delay, ..self }
    }

    pub fn with_baseline(self, baseline: BlockManifest) -> Self {
        self.state().baseline = Some(baseline);
        self
    }

    pub fn state(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap()
    }

    /// Make the next upload calls for block `index` fail with `errors`, in order.
    pub fn fail_block(&self, index: u64, errors: impl IntoIterator<Item = TransportError>) {
        self.state().block_failures.entry(index).or_default().extend(errors);
    }

    pub fn with_pending(self, pending: Vec<Block>) -> Self {
        self.state().pending_override = Some(pending);
        self
    }

    pub fn fail_initialize(&self, errors: impl IntoIterator<Item = TransportError>) {
        self.state().initialize_failures.extend(errors);
    }

    pub fn fail_commit(&self, errors: impl IntoIterator<Item = TransportError>) {
        self.state().commit_failures.extend(errors);
    }

    pub fn cancel_on(&self, index: u64, cancel: CancellationToken) {
        self.state().cancel_on = Some((index, cancel));
    }

    pub fn upload_calls_for(&self, index: u64) -> usize {
        self.state().upload_calls.iter().filter(|&&i| i == index).count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl UploadService for StubService {
    fn initialize_asset<'a>(
        &'a self,
        _asset_id: &'a str,
        total_size: u64,
        block_size: u64,
        delta_mode: bool,
    ) -> BoxFuture<'a, Result<UploadProgress, TransportError>> {
        async move {
            let block_size = NonZeroU64::new(block_size).ok_or_else(|| TransportError::Terminal("zero block size".into()))?;

            let mut state = self.state();
            state.initialize_calls.push(delta_mode);

            if let Some(err) = state.initialize_failures.pop_front() {
                return Err(err);
            }

            let pending_blocks = match &state.pending_override {
                Some(pending) => pending.clone(),
                None => plan(total_size, block_size)
                    .into_iter()
                    .filter(|block| !state.received.contains(&block.index()))
                    .collect(),
            };

            Ok(UploadProgress {
                pending_blocks,
                baseline: state.baseline.clone().filter(|_| delta_mode),
            })
        }
        .boxed()
    }

    fn upload_block<'a>(&'a self, _asset_id: &'a str, block: &'a Block, data: Bytes) -> BoxFuture<'a, Result<(), TransportError>> {
        async move {
            let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            assert_eq!(data.len() as u64, block.length());

            let mut state = self.state();
            state.upload_calls.push(block.index());

            if let Some(err) = state.block_failures.get_mut(&block.index()).and_then(VecDeque::pop_front) {
                return Err(err);
            }

            state.received.insert(block.index());

            if let Some((index, cancel)) = &state.cancel_on {
                if *index == block.index() {
                    cancel.cancel();
                }
            }

            Ok(())
        }
        .boxed()
    }

    fn commit_asset<'a>(&'a self, _asset_id: &'a str) -> BoxFuture<'a, Result<(), TransportError>> {
        async move {
            let mut state = self.state();
            state.commit_calls += 1;

            match state.commit_failures.pop_front() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
        .boxed()
    }
}
