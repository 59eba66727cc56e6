//! This module provides upload progress accounting.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// A point-in-time copy of the progress counters of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// Bytes planned for transfer, fixed once blocks have been planned.
    pub total_bytes: u64,
    /// Blocks planned for transfer.
    pub total_blocks: u64,
    pub bytes_uploaded: u64,
    pub blocks_uploaded: u64,
    pub blocks_failed: u64,
}

impl ProgressSnapshot {
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.bytes_uploaded == self.total_bytes && self.blocks_uploaded == self.total_blocks
    }
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} ({} of {} blocks",
            ByteSize(self.bytes_uploaded),
            ByteSize(self.total_bytes),
            self.blocks_uploaded,
            self.total_blocks
        )?;

        if self.blocks_failed > 0 {
            write!(f, ", {} failed", self.blocks_failed)?;
        }

        f.write_str(")")
    }
}

/// Thread-safe accumulator of the progress of a session.
///
/// Cloning is cheap: all clones update and read the same counters, so that a clone can be kept by the caller to watch
/// a session in progress:
/// ```
/// # use uploader::progress::ProgressReporter;
/// let progress = ProgressReporter::default();
/// progress.reset(10, 3);
///
/// let worker = progress.clone();
/// worker.record_uploaded(4);
/// worker.record_uploaded(4);
///
/// let snapshot = progress.snapshot();
/// assert_eq!(snapshot.bytes_uploaded, 8);
/// assert_eq!(snapshot.blocks_uploaded, 2);
/// assert!(!snapshot.is_complete());
/// ```
#[derive(Debug, Clone, Default)]
pub struct ProgressReporter {
    counters: Arc<Mutex<ProgressSnapshot>>,
}

impl ProgressReporter {
    /// Reset all counters for a new transfer plan.
    pub fn reset(&self, total_bytes: u64, total_blocks: u64) {
        *self.lock() = ProgressSnapshot {
            total_bytes,
            total_blocks,
            ..Default::default()
        };
    }

    /// Account for a successfully uploaded block of `length` bytes.
    pub fn record_uploaded(&self, length: u64) -> ProgressSnapshot {
        let mut counters = self.lock();

        debug_assert!(counters.bytes_uploaded + length <= counters.total_bytes);

        counters.bytes_uploaded = counters.bytes_uploaded.saturating_add(length).min(counters.total_bytes);
        counters.blocks_uploaded += 1;

        *counters
    }

    /// Account for a block the transfer gave up on.
    pub fn record_failed(&self) -> ProgressSnapshot {
        let mut counters = self.lock();
        counters.blocks_failed += 1;

        *counters
    }

    #[inline]
    pub fn snapshot(&self) -> ProgressSnapshot {
        *self.lock()
    }

    /// Log a progress snapshot every `interval` in the background, until `cancel` is triggered.
    pub fn log_every(&self, interval: Duration, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let progress = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick completes immediately

            loop {
                tokio::select! {
                    _ = ticker.tick() => tracing::info!("Upload progress: {}", progress.snapshot()),
                    _ = cancel.cancelled() => break,
                }
            }
        }
        .in_current_span())
    }

    // counters are always left consistent, even by a panicking holder
    fn lock(&self) -> MutexGuard<'_, ProgressSnapshot> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Human-readable display of a byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteSize(pub u64);

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [&str; 5] = ["KiB", "MiB", "GiB", "TiB", "PiB"];

        if self.0 < 1_024 {
            return write!(f, "{} B", self.0);
        }

        let mut size = self.0 as f64 / 1_024.0;
        let mut unit = 0;

        while size >= 1_024.0 && unit < UNITS.len() - 1 {
            size /= 1_024.0;
            unit += 1;
        }

        write!(f, "{size:.2} {}", UNITS[unit])
    }
}
