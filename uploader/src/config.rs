//! Upload session configuration.

use std::num::{NonZeroU64, NonZeroU8};
use std::time::Duration;

use serde::Deserialize;

use crate::Error;

/// Default block size: 4 MiB.
pub const DEFAULT_BLOCK_SIZE: NonZeroU64 = match NonZeroU64::new(4 * 1_024 * 1_024) {
    Some(size) => size,
    None => unreachable!(),
};
const DEFAULT_PARALLELISM: NonZeroU8 = match NonZeroU8::new(10) {
    Some(parallelism) => parallelism,
    None => unreachable!(),
};
const DEFAULT_HTTP_TIMEOUT_MS: u64 = 5 * 60 * 1_000;
const DEFAULT_BLOCK_RETRIES: u32 = 3;
const DEFAULT_COMMIT_RETRIES: u32 = 3;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1_000;
const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;
const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 5_000;

/// Configuration of an upload session.
///
/// Every field is optional when deserialized, so that a partial JSON object such as `{"deltaUpload": true}` is a
/// valid configuration:
/// ```
/// # use uploader::UploadConfig;
/// let config: UploadConfig = serde_json::from_str(r#"{ "deltaUpload": true, "maxParallelism": 4 }"#).unwrap();
///
/// assert!(config.delta_upload);
/// assert_eq!(config.max_parallelism.get(), 4);
/// assert_eq!(config.block_size, uploader::config::DEFAULT_BLOCK_SIZE);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UploadConfig {
    /// Size of every block but the last one.
    pub block_size: NonZeroU64,
    /// Only transmit blocks differing from the previously committed version, when one exists.
    pub delta_upload: bool,
    /// Maximum number of blocks in flight at once.
    pub max_parallelism: NonZeroU8,
    /// Timeout of a single HTTP attempt.
    pub http_timeout_ms: u64,
    /// Retries allowed per block after its first attempt.
    pub max_block_retries: u32,
    /// Retries allowed for the final commit after its first attempt.
    pub max_commit_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Period of progress logging while blocks are being transferred.
    pub progress_interval_ms: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            delta_upload: false,
            max_parallelism: DEFAULT_PARALLELISM,
            http_timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
            max_block_retries: DEFAULT_BLOCK_RETRIES,
            max_commit_retries: DEFAULT_COMMIT_RETRIES,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
        }
    }
}

impl UploadConfig {
    #[inline]
    pub fn with_block_size(self, block_size: NonZeroU64) -> Self {
        Self { block_size, ..self }
    }

    #[inline]
    pub fn with_delta_upload(self, delta_upload: bool) -> Self {
        Self { delta_upload, ..self }
    }

    #[inline]
    pub fn with_max_parallelism(self, max_parallelism: NonZeroU8) -> Self {
        Self { max_parallelism, ..self }
    }

    #[inline]
    pub fn with_http_timeout(self, timeout: Duration) -> Self {
        Self {
            http_timeout_ms: duration_ms(timeout),
            ..self
        }
    }

    #[inline]
    pub fn with_max_block_retries(self, max_block_retries: u32) -> Self {
        Self { max_block_retries, ..self }
    }

    #[inline]
    pub fn with_max_commit_retries(self, max_commit_retries: u32) -> Self {
        Self {
            max_commit_retries,
            ..self
        }
    }

    #[inline]
    pub fn with_backoff(self, initial: Duration, max: Duration) -> Self {
        Self {
            initial_backoff_ms: duration_ms(initial),
            max_backoff_ms: duration_ms(max),
            ..self
        }
    }

    #[inline]
    pub fn with_progress_interval(self, interval: Duration) -> Self {
        Self {
            progress_interval_ms: duration_ms(interval),
            ..self
        }
    }

    #[inline]
    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    #[inline]
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Delay to wait before the `retry`-th retry (starting at 1).
    ///
    /// Doubles from `initial_backoff_ms` on every retry, capped at `max_backoff_ms`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry.saturating_sub(1)).unwrap_or(u64::MAX);
        let delay = self.initial_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);

        Duration::from_millis(delay)
    }

    /// Check the configuration is consistent before starting a session.
    pub fn validate(&self) -> Result<(), Error> {
        if self.http_timeout_ms == 0 {
            return Err(Error::Config("`httpTimeoutMs` must be greater than 0".into()));
        }

        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(Error::Config(format!(
                "`initialBackoffMs` ({}) exceeds `maxBackoffMs` ({})",
                self.initial_backoff_ms, self.max_backoff_ms
            )));
        }

        if self.progress_interval_ms == 0 {
            return Err(Error::Config("`progressIntervalMs` must be greater than 0".into()));
        }

        Ok(())
    }
}

fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config: UploadConfig = serde_json::from_str("{}").unwrap();

        assert_eq!(config, UploadConfig::default());
        assert!(!config.delta_upload);
        assert_eq!(config.block_size.get(), 4 * 1_024 * 1_024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let config = UploadConfig::default().with_backoff(Duration::from_millis(100), Duration::from_millis(500));

        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(400));
        assert_eq!(config.backoff(4), Duration::from_millis(500));
        assert_eq!(config.backoff(80), Duration::from_millis(500));
    }

    #[test]
    fn test_invalid_config() {
        let config = UploadConfig::default().with_backoff(Duration::from_secs(2), Duration::from_secs(1));
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = UploadConfig::default().with_http_timeout(Duration::ZERO);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
