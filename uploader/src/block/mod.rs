use std::collections::BTreeSet;
use std::num::NonZeroU64;

use sha2::{Digest, Sha256};

use crate::Error;

mod source;
pub use source::*;

/// A block content fingerprint (SHA-256 digest).
pub type Fingerprint = [u8; 32];

/// Compute the fingerprint of a block content.
#[inline]
pub fn fingerprint(data: &[u8]) -> Fingerprint {
    let mut digest = Fingerprint::default();
    digest.copy_from_slice(&Sha256::digest(data));
    digest
}

/// A contiguous byte range of the local file, the unit of transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block {
    index: u64,
    offset: u64,
    length: u64,
}

impl Block {
    #[inline]
    pub const fn new(index: u64, offset: u64, length: u64) -> Self {
        Self { index, offset, length }
    }

    /// Return the `index`-th block of a file of `total_size` bytes split into `block_size` blocks, if any.
    pub fn at(index: u64, total_size: u64, block_size: NonZeroU64) -> Option<Self> {
        let offset = index.checked_mul(block_size.get()).filter(|&offset| offset < total_size)?;

        Some(Self::new(index, offset, block_size.get().min(total_size - offset)))
    }

    #[inline]
    pub fn index(&self) -> u64 {
        self.index
    }

    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    pub fn length(&self) -> u64 {
        self.length
    }
}

/// Transfer status of a block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BlockStatus {
    #[default]
    Pending,
    InFlight,
    Uploaded,
    Failed,
}

impl BlockStatus {
    /// Move to `next` status if allowed, returning whether the transition happened.
    ///
    /// Allowed transitions are `Pending -> InFlight -> {Uploaded | Pending | Failed}`, so that an uploaded block never
    /// reverts to any other status.
    pub fn transition(&mut self, next: BlockStatus) -> bool {
        use BlockStatus::*;

        let allowed = matches!((*self, next), (Pending, InFlight) | (InFlight, Uploaded | Pending | Failed));

        if allowed {
            *self = next;
        }

        allowed
    }
}

/// The remote record of block fingerprints for a previously committed version of an asset, ordered by block index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockManifest(Vec<Fingerprint>);

impl BlockManifest {
    #[inline]
    pub fn new(fingerprints: Vec<Fingerprint>) -> Self {
        Self(fingerprints)
    }

    #[inline]
    pub fn get(&self, index: u64) -> Option<&Fingerprint> {
        usize::try_from(index).ok().and_then(|index| self.0.get(index))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Fingerprint> for BlockManifest {
    fn from_iter<I: IntoIterator<Item = Fingerprint>>(iter: I) -> Self {
        Self(Vec::from_iter(iter))
    }
}

/// Split a file of `total_size` bytes into contiguous blocks of `block_size` bytes.
///
/// The last block holds the remainder, if any:
/// ```
/// # use uploader::block::plan;
/// let blocks = plan(10, 4.try_into().unwrap());
///
/// assert_eq!(blocks.iter().map(|block| block.length()).collect::<Vec<_>>(), [4, 4, 2]);
/// ```
pub fn plan(total_size: u64, block_size: NonZeroU64) -> Vec<Block> {
    let count = total_size.div_ceil(block_size.get());

    (0..count).map_while(|index| Block::at(index, total_size, block_size)).collect()
}

/// Check the pending blocks returned by the remote service against the local block plan.
///
/// Returned blocks are ordered by index. Any block out of the plan range, not matching its planned byte range, or
/// listed more than once is rejected.
pub fn validate_pending(mut pending: Vec<Block>, total_size: u64, block_size: NonZeroU64) -> Result<Vec<Block>, Error> {
    let mut seen = BTreeSet::new();

    for block in &pending {
        match Block::at(block.index, total_size, block_size) {
            Some(expected) if expected == *block => {}
            Some(expected) => {
                return Err(Error::InvalidProgress(format!(
                    "pending block #{} spans {}+{} while {}+{} was expected",
                    block.index, block.offset, block.length, expected.offset, expected.length
                )))
            }
            None => {
                return Err(Error::InvalidProgress(format!(
                    "pending block #{} is out of a {total_size} bytes file",
                    block.index
                )))
            }
        }

        if !seen.insert(block.index) {
            return Err(Error::InvalidProgress(format!("pending block #{} is listed twice", block.index)));
        }
    }

    pending.sort_unstable_by_key(Block::index);

    Ok(pending)
}

/// Keep the pending blocks whose content changed relative to the `baseline` manifest.
///
/// `fingerprints` are the local fingerprints of `pending` blocks, in the same order. A block is unchanged when its
/// fingerprint matches the baseline one at the same index; blocks beyond the end of the baseline are always changed.
pub fn diff(pending: Vec<Block>, fingerprints: &[Fingerprint], baseline: &BlockManifest) -> Vec<Block> {
    debug_assert_eq!(pending.len(), fingerprints.len());

    pending
        .into_iter()
        .zip(fingerprints)
        .filter(|(block, local)| baseline.get(block.index) != Some(*local))
        .map(|(block, _)| block)
        .collect()
}
