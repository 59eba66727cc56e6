use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};

use super::{fingerprint, Block, Fingerprint};

/// A local file opened once for concurrent positioned reads.
///
/// Cloning is cheap and all clones share the same file handle. Reads never move a shared cursor, so that any number
/// of workers can read their own block without contending on a lock:
/// ```
/// # tokio_test::block_on(async {
/// # use std::io::Write;
/// # use uploader::block::{Block, SourceFile};
/// let mut file = tempfile::NamedTempFile::new().unwrap();
/// file.write_all(b"hello world").unwrap();
///
/// let source = SourceFile::open(file.path()).await.unwrap();
/// let bytes = source.read_block(&Block::new(1, 6, 5)).await.unwrap();
///
/// assert_eq!(source.len(), 11);
/// assert_eq!(&bytes[..], b"world");
/// # })
/// ```
#[derive(Debug, Clone)]
pub struct SourceFile {
    file: Arc<File>,
    path: Arc<PathBuf>,
    len: u64,
}

impl SourceFile {
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = tokio::fs::File::open(&path).await?;
        let len = file.metadata().await?.len();

        tracing::debug!("Opened source file `{}` ({len} bytes)", path.display());

        Ok(Self {
            file: Arc::new(file.into_std().await),
            path: Arc::new(path),
            len,
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// File size, as observed when opened.
    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read the whole byte range of `block`.
    pub async fn read_block(&self, block: &Block) -> io::Result<Bytes> {
        let file = Arc::clone(&self.file);
        let (offset, length) = (block.offset(), block.length());
        let length = usize::try_from(length).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "block too large"))?;

        tokio::task::spawn_blocking(move || {
            let mut buf = vec![0; length];
            read_exact_at(&file, &mut buf, offset)?;
            Ok::<_, io::Error>(Bytes::from(buf))
        })
        .await
        .map_err(io::Error::other)?
    }

    /// Read and fingerprint `block`.
    pub async fn fingerprint(&self, block: &Block) -> io::Result<Fingerprint> {
        let data = self.read_block(block).await?;

        tokio::task::spawn_blocking(move || fingerprint(&data)).await.map_err(io::Error::other)
    }

    /// Fingerprint `blocks`, reading up to `concurrency` blocks at once.
    ///
    /// Returned fingerprints are in the same order as `blocks`.
    pub async fn fingerprints(&self, blocks: &[Block], concurrency: usize) -> io::Result<Vec<Fingerprint>> {
        stream::iter(blocks)
            .map(|block| self.fingerprint(block))
            .buffered(concurrency.max(1))
            .try_collect()
            .await
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::read_exact_at(file, buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;

    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }

    Ok(())
}
