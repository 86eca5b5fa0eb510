use std::io::SeekFrom;
use std::path::Path;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

use crate::{DEFAULT_CHUNK_SIZE, TransferError};

/// A chunk of upload data read at a known offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Byte offset of `data[0]` within the source.
    pub offset: u64,
    pub data: Vec<u8>,
    /// The source ended before the chunk could be filled.
    pub eof: bool,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Offset of the first byte after this chunk.
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// Reads a seekable source in bounded chunks.
///
/// The reader never trusts its own position across failures: callers seek
/// to the server's offset with [`seek_to`](Self::seek_to) before reading.
pub struct ChunkReader<R> {
    inner: R,
    chunk_size: usize,
    position: Option<u64>,
}

impl ChunkReader<tokio::fs::File> {
    /// Opens `path` for chunked reading.
    pub async fn open(path: &Path, chunk_size: usize) -> Result<Self, TransferError> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Self::new(file, chunk_size))
    }
}

impl<R> ChunkReader<R>
where
    R: AsyncRead + AsyncSeek + Unpin + Send,
{
    /// Wraps `inner`. If `chunk_size` is 0, [`DEFAULT_CHUNK_SIZE`] is used.
    pub fn new(inner: R, chunk_size: usize) -> Self {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Self {
            inner,
            chunk_size,
            position: None,
        }
    }

    /// Determines the total size of the source by seeking to its end.
    pub async fn total_len(&mut self) -> Result<u64, TransferError> {
        let end = self.inner.seek(SeekFrom::End(0)).await?;
        self.position = Some(end);
        Ok(end)
    }

    /// Seeks to the given byte offset (for resume).
    pub async fn seek_to(&mut self, offset: u64) -> Result<(), TransferError> {
        let pos = self.inner.seek(SeekFrom::Start(offset)).await?;
        self.position = Some(pos);
        Ok(())
    }

    /// Reads the next chunk, at most `chunk_size` bytes and at most `limit`
    /// bytes when given.
    ///
    /// The read loops until the chunk is full or the source is exhausted,
    /// so a short chunk always means end of source.
    pub async fn next_chunk(&mut self, limit: Option<u64>) -> Result<Chunk, TransferError> {
        let offset = self.position.ok_or(TransferError::UnknownPosition)?;

        let mut want = self.chunk_size;
        if let Some(limit) = limit {
            want = want.min(usize::try_from(limit).unwrap_or(usize::MAX));
        }

        let mut buf = vec![0u8; want];
        let mut filled = 0;
        let mut eof = false;
        while filled < want {
            let n = match self.inner.read(&mut buf[filled..]).await {
                Ok(n) => n,
                Err(e) => {
                    self.position = None;
                    return Err(e.into());
                }
            };
            if n == 0 {
                eof = true;
                break;
            }
            filled += n;
        }
        buf.truncate(filled);

        self.position = Some(offset + filled as u64);
        Ok(Chunk {
            offset,
            data: buf,
            eof,
        })
    }

    /// Current byte offset, if known.
    pub fn position(&self) -> Option<u64> {
        self.position
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Lowers the chunk size, e.g. to honor a server-advertised limit.
    pub fn cap_chunk_size(&mut self, max: usize) {
        if max > 0 {
            self.chunk_size = self.chunk_size.min(max);
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}
