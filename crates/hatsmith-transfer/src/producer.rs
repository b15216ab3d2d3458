//! Chunk producer: fixed-size slices of an input, in order

use std::io;
use std::path::Path;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};

use crate::message::ChunkMessage;

/// Reads `total` bytes from `reader` as `chunk_size` slices. The slice that
/// reaches `total` is marked last; an empty input yields one empty last slice.
pub struct ChunkSource<R> {
    reader: R,
    chunk_size: usize,
    total: u64,
    offset: u64,
    index: u64,
    done: bool,
}

impl<R: AsyncRead + Unpin> ChunkSource<R> {
    pub fn new(reader: R, total: u64, chunk_size: usize) -> Self {
        Self {
            reader,
            chunk_size: chunk_size.max(1),
            total,
            offset: 0,
            index: 0,
            done: false,
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub async fn next_chunk(&mut self) -> io::Result<Option<ChunkMessage>> {
        if self.done {
            return Ok(None);
        }

        let want = (self.total - self.offset).min(self.chunk_size as u64) as usize;
        let mut buf = BytesMut::zeroed(want);
        self.reader.read_exact(&mut buf).await?;

        self.offset += want as u64;
        let last = self.offset >= self.total;
        self.done = last;

        let chunk = ChunkMessage {
            index: self.index,
            data: buf.freeze(),
            last,
        };
        self.index += 1;
        Ok(Some(chunk))
    }
}

impl ChunkSource<tokio::fs::File> {
    /// Slice a file starting at `skip` bytes (the container prefix when decrypting).
    pub async fn open(path: &Path, skip: u64, chunk_size: usize) -> io::Result<Self> {
        let mut file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        if skip > len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} is shorter than {skip} bytes", path.display()),
            ));
        }
        file.seek(io::SeekFrom::Start(skip)).await?;
        Ok(Self::new(file, len - skip, chunk_size))
    }
}

/// Read up to `len` bytes from the start of a file.
pub async fn read_prefix(path: &Path, len: usize) -> io::Result<Bytes> {
    let file = tokio::fs::File::open(path).await?;
    let mut buf = Vec::with_capacity(len);
    file.take(len as u64).read_to_end(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// Read up to `len` bytes starting at `offset`.
pub async fn read_at(path: &Path, offset: u64, len: usize) -> io::Result<Bytes> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(io::SeekFrom::Start(offset)).await?;
    let mut buf = Vec::with_capacity(len);
    file.take(len as u64).read_to_end(&mut buf).await?;
    Ok(Bytes::from(buf))
}
