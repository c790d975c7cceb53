//! Streaming copy helpers shared by all backends.

use std::io;
use std::sync::OnceLock;

use bytes::Bytes;
use futures_util::Stream;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::activity::TaskHandle;
use crate::entry::Entry;
use crate::error::SourceError;

pub const BLOCK_SIZE: usize = 64 * 1024;
pub const DEFAULT_CHUNK_SIZE: u64 = 10 * 1024 * 1024;
const MAX_IDLE_BUFFERS: usize = 32;

/// Reusable transfer buffers.
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    block_size: usize,
    max_idle: usize,
}

impl BufferPool {
    pub fn new(block_size: usize, max_idle: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            block_size: block_size.max(1),
            max_idle,
        }
    }

    pub fn global() -> &'static BufferPool {
        static POOL: OnceLock<BufferPool> = OnceLock::new();
        POOL.get_or_init(|| BufferPool::new(BLOCK_SIZE, MAX_IDLE_BUFFERS))
    }

    pub fn lease(&self) -> BufferLease<'_> {
        let buffer = self
            .buffers
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0; self.block_size]);
        BufferLease {
            pool: self,
            buffer,
        }
    }

    pub fn idle(&self) -> usize {
        self.buffers.lock().len()
    }
}

pub struct BufferLease<'a> {
    pool: &'a BufferPool,
    buffer: Vec<u8>,
}

impl std::ops::Deref for BufferLease<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buffer
    }
}

impl std::ops::DerefMut for BufferLease<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
}

impl Drop for BufferLease<'_> {
    fn drop(&mut self) {
        let mut buffers = self.pool.buffers.lock();
        if buffers.len() < self.pool.max_idle {
            buffers.push(std::mem::take(&mut self.buffer));
        }
    }
}

/// Copies `reader` to the end into `writer`, publishing progress after every block.
///
/// Without a known non-zero `total` the task stays indeterminate until the copy
/// completes. The final published value is always exactly 1.0.
pub async fn copy_with_progress<R, W>(
    reader: &mut R,
    writer: &mut W,
    total: Option<u64>,
    progress: &TaskHandle,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let total = total.filter(|total| *total > 0);
    match total {
        Some(_) => progress.set_progress(0.0),
        None => progress.set_indeterminate(),
    }

    let mut buffer = BufferPool::global().lease();
    let mut copied = 0u64;
    loop {
        let read = reader.read(&mut buffer[..]).await?;
        if read == 0 {
            break;
        }
        writer.write_all(&buffer[..read]).await?;
        copied += read as u64;
        if let Some(total) = total {
            progress.set_progress((copied as f64 / total as f64).min(1.0));
        }
    }
    writer.flush().await?;
    progress.finish();
    Ok(copied)
}

/// Copies exactly `length` bytes; a shorter source is an error.
pub async fn copy_exact_with_progress<R, W>(
    reader: &mut R,
    writer: &mut W,
    length: u64,
    progress: &TaskHandle,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut limited = (&mut *reader).take(length);
    let copied = copy_with_progress(&mut limited, writer, Some(length), progress).await?;
    if copied < length {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("source ended after {copied} of {length} bytes"),
        ));
    }
    Ok(copied)
}

pub type BodyChunk = Result<Bytes, io::Error>;

/// Channel-backed request body for pushing a borrowed reader into an HTTP upload.
pub fn body_channel() -> (
    mpsc::Sender<BodyChunk>,
    impl Stream<Item = BodyChunk> + Send + 'static,
) {
    let (tx, rx) = mpsc::channel::<BodyChunk>(4);
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    (tx, stream)
}

/// Feeds exactly `length` bytes from `reader` into a [`body_channel`] sender.
pub async fn pump_with_progress<R>(
    reader: &mut R,
    sink: mpsc::Sender<BodyChunk>,
    length: u64,
    progress: &TaskHandle,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    progress.set_progress(0.0);
    let mut buffer = BufferPool::global().lease();
    let mut sent = 0u64;
    while sent < length {
        let want = (length - sent).min(buffer.len() as u64) as usize;
        let read = reader.read(&mut buffer[..want]).await?;
        if read == 0 {
            let err = io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("source ended after {sent} of {length} bytes"),
            );
            let _ = sink
                .send(Err(io::Error::new(err.kind(), err.to_string())))
                .await;
            return Err(err);
        }
        sink.send(Ok(Bytes::copy_from_slice(&buffer[..read])))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "request body closed"))?;
        sent += read as u64;
        progress.set_progress(sent as f64 / length as f64);
    }
    progress.finish();
    Ok(sent)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub index: u64,
    pub offset: u64,
    pub len: u64,
}

/// Fixed-size split of an upload; an empty upload still has one (empty) chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    length: u64,
    chunk_size: u64,
}

impl ChunkPlan {
    pub fn new(length: u64, chunk_size: u64) -> Self {
        Self {
            length,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn count(&self) -> u64 {
        self.length.div_ceil(self.chunk_size).max(1)
    }

    pub fn chunks(&self) -> impl Iterator<Item = Chunk> + '_ {
        (0..self.count()).map(move |index| {
            let offset = index * self.chunk_size;
            Chunk {
                index,
                offset,
                len: self.chunk_size.min(self.length - offset),
            }
        })
    }

    /// Progress after `chunk` has been uploaded.
    pub fn progress_after(&self, chunk: &Chunk) -> f64 {
        (chunk.index + 1) as f64 / self.count() as f64
    }
}

/// Copies a file entry into `target_dir`, which may belong to another source.
pub async fn copy_entry(
    source: &Entry,
    target_dir: &Entry,
    progress: &TaskHandle,
) -> Result<Entry, SourceError> {
    if source.is_directory() {
        return Err(SourceError::InvalidOperation(format!(
            "cannot copy directory {source}"
        )));
    }
    if !target_dir.is_directory() {
        return Err(SourceError::InvalidOperation(format!(
            "copy target {target_dir} is not a directory"
        )));
    }
    debug!(from = %source, to = %target_dir, "copying entry");

    let (mut writer, mut reader) = tokio::io::duplex(BLOCK_SIZE);
    let upload_progress = TaskHandle::detached(progress.name());
    let download = async move {
        let copied = source.transfer_to(&mut writer, progress).await?;
        writer.shutdown().await?;
        Ok::<_, SourceError>(copied)
    };
    let upload = target_dir.transfer_from(
        source.name(),
        &mut reader,
        source.size(),
        &upload_progress,
    );
    let (_, created) = tokio::try_join!(download, upload)?;
    Ok(created)
}
