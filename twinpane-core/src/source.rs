use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;

use crate::activity::TaskHandle;
use crate::entry::{Entry, EntryMeta};
use crate::error::SourceError;
use crate::paths;
use crate::pool::PoolStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Local,
    Sftp,
    Webdav,
    Ftp,
    Kubernetes,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceKind::Local => "local",
            SourceKind::Sftp => "sftp",
            SourceKind::Webdav => "webdav",
            SourceKind::Ftp => "ftp",
            SourceKind::Kubernetes => "kubernetes",
        };
        f.write_str(name)
    }
}

/// What [`Entry::list`] does when the backend fails to list a directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListingPolicy {
    /// Log the failure and report no children.
    #[default]
    Lenient,
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Created,
    Connecting,
    Ready,
    Closed,
}

/// Protocol-specific half of a [`Source`].
///
/// All paths handed to a backend are canonical (see [`paths::canonicalize`]).
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> SourceKind;

    async fn home(&self) -> Result<String, SourceError>;

    fn concurrency(&self) -> usize {
        1
    }

    async fn stat(&self, path: &str) -> Result<EntryMeta, SourceError>;

    async fn read_dir(&self, path: &str) -> Result<Vec<EntryMeta>, SourceError>;

    /// Streams the file into `out`, returning the number of bytes written.
    async fn read_file(
        &self,
        entry: &EntryMeta,
        out: &mut (dyn AsyncWrite + Unpin + Send),
        progress: &TaskHandle,
    ) -> Result<u64, SourceError>;

    /// Creates or truncates `path` with exactly `length` bytes from `input`.
    async fn write_file(
        &self,
        path: &str,
        input: &mut (dyn AsyncRead + Unpin + Send),
        length: u64,
        progress: &TaskHandle,
    ) -> Result<(), SourceError>;

    async fn create_dir(&self, path: &str) -> Result<(), SourceError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), SourceError>;

    /// Removes the entry, including the subtree of a directory.
    async fn delete(&self, entry: &EntryMeta) -> Result<(), SourceError>;

    async fn exists(&self, path: &str) -> bool {
        self.stat(path).await.is_ok()
    }

    fn pool_status(&self) -> Option<PoolStatus> {
        None
    }

    async fn close(&self);
}

struct Inner {
    backend: Box<dyn Backend>,
    listing: ListingPolicy,
    closed: AtomicBool,
}

/// A live, cheaply cloneable handle to one configured backend.
#[derive(Clone)]
pub struct Source {
    inner: Arc<Inner>,
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("kind", &self.kind())
            .field("listing", &self.inner.listing)
            .field("state", &self.state())
            .finish()
    }
}

impl Source {
    pub fn new(backend: impl Backend + 'static, listing: ListingPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend: Box::new(backend),
                listing,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn backend(&self) -> &dyn Backend {
        self.inner.backend.as_ref()
    }

    pub fn kind(&self) -> SourceKind {
        self.inner.backend.kind()
    }

    /// Initial navigation path.
    pub async fn home(&self) -> Result<String, SourceError> {
        self.inner
            .backend
            .home()
            .await
            .map(|home| paths::canonicalize(&home))
    }

    pub fn concurrency(&self) -> usize {
        self.inner.backend.concurrency()
    }

    pub fn listing_policy(&self) -> ListingPolicy {
        self.inner.listing
    }

    pub fn state(&self) -> SourceState {
        if self.is_closed() {
            return SourceState::Closed;
        }
        match self.inner.backend.pool_status() {
            None => SourceState::Ready,
            Some(status) if status.idle + status.borrowed > status.connecting => {
                SourceState::Ready
            }
            Some(status) if status.connecting > 0 => SourceState::Connecting,
            Some(_) => SourceState::Created,
        }
    }

    pub fn pool_status(&self) -> Option<PoolStatus> {
        self.inner.backend.pool_status()
    }

    /// Whether `path` exists. Never fails.
    pub async fn is_valid(&self, path: &str) -> bool {
        self.inner.backend.exists(&paths::canonicalize(path)).await
    }

    /// Whether `path` exists and is a directory. Never fails.
    pub async fn is_directory(&self, path: &str) -> bool {
        matches!(
            self.inner.backend.stat(&paths::canonicalize(path)).await,
            Ok(meta) if meta.directory
        )
    }

    pub async fn get(&self, path: &str) -> Result<Entry, SourceError> {
        let path = paths::canonicalize(path);
        let meta = self.inner.backend.stat(&path).await?;
        Ok(Entry::new(meta, self.clone()))
    }

    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(kind = %self.kind(), "closing source");
        self.inner.backend.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}
