use std::fmt;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::activity::TaskHandle;
use crate::error::SourceError;
use crate::paths;
use crate::source::{ListingPolicy, Source};

/// Metadata snapshot of one node, as reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryMeta {
    pub path: String,
    pub size: u64,
    /// Milliseconds since the Unix epoch, 0 when unknown.
    pub modified: i64,
    pub directory: bool,
}

impl EntryMeta {
    pub fn file(path: impl Into<String>, size: u64, modified: i64) -> Self {
        Self {
            path: path.into(),
            size,
            modified,
            directory: false,
        }
    }

    pub fn dir(path: impl Into<String>, modified: i64) -> Self {
        Self {
            path: path.into(),
            size: 0,
            modified,
            directory: true,
        }
    }

    pub fn name(&self) -> &str {
        paths::file_name(&self.path)
    }
}

/// A file or directory of a [`Source`].
#[derive(Clone)]
pub struct Entry {
    meta: EntryMeta,
    source: Source,
}

impl Entry {
    pub(crate) fn new(meta: EntryMeta, source: Source) -> Self {
        Self { meta, source }
    }

    pub fn meta(&self) -> &EntryMeta {
        &self.meta
    }

    pub fn path(&self) -> &str {
        &self.meta.path
    }

    pub fn name(&self) -> &str {
        self.meta.name()
    }

    pub fn size(&self) -> u64 {
        self.meta.size
    }

    pub fn modified(&self) -> i64 {
        self.meta.modified
    }

    pub fn is_directory(&self) -> bool {
        self.meta.directory
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn parent_path(&self) -> Option<String> {
        paths::parent(&self.meta.path)
    }

    /// Children of a directory, directories first, then by name.
    pub async fn list(&self) -> Result<Vec<Entry>, SourceError> {
        if !self.is_directory() {
            return Ok(Vec::new());
        }
        let children = match self.source.backend().read_dir(&self.meta.path).await {
            Ok(children) => children,
            Err(err) if self.source.listing_policy() == ListingPolicy::Lenient => {
                warn!(path = %self.meta.path, error = %err, "listing failed, showing no children");
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };
        let mut entries: Vec<Entry> = children
            .into_iter()
            .map(|meta| Entry::new(meta, self.source.clone()))
            .collect();
        entries.sort_by(|a, b| {
            b.is_directory()
                .cmp(&a.is_directory())
                .then_with(|| a.name().to_lowercase().cmp(&b.name().to_lowercase()))
        });
        debug!(path = %self.meta.path, count = entries.len(), "listed directory");
        Ok(entries)
    }

    /// Streams the file content into `out`.
    pub async fn transfer_to(
        &self,
        out: &mut (dyn AsyncWrite + Unpin + Send),
        progress: &TaskHandle,
    ) -> Result<u64, SourceError> {
        if self.is_directory() {
            return Err(SourceError::InvalidOperation(format!(
                "cannot download directory {}",
                self.meta.path
            )));
        }
        let copied = self.source.backend().read_file(&self.meta, out, progress).await?;
        progress.finish();
        Ok(copied)
    }

    /// Writes a new child `name` of this directory from `input`.
    pub async fn transfer_from(
        &self,
        name: &str,
        input: &mut (dyn AsyncRead + Unpin + Send),
        length: u64,
        progress: &TaskHandle,
    ) -> Result<Entry, SourceError> {
        let path = self.child_path(name)?;
        self.source
            .backend()
            .write_file(&path, input, length, progress)
            .await?;
        progress.finish();
        self.source.get(&path).await
    }

    pub async fn create_dir(&self, name: &str) -> Result<Entry, SourceError> {
        let path = self.child_path(name)?;
        self.source.backend().create_dir(&path).await?;
        self.source.get(&path).await
    }

    /// Renames within the same parent directory.
    pub async fn rename(&self, new_name: &str) -> Result<Entry, SourceError> {
        if !paths::is_valid_name(new_name) {
            return Err(SourceError::InvalidOperation(format!(
                "invalid name {new_name:?}"
            )));
        }
        let target = match self.parent_path() {
            Some(parent) => paths::join(&parent, new_name),
            None => new_name.to_string(),
        };
        self.source
            .backend()
            .rename(&self.meta.path, &target)
            .await?;
        self.source.get(&target).await
    }

    pub async fn delete(&self) -> Result<(), SourceError> {
        self.source.backend().delete(&self.meta).await
    }

    fn child_path(&self, name: &str) -> Result<String, SourceError> {
        if !self.is_directory() {
            return Err(SourceError::InvalidOperation(format!(
                "{} is not a directory",
                self.meta.path
            )));
        }
        if !paths::is_valid_name(name) {
            return Err(SourceError::InvalidOperation(format!(
                "invalid name {name:?}"
            )));
        }
        Ok(paths::join(&self.meta.path, name))
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.meta.path)
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("meta", &self.meta)
            .field("source", &self.source.kind())
            .finish()
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.meta == other.meta
    }
}
