use std::fs::Metadata;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use super::epoch_millis;
use crate::activity::TaskHandle;
use crate::entry::EntryMeta;
use crate::error::SourceError;
use crate::paths;
use crate::source::{Backend, SourceKind};
use crate::transfer::{copy_exact_with_progress, copy_with_progress};

/// The machine's own filesystem.
pub struct LocalBackend {
    home: String,
}

impl LocalBackend {
    pub fn new(home: Option<String>) -> Self {
        let home = home
            .or_else(|| dirs::home_dir().map(|dir| dir.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "/".to_string());
        Self {
            home: paths::canonicalize(&home),
        }
    }

    async fn meta(path: &str) -> Result<EntryMeta, SourceError> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            // dangling symlinks still show up as entries
            Err(_) => tokio::fs::symlink_metadata(path)
                .await
                .map_err(|err| SourceError::io(err, path))?,
        };
        Ok(meta_of(path, &metadata))
    }
}

fn meta_of(path: &str, metadata: &Metadata) -> EntryMeta {
    let modified = metadata.modified().map(epoch_millis).unwrap_or(0);
    if metadata.is_dir() {
        EntryMeta::dir(path, modified)
    } else {
        EntryMeta::file(path, metadata.len(), modified)
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn kind(&self) -> SourceKind {
        SourceKind::Local
    }

    async fn home(&self) -> Result<String, SourceError> {
        Ok(self.home.clone())
    }

    async fn stat(&self, path: &str) -> Result<EntryMeta, SourceError> {
        Self::meta(path).await
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<EntryMeta>, SourceError> {
        let mut dir = tokio::fs::read_dir(path)
            .await
            .map_err(|err| SourceError::io(err, path))?;
        let mut children = Vec::new();
        while let Some(child) = dir
            .next_entry()
            .await
            .map_err(|err| SourceError::io(err, path))?
        {
            let Ok(name) = child.file_name().into_string() else {
                warn!(
                    dir = path,
                    name = ?child.file_name(),
                    "skipping entry with a non UTF-8 name"
                );
                continue;
            };
            let metadata = match tokio::fs::metadata(child.path()).await {
                Ok(metadata) => Ok(metadata),
                Err(_) => child.metadata().await,
            };
            match metadata {
                Ok(metadata) => children.push(meta_of(&paths::join(path, &name), &metadata)),
                Err(err) => {
                    warn!(dir = path, name = %name, error = %err, "skipping unreadable entry")
                }
            }
        }
        Ok(children)
    }

    async fn read_file(
        &self,
        entry: &EntryMeta,
        out: &mut (dyn AsyncWrite + Unpin + Send),
        progress: &TaskHandle,
    ) -> Result<u64, SourceError> {
        let mut file = tokio::fs::File::open(&entry.path)
            .await
            .map_err(|err| SourceError::io(err, &entry.path))?;
        let copied = copy_with_progress(&mut file, out, Some(entry.size), progress).await?;
        Ok(copied)
    }

    async fn write_file(
        &self,
        path: &str,
        input: &mut (dyn AsyncRead + Unpin + Send),
        length: u64,
        progress: &TaskHandle,
    ) -> Result<(), SourceError> {
        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|err| SourceError::io(err, path))?;
        copy_exact_with_progress(input, &mut file, length, progress).await?;
        file.sync_all().await?;
        debug!(path, length, "wrote local file");
        Ok(())
    }

    async fn create_dir(&self, path: &str) -> Result<(), SourceError> {
        tokio::fs::create_dir(path)
            .await
            .map_err(|err| SourceError::io(err, path))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SourceError> {
        if from != to && tokio::fs::symlink_metadata(to).await.is_ok() {
            return Err(SourceError::InvalidOperation(format!("{to} already exists")));
        }
        tokio::fs::rename(from, to)
            .await
            .map_err(|err| SourceError::io(err, from))
    }

    async fn delete(&self, entry: &EntryMeta) -> Result<(), SourceError> {
        let path = PathBuf::from(&entry.path);
        let result = if entry.directory {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        result.map_err(|err| SourceError::io(err, &entry.path))
    }

    async fn exists(&self, path: &str) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn close(&self) {}
}
