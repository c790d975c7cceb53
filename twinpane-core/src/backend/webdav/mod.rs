//! WebDAV over HTTP(S), with optional Nextcloud-style chunked uploads.

mod client;
mod multistatus;

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use reqwest::Body;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

pub use client::{Credentials, DavClient};
pub use multistatus::DavResource;

use crate::activity::TaskHandle;
use crate::config::ChunkedUploadConfig;
use crate::entry::EntryMeta;
use crate::error::SourceError;
use crate::pool::{Manager, Pool, PoolStatus};
use crate::retry::RetryPolicy;
use crate::source::{Backend, SourceKind};
use crate::transfer::{ChunkPlan, body_channel, copy_with_progress, pump_with_progress};

#[derive(Debug, Clone)]
pub struct WebdavTarget {
    pub url: String,
    pub credentials: Option<Credentials>,
    pub chunked: Option<ChunkedUploadConfig>,
    pub connect_timeout: Duration,
}

struct DavManager {
    target: WebdavTarget,
}

#[async_trait]
impl Manager for DavManager {
    type Connection = DavClient;

    async fn create(&self) -> Result<DavClient, SourceError> {
        DavClient::new(
            &self.target.url,
            self.target.credentials.clone(),
            self.target.connect_timeout,
        )
    }

    async fn is_alive(&self, _conn: &mut DavClient) -> bool {
        true
    }

    async fn dispose(&self, conn: DavClient) {
        drop(conn);
    }
}

struct ChunkedUploads {
    uploads_url: Url,
    chunk_size: u64,
}

pub struct WebdavBackend {
    pool: Pool<DavManager>,
    home: String,
    chunked: Option<ChunkedUploads>,
}

impl WebdavBackend {
    pub fn new(
        target: WebdavTarget,
        home: Option<String>,
        pool_size: usize,
        retry: RetryPolicy,
    ) -> Result<Self, SourceError> {
        client::parse_base(&target.url)?;
        let chunked = match &target.chunked {
            Some(config) => Some(ChunkedUploads {
                uploads_url: client::parse_base(&config.uploads_url)?,
                chunk_size: config.chunk_size.max(1),
            }),
            None => None,
        };
        Ok(Self {
            pool: Pool::new(DavManager { target }, pool_size, retry),
            home: home.unwrap_or_else(|| "/".to_string()),
            chunked,
        })
    }

    fn meta(client: &DavClient, resource: &DavResource) -> Result<EntryMeta, SourceError> {
        let path = client.path_of(&resource.href)?;
        Ok(if resource.collection {
            EntryMeta::dir(path, resource.modified)
        } else {
            EntryMeta::file(path, resource.size, resource.modified)
        })
    }

    async fn upload_chunked(
        &self,
        client: &DavClient,
        chunked: &ChunkedUploads,
        path: &str,
        input: &mut (dyn AsyncRead + Unpin + Send),
        length: u64,
        progress: &TaskHandle,
    ) -> Result<(), SourceError> {
        let destination = client.url_for(path, false)?;
        let folder = format!("twinpane-{}", Uuid::new_v4().simple());
        let upload_dir = client::join_url(&chunked.uploads_url, &folder, true)?;
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("destination"),
            header_value(destination.as_str())?,
        );

        debug!(path, length, folder = %folder, "starting chunked upload");
        client
            .mkcol(upload_dir.clone(), headers.clone(), path)
            .await?;

        let result = async {
            let plan = ChunkPlan::new(length, chunked.chunk_size);
            progress.set_progress(0.0);
            for chunk in plan.chunks() {
                let url = client::join_url(
                    &chunked.uploads_url,
                    &format!("{folder}/{:05}", chunk.index + 1),
                    false,
                )?;
                let chunk_progress = TaskHandle::detached(progress.name());
                put_streamed(
                    client,
                    url,
                    headers.clone(),
                    &mut *input,
                    chunk.len,
                    &chunk_progress,
                    path,
                )
                .await?;
                progress.set_progress(plan.progress_after(&chunk));
            }

            let mut assemble = headers.clone();
            assemble.insert(
                HeaderName::from_static("oc-total-length"),
                HeaderValue::from(length),
            );
            let assembled = client::join_url(&upload_dir, ".file", false)?;
            client
                .move_to(assembled, &destination, true, assemble, path)
                .await
        }
        .await;

        if let Err(err) = &result {
            warn!(
                path,
                folder = %folder,
                error = %err,
                "chunked upload failed, removing upload folder"
            );
            if let Err(cleanup) = client.delete(upload_dir, path).await {
                warn!(folder = %folder, error = %cleanup, "could not remove upload folder");
            }
        }
        result
    }
}

fn header_value(value: &str) -> Result<HeaderValue, SourceError> {
    HeaderValue::from_str(value)
        .map_err(|err| SourceError::InvalidConfig(format!("invalid header value {value:?}: {err}")))
}

/// PUTs exactly `length` bytes of `input` as a streamed request body.
async fn put_streamed(
    client: &DavClient,
    url: Url,
    headers: HeaderMap,
    input: &mut (dyn AsyncRead + Unpin + Send),
    length: u64,
    progress: &TaskHandle,
    path: &str,
) -> Result<(), SourceError> {
    let (sender, stream) = body_channel();
    let request = client.put(url, Body::wrap_stream(stream), length, headers, path);
    let pump = pump_with_progress(input, sender, length, progress);
    let (sent, pumped) = tokio::join!(request, pump);
    match (sent, pumped) {
        (_, Err(err)) if err.kind() == io::ErrorKind::UnexpectedEof => Err(err.into()),
        (Err(err), _) => Err(err),
        (Ok(()), Err(err)) => Err(err.into()),
        (Ok(()), Ok(_)) => Ok(()),
    }
}

#[async_trait]
impl Backend for WebdavBackend {
    fn kind(&self) -> SourceKind {
        SourceKind::Webdav
    }

    async fn home(&self) -> Result<String, SourceError> {
        Ok(self.home.clone())
    }

    fn concurrency(&self) -> usize {
        self.pool.capacity()
    }

    async fn stat(&self, path: &str) -> Result<EntryMeta, SourceError> {
        let client = self.pool.get().await?;
        let resources = client.propfind(path, 0).await?;
        let resource = resources
            .first()
            .ok_or_else(|| SourceError::NotFound(path.to_string()))?;
        let mut meta = Self::meta(&client, resource)?;
        meta.path = path.to_string();
        Ok(meta)
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<EntryMeta>, SourceError> {
        let client = self.pool.get().await?;
        let resources = client.propfind(path, 1).await?;
        let mut children = Vec::with_capacity(resources.len());
        for resource in &resources {
            let meta = Self::meta(&client, resource)?;
            if meta.path != path {
                children.push(meta);
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
        let client = self.pool.get().await?;
        let response = client.get(&entry.path).await?;
        let total = response.content_length();
        let stream = response.bytes_stream().map_err(io::Error::other);
        let mut reader = StreamReader::new(Box::pin(stream));
        let copied = copy_with_progress(&mut reader, out, total, progress).await?;
        Ok(copied)
    }

    async fn write_file(
        &self,
        path: &str,
        input: &mut (dyn AsyncRead + Unpin + Send),
        length: u64,
        progress: &TaskHandle,
    ) -> Result<(), SourceError> {
        let client = self.pool.get().await?;
        match &self.chunked {
            Some(chunked) if length > chunked.chunk_size => {
                self.upload_chunked(&client, chunked, path, input, length, progress)
                    .await
            }
            _ => {
                let url = client.url_for(path, false)?;
                put_streamed(&client, url, HeaderMap::new(), input, length, progress, path).await
            }
        }
    }

    async fn create_dir(&self, path: &str) -> Result<(), SourceError> {
        let client = self.pool.get().await?;
        let url = client.url_for(path, true)?;
        client.mkcol(url, HeaderMap::new(), path).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SourceError> {
        let client = self.pool.get().await?;
        let source = client.url_for(from, false)?;
        let target = client.url_for(to, false)?;
        client
            .move_to(source, &target, false, HeaderMap::new(), from)
            .await
    }

    async fn delete(&self, entry: &EntryMeta) -> Result<(), SourceError> {
        let client = self.pool.get().await?;
        let url = client.url_for(&entry.path, entry.directory)?;
        client.delete(url, &entry.path).await
    }

    fn pool_status(&self) -> Option<PoolStatus> {
        Some(self.pool.status())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
