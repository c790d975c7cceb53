//! Plain FTP with passive data connections.

mod control;
mod listing;

use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

pub use control::{FtpControl, Reply};
use listing::{FactKind, Listed};

use crate::activity::TaskHandle;
use crate::entry::EntryMeta;
use crate::error::SourceError;
use crate::paths;
use crate::pool::{Manager, Pool, PoolStatus, PooledConnection};
use crate::retry::RetryPolicy;
use crate::source::{Backend, SourceKind};
use crate::transfer::{copy_exact_with_progress, copy_with_progress};

#[derive(Debug, Clone)]
pub struct FtpTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub connect_timeout: Duration,
}

struct FtpManager {
    target: FtpTarget,
}

#[async_trait]
impl Manager for FtpManager {
    type Connection = FtpControl;

    async fn create(&self) -> Result<FtpControl, SourceError> {
        FtpControl::connect(&self.target).await
    }

    async fn is_alive(&self, conn: &mut FtpControl) -> bool {
        if conn.is_broken() {
            return false;
        }
        matches!(conn.command("NOOP").await, Ok(reply) if reply.is(2))
    }

    async fn dispose(&self, conn: FtpControl) {
        conn.quit().await;
        debug!(host = %self.target.host, "ftp session closed");
    }
}

pub struct FtpBackend {
    pool: Pool<FtpManager>,
    home: OnceCell<String>,
}

impl FtpBackend {
    pub fn new(
        target: FtpTarget,
        home: Option<String>,
        pool_size: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            pool: Pool::new(FtpManager { target }, pool_size, retry),
            home: OnceCell::new_with(home),
        }
    }
}

/// Hands the session back, or drops it when a failure left a reply unread.
fn settle<T>(
    conn: PooledConnection<FtpManager>,
    result: Result<T, SourceError>,
) -> Result<T, SourceError> {
    if result.is_err() && conn.is_broken() {
        warn!("ftp session out of sync after a failure, discarding it");
        conn.discard();
    }
    result
}

fn meta_of(listed: Listed, parent: &str) -> EntryMeta {
    let path = paths::join(parent, &listed.name);
    match listed.kind {
        FactKind::Dir => EntryMeta::dir(path, listed.modified),
        _ => EntryMeta::file(path, listed.size, listed.modified),
    }
}

async fn list(conn: &mut FtpControl, path: &str) -> Result<Vec<EntryMeta>, SourceError> {
    let children = if conn.supports_mlst() {
        conn.read_listing(&format!("MLSD {path}"), path)
            .await?
            .lines()
            .filter_map(listing::parse_facts)
            .filter(|listed| listed.kind != FactKind::SelfOrParent)
            .map(|listed| meta_of(listed, path))
            .collect()
    } else {
        let now = OffsetDateTime::now_utc();
        conn.read_listing(&format!("LIST {path}"), path)
            .await?
            .lines()
            .filter_map(|line| listing::parse_list_line(line, now))
            .map(|listed| meta_of(listed, path))
            .collect()
    };
    Ok(children)
}

async fn stat(conn: &mut FtpControl, path: &str) -> Result<EntryMeta, SourceError> {
    if path == "/" {
        return Ok(EntryMeta::dir(path, 0));
    }
    if conn.supports_mlst() {
        let reply = conn.expect(&format!("MLST {path}"), 2, path).await?;
        let listed = reply
            .message
            .lines()
            .filter(|line| line.starts_with(' ') || line.contains(';'))
            .find_map(listing::parse_facts)
            .ok_or_else(|| SourceError::Transport(format!("unexpected MLST reply for {path}")))?;
        return Ok(match listed.kind {
            FactKind::Dir | FactKind::SelfOrParent => EntryMeta::dir(path, listed.modified),
            FactKind::File => EntryMeta::file(path, listed.size, listed.modified),
        });
    }

    let size = conn.command(&format!("SIZE {path}")).await?;
    if size.code == 213 {
        let modified = match conn.command(&format!("MDTM {path}")).await? {
            reply if reply.code == 213 => listing::parse_timeval(&reply.message).unwrap_or(0),
            _ => 0,
        };
        return Ok(EntryMeta::file(
            path,
            size.message.trim().parse().unwrap_or(0),
            modified,
        ));
    }
    let cwd = conn.command(&format!("CWD {path}")).await?;
    if cwd.is(2) {
        Ok(EntryMeta::dir(path, 0))
    } else {
        Err(SourceError::NotFound(path.to_string()))
    }
}

fn remove_tree<'a>(
    conn: &'a mut FtpControl,
    path: &'a str,
) -> BoxFuture<'a, Result<(), SourceError>> {
    async move {
        for child in list(conn, path).await? {
            if child.directory {
                remove_tree(conn, &child.path).await?;
            } else {
                conn.expect(&format!("DELE {}", child.path), 2, &child.path)
                    .await?;
            }
        }
        conn.expect(&format!("RMD {path}"), 2, path).await?;
        Ok(())
    }
    .boxed()
}

#[async_trait]
impl Backend for FtpBackend {
    fn kind(&self) -> SourceKind {
        SourceKind::Ftp
    }

    async fn home(&self) -> Result<String, SourceError> {
        let home = self
            .home
            .get_or_try_init(|| async {
                let mut conn = self.pool.get().await?;
                let reply = conn.expect("PWD", 2, "PWD").await?;
                control::parse_pwd(&reply.message).ok_or_else(|| {
                    SourceError::Transport(format!("unexpected PWD reply {:?}", reply.message))
                })
            })
            .await?;
        Ok(home.clone())
    }

    fn concurrency(&self) -> usize {
        self.pool.capacity()
    }

    async fn stat(&self, path: &str) -> Result<EntryMeta, SourceError> {
        let mut conn = self.pool.get().await?;
        stat(&mut conn, path).await
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<EntryMeta>, SourceError> {
        let mut conn = self.pool.get().await?;
        let result = list(&mut conn, path).await;
        settle(conn, result)
    }

    async fn read_file(
        &self,
        entry: &EntryMeta,
        out: &mut (dyn AsyncWrite + Unpin + Send),
        progress: &TaskHandle,
    ) -> Result<u64, SourceError> {
        let mut conn = self.pool.get().await?;
        let result = async {
            let mut data = conn
                .start_data(&format!("RETR {}", entry.path), &entry.path)
                .await?;
            let copied = copy_with_progress(&mut data, out, Some(entry.size), progress).await?;
            drop(data);
            conn.finish_data(&entry.path).await?;
            Ok::<_, SourceError>(copied)
        }
        .await;
        settle(conn, result)
    }

    async fn write_file(
        &self,
        path: &str,
        input: &mut (dyn AsyncRead + Unpin + Send),
        length: u64,
        progress: &TaskHandle,
    ) -> Result<(), SourceError> {
        let mut conn = self.pool.get().await?;
        let result = async {
            let mut data = conn.start_data(&format!("STOR {path}"), path).await?;
            copy_exact_with_progress(input, &mut data, length, progress).await?;
            data.shutdown().await?;
            drop(data);
            conn.finish_data(path).await
        }
        .await;
        settle(conn, result)
    }

    async fn create_dir(&self, path: &str) -> Result<(), SourceError> {
        let mut conn = self.pool.get().await?;
        conn.expect(&format!("MKD {path}"), 2, path).await.map(drop)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SourceError> {
        let mut conn = self.pool.get().await?;
        match stat(&mut conn, to).await {
            Ok(_) => {
                return Err(SourceError::InvalidOperation(format!(
                    "{to} already exists"
                )));
            }
            Err(SourceError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        conn.expect(&format!("RNFR {from}"), 3, from).await?;
        conn.expect(&format!("RNTO {to}"), 2, to).await.map(drop)
    }

    async fn delete(&self, entry: &EntryMeta) -> Result<(), SourceError> {
        let mut conn = self.pool.get().await?;
        if entry.directory {
            remove_tree(&mut conn, &entry.path).await
        } else {
            conn.expect(&format!("DELE {}", entry.path), 2, &entry.path)
                .await
                .map(drop)
        }
    }

    fn pool_status(&self) -> Option<PoolStatus> {
        Some(self.pool.status())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
