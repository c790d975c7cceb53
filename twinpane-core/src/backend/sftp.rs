use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use russh::client;
use russh::keys::PublicKey;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh_sftp::client::SftpSession;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::protocol::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::activity::TaskHandle;
use crate::entry::EntryMeta;
use crate::error::SourceError;
use crate::paths;
use crate::pool::{Manager, Pool, PoolStatus};
use crate::retry::RetryPolicy;
use crate::source::{Backend, SourceKind};
use crate::transfer::{copy_exact_with_progress, copy_with_progress};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum SshAuth {
    Password {
        password: String,
    },
    Key {
        key_path: String,
        #[serde(default)]
        passphrase: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
}

/// Opens authenticated SSH connections. Shared by every SFTP source.
#[derive(Debug, Clone)]
pub struct SshConnector {
    pub connect_timeout: Duration,
    pub keepalive: Option<Duration>,
    pub check_known_hosts: bool,
}

impl Default for SshConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            keepalive: Some(Duration::from_secs(30)),
            check_known_hosts: true,
        }
    }
}

impl SshConnector {
    pub async fn connect(
        &self,
        target: &SshTarget,
    ) -> Result<client::Handle<SshHandler>, SourceError> {
        let config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: self.keepalive,
            keepalive_max: 3,
            ..Default::default()
        };
        let handler = SshHandler {
            host: target.host.clone(),
            port: target.port,
            check_known_hosts: self.check_known_hosts,
        };

        info!(host = %target.host, port = target.port, "connecting over ssh");
        let mut handle = tokio::time::timeout(
            self.connect_timeout,
            client::connect(
                Arc::new(config),
                (target.host.as_str(), target.port),
                handler,
            ),
        )
        .await
        .map_err(|_| SourceError::Transport(format!("ssh connect to {} timed out", target.host)))?
        .map_err(SourceError::transport)?;

        let auth = match &target.auth {
            SshAuth::Password { password } => handle
                .authenticate_password(&target.username, password)
                .await
                .map_err(SourceError::transport)?,
            SshAuth::Key {
                key_path,
                passphrase,
            } => {
                let key = russh::keys::load_secret_key(key_path, passphrase.as_deref())
                    .map_err(|err| {
                        SourceError::InvalidConfig(format!("cannot load key {key_path}: {err}"))
                    })?;
                handle
                    .authenticate_publickey(
                        &target.username,
                        PrivateKeyWithHashAlg::new(Arc::new(key), None),
                    )
                    .await
                    .map_err(SourceError::transport)?
            }
        };
        if !auth.success() {
            return Err(SourceError::Transport(format!(
                "ssh authentication rejected for {}@{}",
                target.username, target.host
            )));
        }
        Ok(handle)
    }
}

pub struct SshHandler {
    host: String,
    port: u16,
    check_known_hosts: bool,
}

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        if !self.check_known_hosts {
            return Ok(true);
        }
        match russh::keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => Ok(true),
            Ok(false) => {
                warn!(host = %self.host, "host key is not in known_hosts");
                Ok(false)
            }
            Err(err) => {
                warn!(host = %self.host, error = %err, "host key verification failed");
                Ok(false)
            }
        }
    }
}

pub struct SftpConnection {
    handle: client::Handle<SshHandler>,
    sftp: SftpSession,
}

pub struct SftpManager {
    connector: SshConnector,
    target: SshTarget,
}

#[async_trait]
impl Manager for SftpManager {
    type Connection = SftpConnection;

    async fn create(&self) -> Result<SftpConnection, SourceError> {
        let handle = self.connector.connect(&self.target).await?;
        let channel = handle
            .channel_open_session()
            .await
            .map_err(SourceError::transport)?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(SourceError::transport)?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(SourceError::transport)?;
        debug!(host = %self.target.host, "sftp session opened");
        Ok(SftpConnection { handle, sftp })
    }

    async fn is_alive(&self, conn: &mut SftpConnection) -> bool {
        !conn.handle.is_closed()
    }

    async fn dispose(&self, conn: SftpConnection) {
        drop(conn.sftp);
        let _ = conn
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
        debug!(host = %self.target.host, "sftp session closed");
    }
}

/// SFTP over SSH, one SSH connection per pool slot.
pub struct SftpBackend {
    pool: Pool<SftpManager>,
    home: OnceCell<String>,
}

impl SftpBackend {
    pub fn new(
        connector: SshConnector,
        target: SshTarget,
        home: Option<String>,
        pool_size: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            pool: Pool::new(SftpManager { connector, target }, pool_size, retry),
            home: OnceCell::new_with(home),
        }
    }
}

fn map_sftp_error(err: SftpError, path: &str) -> SourceError {
    if let SftpError::Status(status) = &err
        && status.status_code == StatusCode::NoSuchFile
    {
        return SourceError::NotFound(path.to_string());
    }
    let message = err.to_string();
    if message.contains("No such file") || message.contains("not found") {
        SourceError::NotFound(path.to_string())
    } else {
        SourceError::Transport(format!("{path}: {message}"))
    }
}

fn meta_from_attrs(path: String, attrs: &russh_sftp::client::fs::Metadata) -> EntryMeta {
    let modified = attrs.mtime.map(|secs| i64::from(secs) * 1000).unwrap_or(0);
    if attrs.is_dir() {
        EntryMeta::dir(path, modified)
    } else {
        EntryMeta::file(path, attrs.size.unwrap_or(0), modified)
    }
}

fn remove_tree<'a>(sftp: &'a SftpSession, path: &'a str) -> BoxFuture<'a, Result<(), SourceError>> {
    async move {
        let children = sftp
            .read_dir(path)
            .await
            .map_err(|err| map_sftp_error(err, path))?;
        for child in children {
            let name = child.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let child_path = paths::join(path, &name);
            if child.metadata().is_dir() {
                remove_tree(sftp, &child_path).await?;
            } else {
                sftp.remove_file(&child_path)
                    .await
                    .map_err(|err| map_sftp_error(err, &child_path))?;
            }
        }
        sftp.remove_dir(path)
            .await
            .map_err(|err| map_sftp_error(err, path))
    }
    .boxed()
}

#[async_trait]
impl Backend for SftpBackend {
    fn kind(&self) -> SourceKind {
        SourceKind::Sftp
    }

    async fn home(&self) -> Result<String, SourceError> {
        let home = self
            .home
            .get_or_try_init(|| async {
                let conn = self.pool.get().await?;
                conn.sftp
                    .canonicalize(".")
                    .await
                    .map_err(|err| map_sftp_error(err, "."))
            })
            .await?;
        Ok(home.clone())
    }

    fn concurrency(&self) -> usize {
        self.pool.capacity()
    }

    async fn stat(&self, path: &str) -> Result<EntryMeta, SourceError> {
        let conn = self.pool.get().await?;
        let attrs = conn
            .sftp
            .metadata(path)
            .await
            .map_err(|err| map_sftp_error(err, path))?;
        Ok(meta_from_attrs(path.to_string(), &attrs))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<EntryMeta>, SourceError> {
        let conn = self.pool.get().await?;
        let listing = conn
            .sftp
            .read_dir(path)
            .await
            .map_err(|err| map_sftp_error(err, path))?;
        Ok(listing
            .filter(|child| child.file_name() != "." && child.file_name() != "..")
            .map(|child| meta_from_attrs(paths::join(path, &child.file_name()), &child.metadata()))
            .collect())
    }

    async fn read_file(
        &self,
        entry: &EntryMeta,
        out: &mut (dyn AsyncWrite + Unpin + Send),
        progress: &TaskHandle,
    ) -> Result<u64, SourceError> {
        let conn = self.pool.get().await?;
        let mut file = conn
            .sftp
            .open(&entry.path)
            .await
            .map_err(|err| map_sftp_error(err, &entry.path))?;
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
        let conn = self.pool.get().await?;
        let mut file = conn
            .sftp
            .create(path)
            .await
            .map_err(|err| map_sftp_error(err, path))?;
        copy_exact_with_progress(input, &mut file, length, progress).await?;
        file.shutdown().await?;
        Ok(())
    }

    async fn create_dir(&self, path: &str) -> Result<(), SourceError> {
        let conn = self.pool.get().await?;
        conn.sftp
            .create_dir(path)
            .await
            .map_err(|err| map_sftp_error(err, path))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SourceError> {
        let conn = self.pool.get().await?;
        let taken = conn
            .sftp
            .try_exists(to)
            .await
            .map_err(|err| map_sftp_error(err, to))?;
        if from != to && taken {
            return Err(SourceError::InvalidOperation(format!("{to} already exists")));
        }
        conn.sftp
            .rename(from, to)
            .await
            .map_err(|err| map_sftp_error(err, from))
    }

    async fn delete(&self, entry: &EntryMeta) -> Result<(), SourceError> {
        let conn = self.pool.get().await?;
        if entry.directory {
            remove_tree(&conn.sftp, &entry.path).await
        } else {
            conn.sftp
                .remove_file(&entry.path)
                .await
                .map_err(|err| map_sftp_error(err, &entry.path))
        }
    }

    async fn exists(&self, path: &str) -> bool {
        match self.pool.get().await {
            Ok(conn) => conn.sftp.try_exists(path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    fn pool_status(&self) -> Option<PoolStatus> {
        Some(self.pool.status())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
