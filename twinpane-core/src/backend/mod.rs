//! One [`crate::Backend`] implementation per protocol.

pub mod ftp;
pub mod kube;
pub mod local;
pub mod sftp;
pub mod webdav;

pub use ftp::{FtpBackend, FtpTarget};
pub use kube::{KubeBackend, KubeTarget, Kubectl};
pub use local::LocalBackend;
pub use sftp::{SftpBackend, SshAuth, SshConnector, SshTarget};
pub use webdav::{WebdavBackend, WebdavTarget};

/// Milliseconds since the Unix epoch, 0 for anything before it or unknown.
pub(crate) fn epoch_millis(time: std::time::SystemTime) -> i64 {
    time.duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}
