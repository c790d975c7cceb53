use std::io;

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("connection pool is closed")]
    PoolClosed,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SourceError {
    /// Maps an I/O failure on `path`, keeping missing files distinguishable.
    pub fn io(err: io::Error, path: &str) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            SourceError::NotFound(path.to_string())
        } else {
            SourceError::Io(err)
        }
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        SourceError::Transport(err.to_string())
    }

    pub fn is_transport(&self) -> bool {
        match self {
            SourceError::Transport(_) => true,
            SourceError::Http(err) => err.is_connect() || err.is_timeout(),
            SourceError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::TimedOut
            ),
            SourceError::Api { status, .. } => status.is_server_error(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ExpectedFailure;

    #[test]
    fn io_not_found_keeps_path() {
        let err = SourceError::io(io::Error::from(io::ErrorKind::NotFound), "/a/b");
        assert!(matches!(err, SourceError::NotFound(ref path) if path == "/a/b"));
        assert!(err.notification().is_some());
    }

    #[test]
    fn other_io_errors_are_not_expected() {
        let err = SourceError::io(io::Error::from(io::ErrorKind::PermissionDenied), "/a");
        assert!(matches!(err, SourceError::Io(_)));
        assert!(err.notification().is_none());
        assert!(!err.is_transport());
    }

    #[test]
    fn classifies_transport_failures() {
        assert!(SourceError::Transport("reset".into()).is_transport());
        assert!(SourceError::Io(io::Error::from(io::ErrorKind::BrokenPipe)).is_transport());
        assert!(
            SourceError::Api {
                status: StatusCode::BAD_GATEWAY,
                body: String::new()
            }
            .is_transport()
        );
        assert!(!SourceError::NotFound("/x".into()).is_transport());
    }
}
