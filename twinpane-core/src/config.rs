use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::ftp::FtpTarget;
use crate::backend::kube::{KubeTarget, Kubectl};
use crate::backend::sftp::{SshAuth, SshConnector, SshTarget};
use crate::backend::webdav::{Credentials, WebdavTarget};
use crate::backend::{FtpBackend, KubeBackend, LocalBackend, SftpBackend, WebdavBackend};
use crate::error::SourceError;
use crate::pool::DEFAULT_POOL_SIZE;
use crate::retry::RetryPolicy;
use crate::source::{ListingPolicy, Source, SourceKind};
use crate::transfer::DEFAULT_CHUNK_SIZE;

fn default_ssh_port() -> u16 {
    22
}

fn default_ftp_port() -> u16 {
    21
}

fn default_ftp_user() -> String {
    "anonymous".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkedUploadConfig {
    /// Root of the uploads collection, e.g. `https://host/remote.php/dav/uploads/ann/`.
    pub uploads_url: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
}

/// Connection settings of one backend, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    Local {
        #[serde(default)]
        home: Option<String>,
    },
    Sftp {
        host: String,
        #[serde(default = "default_ssh_port")]
        port: u16,
        username: String,
        auth: SshAuth,
        #[serde(default)]
        home: Option<String>,
        #[serde(default)]
        pool_size: Option<usize>,
    },
    Webdav {
        url: String,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        home: Option<String>,
        #[serde(default)]
        pool_size: Option<usize>,
        #[serde(default)]
        chunked: Option<ChunkedUploadConfig>,
    },
    Ftp {
        host: String,
        #[serde(default = "default_ftp_port")]
        port: u16,
        #[serde(default = "default_ftp_user")]
        username: String,
        #[serde(default)]
        password: String,
        #[serde(default)]
        home: Option<String>,
        #[serde(default)]
        pool_size: Option<usize>,
    },
    Kubernetes {
        #[serde(default = "default_namespace")]
        namespace: String,
        pod: String,
        #[serde(default)]
        container: Option<String>,
        #[serde(default)]
        home: Option<String>,
        #[serde(default)]
        concurrency: Option<usize>,
    },
}

/// Shared client factories handed to every source that is opened.
#[derive(Debug, Clone)]
pub struct Clients {
    pub ssh: SshConnector,
    pub kubectl: Kubectl,
    pub retry: RetryPolicy,
    pub connect_timeout: Duration,
    /// Replaces every configured pool size when set.
    pub pool_size_override: Option<usize>,
}

impl Default for Clients {
    fn default() -> Self {
        Self {
            ssh: SshConnector::default(),
            kubectl: Kubectl::default(),
            retry: RetryPolicy::none(),
            connect_timeout: Duration::from_secs(15),
            pool_size_override: None,
        }
    }
}

impl Clients {
    fn pool_size(&self, configured: Option<usize>) -> usize {
        self.pool_size_override
            .or(configured)
            .unwrap_or(DEFAULT_POOL_SIZE)
            .max(1)
    }
}

fn require(value: &str, field: &str) -> Result<(), SourceError> {
    if value.trim().is_empty() {
        Err(SourceError::InvalidConfig(format!("{field} must not be empty")))
    } else {
        Ok(())
    }
}

impl SourceConfig {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceConfig::Local { .. } => SourceKind::Local,
            SourceConfig::Sftp { .. } => SourceKind::Sftp,
            SourceConfig::Webdav { .. } => SourceKind::Webdav,
            SourceConfig::Ftp { .. } => SourceKind::Ftp,
            SourceConfig::Kubernetes { .. } => SourceKind::Kubernetes,
        }
    }

    /// Builds a live source. Network connections are opened lazily.
    pub fn open(&self, clients: &Clients, listing: ListingPolicy) -> Result<Source, SourceError> {
        let source = match self.clone() {
            SourceConfig::Local { home } => Source::new(LocalBackend::new(home), listing),
            SourceConfig::Sftp {
                host,
                port,
                username,
                auth,
                home,
                pool_size,
            } => {
                require(&host, "host")?;
                require(&username, "username")?;
                let target = SshTarget {
                    host,
                    port,
                    username,
                    auth,
                };
                Source::new(
                    SftpBackend::new(
                        clients.ssh.clone(),
                        target,
                        home,
                        clients.pool_size(pool_size),
                        clients.retry,
                    ),
                    listing,
                )
            }
            SourceConfig::Webdav {
                url,
                username,
                password,
                home,
                pool_size,
                chunked,
            } => {
                let target = WebdavTarget {
                    url,
                    credentials: username.map(|username| Credentials {
                        username,
                        password: password.unwrap_or_default(),
                    }),
                    chunked,
                    connect_timeout: clients.connect_timeout,
                };
                Source::new(
                    WebdavBackend::new(target, home, clients.pool_size(pool_size), clients.retry)?,
                    listing,
                )
            }
            SourceConfig::Ftp {
                host,
                port,
                username,
                password,
                home,
                pool_size,
            } => {
                require(&host, "host")?;
                let target = FtpTarget {
                    host,
                    port,
                    username,
                    password,
                    connect_timeout: clients.connect_timeout,
                };
                Source::new(
                    FtpBackend::new(target, home, clients.pool_size(pool_size), clients.retry),
                    listing,
                )
            }
            SourceConfig::Kubernetes {
                namespace,
                pod,
                container,
                home,
                concurrency,
            } => {
                require(&pod, "pod")?;
                let target = KubeTarget {
                    namespace,
                    pod,
                    container,
                };
                Source::new(
                    KubeBackend::new(
                        clients.kubectl.clone(),
                        target,
                        home,
                        clients.pool_size(concurrency),
                    ),
                    listing,
                )
            }
        };
        Ok(source)
    }
}

/// A named, serializable source description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceProfile {
    pub name: String,
    /// Propagate listing failures instead of showing an empty directory.
    #[serde(default)]
    pub strict_listing: bool,
    #[serde(flatten)]
    pub config: SourceConfig,
}

impl SourceProfile {
    pub fn new(name: impl Into<String>, config: SourceConfig) -> Self {
        Self {
            name: name.into(),
            strict_listing: false,
            config,
        }
    }

    pub fn listing_policy(&self) -> ListingPolicy {
        if self.strict_listing {
            ListingPolicy::Strict
        } else {
            ListingPolicy::Lenient
        }
    }

    pub fn open(&self, clients: &Clients) -> Result<Source, SourceError> {
        self.config.open(clients, self.listing_policy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceState;

    #[test]
    fn parses_profiles_with_defaults() {
        let profiles: Vec<SourceProfile> = serde_json::from_str(
            r#"[
                {"name": "home", "type": "local"},
                {"name": "build box", "type": "sftp", "host": "build.internal",
                 "username": "ci", "auth": {"method": "password", "password": "s3cret"}},
                {"name": "mirror", "type": "ftp", "host": "ftp.example.org"},
                {"name": "web", "type": "kubernetes", "pod": "web-0", "strict_listing": true},
                {"name": "cloud", "type": "webdav", "url": "https://dav.example.com/files/ann/",
                 "username": "ann",
                 "chunked": {"uploads_url": "https://dav.example.com/uploads/ann/"}}
            ]"#,
        )
        .unwrap();

        assert_eq!(profiles[0].config, SourceConfig::Local { home: None });
        assert!(matches!(
            &profiles[1].config,
            SourceConfig::Sftp { port: 22, pool_size: None, .. }
        ));
        assert!(matches!(
            &profiles[2].config,
            SourceConfig::Ftp { port: 21, username, password, .. }
                if username == "anonymous" && password.is_empty()
        ));
        assert!(matches!(
            &profiles[3].config,
            SourceConfig::Kubernetes { namespace, container: None, .. } if namespace == "default"
        ));
        assert_eq!(profiles[3].listing_policy(), ListingPolicy::Strict);
        assert_eq!(profiles[0].listing_policy(), ListingPolicy::Lenient);
        assert!(matches!(
            &profiles[4].config,
            SourceConfig::Webdav { chunked: Some(ChunkedUploadConfig { chunk_size, .. }), .. }
                if *chunk_size == DEFAULT_CHUNK_SIZE
        ));
    }

    #[test]
    fn profile_serializes_flat() {
        let profile = SourceProfile::new(
            "docs",
            SourceConfig::Local {
                home: Some("/srv/docs".into()),
            },
        );
        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json["type"], "local");
        assert_eq!(json["home"], "/srv/docs");
        assert_eq!(json["name"], "docs");
    }

    #[tokio::test]
    async fn opens_sources_lazily() {
        let clients = Clients {
            pool_size_override: Some(2),
            ..Clients::default()
        };
        let ftp = SourceConfig::Ftp {
            host: "127.0.0.1".into(),
            port: 1,
            username: default_ftp_user(),
            password: String::new(),
            home: None,
            pool_size: Some(8),
        }
        .open(&clients, ListingPolicy::Lenient)
        .unwrap();
        assert_eq!(ftp.kind(), SourceKind::Ftp);
        assert_eq!(ftp.concurrency(), 2);
        assert_eq!(ftp.state(), SourceState::Created);

        ftp.close().await;
        assert_eq!(ftp.state(), SourceState::Closed);
    }

    #[test]
    fn rejects_incomplete_configs() {
        let clients = Clients::default();
        let webdav = SourceConfig::Webdav {
            url: "not a url".into(),
            username: None,
            password: None,
            home: None,
            pool_size: None,
            chunked: None,
        };
        assert!(matches!(
            webdav.open(&clients, ListingPolicy::Lenient),
            Err(SourceError::InvalidConfig(_))
        ));

        let kube = SourceConfig::Kubernetes {
            namespace: default_namespace(),
            pod: " ".into(),
            container: None,
            home: None,
            concurrency: None,
        };
        assert!(matches!(
            kube.open(&clients, ListingPolicy::Lenient),
            Err(SourceError::InvalidConfig(_))
        ));
    }
}
