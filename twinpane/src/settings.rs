use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use twinpane_core::retry::{Backoff, RetryPolicy};
use twinpane_core::{Clients, DEFAULT_TICK};
use twinpane_core::backend::Kubectl;
use twinpane_integrations::SizeUnits;
use twinpane_integrations::ids::{CONFIG_DIR_NAME, PROFILES_FILE_NAME};

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;
const DEFAULT_CONNECT_ATTEMPTS: u64 = 1;

/// Runtime settings read from the environment (`.env` is loaded first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub profiles_path: PathBuf,
    pub pool_size: Option<usize>,
    pub tick: Duration,
    pub connect_timeout: Duration,
    pub connect_attempts: u32,
    pub check_known_hosts: bool,
    pub kubectl: String,
    pub kube_context: Option<String>,
    pub kubeconfig: Option<String>,
    pub size_units: SizeUnits,
}

/// What `twinpane settings` prints.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SettingsSnapshot {
    pub profiles_path: String,
    pub pool_size: Option<usize>,
    pub tick_ms: u64,
    pub connect_timeout_secs: u64,
    pub connect_attempts: u32,
    pub check_known_hosts: bool,
    pub kubectl: String,
    pub size_units: SizeUnits,
}

impl Settings {
    pub fn from_env() -> Self {
        let home = dirs::home_dir().unwrap_or_else(std::env::temp_dir);
        let profiles_path = std::env::var("TWINPANE_CONFIG")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(default_profiles_path);
        let pool_size = std::env::var("TWINPANE_POOL_SIZE")
            .ok()
            .and_then(|value| value.trim().parse::<usize>().ok())
            .filter(|value| *value > 0);
        let kubeconfig = std::env::var("TWINPANE_KUBECONFIG")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(|value| expand_with_home(&value, &home).display().to_string());
        let kubectl = std::env::var("TWINPANE_KUBECTL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(|value| expand_with_home(&value, &home).display().to_string())
            .unwrap_or_else(|| "kubectl".to_string());
        let size_units = std::env::var("TWINPANE_SIZE_UNITS")
            .ok()
            .and_then(|value| SizeUnits::parse(&value))
            .unwrap_or_default();

        Self {
            profiles_path,
            pool_size,
            tick: Duration::from_millis(read_u64_env(
                "TWINPANE_TICK_MS",
                DEFAULT_TICK.as_millis() as u64,
            )),
            connect_timeout: Duration::from_secs(read_u64_env(
                "TWINPANE_CONNECT_TIMEOUT_SECS",
                DEFAULT_CONNECT_TIMEOUT_SECS,
            )),
            connect_attempts: read_u64_env("TWINPANE_CONNECT_ATTEMPTS", DEFAULT_CONNECT_ATTEMPTS)
                .min(u64::from(u32::MAX)) as u32,
            check_known_hosts: read_bool_env("TWINPANE_CHECK_KNOWN_HOSTS", true),
            kubectl,
            kube_context: std::env::var("TWINPANE_KUBE_CONTEXT")
                .ok()
                .filter(|value| !value.trim().is_empty()),
            kubeconfig,
            size_units,
        }
    }

    /// Client factories shared by every source opened in this process.
    pub fn clients(&self) -> Clients {
        let mut kubectl = Kubectl::new(self.kubectl.clone());
        if let Some(context) = &self.kube_context {
            kubectl = kubectl.with_context(context.clone());
        }
        if let Some(kubeconfig) = &self.kubeconfig {
            kubectl = kubectl.with_kubeconfig(kubeconfig.clone());
        }
        let mut clients = Clients {
            kubectl,
            retry: RetryPolicy::new(
                self.connect_attempts,
                Backoff::new(Duration::from_millis(250), Duration::from_secs(5), true),
            ),
            connect_timeout: self.connect_timeout,
            pool_size_override: self.pool_size,
            ..Clients::default()
        };
        clients.ssh.connect_timeout = self.connect_timeout;
        clients.ssh.check_known_hosts = self.check_known_hosts;
        clients
    }

    pub fn snapshot(&self) -> SettingsSnapshot {
        SettingsSnapshot {
            profiles_path: self.profiles_path.display().to_string(),
            pool_size: self.pool_size,
            tick_ms: self.tick.as_millis().min(u128::from(u64::MAX)) as u64,
            connect_timeout_secs: self.connect_timeout.as_secs(),
            connect_attempts: self.connect_attempts,
            check_known_hosts: self.check_known_hosts,
            kubectl: self.kubectl.clone(),
            size_units: self.size_units,
        }
    }
}

fn default_profiles_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(CONFIG_DIR_NAME)
        .join(PROFILES_FILE_NAME)
}

pub fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|value| parse_bool(&value))
        .unwrap_or(default)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
