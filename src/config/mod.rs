use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

#[cfg(test)]
mod tests;

pub const ENV_ROOT: &str = "REPO2MD_ROOT";
pub const ENV_HOST: &str = "REPO2MD_HOST";
pub const ENV_PORT: &str = "REPO2MD_PORT";
pub const ENV_API_BASE_URL: &str = "API_BASE_URL";
pub const ENV_HEARTBEAT_TIMEOUT: &str = "REPO2MD_HEARTBEAT_TIMEOUT_SECS";
pub const ENV_SWEEP_INTERVAL: &str = "REPO2MD_SWEEP_INTERVAL_SECS";
pub const ENV_CLONE_TIMEOUT: &str = "REPO2MD_CLONE_TIMEOUT_SECS";
pub const ENV_MAX_ARCHIVE_BYTES: &str = "REPO2MD_MAX_ARCHIVE_BYTES";

/// Server configuration: TOML file, then environment, then CLI flags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Directory holding one workspace per session
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Public base URL reported by `GET /config`; derived from host and port when unset
    #[serde(default)]
    pub api_base_url: Option<String>,

    /// Sessions without a heartbeat for this long are torn down
    #[serde(with = "humantime_serde", default = "default_heartbeat_timeout")]
    pub heartbeat_timeout: Duration,

    #[serde(with = "humantime_serde", default = "default_sweep_interval")]
    pub sweep_interval: Duration,

    #[serde(with = "humantime_serde", default = "default_clone_timeout")]
    pub clone_timeout: Duration,

    /// Largest accepted archive upload in bytes
    #[serde(default = "default_max_archive_bytes")]
    pub max_archive_bytes: u64,
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(".repos")
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_clone_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_max_archive_bytes() -> u64 {
    200 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            host: default_host(),
            port: default_port(),
            api_base_url: None,
            heartbeat_timeout: default_heartbeat_timeout(),
            sweep_interval: default_sweep_interval(),
            clone_timeout: default_clone_timeout(),
            max_archive_bytes: default_max_archive_bytes(),
        }
    }
}

impl ServerConfig {
    /// Load from an optional TOML file and merge the process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.merge_env_vars();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn merge_env_vars(&mut self) {
        self.merge_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`; unparsable values are ignored with a warning
    pub fn merge_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(root) = lookup(ENV_ROOT) {
            self.workspace_root = PathBuf::from(root);
        }
        if let Some(host) = lookup(ENV_HOST) {
            self.host = host;
        }
        if let Some(port) = parse_env(&lookup, ENV_PORT) {
            self.port = port;
        }
        if let Some(url) = lookup(ENV_API_BASE_URL) {
            self.api_base_url = Some(url);
        }
        if let Some(secs) = parse_env(&lookup, ENV_HEARTBEAT_TIMEOUT) {
            self.heartbeat_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env(&lookup, ENV_SWEEP_INTERVAL) {
            self.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env(&lookup, ENV_CLONE_TIMEOUT) {
            self.clone_timeout = Duration::from_secs(secs);
        }
        if let Some(bytes) = parse_env(&lookup, ENV_MAX_ARCHIVE_BYTES) {
            self.max_archive_bytes = bytes;
        }
    }

    /// Apply command-line flags, which take precedence over everything else
    pub fn apply_overrides(
        &mut self,
        workspace_root: Option<PathBuf>,
        host: Option<String>,
        port: Option<u16>,
    ) {
        if let Some(root) = workspace_root {
            self.workspace_root = root;
        }
        if let Some(host) = host {
            self.host = host;
        }
        if let Some(port) = port {
            self.port = port;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.workspace_root.as_os_str().is_empty() {
            bail!("workspace_root must not be empty");
        }
        if self.host.trim().is_empty() {
            bail!("host must not be empty");
        }
        if self.heartbeat_timeout.is_zero() {
            bail!("heartbeat_timeout must be greater than zero");
        }
        if self.sweep_interval.is_zero() {
            bail!("sweep_interval must be greater than zero");
        }
        if self.sweep_interval > self.heartbeat_timeout {
            bail!(
                "sweep_interval ({:?}) must not exceed heartbeat_timeout ({:?})",
                self.sweep_interval,
                self.heartbeat_timeout
            );
        }
        if self.clone_timeout.is_zero() {
            bail!("clone_timeout must be greater than zero");
        }
        if self.max_archive_bytes == 0 {
            bail!("max_archive_bytes must be greater than zero");
        }
        Ok(())
    }

    /// Address the HTTP listener binds to
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Base URL clients should call
    pub fn api_url(&self) -> String {
        self.api_base_url
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.bind_addr()))
    }
}

fn parse_env<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid value for {}: {:?}", key, raw);
            None
        }
    }
}
