//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the provisioner runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;
use url::Url;

use crate::logging::LogFormat;

fn default_server_uri() -> String {
    "http://localhost:55054".to_owned()
}

fn default_user_id() -> String {
    "admin".to_owned()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_capacity_total() -> u32 {
    100
}

fn default_advertised_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_port() -> u16 {
    4567
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_readiness_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_reap_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_reap_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_worker_command() -> PathBuf {
    PathBuf::from("loom-worker")
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_log_level() -> String {
    "info".to_owned()
}

/// Primary configuration object for the provisioner agent.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentConfig {
    #[serde(default)]
    pub control_plane: ControlPlaneConfig,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where an [`AgentConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAgentConfig {
    pub config: AgentConfig,
    /// `None` when no file was found and built-in defaults are in effect.
    pub source: Option<PathBuf>,
}

impl AgentConfig {
    pub const ENV_CONFIG_PATH: &str = "LOOM_PROVISIONER_CONFIG";

    /// Load configuration from disk, respecting the `LOOM_PROVISIONER_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration together with the effective source path.
    ///
    /// An explicit override that points at a missing file is an error; an
    /// empty candidate search falls back to defaults.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAgentConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAgentConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAgentConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        debug!(
            inspected = %candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            "no configuration file found; using defaults"
        );
        let config = Self::default();
        config.validate()?;
        Ok(LoadedAgentConfig {
            config,
            source: None,
        })
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AgentConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.control_plane.validate()?;
        self.agent.validate()?;
        if self.workers.command.as_os_str().is_empty() {
            return Err(anyhow!("workers.command must not be empty"));
        }
        Ok(())
    }
}

impl std::str::FromStr for AgentConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AgentConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    #[serde(default = "default_server_uri")]
    pub uri: String,
    #[serde(default = "default_user_id")]
    pub user_id: String,
    #[serde(default = "default_request_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            uri: default_server_uri(),
            user_id: default_user_id(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl ControlPlaneConfig {
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.uri)
            .with_context(|| format!("control_plane.uri '{}' is not a valid URL", self.uri))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow!(
                "control_plane.uri must use http or https, got '{}'",
                url.scheme()
            ));
        }
        if self.user_id.trim().is_empty() {
            return Err(anyhow!("control_plane.user_id must not be empty"));
        }
        if self.request_timeout.is_zero() {
            return Err(anyhow!("control_plane.request_timeout must be non-zero"));
        }
        Ok(())
    }
}

/// Static agent settings advertised to the control plane and used to pace
/// the background activities.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_capacity_total")]
    pub capacity_total: u32,
    #[serde(default = "default_advertised_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    #[serde(default = "default_heartbeat_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub heartbeat_interval: Duration,
    #[serde(default = "default_readiness_poll_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub readiness_poll_interval: Duration,
    #[serde(default = "default_reap_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub reap_timeout: Duration,
    #[serde(default = "default_reap_poll_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub reap_poll_interval: Duration,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            capacity_total: default_capacity_total(),
            host: default_advertised_host(),
            port: default_port(),
            bind_address: default_bind_address(),
            heartbeat_interval: default_heartbeat_interval(),
            readiness_poll_interval: default_readiness_poll_interval(),
            reap_timeout: default_reap_timeout(),
            reap_poll_interval: default_reap_poll_interval(),
        }
    }
}

impl AgentSettings {
    /// Socket address the API binding listens on.
    pub fn api_listen(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity_total == 0 {
            return Err(anyhow!("agent.capacity_total must be greater than zero"));
        }
        if self.port == 0 {
            return Err(anyhow!("agent.port must be non-zero"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("agent.host must not be empty"));
        }
        for (name, value) in [
            ("heartbeat_interval", self.heartbeat_interval),
            ("readiness_poll_interval", self.readiness_poll_interval),
            ("reap_timeout", self.reap_timeout),
            ("reap_poll_interval", self.reap_poll_interval),
        ] {
            if value.is_zero() {
                return Err(anyhow!("agent.{} must be non-zero", name));
            }
        }
        Ok(())
    }
}

/// How tenant workers are launched on this host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_command")]
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: default_worker_command(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for the rolling log file; stdout only when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            format: default_log_format(),
            level: default_log_level(),
            file_prefix: None,
        }
    }
}
