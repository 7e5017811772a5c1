//! chainward.toml configuration parser.
//!
//! Every section is optional; missing values fall back to defaults so an
//! empty file is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::serde_str;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainwardConfig {
    pub daemon: DaemonConfig,
    pub runtime: RuntimeConfig,
    pub nodes: NodesConfig,
    pub alerts: AlertsConfig,
    pub health: HealthConfig,
    pub pruning: PruningConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Root directory for node data directories and the state database.
    pub data_root: PathBuf,
    /// State database file name, relative to `data_root`.
    pub state_file: String,
    /// Path to the template catalog TOML file.
    pub catalog: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/var/lib/chainward"),
            state_file: "chainward.redb".to_string(),
            catalog: PathBuf::from("/etc/chainward/templates.toml"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Explicit runtime endpoint (`unix:///…`, `npipe://…`, `tcp://host:port`).
    pub endpoint: Option<String>,
    /// TCP endpoint tried after local sockets; loopback or allow-listed only.
    pub tcp_fallback: Option<String>,
    /// Private CIDR blocks a non-loopback TCP endpoint may live in.
    pub allowed_subnets: Vec<String>,
    /// Host address container ports are published on.
    pub publish_address: String,
    /// Per-request timeout for runtime API calls.
    #[serde(with = "serde_str")]
    pub request_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            tcp_fallback: None,
            allowed_subnets: Vec::new(),
            publish_address: "127.0.0.1".to_string(),
            request_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodesConfig {
    /// Ceiling on nodes in starting/syncing/ready at once.
    pub max_running: usize,
    #[serde(with = "serde_str")]
    pub start_timeout: Duration,
    #[serde(with = "serde_str")]
    pub stop_timeout: Duration,
    #[serde(with = "serde_str")]
    pub probe_interval: Duration,
    #[serde(with = "serde_str")]
    pub probe_timeout: Duration,
    /// Blocks behind the peer best height still considered synced.
    pub sync_tolerance_blocks: u64,
    pub retry_max_attempts: u32,
    #[serde(with = "serde_str")]
    pub retry_initial_backoff: Duration,
    #[serde(with = "serde_str")]
    pub retry_max_backoff: Duration,
    pub port_stride: u16,
    pub port_max_attempts: u32,
    /// Restart nodes that were running when the daemon last stopped.
    pub resume_on_boot: bool,
}

impl Default for NodesConfig {
    fn default() -> Self {
        Self {
            max_running: 4,
            start_timeout: Duration::from_secs(300),
            stop_timeout: Duration::from_secs(30),
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(3),
            sync_tolerance_blocks: 2,
            retry_max_attempts: 5,
            retry_initial_backoff: Duration::from_secs(1),
            retry_max_backoff: Duration::from_secs(30),
            port_stride: 10,
            port_max_attempts: 100,
            resume_on_boot: true,
        }
    }
}

/// Minimum severity for alert dispatch: "info", "warning" or "critical".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub min_severity: String,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            min_severity: "warning".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    #[serde(with = "serde_str")]
    pub interval: Duration,
    pub cpu_limit_percent: f64,
    pub memory_limit_percent: f64,
    pub disk_limit_percent: f64,
    /// How long a node may stay stopped/errored before NODE_DOWN.
    #[serde(with = "serde_str")]
    pub down_grace: Duration,
    /// How long sync progress may stay flat before SYNC_DELAYED.
    #[serde(with = "serde_str")]
    pub stall_window: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            cpu_limit_percent: 90.0,
            memory_limit_percent: 90.0,
            disk_limit_percent: 90.0,
            down_grace: Duration::from_secs(60),
            stall_window: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PruningConfig {
    pub enabled: bool,
    #[serde(with = "serde_str")]
    pub interval: Duration,
    pub disk_threshold_percent: f64,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(3600),
            disk_threshold_percent: 85.0,
        }
    }
}

impl ChainwardConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ChainwardConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Absolute path of the state database.
    pub fn state_path(&self) -> PathBuf {
        self.daemon.data_root.join(&self.daemon.state_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: ChainwardConfig = toml::from_str("").unwrap();
        assert_eq!(config.nodes.max_running, 4);
        assert_eq!(config.runtime.publish_address, "127.0.0.1");
        assert_eq!(config.health.stall_window, Duration::from_secs(600));
        assert_eq!(
            config.state_path(),
            PathBuf::from("/var/lib/chainward/chainward.redb")
        );
    }

    #[test]
    fn parses_partial_sections() {
        let toml_str = r#"
[runtime]
tcp_fallback = "tcp://192.168.64.2:2375"
allowed_subnets = ["192.168.64.0/24"]

[nodes]
max_running = 2
probe_interval = "500ms"

[health]
stall_window = "5m"
"#;
        let config: ChainwardConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.nodes.max_running, 2);
        assert_eq!(config.nodes.probe_interval, Duration::from_millis(500));
        // Untouched fields keep defaults.
        assert_eq!(config.nodes.stop_timeout, Duration::from_secs(30));
        assert_eq!(config.health.stall_window, Duration::from_secs(300));
        assert_eq!(config.runtime.allowed_subnets.len(), 1);
    }

    #[test]
    fn rejects_bad_duration() {
        let err = toml::from_str::<ChainwardConfig>("[nodes]\nstart_timeout = \"soon\"\n");
        assert!(err.is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let config = ChainwardConfig::default();
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("probe_interval = \"10s\""));
        let back: ChainwardConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.pruning.interval, Duration::from_secs(3600));
    }
}
