//! Domain types for node supervision and alerting.
//!
//! `NodeRecord` and `Alert` are persisted. `NodeState` and `NodeMetrics`
//! live in memory only and describe the current run of a node.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use chainward_core::{BlockchainId, NodeId, NodeMode, PortSet};

// ── Node ──────────────────────────────────────────────────────────

/// Persisted description of a managed node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    pub id: NodeId,
    pub name: String,
    pub blockchain: BlockchainId,
    pub mode: NodeMode,
    /// Host directory bind-mounted into the container.
    pub data_path: PathBuf,
    pub rpc_port: u16,
    pub p2p_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_port: Option<u16>,
    /// Opaque per-node settings supplied by the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_config: Option<serde_json::Value>,
    /// Last known lifecycle status.
    pub status: NodeStatus,
    /// Runtime id of the live container, if one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl NodeRecord {
    /// Host ports allocated to this node.
    pub fn ports(&self) -> PortSet {
        PortSet::new(self.rpc_port, self.p2p_port, self.ws_port)
    }

    /// Name of the container backing this node.
    pub fn container_name(&self) -> String {
        format!("chainward-{}", self.id)
    }
}

/// Lifecycle status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Stopped,
    Starting,
    Syncing,
    Ready,
    Error,
    Stopping,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Stopped => "stopped",
            NodeStatus::Starting => "starting",
            NodeStatus::Syncing => "syncing",
            NodeStatus::Ready => "ready",
            NodeStatus::Error => "error",
            NodeStatus::Stopping => "stopping",
        }
    }

    /// Counts against the running-node ceiling.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            NodeStatus::Starting | NodeStatus::Syncing | NodeStatus::Ready
        )
    }

    /// A node may only be started or deleted from these states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Stopped | NodeStatus::Error)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage reported by a node's own log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStage {
    HeadersPresync,
    Headers,
    Blocks,
}

impl SyncStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStage::HeadersPresync => "headers-presync",
            SyncStage::Headers => "headers",
            SyncStage::Blocks => "blocks",
        }
    }
}

/// Which signal produced the sync numbers in a `NodeState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncSource {
    Log,
    Rpc,
}

/// Live state of a node during the current run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeState {
    pub id: NodeId,
    pub status: NodeStatus,
    /// 0.0–100.0
    pub sync_progress: f64,
    pub block_height: Option<u64>,
    pub peer_best_height: Option<u64>,
    pub peers: Option<u32>,
    /// Seconds since the container was started; 0 when not running.
    pub uptime_secs: u64,
    pub started_at: Option<u64>,
    pub last_error: Option<String>,
    pub sync_stage: Option<SyncStage>,
    pub sync_source: Option<SyncSource>,
}

impl NodeState {
    /// Fresh state for a node that is not running.
    pub fn stopped(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: NodeStatus::Stopped,
            sync_progress: 0.0,
            block_height: None,
            peer_best_height: None,
            peers: None,
            uptime_secs: 0,
            started_at: None,
            last_error: None,
            sync_stage: None,
            sync_source: None,
        }
    }

    /// Clear per-run sync figures, keeping identity and status.
    pub fn reset_sync(&mut self) {
        self.sync_progress = 0.0;
        self.block_height = None;
        self.peer_best_height = None;
        self.peers = None;
        self.sync_stage = None;
        self.sync_source = None;
    }
}

/// Latest resource sample for a running node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeMetrics {
    pub id: NodeId,
    pub cpu_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_limit_bytes: u64,
    pub disk_used_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    /// Unix timestamp (seconds) of the sample.
    pub timestamp: u64,
}

// ── Alert ─────────────────────────────────────────────────────────

/// Kind of operational condition an alert reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    NodeDown,
    NodeError,
    SyncDelayed,
    DiskFull,
    CpuHigh,
    MemoryCritical,
    Custom,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::NodeDown => "NODE_DOWN",
            AlertType::NodeError => "NODE_ERROR",
            AlertType::SyncDelayed => "SYNC_DELAYED",
            AlertType::DiskFull => "DISK_FULL",
            AlertType::CpuHigh => "CPU_HIGH",
            AlertType::MemoryCritical => "MEMORY_CRITICAL",
            AlertType::Custom => "CUSTOM",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert severity; ordering is `Info < Warning < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AlertSeverity::Info => "INFO",
            AlertSeverity::Warning => "WARNING",
            AlertSeverity::Critical => "CRITICAL",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown alert severity: {0}")]
pub struct UnknownSeverity(pub String);

impl FromStr for AlertSeverity {
    type Err = UnknownSeverity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Ok(AlertSeverity::Info),
            "warning" | "warn" => Ok(AlertSeverity::Warning),
            "critical" => Ok(AlertSeverity::Critical),
            other => Err(UnknownSeverity(other.to_string())),
        }
    }
}

/// A raised operational alert. Kept forever; resolution is a flag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub id: String,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub message: String,
    /// Unix timestamp (seconds) when the alert was raised.
    pub timestamp: u64,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Alert {
    /// Whether this alert is keyed by the given (type, node) pair.
    pub fn matches(&self, alert_type: AlertType, node_id: Option<&str>) -> bool {
        self.alert_type == alert_type && self.node_id.as_deref() == node_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering() {
        assert!(AlertSeverity::Info < AlertSeverity::Warning);
        assert!(AlertSeverity::Warning < AlertSeverity::Critical);
        assert_eq!("WARN".parse::<AlertSeverity>(), Ok(AlertSeverity::Warning));
    }

    #[test]
    fn alert_serializes_with_type_key() {
        let alert = Alert {
            id: "alert-1".to_string(),
            alert_type: AlertType::SyncDelayed,
            severity: AlertSeverity::Warning,
            node_id: Some("btc-1".to_string()),
            message: "stalled".to_string(),
            timestamp: 1000,
            resolved: false,
            resolved_at: None,
            metadata: BTreeMap::new(),
        };
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["type"], "SYNC_DELAYED");
        assert_eq!(json["severity"], "WARNING");
        assert!(json.get("metadata").is_none());
    }

    #[test]
    fn status_classes() {
        assert!(NodeStatus::Syncing.is_active());
        assert!(!NodeStatus::Stopping.is_active());
        assert!(NodeStatus::Error.is_terminal());
        assert!(!NodeStatus::Ready.is_terminal());
    }

    #[test]
    fn sync_stage_names() {
        assert_eq!(SyncStage::HeadersPresync.as_str(), "headers-presync");
        let json = serde_json::to_string(&SyncStage::HeadersPresync).unwrap();
        assert_eq!(json, "\"headers-presync\"");
    }

    #[test]
    fn alert_matching_key() {
        let alert = Alert {
            id: "a".to_string(),
            alert_type: AlertType::CpuHigh,
            severity: AlertSeverity::Warning,
            node_id: None,
            message: String::new(),
            timestamp: 0,
            resolved: false,
            resolved_at: None,
            metadata: BTreeMap::new(),
        };
        assert!(alert.matches(AlertType::CpuHigh, None));
        assert!(!alert.matches(AlertType::CpuHigh, Some("n1")));
        assert!(!alert.matches(AlertType::DiskFull, None));
    }
}
