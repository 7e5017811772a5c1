//! Disk-pressure remediation.
//!
//! When the data root's filesystem fills past the threshold, every running
//! node whose template defines a pruning routine has it executed inside
//! its container. Each run is bracketed by a node-scoped `DISK_FULL`
//! alert that is resolved only if the routine succeeds.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use chainward_alerts::{AlertInput, AlertManager};
use chainward_core::catalog::PruneRoutine;
use chainward_core::config::PruningConfig;
use chainward_core::duration::format_duration;
use chainward_node::{NodeError, NodeManager};
use chainward_placement::HostProbe;
use chainward_state::{AlertSeverity, AlertType, NodeStatus};

#[derive(Debug, Error)]
pub enum PruneError {
    #[error(transparent)]
    Node(#[from] NodeError),

    #[error("`{command}` exited with {code:?}: {output}")]
    Command {
        command: String,
        code: Option<i64>,
        output: String,
    },

    #[error("unexpected block height output: {0:?}")]
    Height(String),
}

/// Result of pruning one node.
#[derive(Debug, Clone, PartialEq)]
pub struct PruneReport {
    pub node_id: String,
    /// The bracket alert, if it could be raised.
    pub alert_id: Option<String>,
    pub error: Option<String>,
}

pub struct PruningScheduler {
    nodes: NodeManager,
    alerts: AlertManager,
    host: Arc<dyn HostProbe>,
    config: PruningConfig,
    data_root: PathBuf,
}

impl PruningScheduler {
    pub fn new(
        nodes: NodeManager,
        alerts: AlertManager,
        host: Arc<dyn HostProbe>,
        config: PruningConfig,
        data_root: PathBuf,
    ) -> Self {
        Self {
            nodes,
            alerts,
            host,
            config,
            data_root,
        }
    }

    /// Check disk usage once and prune if it is over the threshold.
    pub async fn tick(&self) -> Vec<PruneReport> {
        let used = self.host.sample(&self.data_root).disk_used_percent();
        if used < self.config.disk_threshold_percent {
            debug!(disk_used = used, threshold = self.config.disk_threshold_percent, "no disk pressure");
            return Vec::new();
        }
        info!(disk_used = used, threshold = self.config.disk_threshold_percent, "disk pressure, pruning nodes");

        let mut reports = Vec::new();
        for record in self.nodes.list().await {
            let Ok(state) = self.nodes.state(&record.id).await else {
                continue;
            };
            if !matches!(state.status, NodeStatus::Ready | NodeStatus::Syncing) {
                continue;
            }
            let Some(routine) = self
                .nodes
                .catalog()
                .template(&record.blockchain, record.mode)
                .and_then(|t| t.prune.clone())
            else {
                continue;
            };
            reports.push(self.prune_node(&record.id, &routine, used).await);
        }
        reports
    }

    /// Tick on the configured interval until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("pruning disabled");
            return;
        }
        info!(interval = %format_duration(self.config.interval), "pruning scheduler started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    debug!("pruning scheduler shutting down");
                    break;
                }
            }
        }
    }

    async fn prune_node(&self, node_id: &str, routine: &PruneRoutine, disk_used: f64) -> PruneReport {
        let input = AlertInput::new(
            AlertType::DiskFull,
            AlertSeverity::Warning,
            format!("disk at {disk_used:.1}%, pruning node {node_id}"),
        )
        .for_node(node_id)
        .with_meta("disk_used_percent", disk_used);
        let alert = match self.alerts.trigger(input).await {
            Ok(alert) => Some(alert),
            Err(e) => {
                warn!(node_id, error = %e, "cannot raise pruning alert");
                None
            }
        };

        let result = run_routine(&self.nodes, node_id, routine).await;
        match &result {
            Ok(()) => {
                info!(node_id, "node pruned");
                if let Some(alert) = &alert {
                    if let Err(e) = self.alerts.resolve(&alert.id).await {
                        warn!(node_id, alert_id = %alert.id, error = %e, "cannot resolve pruning alert");
                    }
                }
            }
            Err(e) => error!(node_id, error = %e, "pruning failed"),
        }

        PruneReport {
            node_id: node_id.to_string(),
            alert_id: alert.map(|a| a.id),
            error: result.err().map(|e| e.to_string()),
        }
    }
}

/// Execute a pruning routine inside a node's container.
pub async fn run_routine(
    nodes: &NodeManager,
    node_id: &str,
    routine: &PruneRoutine,
) -> Result<(), PruneError> {
    match routine {
        PruneRoutine::BitcoinRpc {
            cli,
            args,
            keep_blocks,
        } => {
            let cli_argv = |extra: &[String]| -> Vec<String> {
                std::iter::once(cli.clone())
                    .chain(args.iter().cloned())
                    .chain(extra.iter().cloned())
                    .collect()
            };

            let out = exec_checked(nodes, node_id, cli_argv(&["getblockcount".to_string()])).await?;
            let height: u64 = out
                .trim()
                .parse()
                .map_err(|_| PruneError::Height(out.trim().to_string()))?;
            let target = height.saturating_sub(*keep_blocks);
            if target == 0 {
                debug!(node_id, height, keep_blocks, "chain too short to prune");
                return Ok(());
            }
            exec_checked(
                nodes,
                node_id,
                cli_argv(&["pruneblockchain".to_string(), target.to_string()]),
            )
            .await?;
            Ok(())
        }
        PruneRoutine::Command { argv } => {
            exec_checked(nodes, node_id, argv.clone()).await?;
            Ok(())
        }
    }
}

async fn exec_checked(
    nodes: &NodeManager,
    node_id: &str,
    argv: Vec<String>,
) -> Result<String, PruneError> {
    let out = nodes.exec(node_id, &argv).await?;
    if !out.succeeded() {
        return Err(PruneError::Command {
            command: argv.join(" "),
            code: out.exit_code,
            output: out.output.trim().to_string(),
        });
    }
    Ok(out.output)
}
