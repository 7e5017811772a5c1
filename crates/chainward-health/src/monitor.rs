//! Health monitor: periodic system and per-node checks.
//!
//! Every tick the monitor:
//! - Samples host CPU, memory and disk against the configured limits
//! - Checks each node for sustained downtime and stalled sync progress
//! - Refreshes metrics for active nodes
//!
//! Alerts are raised and resolved only when a condition flips; the alert
//! manager's dedup makes repeated raises harmless anyway.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use chainward_alerts::{AlertInput, AlertManager};
use chainward_core::config::HealthConfig;
use chainward_core::duration::format_duration;
use chainward_node::NodeManager;
use chainward_placement::HostProbe;
use chainward_state::{AlertSeverity, AlertType, NodeState};

use crate::checker::{Edge, NodeWatch, Signal, system_readings};

/// A node-level alert change decided under the watch lock and applied
/// after it is released.
struct NodeAction {
    node_id: String,
    alert_type: AlertType,
    signal: Signal,
    message: String,
}

pub struct HealthMonitor {
    nodes: NodeManager,
    alerts: AlertManager,
    host: Arc<dyn HostProbe>,
    config: HealthConfig,
    /// Disk figures are taken for the filesystem holding this path.
    data_root: PathBuf,
    system: Mutex<HashMap<AlertType, Edge>>,
    /// node_id → watch.
    watches: Mutex<HashMap<String, NodeWatch>>,
}

impl HealthMonitor {
    pub fn new(
        nodes: NodeManager,
        alerts: AlertManager,
        host: Arc<dyn HostProbe>,
        config: HealthConfig,
        data_root: PathBuf,
    ) -> Self {
        Self {
            nodes,
            alerts,
            host,
            config,
            data_root,
            system: Mutex::new(HashMap::new()),
            watches: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Run one round of checks.
    pub async fn tick(&self) {
        self.tick_at(Instant::now()).await;
    }

    /// Run one round of checks as if the current time were `now`.
    pub async fn tick_at(&self, now: Instant) {
        self.check_system().await;
        self.check_nodes(now).await;
    }

    /// Tick on the configured interval until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval = %format_duration(self.config.interval), "health monitor started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => self.tick().await,
                _ = shutdown.changed() => {
                    debug!("health monitor shutting down");
                    break;
                }
            }
        }
    }

    async fn check_system(&self) {
        let host = self.host.sample(&self.data_root);
        let changes: Vec<_> = {
            let mut edges = self.system.lock().await;
            system_readings(&host, &self.config)
                .into_iter()
                .filter_map(|reading| {
                    let signal = edges
                        .entry(reading.alert_type)
                        .or_default()
                        .update(reading.over_limit())?;
                    Some((reading, signal))
                })
                .collect()
        };

        for (reading, signal) in changes {
            let result = match signal {
                Signal::Raise => self
                    .alerts
                    .trigger(
                        AlertInput::new(reading.alert_type, reading.severity, reading.message())
                            .with_meta("value", reading.value)
                            .with_meta("limit", reading.limit),
                    )
                    .await
                    .map(|_| ()),
                Signal::Clear => self
                    .alerts
                    .resolve_by_type(reading.alert_type, None)
                    .await
                    .map(|_| ()),
            };
            if let Err(e) = result {
                warn!(kind = %reading.alert_type, error = %e, "system check failed");
                // Try again next tick.
                if let Some(edge) = self.system.lock().await.get_mut(&reading.alert_type) {
                    edge.reset();
                }
            }
        }
    }

    async fn check_nodes(&self, now: Instant) {
        let states = self.nodes.states().await;
        let mut actions = Vec::new();
        let mut gone = Vec::new();

        {
            let mut watches = self.watches.lock().await;
            watches.retain(|id, _| {
                let keep = states.iter().any(|s| &s.id == id);
                if !keep {
                    gone.push(id.clone());
                }
                keep
            });

            for state in &states {
                let watch = watches
                    .entry(state.id.clone())
                    .or_insert_with(|| NodeWatch::new(now));

                let down = watch.is_down(state.status, now, self.config.down_grace);
                if let Some(signal) = watch.down.update(down) {
                    actions.push(NodeAction {
                        node_id: state.id.clone(),
                        alert_type: AlertType::NodeDown,
                        signal,
                        message: down_message(state),
                    });
                }

                let stalled =
                    watch.is_stalled(state.status, state.sync_progress, now, self.config.stall_window);
                if let Some(signal) = watch.stall.update(stalled) {
                    actions.push(NodeAction {
                        node_id: state.id.clone(),
                        alert_type: AlertType::SyncDelayed,
                        signal,
                        message: format!(
                            "node {} sync stalled at {:.2}% for over {}",
                            state.id,
                            state.sync_progress,
                            format_duration(self.config.stall_window)
                        ),
                    });
                }
            }
        }

        for id in gone {
            debug!(node_id = %id, "node removed, dropping health watch");
            for alert_type in [AlertType::NodeDown, AlertType::SyncDelayed] {
                if let Err(e) = self.alerts.resolve_by_type(alert_type, Some(&id)).await {
                    warn!(node_id = %id, kind = %alert_type, error = %e, "cannot resolve alert for removed node");
                }
            }
        }

        for action in actions {
            self.apply(action).await;
        }

        for state in states.iter().filter(|s| s.status.is_active()) {
            if let Err(e) = self.nodes.refresh_metrics(&state.id).await {
                debug!(node_id = %state.id, error = %e, "metrics refresh failed");
            }
        }
    }

    async fn apply(&self, action: NodeAction) {
        let result = match action.signal {
            Signal::Raise => {
                let severity = match action.alert_type {
                    AlertType::NodeDown => AlertSeverity::Critical,
                    _ => AlertSeverity::Warning,
                };
                self.alerts
                    .trigger(
                        AlertInput::new(action.alert_type, severity, action.message)
                            .for_node(action.node_id.clone()),
                    )
                    .await
                    .map(|_| ())
            }
            Signal::Clear => self
                .alerts
                .resolve_by_type(action.alert_type, Some(&action.node_id))
                .await
                .map(|_| ()),
        };

        if let Err(e) = result {
            warn!(node_id = %action.node_id, kind = %action.alert_type, error = %e, "node check failed");
            let mut watches = self.watches.lock().await;
            if let Some(watch) = watches.get_mut(&action.node_id) {
                match action.alert_type {
                    AlertType::NodeDown => watch.down.reset(),
                    _ => watch.stall.reset(),
                }
            }
        }
    }
}

fn down_message(state: &NodeState) -> String {
    match &state.last_error {
        Some(err) => format!("node {} is {}: {err}", state.id, state.status),
        None => format!("node {} is {}", state.id, state.status),
    }
}
