//! Run mode: wires the subsystems together and drives the background
//! loops until Ctrl-C.
//!
//! Boot order:
//! 1. Opens the state store and the template catalog
//! 2. Connects to the container runtime (first endpoint that answers a ping)
//! 3. Builds the node manager and recovers persisted nodes
//! 4. Starts the health monitor, pruning scheduler and node-error forwarder
//! 5. Resumes nodes that were running when the daemon last stopped

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use chainward_alerts::{AlertInput, AlertManager, log_handler};
use chainward_core::{ChainwardConfig, StaticCatalog, TemplateCatalog};
use chainward_health::{HealthMonitor, PruningScheduler};
use chainward_node::{ManagerDeps, ManagerSettings, NodeEvent, NodeManager, RpcProbe};
use chainward_placement::{HostProbe, OsPortProbe, PortAllocator, ResourceGate, SysinfoProbe};
use chainward_runtime::{ConnectionResolver, DockerRuntime};
use chainward_state::{AlertSeverity, AlertType, NodeStatus, StateStore};

pub async fn run(config: ChainwardConfig) -> anyhow::Result<()> {
    info!("chainward daemon starting");

    let data_root = config.daemon.data_root.clone();
    std::fs::create_dir_all(&data_root)
        .with_context(|| format!("create data root {}", data_root.display()))?;

    // ── Storage and catalog ────────────────────────────────────

    let state_path = config.state_path();
    let state = StateStore::open(&state_path)
        .with_context(|| format!("open state store {}", state_path.display()))?;
    info!(path = %state_path.display(), "state store opened");

    let catalog: Arc<dyn TemplateCatalog> = Arc::new(
        StaticCatalog::from_file(&config.daemon.catalog)
            .with_context(|| format!("load catalog {}", config.daemon.catalog.display()))?,
    );
    info!(path = %config.daemon.catalog.display(), chains = catalog.chains().len(), "template catalog loaded");

    // ── Container runtime ──────────────────────────────────────

    let resolver = ConnectionResolver::from_config(&config.runtime)?;
    let runtime = DockerRuntime::connect(&resolver, config.runtime.request_timeout)
        .await
        .context("no container runtime reachable")?;
    info!(endpoint = %runtime.endpoint(), "container runtime ready");

    // ── Placement ──────────────────────────────────────────────

    let host: Arc<dyn HostProbe> = Arc::new(SysinfoProbe::new());
    let gate = ResourceGate::new(catalog.clone(), host.clone(), data_root.clone());
    let ports = PortAllocator::from_config(&config.nodes, Arc::new(OsPortProbe));

    // ── Nodes and alerts ───────────────────────────────────────

    let nodes = NodeManager::new(
        ManagerSettings::from_config(&config),
        ManagerDeps {
            state: state.clone(),
            runtime: Arc::new(runtime),
            catalog,
            gate,
            ports,
            probe: Arc::new(RpcProbe),
        },
    )?;

    let alerts = AlertManager::from_config(state, &config.alerts)?;
    alerts.register_handler("log", log_handler()).await;
    info!(min_severity = %alerts.min_severity(), "alert manager initialized");

    let resume = nodes.recover().await?;
    info!(nodes = nodes.list().await.len(), resumable = resume.len(), "nodes recovered");

    // ── Background tasks ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor = Arc::new(HealthMonitor::new(
        nodes.clone(),
        alerts.clone(),
        host.clone(),
        config.health.clone(),
        data_root.clone(),
    ));
    let monitor_handle = tokio::spawn(monitor.run(shutdown_rx.clone()));

    let pruning = Arc::new(PruningScheduler::new(
        nodes.clone(),
        alerts.clone(),
        host,
        config.pruning.clone(),
        data_root,
    ));
    let pruning_handle = tokio::spawn(pruning.run(shutdown_rx.clone()));

    let forward_handle = tokio::spawn(forward_node_errors(
        nodes.subscribe(),
        alerts.clone(),
        shutdown_rx,
    ));

    if config.nodes.resume_on_boot {
        for id in resume {
            let nodes = nodes.clone();
            tokio::spawn(async move {
                info!(node_id = %id, "resuming node");
                if let Err(e) = nodes.start(&id).await {
                    error!(node_id = %id, error = %e, "cannot resume node");
                }
            });
        }
    }

    info!("chainward daemon running");

    // ── Shutdown ───────────────────────────────────────────────

    tokio::signal::ctrl_c()
        .await
        .context("install Ctrl-C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    nodes.shutdown().await;
    let _ = monitor_handle.await;
    let _ = pruning_handle.await;
    let _ = forward_handle.await;

    info!("chainward daemon stopped");
    Ok(())
}

/// Raise `NODE_ERROR` when a node fails and resolve it once the node leaves
/// the error state or is deleted.
async fn forward_node_errors(
    mut events: broadcast::Receiver<NodeEvent>,
    alerts: AlertManager,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = shutdown.changed() => break,
        };

        let result = match event {
            Ok(NodeEvent::StatusChanged { id, to: NodeStatus::Error, error, .. }) => {
                let message = match error {
                    Some(e) => format!("node {id} failed: {e}"),
                    None => format!("node {id} failed"),
                };
                alerts
                    .trigger(AlertInput::new(AlertType::NodeError, AlertSeverity::Critical, message).for_node(id))
                    .await
                    .map(|_| ())
            }
            Ok(NodeEvent::StatusChanged { id, from: NodeStatus::Error, .. })
            | Ok(NodeEvent::Deleted { id }) => alerts
                .resolve_by_type(AlertType::NodeError, Some(&id))
                .await
                .map(|_| ()),
            Ok(_) => Ok(()),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "node event consumer lagged");
                Ok(())
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        if let Err(e) = result {
            warn!(error = %e, "cannot update node error alert");
        }
    }
    debug!("node error forwarder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainward_node::EventBus;

    async fn open_node_errors(alerts: &AlertManager) -> Vec<chainward_state::Alert> {
        alerts
            .active()
            .await
            .unwrap()
            .into_iter()
            .filter(|a| a.alert_type == AlertType::NodeError)
            .collect()
    }

    async fn settle() {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn node_errors_raise_and_resolve() {
        let bus = EventBus::new();
        let alerts = AlertManager::new(StateStore::open_in_memory().unwrap(), AlertSeverity::Info);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(forward_node_errors(bus.subscribe(), alerts.clone(), shutdown_rx));

        bus.emit(NodeEvent::StatusChanged {
            id: "btc".to_string(),
            from: NodeStatus::Ready,
            to: NodeStatus::Error,
            error: Some("container exited with code 137".to_string()),
        });
        settle().await;

        let open = open_node_errors(&alerts).await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].node_id.as_deref(), Some("btc"));
        assert_eq!(open[0].severity, AlertSeverity::Critical);
        assert!(open[0].message.contains("code 137"));

        bus.emit(NodeEvent::StatusChanged {
            id: "btc".to_string(),
            from: NodeStatus::Error,
            to: NodeStatus::Starting,
            error: None,
        });
        settle().await;
        assert!(open_node_errors(&alerts).await.is_empty());

        let _ = shutdown_tx.send(true);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn deleting_a_failed_node_resolves_its_alert() {
        let bus = EventBus::new();
        let alerts = AlertManager::new(StateStore::open_in_memory().unwrap(), AlertSeverity::Info);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(forward_node_errors(bus.subscribe(), alerts.clone(), shutdown_rx));

        bus.emit(NodeEvent::StatusChanged {
            id: "eth".to_string(),
            from: NodeStatus::Starting,
            to: NodeStatus::Error,
            error: None,
        });
        settle().await;
        assert_eq!(open_node_errors(&alerts).await.len(), 1);

        bus.emit(NodeEvent::Deleted { id: "eth".to_string() });
        settle().await;
        assert!(open_node_errors(&alerts).await.is_empty());
    }
}
