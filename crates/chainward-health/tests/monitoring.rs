//! End-to-end node lifecycle with health monitoring and pruning.
//!
//! Nodes run on the in-memory runtime with scripted probes; the host is a
//! `FixedHost` whose figures each test adjusts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chainward_alerts::{AlertFilter, AlertManager};
use chainward_core::catalog::{StaticCatalog, TemplateCatalog};
use chainward_core::config::{HealthConfig, NodesConfig, PruningConfig};
use chainward_core::NodeMode;
use chainward_health::{HealthMonitor, PruningScheduler};
use chainward_node::{CreateRequest, ManagerDeps, ManagerSettings, NodeManager, ProbeReport, ScriptedProbe};
use chainward_placement::{FixedHost, HostResources, PortAllocator, ResourceGate, UnprobedPorts};
use chainward_runtime::{ExecOutput, InMemoryRuntime};
use chainward_state::{Alert, AlertSeverity, AlertType, NodeState, NodeStatus, StateStore};
use tempfile::TempDir;

const CATALOG: &str = r#"
[[chains]]
id = "bitcoin"
name = "Bitcoin Core"
modes = ["pruned"]
ports = { rpc = 8332, p2p = 8333 }
health_check = { kind = "utxo" }

[[chains.templates]]
mode = "pruned"
image = "bitcoin/bitcoin:27.0"
volumes = ["{{DATA_DIR}}:/home/bitcoin/.bitcoin"]
requirements = { disk_gb = 10, memory_gb = 2 }
prune = { kind = "bitcoin-rpc", keep_blocks = 288 }
"#;

struct World {
    nodes: NodeManager,
    alerts: AlertManager,
    runtime: InMemoryRuntime,
    probe: Arc<ScriptedProbe>,
    host: Arc<FixedHost>,
    monitor: HealthMonitor,
    pruning: PruningScheduler,
    _dir: TempDir,
}

fn calm_host() -> HostResources {
    HostResources {
        disk_total_gb: 1000.0,
        disk_available_gb: 500.0,
        memory_total_gb: 32.0,
        memory_available_gb: 16.0,
        cpu_percent: 10.0,
    }
}

fn world() -> World {
    let dir = tempfile::tempdir().unwrap();
    let state = StateStore::open_in_memory().unwrap();
    let catalog: Arc<dyn TemplateCatalog> = Arc::new(StaticCatalog::from_toml_str(CATALOG).unwrap());
    let host = Arc::new(FixedHost::new(calm_host()));
    let runtime = InMemoryRuntime::new();
    let probe = Arc::new(ScriptedProbe::new());

    let node_config = NodesConfig {
        probe_interval: Duration::from_millis(20),
        probe_timeout: Duration::from_millis(100),
        stop_timeout: Duration::from_millis(100),
        retry_initial_backoff: Duration::from_millis(5),
        ..NodesConfig::default()
    };
    let nodes = NodeManager::new(
        ManagerSettings {
            nodes: node_config.clone(),
            data_root: dir.path().to_path_buf(),
            publish_address: "127.0.0.1".to_string(),
        },
        ManagerDeps {
            state: state.clone(),
            runtime: Arc::new(runtime.clone()),
            catalog: catalog.clone(),
            gate: ResourceGate::new(catalog, host.clone(), dir.path().to_path_buf()),
            ports: PortAllocator::from_config(&node_config, Arc::new(UnprobedPorts)),
            probe: probe.clone(),
        },
    )
    .unwrap();
    let alerts = AlertManager::new(state, AlertSeverity::Info);

    let monitor = HealthMonitor::new(
        nodes.clone(),
        alerts.clone(),
        host.clone(),
        HealthConfig {
            interval: Duration::from_secs(1),
            cpu_limit_percent: 90.0,
            memory_limit_percent: 90.0,
            disk_limit_percent: 90.0,
            down_grace: Duration::from_secs(60),
            stall_window: Duration::from_secs(3),
        },
        dir.path().to_path_buf(),
    );
    let pruning = PruningScheduler::new(
        nodes.clone(),
        alerts.clone(),
        host.clone(),
        PruningConfig {
            enabled: true,
            interval: Duration::from_secs(60),
            disk_threshold_percent: 85.0,
        },
        dir.path().to_path_buf(),
    );

    World {
        nodes,
        alerts,
        runtime,
        probe,
        host,
        monitor,
        pruning,
        _dir: dir,
    }
}

fn btc() -> CreateRequest {
    CreateRequest {
        name: "btc".to_string(),
        blockchain: "bitcoin".to_string(),
        mode: NodeMode::Pruned,
        id: None,
        custom_config: None,
    }
}

async fn alerts_of(w: &World, alert_type: AlertType, resolved: Option<bool>) -> Vec<Alert> {
    w.alerts
        .list(&AlertFilter {
            resolved,
            alert_type: Some(alert_type),
            ..Default::default()
        })
        .await
        .unwrap()
}

async fn wait_for_state(w: &World, id: &str, done: impl Fn(&NodeState) -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if done(&w.nodes.state(id).await.unwrap()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "node {id} did not reach the expected state");
}

async fn wait_for_status(w: &World, id: &str, status: NodeStatus) {
    wait_for_state(w, id, |s| s.status == status).await;
}

#[tokio::test]
async fn system_thresholds_raise_once_and_resolve() {
    let w = world();

    w.monitor.tick().await;
    assert!(w.alerts.active().await.unwrap().is_empty());

    w.host.update(|h| h.cpu_percent = 97.0);
    w.monitor.tick().await;
    w.monitor.tick().await;

    let open = alerts_of(&w, AlertType::CpuHigh, Some(false)).await;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].severity, AlertSeverity::Warning);
    assert_eq!(open[0].node_id, None);

    w.host.update(|h| {
        h.cpu_percent = 20.0;
        h.disk_available_gb = 10.0;
    });
    w.monitor.tick().await;

    assert!(alerts_of(&w, AlertType::CpuHigh, Some(false)).await.is_empty());
    assert_eq!(alerts_of(&w, AlertType::CpuHigh, Some(true)).await.len(), 1);
    let disk = alerts_of(&w, AlertType::DiskFull, Some(false)).await;
    assert_eq!(disk.len(), 1);
    assert_eq!(disk[0].severity, AlertSeverity::Critical);
}

#[tokio::test]
async fn stopped_node_goes_down_after_grace() {
    let w = world();
    let node = w.nodes.create(btc()).await.unwrap();
    let t0 = Instant::now();

    w.monitor.tick_at(t0).await;
    w.monitor.tick_at(t0 + Duration::from_secs(30)).await;
    assert!(alerts_of(&w, AlertType::NodeDown, None).await.is_empty());

    w.monitor.tick_at(t0 + Duration::from_secs(61)).await;
    let down = alerts_of(&w, AlertType::NodeDown, Some(false)).await;
    assert_eq!(down.len(), 1);
    assert_eq!(down[0].node_id.as_deref(), Some(node.id.as_str()));
    assert_eq!(down[0].severity, AlertSeverity::Critical);

    w.nodes.start(&node.id).await.unwrap();
    w.monitor.tick_at(t0 + Duration::from_secs(62)).await;
    assert!(alerts_of(&w, AlertType::NodeDown, Some(false)).await.is_empty());
}

#[tokio::test]
async fn crashed_node_reports_its_exit_in_node_down() {
    let w = world();
    let node = w.nodes.create(btc()).await.unwrap();
    w.nodes.start(&node.id).await.unwrap();
    let container = w.nodes.get(&node.id).await.unwrap().container_id.unwrap();

    w.runtime.crash(&container, 1);
    wait_for_status(&w, &node.id, NodeStatus::Error).await;

    let t0 = Instant::now();
    w.monitor.tick_at(t0).await;
    w.monitor.tick_at(t0 + Duration::from_secs(60)).await;

    let down = alerts_of(&w, AlertType::NodeDown, Some(false)).await;
    assert_eq!(down.len(), 1);
    assert!(down[0].message.contains("container exited with code 1"));

    // Deleting the node clears what was open for it.
    w.nodes.delete(&node.id).await.unwrap();
    w.monitor.tick_at(t0 + Duration::from_secs(61)).await;
    assert!(alerts_of(&w, AlertType::NodeDown, Some(false)).await.is_empty());
}

#[tokio::test]
async fn flat_sync_progress_raises_exactly_one_sync_delayed() {
    let w = world();
    let node = w.nodes.create(btc()).await.unwrap();
    w.probe.set_fallback(Some(ProbeReport {
        height: Some(100),
        peer_best: Some(1000),
        ..Default::default()
    }));
    w.nodes.start(&node.id).await.unwrap();
    wait_for_state(&w, &node.id, |s| {
        s.status == NodeStatus::Syncing && s.sync_progress == 10.0
    })
    .await;

    // stall_window is 3s; tick once per second for window + 1 ticks.
    let t0 = Instant::now();
    for tick in 0..=4 {
        w.monitor.tick_at(t0 + Duration::from_secs(tick)).await;
    }
    let stalled = alerts_of(&w, AlertType::SyncDelayed, None).await;
    assert_eq!(stalled.len(), 1);
    assert!(!stalled[0].resolved);
    assert_eq!(stalled[0].severity, AlertSeverity::Warning);

    w.monitor.tick_at(t0 + Duration::from_secs(5)).await;
    assert_eq!(alerts_of(&w, AlertType::SyncDelayed, None).await.len(), 1);

    w.probe.set_fallback(Some(ProbeReport {
        height: Some(200),
        peer_best: Some(1000),
        ..Default::default()
    }));
    wait_for_state(&w, &node.id, |s| s.sync_progress == 20.0).await;
    w.monitor.tick_at(t0 + Duration::from_secs(6)).await;

    assert!(alerts_of(&w, AlertType::SyncDelayed, Some(false)).await.is_empty());
    assert!(w.nodes.metrics(&node.id).await.unwrap().is_some());
}

#[tokio::test]
async fn pruning_runs_chain_routine_under_disk_pressure() {
    let w = world();
    let node = w.nodes.create(btc()).await.unwrap();
    w.probe.set_fallback(Some(ProbeReport {
        height: Some(840_000),
        peer_best: Some(840_000),
        ..Default::default()
    }));
    w.nodes.start(&node.id).await.unwrap();
    wait_for_status(&w, &node.id, NodeStatus::Ready).await;

    // No pressure, nothing to do.
    assert!(w.pruning.tick().await.is_empty());

    w.host.update(|h| h.disk_available_gb = 50.0);
    w.runtime.set_exec_result(ExecOutput {
        exit_code: Some(0),
        output: "840000\n".to_string(),
    });

    let reports = w.pruning.tick().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].node_id, node.id);
    assert_eq!(reports[0].error, None);

    let argv: Vec<Vec<String>> = w.runtime.exec_calls().into_iter().map(|(_, a)| a).collect();
    assert_eq!(
        argv,
        vec![
            vec!["bitcoin-cli".to_string(), "getblockcount".to_string()],
            vec![
                "bitcoin-cli".to_string(),
                "pruneblockchain".to_string(),
                "839712".to_string()
            ],
        ]
    );

    let bracket = alerts_of(&w, AlertType::DiskFull, None).await;
    assert_eq!(bracket.len(), 1);
    assert_eq!(bracket[0].node_id.as_deref(), Some(node.id.as_str()));
    assert!(bracket[0].resolved);
}

#[tokio::test]
async fn failed_pruning_leaves_the_alert_open() {
    let w = world();
    let node = w.nodes.create(btc()).await.unwrap();
    w.probe.set_fallback(Some(ProbeReport {
        synced: Some(true),
        ..Default::default()
    }));
    w.nodes.start(&node.id).await.unwrap();
    wait_for_status(&w, &node.id, NodeStatus::Ready).await;

    w.host.update(|h| h.disk_available_gb = 20.0);
    w.runtime.set_exec_result(ExecOutput {
        exit_code: Some(1),
        output: "error code: -1\n".to_string(),
    });

    let reports = w.pruning.tick().await;
    assert_eq!(reports.len(), 1);
    assert!(reports[0].error.as_deref().unwrap().contains("getblockcount"));

    let open = alerts_of(&w, AlertType::DiskFull, Some(false)).await;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].node_id.as_deref(), Some(node.id.as_str()));
}
