//! Node manager: the lifecycle state machine.
//!
//! The `NodeManager`:
//! - Creates nodes (gate check, port allocation, data directory, record)
//! - Starts and stops their containers with retry and timeouts
//! - Supervises each run through log parsing and RPC probes
//! - Persists every status change and publishes it on the event bus
//!
//! Operations on one node are serialized by a per-node lock. `stop` is the
//! exception: it may interrupt an in-flight `start`.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use chainward_core::catalog::{ChainSpec, Template, TemplateCatalog};
use chainward_core::clock::epoch_secs;
use chainward_core::config::{ChainwardConfig, NodesConfig};
use chainward_core::id::generate_id;
use chainward_core::NodeMode;
use chainward_placement::{GateFailure, GateVerdict, PortAllocator, ResourceGate};
use chainward_runtime::{
    ContainerHandle, ContainerRuntime, ContainerSpec, ExecOutput, PortMapping, RuntimeError,
};
use chainward_state::{NodeMetrics, NodeRecord, NodeState, NodeStatus, StateStore};

use crate::error::{NodeError, NodeResult};
use crate::events::{EventBus, NodeEvent};
use crate::logparse::LogParser;
use crate::mounts::resolve_binds;
use crate::naming::{sanitize_name, validate_id};
use crate::probe::{ProbeReport, ProbeTarget, SyncProbe};
use crate::retry::Backoff;
use crate::supervise::{self, RunContext, Supervisor};
use crate::sync::SyncTracker;

/// Lines of container output kept per node.
const LOG_RING: usize = 500;

/// Request to register a new node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRequest {
    pub name: String,
    pub blockchain: String,
    pub mode: NodeMode,
    /// Caller-chosen id; generated from the blockchain id when absent.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub custom_config: Option<serde_json::Value>,
}

/// Static settings for a [`NodeManager`].
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub nodes: NodesConfig,
    pub data_root: PathBuf,
    /// Host address container ports are published on.
    pub publish_address: String,
}

impl ManagerSettings {
    pub fn from_config(config: &ChainwardConfig) -> Self {
        Self {
            nodes: config.nodes.clone(),
            data_root: config.daemon.data_root.clone(),
            publish_address: config.runtime.publish_address.clone(),
        }
    }
}

/// Collaborators a [`NodeManager`] is built from.
pub struct ManagerDeps {
    pub state: StateStore,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub catalog: Arc<dyn TemplateCatalog>,
    pub gate: ResourceGate,
    pub ports: PortAllocator,
    pub probe: Arc<dyn SyncProbe>,
}

/// Per-node state held in memory.
struct NodeSlot {
    /// Mirrors the persisted record.
    record: NodeRecord,
    state: NodeState,
    metrics: Option<NodeMetrics>,
    logs: VecDeque<String>,
    tracker: SyncTracker,
    /// Held for the duration of start, stop and delete.
    op_lock: Arc<Mutex<()>>,
    /// Set while a start is in flight; `true` asks it to give up.
    start_cancel: Option<watch::Sender<bool>>,
    supervisor: Option<Supervisor>,
    /// Incremented on every start. Supervisor reports carry it.
    run: u64,
}

impl NodeSlot {
    fn new(record: NodeRecord, tolerance: u64) -> Self {
        let mut state = NodeState::stopped(&record.id);
        state.status = record.status;
        Self {
            record,
            state,
            metrics: None,
            logs: VecDeque::with_capacity(LOG_RING),
            tracker: SyncTracker::new(tolerance),
            op_lock: Arc::new(Mutex::new(())),
            start_cancel: None,
            supervisor: None,
            run: 0,
        }
    }

    /// Whether a supervisor report for `run` still applies.
    fn current(&self, run: u64) -> bool {
        self.run == run && self.state.status.is_active()
    }
}

struct Inner {
    settings: ManagerSettings,
    probe_host: IpAddr,
    backoff: Backoff,
    state: StateStore,
    runtime: Arc<dyn ContainerRuntime>,
    catalog: Arc<dyn TemplateCatalog>,
    gate: ResourceGate,
    ports: PortAllocator,
    probe: Arc<dyn SyncProbe>,
    parser: LogParser,
    nodes: RwLock<HashMap<String, NodeSlot>>,
    /// Serializes id selection and port allocation.
    create_lock: Mutex<()>,
    events: EventBus,
}

enum StartOutcome {
    Started(ContainerHandle),
    Failed(RuntimeError),
    TimedOut,
    Aborted,
}

/// Owns every managed node. Cheap to clone.
#[derive(Clone)]
pub struct NodeManager {
    inner: Arc<Inner>,
}

impl NodeManager {
    pub fn new(settings: ManagerSettings, deps: ManagerDeps) -> NodeResult<Self> {
        let probe_host = probe_host(&settings.publish_address)?;
        let parser =
            LogParser::new().map_err(|e| NodeError::Validation(format!("log patterns: {e}")))?;
        let backoff = Backoff::from_config(&settings.nodes);
        Ok(Self {
            inner: Arc::new(Inner {
                settings,
                probe_host,
                backoff,
                state: deps.state,
                runtime: deps.runtime,
                catalog: deps.catalog,
                gate: deps.gate,
                ports: deps.ports,
                probe: deps.probe,
                parser,
                nodes: RwLock::new(HashMap::new()),
                create_lock: Mutex::new(()),
                events: EventBus::new(),
            }),
        })
    }

    pub fn catalog(&self) -> &Arc<dyn TemplateCatalog> {
        &self.inner.catalog
    }

    pub fn gate(&self) -> &ResourceGate {
        &self.inner.gate
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.inner.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.inner.runtime
    }

    pub(crate) fn probe(&self) -> &Arc<dyn SyncProbe> {
        &self.inner.probe
    }

    // ── Boot ──────────────────────────────────────────────────────

    /// Load persisted records and reconcile them with reality.
    ///
    /// Nodes left active by a previous daemon are reset to `stopped` and
    /// their containers removed; their ids are returned so the caller can
    /// start them again.
    pub async fn recover(&self) -> NodeResult<Vec<String>> {
        let records = self.inner.state.list_nodes()?;
        let mut resume = Vec::new();
        let tolerance = self.inner.settings.nodes.sync_tolerance_blocks;

        for mut record in records {
            let was = record.status;
            if was.is_active() {
                resume.push(record.id.clone());
            }
            if was != NodeStatus::Stopped || record.container_id.is_some() {
                let target = record
                    .container_id
                    .take()
                    .unwrap_or_else(|| record.container_name());
                match self.inner.runtime.remove(&target).await {
                    Ok(()) => debug!(node_id = %record.id, container = %target, "removed stale container"),
                    Err(RuntimeError::NotFound(_)) => {}
                    Err(e) => warn!(node_id = %record.id, error = %e, "cannot remove stale container"),
                }
                if was != NodeStatus::Error {
                    record.status = NodeStatus::Stopped;
                }
                record.updated_at = epoch_secs();
                self.inner.state.put_node(&record)?;
            }

            info!(node_id = %record.id, previous = %was, status = %record.status, "node recovered");
            let mut nodes = self.inner.nodes.write().await;
            nodes.insert(record.id.clone(), NodeSlot::new(record, tolerance));
        }

        Ok(resume)
    }

    // ── Create ────────────────────────────────────────────────────

    pub async fn create(&self, req: CreateRequest) -> NodeResult<NodeRecord> {
        let name = sanitize_name(&req.name)?;
        let chain = self
            .inner
            .catalog
            .chain(&req.blockchain)
            .ok_or_else(|| NodeError::Validation(format!("unknown blockchain '{}'", req.blockchain)))?;
        let chain_id = chain.id.clone();
        let default_ports = chain.ports;

        let verdict = self.inner.gate.can_run(&chain_id, req.mode);
        if !verdict.can_run {
            return Err(gate_error(verdict));
        }
        if let Some(warning) = &verdict.warning {
            warn!(blockchain = %chain_id, mode = %req.mode, "{warning}");
        }
        if let Some(id) = &req.id {
            validate_id(id)?;
        }

        let _create = self.inner.create_lock.lock().await;

        let (id, in_use) = {
            let nodes = self.inner.nodes.read().await;
            let id = match req.id {
                Some(id) => {
                    if nodes.contains_key(&id) || self.inner.state.get_node(&id)?.is_some() {
                        return Err(NodeError::Validation(format!("node id '{id}' already exists")));
                    }
                    id
                }
                None => loop {
                    let candidate = generate_id(&chain_id);
                    if !nodes.contains_key(&candidate) {
                        break candidate;
                    }
                },
            };
            let in_use: HashSet<u16> = nodes
                .values()
                .flat_map(|slot| slot.record.ports().ports().collect::<Vec<_>>())
                .collect();
            (id, in_use)
        };

        let ports = self.inner.ports.allocate(&chain_id, &default_ports, &in_use)?;

        let data_path = self.inner.settings.data_root.join(&id);
        tokio::fs::create_dir_all(&data_path).await?;

        let now = epoch_secs();
        let record = NodeRecord {
            id: id.clone(),
            name,
            blockchain: chain_id,
            mode: req.mode,
            data_path: data_path.clone(),
            rpc_port: ports.rpc,
            p2p_port: ports.p2p,
            ws_port: ports.ws,
            custom_config: req.custom_config,
            status: NodeStatus::Stopped,
            container_id: None,
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.inner.state.put_node(&record) {
            let _ = tokio::fs::remove_dir_all(&data_path).await;
            return Err(e.into());
        }

        {
            let mut nodes = self.inner.nodes.write().await;
            nodes.insert(
                id.clone(),
                NodeSlot::new(record.clone(), self.inner.settings.nodes.sync_tolerance_blocks),
            );
            self.inner.events.emit(NodeEvent::Created { id: id.clone() });
        }

        info!(
            node_id = %id,
            blockchain = %record.blockchain,
            mode = %record.mode,
            rpc_port = record.rpc_port,
            p2p_port = record.p2p_port,
            "node created"
        );
        Ok(record)
    }

    // ── Start ─────────────────────────────────────────────────────

    pub async fn start(&self, id: &str) -> NodeResult<()> {
        let (op_lock, record) = {
            let nodes = self.inner.nodes.read().await;
            let slot = nodes
                .get(id)
                .ok_or_else(|| NodeError::NotFound(id.to_string()))?;
            (slot.op_lock.clone(), slot.record.clone())
        };
        let _op = op_lock
            .try_lock_owned()
            .map_err(|_| NodeError::OperationInProgress(id.to_string()))?;

        let (chain, template) = self.inner.resolve_template(&record)?;
        let verdict = self.inner.gate.can_run(&record.blockchain, record.mode);
        if !verdict.can_run {
            return Err(gate_error(verdict));
        }
        let spec = self.inner.container_spec(&record, &chain, &template)?;
        let target = self.inner.probe_target(&record)?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let run = {
            let mut nodes = self.inner.nodes.write().await;
            let running = nodes.values().filter(|s| s.state.status.is_active()).count();
            let slot = nodes
                .get_mut(id)
                .ok_or_else(|| NodeError::NotFound(id.to_string()))?;
            if !slot.state.status.is_terminal() {
                return Err(NodeError::InvalidState {
                    id: id.to_string(),
                    status: slot.state.status,
                    op: "start",
                });
            }
            let max = self.inner.settings.nodes.max_running;
            if running >= max {
                return Err(NodeError::CapacityExceeded { running, max });
            }
            slot.run += 1;
            slot.start_cancel = Some(cancel_tx);
            slot.state.reset_sync();
            slot.state.started_at = None;
            slot.tracker = SyncTracker::new(self.inner.settings.nodes.sync_tolerance_blocks);
            slot.logs.clear();
            slot.metrics = None;
            self.inner.transition(slot, NodeStatus::Starting, None);
            slot.run
        };

        let start_timeout = self.inner.settings.nodes.start_timeout;
        let outcome = tokio::select! {
            biased;
            _ = cancelled(cancel_rx) => StartOutcome::Aborted,
            res = tokio::time::timeout(start_timeout, self.inner.run_with_retry(id, &spec)) => match res {
                Ok(Ok(handle)) => StartOutcome::Started(handle),
                Ok(Err(e)) => StartOutcome::Failed(e),
                Err(_) => StartOutcome::TimedOut,
            },
        };

        match outcome {
            StartOutcome::Started(handle) => {
                let mut nodes = self.inner.nodes.write().await;
                let slot = nodes
                    .get_mut(id)
                    .ok_or_else(|| NodeError::NotFound(id.to_string()))?;
                slot.start_cancel = None;
                slot.record.container_id = Some(handle.id.clone());
                slot.state.started_at = Some(epoch_secs());
                self.inner.persist(&mut slot.record);
                slot.supervisor = Some(supervise::spawn(
                    self.clone(),
                    RunContext {
                        id: id.to_string(),
                        container_id: handle.id.clone(),
                        run,
                        target,
                        interval: self.inner.settings.nodes.probe_interval,
                        probe_timeout: self.inner.settings.nodes.probe_timeout,
                    },
                ));
                info!(node_id = %id, container = %handle.id, image = %spec.image, "node container started");
                Ok(())
            }
            StartOutcome::Failed(e) => {
                error!(node_id = %id, error = %e, "node start failed");
                self.inner
                    .fail_start(id, format!("start failed: {e}"))
                    .await;
                Err(e.into())
            }
            StartOutcome::TimedOut => {
                error!(node_id = %id, timeout = ?start_timeout, "node start timed out");
                self.inner.discard_container(&spec.name).await;
                self.inner
                    .fail_start(id, format!("start timed out after {start_timeout:?}"))
                    .await;
                Err(NodeError::StartTimeout {
                    id: id.to_string(),
                    after: start_timeout,
                })
            }
            StartOutcome::Aborted => {
                info!(node_id = %id, "node start aborted");
                self.inner.discard_container(&spec.name).await;
                let mut nodes = self.inner.nodes.write().await;
                if let Some(slot) = nodes.get_mut(id) {
                    slot.start_cancel = None;
                }
                Err(NodeError::StartAborted(id.to_string()))
            }
        }
    }

    // ── Stop ──────────────────────────────────────────────────────

    /// Stop a node's container and return it to `stopped`.
    ///
    /// Interrupts an in-flight start. A container that ignores the graceful
    /// stop is killed once the stop timeout elapses.
    pub async fn stop(&self, id: &str) -> NodeResult<()> {
        let op_lock = {
            let nodes = self.inner.nodes.read().await;
            let slot = nodes
                .get(id)
                .ok_or_else(|| NodeError::NotFound(id.to_string()))?;
            match slot.state.status {
                NodeStatus::Stopped => {
                    return Err(NodeError::InvalidState {
                        id: id.to_string(),
                        status: NodeStatus::Stopped,
                        op: "stop",
                    });
                }
                NodeStatus::Stopping => return Err(NodeError::OperationInProgress(id.to_string())),
                _ => {}
            }
            if let Some(cancel) = &slot.start_cancel {
                let _ = cancel.send(true);
            }
            slot.op_lock.clone()
        };
        let _op = op_lock.lock_owned().await;

        let (container_id, container_name, supervisor) = {
            let mut nodes = self.inner.nodes.write().await;
            let slot = nodes
                .get_mut(id)
                .ok_or_else(|| NodeError::NotFound(id.to_string()))?;
            if slot.state.status == NodeStatus::Stopped {
                // A concurrent stop got here first.
                return Ok(());
            }
            slot.start_cancel = None;
            self.inner.transition(slot, NodeStatus::Stopping, None);
            (
                slot.record.container_id.clone(),
                slot.record.container_name(),
                slot.supervisor.take(),
            )
        };
        if let Some(supervisor) = supervisor {
            supervisor.stop();
        }

        let target = container_id.unwrap_or(container_name);
        let halted = self.inner.halt_container(id, &target).await;

        let mut nodes = self.inner.nodes.write().await;
        let slot = nodes
            .get_mut(id)
            .ok_or_else(|| NodeError::NotFound(id.to_string()))?;
        slot.state.started_at = None;
        slot.metrics = None;
        match halted {
            Ok(()) => {
                slot.record.container_id = None;
                slot.state.reset_sync();
                self.inner.transition(slot, NodeStatus::Stopped, None);
                info!(node_id = %id, "node stopped");
                Ok(())
            }
            Err(e) => {
                error!(node_id = %id, error = %e, "node stop failed");
                self.inner
                    .transition(slot, NodeStatus::Error, Some(format!("stop failed: {e}")));
                Err(e.into())
            }
        }
    }

    // ── Delete ────────────────────────────────────────────────────

    /// Remove a stopped node: container, data directory and record.
    pub async fn delete(&self, id: &str) -> NodeResult<()> {
        let op_lock = {
            let nodes = self.inner.nodes.read().await;
            nodes
                .get(id)
                .ok_or_else(|| NodeError::NotFound(id.to_string()))?
                .op_lock
                .clone()
        };
        let _op = op_lock
            .try_lock_owned()
            .map_err(|_| NodeError::OperationInProgress(id.to_string()))?;

        let record = {
            let nodes = self.inner.nodes.read().await;
            let slot = nodes
                .get(id)
                .ok_or_else(|| NodeError::NotFound(id.to_string()))?;
            if !slot.state.status.is_terminal() {
                return Err(NodeError::InvalidState {
                    id: id.to_string(),
                    status: slot.state.status,
                    op: "delete",
                });
            }
            slot.record.clone()
        };

        if let Some(container_id) = &record.container_id {
            match self.inner.runtime.remove(container_id).await {
                Ok(()) | Err(RuntimeError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if record.data_path.starts_with(&self.inner.settings.data_root) {
            match tokio::fs::remove_dir_all(&record.data_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        } else {
            warn!(node_id = %id, path = %record.data_path.display(), "data path outside data root, left in place");
        }

        self.inner.state.delete_node(id)?;
        {
            let mut nodes = self.inner.nodes.write().await;
            nodes.remove(id);
            self.inner.events.emit(NodeEvent::Deleted { id: id.to_string() });
        }
        info!(node_id = %id, "node deleted");
        Ok(())
    }

    // ── Queries ───────────────────────────────────────────────────

    pub async fn get(&self, id: &str) -> NodeResult<NodeRecord> {
        let nodes = self.inner.nodes.read().await;
        nodes
            .get(id)
            .map(|slot| slot.record.clone())
            .ok_or_else(|| NodeError::NotFound(id.to_string()))
    }

    /// All node records, oldest first.
    pub async fn list(&self) -> Vec<NodeRecord> {
        let nodes = self.inner.nodes.read().await;
        let mut records: Vec<NodeRecord> = nodes.values().map(|s| s.record.clone()).collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        records
    }

    pub async fn state(&self, id: &str) -> NodeResult<NodeState> {
        let nodes = self.inner.nodes.read().await;
        nodes
            .get(id)
            .map(|slot| snapshot(&slot.state))
            .ok_or_else(|| NodeError::NotFound(id.to_string()))
    }

    pub async fn states(&self) -> Vec<NodeState> {
        let nodes = self.inner.nodes.read().await;
        let mut states: Vec<NodeState> = nodes.values().map(|s| snapshot(&s.state)).collect();
        states.sort_by(|a, b| a.id.cmp(&b.id));
        states
    }

    /// Number of nodes counting against `max_running`.
    pub async fn running_count(&self) -> usize {
        let nodes = self.inner.nodes.read().await;
        nodes.values().filter(|s| s.state.status.is_active()).count()
    }

    /// Last sampled metrics, if any.
    pub async fn metrics(&self, id: &str) -> NodeResult<Option<NodeMetrics>> {
        let nodes = self.inner.nodes.read().await;
        nodes
            .get(id)
            .map(|slot| slot.metrics.clone())
            .ok_or_else(|| NodeError::NotFound(id.to_string()))
    }

    /// Sample container stats and data directory size for a node.
    pub async fn refresh_metrics(&self, id: &str) -> NodeResult<NodeMetrics> {
        let (container_id, status, data_path) = {
            let nodes = self.inner.nodes.read().await;
            let slot = nodes
                .get(id)
                .ok_or_else(|| NodeError::NotFound(id.to_string()))?;
            (
                slot.record.container_id.clone(),
                slot.state.status,
                slot.record.data_path.clone(),
            )
        };

        let stats = match container_id {
            Some(cid) if status.is_active() => self.inner.runtime.stats(&cid).await?,
            _ => Default::default(),
        };
        let disk_used_bytes = tokio::task::spawn_blocking(move || dir_size(&data_path))
            .await
            .unwrap_or_else(|e| {
                warn!(node_id = %id, error = %e, "disk usage scan failed");
                0
            });

        let metrics = NodeMetrics {
            id: id.to_string(),
            cpu_percent: stats.cpu_percent,
            memory_used_bytes: stats.memory_used_bytes,
            memory_limit_bytes: stats.memory_limit_bytes,
            disk_used_bytes,
            network_rx_bytes: stats.network_rx_bytes,
            network_tx_bytes: stats.network_tx_bytes,
            timestamp: epoch_secs(),
        };

        let mut nodes = self.inner.nodes.write().await;
        if let Some(slot) = nodes.get_mut(id) {
            slot.metrics = Some(metrics.clone());
        }
        Ok(metrics)
    }

    /// The most recent `limit` lines of container output, oldest first.
    pub async fn recent_logs(&self, id: &str, limit: usize) -> NodeResult<Vec<String>> {
        let nodes = self.inner.nodes.read().await;
        let slot = nodes
            .get(id)
            .ok_or_else(|| NodeError::NotFound(id.to_string()))?;
        let skip = slot.logs.len().saturating_sub(limit);
        Ok(slot.logs.iter().skip(skip).cloned().collect())
    }

    /// Run a command inside a node's running container.
    pub async fn exec(&self, id: &str, argv: &[String]) -> NodeResult<ExecOutput> {
        let container_id = {
            let nodes = self.inner.nodes.read().await;
            let slot = nodes
                .get(id)
                .ok_or_else(|| NodeError::NotFound(id.to_string()))?;
            match (&slot.record.container_id, slot.state.status.is_active()) {
                (Some(cid), true) => cid.clone(),
                _ => {
                    return Err(NodeError::InvalidState {
                        id: id.to_string(),
                        status: slot.state.status,
                        op: "exec in",
                    });
                }
            }
        };
        debug!(node_id = %id, ?argv, "exec");
        Ok(self.inner.runtime.exec(&container_id, argv).await?)
    }

    /// Stop supervising every node. Containers keep running.
    pub async fn shutdown(&self) {
        let mut nodes = self.inner.nodes.write().await;
        for slot in nodes.values_mut() {
            if let Some(cancel) = slot.start_cancel.take() {
                let _ = cancel.send(true);
            }
            if let Some(supervisor) = slot.supervisor.take() {
                supervisor.stop();
            }
        }
        info!(nodes = nodes.len(), "node manager shut down");
    }

    // ── Supervisor reports ────────────────────────────────────────

    pub(crate) async fn ingest_log(&self, id: &str, run: u64, line: String) {
        let signals = self.inner.parser.parse(&line);
        let mut nodes = self.inner.nodes.write().await;
        let Some(slot) = nodes.get_mut(id) else {
            return;
        };
        if slot.run != run {
            return;
        }
        if slot.logs.len() == LOG_RING {
            slot.logs.pop_front();
        }
        slot.logs.push_back(line);

        if !slot.state.status.is_active() {
            return;
        }
        let recorded = slot.tracker.apply_log(&signals, &mut slot.state);
        if recorded && slot.state.status == NodeStatus::Starting {
            self.inner.transition(slot, NodeStatus::Syncing, None);
        }
    }

    pub(crate) async fn apply_probe(&self, id: &str, run: u64, report: ProbeReport) {
        let mut nodes = self.inner.nodes.write().await;
        let Some(slot) = nodes.get_mut(id) else {
            return;
        };
        if !slot.current(run) {
            return;
        }
        let synced = slot.tracker.apply_probe(&report, &mut slot.state);
        debug!(
            node_id = %id,
            height = ?report.height,
            peer_best = ?report.peer_best,
            synced,
            "probe"
        );

        // A starting node always passes through syncing; the next probe
        // promotes it.
        let next = match (slot.state.status, synced) {
            (NodeStatus::Starting, _) | (NodeStatus::Ready, false) => NodeStatus::Syncing,
            (NodeStatus::Syncing, true) => NodeStatus::Ready,
            (status, _) => status,
        };
        self.inner.transition(slot, next, None);
    }

    /// Check whether the container is gone and mark the node failed if so.
    /// Returns `true` when the run is over.
    pub(crate) async fn check_exit(&self, id: &str, run: u64, container_id: &str) -> bool {
        let reason = match self.inner.runtime.inspect(container_id).await {
            Ok(status) if status.running => return false,
            Ok(status) => status.describe_exit(),
            Err(RuntimeError::NotFound(_)) => "container disappeared".to_string(),
            Err(e) => {
                debug!(node_id = %id, error = %e, "inspect failed");
                return false;
            }
        };

        let mut nodes = self.inner.nodes.write().await;
        let Some(slot) = nodes.get_mut(id) else {
            return true;
        };
        if !slot.current(run) {
            return true;
        }
        warn!(node_id = %id, reason = %reason, "node container exited");
        slot.state.started_at = None;
        self.inner.transition(slot, NodeStatus::Error, Some(reason));
        if let Some(supervisor) = slot.supervisor.take() {
            supervisor.signal();
        }
        true
    }
}

impl Inner {
    /// Record a status change: persist it, log it and publish it.
    /// Must be called with the nodes write lock held.
    fn transition(&self, slot: &mut NodeSlot, to: NodeStatus, error: Option<String>) {
        let from = slot.state.status;
        if from == to {
            return;
        }
        slot.state.status = to;
        match to {
            NodeStatus::Error => slot.state.last_error = error.clone(),
            NodeStatus::Starting => slot.state.last_error = None,
            _ => {}
        }
        slot.record.status = to;
        self.persist(&mut slot.record);

        info!(node_id = %slot.record.id, %from, %to, "node status changed");
        self.events.emit(NodeEvent::StatusChanged {
            id: slot.record.id.clone(),
            from,
            to,
            error,
        });
    }

    fn persist(&self, record: &mut NodeRecord) {
        record.updated_at = epoch_secs();
        if let Err(e) = self.state.put_node(record) {
            error!(node_id = %record.id, error = %e, "failed to persist node record");
        }
    }

    async fn fail_start(&self, id: &str, message: String) {
        let mut nodes = self.nodes.write().await;
        if let Some(slot) = nodes.get_mut(id) {
            slot.start_cancel = None;
            self.transition(slot, NodeStatus::Error, Some(message));
        }
    }

    fn resolve_template(&self, record: &NodeRecord) -> NodeResult<(ChainSpec, Template)> {
        let chain = self
            .catalog
            .chain(&record.blockchain)
            .cloned()
            .ok_or_else(|| NodeError::Validation(format!("unknown blockchain '{}'", record.blockchain)))?;
        let template = self
            .catalog
            .template(&record.blockchain, record.mode)
            .cloned()
            .ok_or_else(|| {
                NodeError::Validation(format!(
                    "no template for {} in {} mode",
                    record.blockchain, record.mode
                ))
            })?;
        Ok((chain, template))
    }

    fn container_spec(
        &self,
        record: &NodeRecord,
        chain: &ChainSpec,
        template: &Template,
    ) -> NodeResult<ContainerSpec> {
        let binds = resolve_binds(&template.volumes, &record.data_path)?;

        let host_ip = self.settings.publish_address.clone();
        let mut ports = vec![
            PortMapping {
                host_ip: host_ip.clone(),
                host_port: record.rpc_port,
                container_port: chain.ports.rpc,
            },
            PortMapping {
                host_ip: host_ip.clone(),
                host_port: record.p2p_port,
                container_port: chain.ports.p2p,
            },
        ];
        if let (Some(host_port), Some(container_port)) = (record.ws_port, chain.ports.ws) {
            ports.push(PortMapping {
                host_ip,
                host_port,
                container_port,
            });
        }

        let labels = BTreeMap::from([
            ("chainward.node".to_string(), record.id.clone()),
            ("chainward.blockchain".to_string(), record.blockchain.clone()),
            ("chainward.mode".to_string(), record.mode.to_string()),
        ]);

        Ok(ContainerSpec {
            name: record.container_name(),
            image: template.image.clone(),
            command: template.command.clone(),
            env: template.env.clone(),
            binds,
            ports,
            labels,
        })
    }

    fn probe_target(&self, record: &NodeRecord) -> NodeResult<ProbeTarget> {
        let check = self
            .catalog
            .health_check(&record.blockchain, record.mode)
            .ok_or_else(|| NodeError::Validation(format!("no health check for {}", record.blockchain)))?;
        Ok(ProbeTarget {
            kind: check.kind,
            addr: SocketAddr::new(self.probe_host, record.rpc_port),
            path: check.path,
            authorization: check.authorization,
        })
    }

    /// Create and start the container, retrying transient runtime failures.
    async fn run_with_retry(&self, id: &str, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.runtime.run_container(spec).await {
                Ok(handle) => return Ok(handle),
                Err(e) if e.is_transient() && self.backoff.allows(attempts) => {
                    let delay = self.backoff.delay(attempts - 1);
                    warn!(node_id = %id, attempt = attempts, error = %e, ?delay, "container start failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Graceful stop bounded by the stop timeout, then kill, then remove.
    async fn halt_container(&self, id: &str, target: &str) -> Result<(), RuntimeError> {
        let grace = self.settings.nodes.stop_timeout;
        let bound = grace + grace / 2;
        let stopped = match tokio::time::timeout(bound, self.runtime.stop(target, grace)).await {
            Ok(Ok(())) => true,
            Ok(Err(RuntimeError::NotFound(_))) => {
                debug!(node_id = %id, container = %target, "container already gone");
                return Ok(());
            }
            Ok(Err(e)) => {
                warn!(node_id = %id, error = %e, "graceful stop failed, killing");
                false
            }
            Err(_) => {
                warn!(node_id = %id, timeout = ?bound, "graceful stop timed out, killing");
                false
            }
        };

        if !stopped {
            match self.runtime.kill(target).await {
                Ok(()) | Err(RuntimeError::NotFound(_)) => {}
                Err(e) => match self.runtime.inspect(target).await {
                    Ok(status) if !status.running => {}
                    _ => return Err(e),
                },
            }
        }

        match self.runtime.remove(target).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Best-effort removal of a container left by an unfinished start.
    async fn discard_container(&self, name: &str) {
        match self.runtime.remove(name).await {
            Ok(()) => debug!(container = %name, "removed container from unfinished start"),
            Err(RuntimeError::NotFound(_)) => {}
            Err(e) => warn!(container = %name, error = %e, "cannot remove container"),
        }
    }
}

fn gate_error(verdict: GateVerdict) -> NodeError {
    let reason = verdict
        .reason
        .unwrap_or_else(|| "resource check failed".to_string());
    match verdict.failure {
        Some(GateFailure::Disk { .. }) | Some(GateFailure::Memory { .. }) => {
            NodeError::ResourceInsufficient(reason)
        }
        _ => NodeError::Validation(reason),
    }
}

/// Address probes connect to. An unspecified publish address means the
/// ports are reachable on loopback.
fn probe_host(publish_address: &str) -> NodeResult<IpAddr> {
    let ip: IpAddr = publish_address
        .parse()
        .map_err(|_| NodeError::Validation(format!("invalid publish address '{publish_address}'")))?;
    Ok(match ip {
        IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        other => other,
    })
}

fn snapshot(state: &NodeState) -> NodeState {
    let mut state = state.clone();
    state.uptime_secs = match state.started_at {
        Some(started) if state.status.is_active() => epoch_secs().saturating_sub(started),
        _ => 0,
    };
    state
}

fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

/// Resolves once `true` is sent. Never resolves if the sender goes away.
async fn cancelled(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
