//! Alert manager.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chainward_core::clock::epoch_secs;
use chainward_core::config::AlertsConfig;
use chainward_core::id::generate_id;
use chainward_state::{Alert, AlertSeverity, AlertType, StateStore};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::AlertError;
use crate::handler::{AlertEvent, AlertHandler};

/// Parameters for raising an alert.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertInput {
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub node_id: Option<String>,
    pub message: String,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl AlertInput {
    pub fn new(alert_type: AlertType, severity: AlertSeverity, message: impl Into<String>) -> Self {
        Self {
            alert_type,
            severity,
            node_id: None,
            message: message.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn for_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Narrows `AlertManager::list`. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlertFilter {
    pub resolved: Option<bool>,
    pub node_id: Option<String>,
    pub alert_type: Option<AlertType>,
}

impl AlertFilter {
    fn accepts(&self, alert: &Alert) -> bool {
        self.resolved.is_none_or(|r| alert.resolved == r)
            && self
                .node_id
                .as_deref()
                .is_none_or(|n| alert.node_id.as_deref() == Some(n))
            && self.alert_type.is_none_or(|t| alert.alert_type == t)
    }
}

/// Raises, deduplicates, resolves and dispatches alerts.
#[derive(Clone)]
pub struct AlertManager {
    state: StateStore,
    min_severity: AlertSeverity,
    handlers: Arc<RwLock<Vec<(String, AlertHandler)>>>,
    /// Alerts that could not be persisted, by id.
    transient: Arc<Mutex<HashMap<String, Alert>>>,
    /// Serializes the dedup check with the write that follows it.
    write_lock: Arc<Mutex<()>>,
}

impl AlertManager {
    pub fn new(state: StateStore, min_severity: AlertSeverity) -> Self {
        Self {
            state,
            min_severity,
            handlers: Arc::new(RwLock::new(Vec::new())),
            transient: Arc::new(Mutex::new(HashMap::new())),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn from_config(state: StateStore, config: &AlertsConfig) -> Result<Self, AlertError> {
        let min = config
            .min_severity
            .parse::<AlertSeverity>()
            .map_err(|e| AlertError::Config(e.to_string()))?;
        Ok(Self::new(state, min))
    }

    pub fn min_severity(&self) -> AlertSeverity {
        self.min_severity
    }

    /// Register a handler under `name`. A handler registered under an
    /// existing name replaces it.
    pub async fn register_handler(&self, name: &str, handler: AlertHandler) {
        let mut handlers = self.handlers.write().await;
        handlers.retain(|(n, _)| n != name);
        handlers.push((name.to_string(), handler));
        debug!(handler = name, "alert handler registered");
    }

    /// Raise an alert, or return the unresolved one already open for the
    /// same `(type, node)` key.
    pub async fn trigger(&self, input: AlertInput) -> Result<Alert, AlertError> {
        let _guard = self.write_lock.lock().await;
        let node_id = input.node_id.as_deref();

        if let Some(existing) = self.find_open(input.alert_type, node_id).await? {
            debug!(alert_id = %existing.id, kind = %existing.alert_type, "alert already open");
            return Ok(existing);
        }

        let alert = Alert {
            id: generate_id("alert"),
            alert_type: input.alert_type,
            severity: input.severity,
            node_id: input.node_id.clone(),
            message: input.message,
            timestamp: epoch_secs(),
            resolved: false,
            resolved_at: None,
            metadata: input.metadata,
        };

        let durable = match node_id {
            None => true,
            Some(id) => self.state.get_node(id)?.is_some(),
        };
        let stored = durable
            && match self.state.put_alert(&alert) {
                Ok(()) => true,
                Err(e) => {
                    warn!(alert_id = %alert.id, error = %e, "alert not persisted");
                    false
                }
            };
        if !stored {
            self.transient
                .lock()
                .await
                .insert(alert.id.clone(), alert.clone());
        }

        if alert.severity >= self.min_severity {
            self.dispatch(AlertEvent::Triggered(alert.clone())).await;
        } else {
            info!(
                alert_id = %alert.id,
                kind = %alert.alert_type,
                severity = %alert.severity,
                "alert below dispatch threshold: {}",
                alert.message
            );
        }
        Ok(alert)
    }

    /// Resolve one alert. Returns `None` for unknown or already resolved ids.
    pub async fn resolve(&self, alert_id: &str) -> Result<Option<Alert>, AlertError> {
        let _guard = self.write_lock.lock().await;
        let resolved = self.resolve_locked(alert_id).await?;
        if let Some(alert) = &resolved {
            self.dispatch(AlertEvent::Resolved(alert.clone())).await;
        }
        Ok(resolved)
    }

    /// Resolve every open alert of `alert_type` for `node_id` (`None` means
    /// system-wide alerts). Returns what was resolved.
    pub async fn resolve_by_type(
        &self,
        alert_type: AlertType,
        node_id: Option<&str>,
    ) -> Result<Vec<Alert>, AlertError> {
        let _guard = self.write_lock.lock().await;
        let mut ids: Vec<String> = self
            .state
            .list_unresolved_alerts()?
            .into_iter()
            .filter(|a| a.matches(alert_type, node_id))
            .map(|a| a.id)
            .collect();
        ids.extend(
            self.transient
                .lock()
                .await
                .values()
                .filter(|a| !a.resolved && a.matches(alert_type, node_id))
                .map(|a| a.id.clone()),
        );

        let mut out = Vec::new();
        for id in ids {
            if let Some(alert) = self.resolve_locked(&id).await? {
                self.dispatch(AlertEvent::Resolved(alert.clone())).await;
                out.push(alert);
            }
        }
        Ok(out)
    }

    pub async fn get(&self, alert_id: &str) -> Result<Option<Alert>, AlertError> {
        if let Some(alert) = self.transient.lock().await.get(alert_id) {
            return Ok(Some(alert.clone()));
        }
        Ok(self.state.get_alert(alert_id)?)
    }

    /// Stored and transient alerts matching `filter`, oldest first.
    pub async fn list(&self, filter: &AlertFilter) -> Result<Vec<Alert>, AlertError> {
        let mut alerts: Vec<Alert> = self
            .state
            .list_alerts()?
            .into_iter()
            .filter(|a| filter.accepts(a))
            .collect();
        alerts.extend(
            self.transient
                .lock()
                .await
                .values()
                .filter(|a| filter.accepts(a))
                .cloned(),
        );
        alerts.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(alerts)
    }

    /// Every unresolved alert.
    pub async fn active(&self) -> Result<Vec<Alert>, AlertError> {
        self.list(&AlertFilter {
            resolved: Some(false),
            ..Default::default()
        })
        .await
    }

    async fn find_open(
        &self,
        alert_type: AlertType,
        node_id: Option<&str>,
    ) -> Result<Option<Alert>, AlertError> {
        let transient = self
            .transient
            .lock()
            .await
            .values()
            .filter(|a| !a.resolved && a.matches(alert_type, node_id))
            .min_by_key(|a| a.timestamp)
            .cloned();
        if transient.is_some() {
            return Ok(transient);
        }
        Ok(self.state.find_unresolved_alert(alert_type, node_id)?)
    }

    async fn resolve_locked(&self, alert_id: &str) -> Result<Option<Alert>, AlertError> {
        let now = epoch_secs();
        {
            // Resolved transient alerts are not retained.
            let mut transient = self.transient.lock().await;
            if let Some(mut alert) = transient.remove(alert_id) {
                alert.resolved = true;
                alert.resolved_at = Some(now);
                return Ok(Some(alert));
            }
        }

        let Some(mut alert) = self.state.get_alert(alert_id)? else {
            return Ok(None);
        };
        if alert.resolved {
            return Ok(None);
        }
        alert.resolved = true;
        alert.resolved_at = Some(now);
        self.state.put_alert(&alert)?;
        Ok(Some(alert))
    }

    /// Fan `event` out to every handler, each on its own task.
    async fn dispatch(&self, event: AlertEvent) {
        let handlers = self.handlers.read().await;
        for (name, handler) in handlers.iter() {
            let fut = handler(event.clone());
            let name = name.clone();
            let alert_id = event.alert().id.clone();
            tokio::spawn(async move {
                if let Err(e) = fut.await {
                    warn!(handler = %name, %alert_id, error = %e, "alert handler failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::BoxFuture;
    use chainward_core::NodeMode;
    use chainward_state::{NodeRecord, NodeStatus};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn node(id: &str) -> NodeRecord {
        NodeRecord {
            id: id.to_string(),
            name: id.to_string(),
            blockchain: "bitcoin".to_string(),
            mode: NodeMode::Pruned,
            data_path: format!("/data/{id}").into(),
            rpc_port: 8332,
            p2p_port: 8333,
            ws_port: None,
            custom_config: None,
            status: NodeStatus::Stopped,
            container_id: None,
            created_at: 1,
            updated_at: 1,
        }
    }

    fn recording_handler() -> (AlertHandler, mpsc::UnboundedReceiver<AlertEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: AlertHandler = Arc::new(move |event: AlertEvent| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(event);
                anyhow::Ok(())
            }) as BoxFuture
        });
        (handler, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<AlertEvent>) -> Option<AlertEvent> {
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .ok()
            .flatten()
    }

    fn manager() -> AlertManager {
        let state = StateStore::open_in_memory().unwrap();
        state.put_node(&node("btc-1")).unwrap();
        AlertManager::new(state, AlertSeverity::Warning)
    }

    #[tokio::test]
    async fn duplicate_trigger_returns_open_alert_without_dispatch() {
        let alerts = manager();
        let (handler, mut rx) = recording_handler();
        alerts.register_handler("test", handler).await;

        let input = AlertInput::new(AlertType::SyncDelayed, AlertSeverity::Warning, "stalled")
            .for_node("btc-1");
        let first = alerts.trigger(input.clone()).await.unwrap();
        let second = alerts.trigger(input).await.unwrap();
        assert_eq!(first.id, second.id);

        assert!(matches!(next(&mut rx).await, Some(AlertEvent::Triggered(_))));
        assert!(next(&mut rx).await.is_none());
        assert_eq!(alerts.active().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn different_nodes_are_different_keys() {
        let alerts = manager();
        let a = alerts
            .trigger(AlertInput::new(AlertType::NodeDown, AlertSeverity::Critical, "down").for_node("btc-1"))
            .await
            .unwrap();
        let b = alerts
            .trigger(AlertInput::new(AlertType::NodeDown, AlertSeverity::Critical, "down"))
            .await
            .unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn below_threshold_is_stored_but_not_dispatched() {
        let alerts = manager();
        let (handler, mut rx) = recording_handler();
        alerts.register_handler("test", handler).await;

        let alert = alerts
            .trigger(AlertInput::new(AlertType::Custom, AlertSeverity::Info, "fyi"))
            .await
            .unwrap();
        assert!(next(&mut rx).await.is_none());
        assert!(alerts.get(&alert.id).await.unwrap().is_some());

        // Resolution is never severity gated.
        alerts.resolve(&alert.id).await.unwrap();
        assert!(matches!(next(&mut rx).await, Some(AlertEvent::Resolved(_))));
    }

    #[tokio::test]
    async fn resolve_is_idempotent() {
        let alerts = manager();
        let alert = alerts
            .trigger(AlertInput::new(AlertType::CpuHigh, AlertSeverity::Warning, "hot"))
            .await
            .unwrap();
        let resolved = alerts.resolve(&alert.id).await.unwrap().unwrap();
        assert!(resolved.resolved);
        assert!(resolved.resolved_at.is_some());
        assert!(alerts.resolve(&alert.id).await.unwrap().is_none());
        assert!(alerts.resolve("alert-missing").await.unwrap().is_none());

        // A fresh trigger after resolution opens a new alert.
        let again = alerts
            .trigger(AlertInput::new(AlertType::CpuHigh, AlertSeverity::Warning, "hot"))
            .await
            .unwrap();
        assert_ne!(again.id, alert.id);
    }

    #[tokio::test]
    async fn resolve_by_type_scopes_to_node() {
        let alerts = manager();
        alerts
            .trigger(AlertInput::new(AlertType::DiskFull, AlertSeverity::Critical, "host disk"))
            .await
            .unwrap();
        alerts
            .trigger(AlertInput::new(AlertType::DiskFull, AlertSeverity::Critical, "pruning").for_node("btc-1"))
            .await
            .unwrap();

        let resolved = alerts.resolve_by_type(AlertType::DiskFull, None).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].node_id, None);

        let open = alerts.active().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].node_id.as_deref(), Some("btc-1"));
    }

    #[tokio::test]
    async fn alert_for_unknown_node_is_transient_but_deduplicated() {
        let alerts = manager();
        let (handler, mut rx) = recording_handler();
        alerts.register_handler("test", handler).await;

        let input = AlertInput::new(AlertType::NodeDown, AlertSeverity::Critical, "gone")
            .for_node("ghost");
        let first = alerts.trigger(input.clone()).await.unwrap();
        assert!(matches!(next(&mut rx).await, Some(AlertEvent::Triggered(_))));
        assert!(alerts.state.get_alert(&first.id).unwrap().is_none());

        let second = alerts.trigger(input).await.unwrap();
        assert_eq!(first.id, second.id);

        let resolved = alerts.resolve_by_type(AlertType::NodeDown, Some("ghost")).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert!(alerts.active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resolved_transient_alerts_are_released() {
        let alerts = manager();
        for round in 0..3 {
            let raised = alerts
                .trigger(
                    AlertInput::new(AlertType::NodeDown, AlertSeverity::Critical, "gone")
                        .for_node("ghost"),
                )
                .await
                .unwrap();
            assert_eq!(alerts.transient.lock().await.len(), 1, "round {round}");

            let resolved = alerts.resolve(&raised.id).await.unwrap().unwrap();
            assert!(resolved.resolved);
            assert!(resolved.resolved_at.is_some());
            assert!(alerts.transient.lock().await.is_empty());
            assert!(alerts.get(&raised.id).await.unwrap().is_none());
            assert!(alerts.resolve(&raised.id).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_siblings() {
        let alerts = manager();
        let failing: AlertHandler =
            Arc::new(|_: AlertEvent| Box::pin(async { Err::<(), _>(anyhow::anyhow!("smtp down")) }) as BoxFuture);
        let (handler, mut rx) = recording_handler();
        alerts.register_handler("email", failing).await;
        alerts.register_handler("test", handler).await;

        alerts
            .trigger(AlertInput::new(AlertType::MemoryCritical, AlertSeverity::Critical, "oom"))
            .await
            .unwrap();
        assert!(matches!(next(&mut rx).await, Some(AlertEvent::Triggered(_))));
    }

    #[tokio::test]
    async fn list_filters_by_type_and_node() {
        let alerts = manager();
        alerts
            .trigger(AlertInput::new(AlertType::SyncDelayed, AlertSeverity::Warning, "s").for_node("btc-1"))
            .await
            .unwrap();
        alerts
            .trigger(AlertInput::new(AlertType::CpuHigh, AlertSeverity::Warning, "c"))
            .await
            .unwrap();

        let by_node = alerts
            .list(&AlertFilter {
                node_id: Some("btc-1".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_node.len(), 1);
        let by_type = alerts
            .list(&AlertFilter {
                alert_type: Some(AlertType::CpuHigh),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_type[0].message, "c");
    }

    #[test]
    fn from_config_rejects_bad_severity() {
        let state = StateStore::open_in_memory().unwrap();
        let err = AlertManager::from_config(
            state,
            &AlertsConfig {
                min_severity: "loud".into(),
            },
        );
        assert!(err.is_err());
    }
}
