//! Alert handlers.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chainward_state::{Alert, AlertSeverity};
use tracing::{error, info, warn};

/// What a handler is told about.
#[derive(Debug, Clone, PartialEq)]
pub enum AlertEvent {
    Triggered(Alert),
    Resolved(Alert),
}

impl AlertEvent {
    pub fn alert(&self) -> &Alert {
        match self {
            AlertEvent::Triggered(a) | AlertEvent::Resolved(a) => a,
        }
    }
}

/// Callback invoked for every dispatched alert event. Errors are logged by
/// the manager and never reach other handlers.
pub type AlertHandler = Arc<dyn Fn(AlertEvent) -> BoxFuture + Send + Sync>;

pub type BoxFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A handler that writes alerts to the tracing log.
pub fn log_handler() -> AlertHandler {
    Arc::new(|event: AlertEvent| {
        Box::pin(async move {
            match &event {
                AlertEvent::Triggered(a) => {
                    let node = a.node_id.as_deref().unwrap_or("-");
                    match a.severity {
                        AlertSeverity::Critical => {
                            error!(alert_id = %a.id, kind = %a.alert_type, node, "{}", a.message)
                        }
                        AlertSeverity::Warning => {
                            warn!(alert_id = %a.id, kind = %a.alert_type, node, "{}", a.message)
                        }
                        AlertSeverity::Info => {
                            info!(alert_id = %a.id, kind = %a.alert_type, node, "{}", a.message)
                        }
                    }
                }
                AlertEvent::Resolved(a) => {
                    info!(alert_id = %a.id, kind = %a.alert_type, node = a.node_id.as_deref().unwrap_or("-"), "alert resolved");
                }
            }
            anyhow::Ok(())
        }) as BoxFuture
    })
}
