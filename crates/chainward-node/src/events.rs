//! Node event bus.

use chainward_state::NodeStatus;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// Something that happened to a node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    Created {
        id: String,
    },
    StatusChanged {
        id: String,
        from: NodeStatus,
        to: NodeStatus,
        error: Option<String>,
    },
    Deleted {
        id: String,
    },
}

impl NodeEvent {
    pub fn node_id(&self) -> &str {
        match self {
            NodeEvent::Created { id }
            | NodeEvent::StatusChanged { id, .. }
            | NodeEvent::Deleted { id } => id,
        }
    }
}

/// Typed broadcast of [`NodeEvent`]s. Sending never blocks; slow
/// subscribers see `Lagged`.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NodeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: NodeEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
