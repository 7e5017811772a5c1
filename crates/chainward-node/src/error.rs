//! Node lifecycle errors.

use std::time::Duration;

use chainward_placement::PlacementError;
use chainward_runtime::RuntimeError;
use chainward_state::{NodeStatus, StateError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("insufficient resources: {0}")]
    ResourceInsufficient(String),

    #[error(transparent)]
    PortExhausted(PlacementError),

    #[error(transparent)]
    ConnectionExhausted(RuntimeError),

    #[error("capacity exceeded: {running} of {max} nodes already running")]
    CapacityExceeded { running: usize, max: usize },

    #[error(transparent)]
    Runtime(RuntimeError),

    #[error("probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    #[error("node not found: {0}")]
    NotFound(String),

    #[error("another operation is in progress on node {0}")]
    OperationInProgress(String),

    #[error("cannot {op} node {id} while {status}")]
    InvalidState {
        id: String,
        status: NodeStatus,
        op: &'static str,
    },

    #[error("start of node {0} aborted by stop")]
    StartAborted(String),

    #[error("start of node {id} timed out after {after:?}")]
    StartTimeout { id: String, after: Duration },

    #[error("state store: {0}")]
    State(#[from] StateError),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RuntimeError> for NodeError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::ConnectionExhausted { .. } => NodeError::ConnectionExhausted(err),
            other => NodeError::Runtime(other),
        }
    }
}

impl From<PlacementError> for NodeError {
    fn from(err: PlacementError) -> Self {
        NodeError::PortExhausted(err)
    }
}

pub type NodeResult<T> = Result<T, NodeError>;
