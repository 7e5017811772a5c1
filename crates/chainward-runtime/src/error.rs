//! Runtime error types.

use thiserror::Error;

/// One failed connection attempt, kept for the exhaustion report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectAttempt {
    pub endpoint: String,
    pub error: String,
}

/// Errors from the container runtime or from reaching it.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime could not be reached; worth retrying.
    #[error("container runtime unreachable: {0}")]
    Unreachable(String),

    /// The runtime answered but refused or failed the operation.
    #[error("container runtime operation failed: {0}")]
    Operation(String),

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("runtime endpoint rejected by policy: {0}")]
    Policy(String),

    #[error("invalid runtime endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("no container runtime endpoint reachable ({})", summarize(.attempts))]
    ConnectionExhausted { attempts: Vec<ConnectAttempt> },
}

impl RuntimeError {
    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RuntimeError::Unreachable(_))
    }
}

fn summarize(attempts: &[ConnectAttempt]) -> String {
    if attempts.is_empty() {
        return "no candidates".to_string();
    }
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.endpoint, a.error))
        .collect::<Vec<_>>()
        .join("; ")
}
