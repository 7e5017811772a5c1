//! The container runtime contract.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;

use crate::error::RuntimeError;

/// A container port published on a host address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub host_ip: String,
    pub host_port: u16,
    pub container_port: u16,
}

/// Everything needed to create and start one container.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Bind mounts in `host:container[:ro]` form, already policy-checked.
    pub binds: Vec<String>,
    pub ports: Vec<PortMapping>,
    pub labels: BTreeMap<String, String>,
}

/// A started container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
}

/// Point-in-time container state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerStatus {
    pub running: bool,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
}

impl ContainerStatus {
    /// Human description of why a container is not running.
    pub fn describe_exit(&self) -> String {
        match (&self.error, self.exit_code) {
            (Some(err), _) if !err.is_empty() => format!("container exited: {err}"),
            (_, Some(code)) => format!("container exited with code {code}"),
            _ => "container is not running".to_string(),
        }
    }
}

/// Resource usage sample for a container.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_limit_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
}

/// Output of a command executed inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecOutput {
    pub exit_code: Option<i64>,
    pub output: String,
}

impl ExecOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Stream of log lines (newline stripped) from a container.
pub type LogStream = Pin<Box<dyn Stream<Item = Result<String, RuntimeError>> + Send>>;

/// Operations chainward needs from a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Short name used in logs ("docker", "memory").
    fn name(&self) -> &str;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// Create and start a container. A stopped leftover container with the
    /// same name is replaced.
    async fn run_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError>;

    /// Follow the container's stdout/stderr, starting with recent history.
    async fn logs(&self, id: &str) -> Result<LogStream, RuntimeError>;

    /// Ask the container to stop, waiting up to `grace` before the runtime
    /// itself escalates.
    async fn stop(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;

    /// Kill the container immediately.
    async fn kill(&self, id: &str) -> Result<(), RuntimeError>;

    /// Remove the container (forcefully if still running).
    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;

    async fn inspect(&self, id: &str) -> Result<ContainerStatus, RuntimeError>;

    async fn stats(&self, id: &str) -> Result<ContainerStats, RuntimeError>;

    /// Run a command inside a running container and collect its output.
    async fn exec(&self, id: &str, argv: &[String]) -> Result<ExecOutput, RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_exit_prefers_error_text() {
        let status = ContainerStatus {
            running: false,
            exit_code: Some(137),
            error: Some("OOM killed".to_string()),
        };
        assert_eq!(status.describe_exit(), "container exited: OOM killed");

        let status = ContainerStatus {
            running: false,
            exit_code: Some(1),
            error: Some(String::new()),
        };
        assert_eq!(status.describe_exit(), "container exited with code 1");
    }
}
