//! Docker Engine API runtime over bollard.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use futures_util::{StreamExt, future, stream};
use tracing::{debug, info, warn};

use crate::error::RuntimeError;
use crate::resolver::{ConnectionResolver, Endpoint};
use crate::runtime::{
    ContainerHandle, ContainerRuntime, ContainerSpec, ContainerStats, ContainerStatus, ExecOutput,
    LogStream,
};

const PING_TIMEOUT: Duration = Duration::from_secs(5);
const LOG_TAIL: &str = "200";

/// Container runtime backed by a Docker-compatible API (Docker, Podman, Colima).
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    endpoint: Endpoint,
}

impl DockerRuntime {
    /// Walk the resolver's candidates and keep the first endpoint that answers a ping.
    pub async fn connect(
        resolver: &ConnectionResolver,
        request_timeout: Duration,
    ) -> Result<Self, RuntimeError> {
        let timeout_secs = request_timeout.as_secs().max(1);
        let (endpoint, docker) = resolver
            .connect(|endpoint| async move {
                let docker = open_client(&endpoint, timeout_secs)?;
                match tokio::time::timeout(PING_TIMEOUT, docker.ping()).await {
                    Ok(Ok(_)) => Ok(docker),
                    Ok(Err(e)) => Err(classify(e)),
                    Err(_) => Err(RuntimeError::Unreachable("ping timed out".to_string())),
                }
            })
            .await?;
        Ok(Self { docker, endpoint })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        info!(image, "pulling image");
        let mut pull = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            let progress = progress.map_err(classify)?;
            if let Some(err) = progress.error {
                return Err(RuntimeError::Operation(format!("pull {image}: {err}")));
            }
            if let Some(status) = progress.status {
                debug!(image, status, "pull progress");
            }
        }
        Ok(())
    }

    async fn remove_stale(&self, name: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => {
                debug!(name, "removed leftover container");
                Ok(())
            }
            Err(e) => match classify(e) {
                RuntimeError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }
}

fn open_client(endpoint: &Endpoint, timeout_secs: u64) -> Result<Docker, RuntimeError> {
    let client = match endpoint {
        Endpoint::Unix(path) => {
            if !path.exists() {
                return Err(RuntimeError::Unreachable("socket not found".to_string()));
            }
            connect_unix(&endpoint.to_string(), timeout_secs)
        }
        Endpoint::NamedPipe(_) => connect_pipe(&endpoint.to_string(), timeout_secs),
        Endpoint::Tcp(addr) => Docker::connect_with_http(
            &format!("http://{addr}"),
            timeout_secs,
            bollard::API_DEFAULT_VERSION,
        )
        .map_err(classify),
    }?;
    Ok(client)
}

#[cfg(unix)]
fn connect_unix(addr: &str, timeout_secs: u64) -> Result<Docker, RuntimeError> {
    Docker::connect_with_unix(addr, timeout_secs, bollard::API_DEFAULT_VERSION).map_err(classify)
}

#[cfg(not(unix))]
fn connect_unix(addr: &str, _timeout_secs: u64) -> Result<Docker, RuntimeError> {
    Err(RuntimeError::Unreachable(format!("unix sockets unsupported on this platform: {addr}")))
}

#[cfg(windows)]
fn connect_pipe(addr: &str, timeout_secs: u64) -> Result<Docker, RuntimeError> {
    Docker::connect_with_named_pipe(addr, timeout_secs, bollard::API_DEFAULT_VERSION)
        .map_err(classify)
}

#[cfg(not(windows))]
fn connect_pipe(addr: &str, _timeout_secs: u64) -> Result<Docker, RuntimeError> {
    Err(RuntimeError::Unreachable(format!("named pipes unsupported on this platform: {addr}")))
}

/// Map a Docker API error onto the runtime error taxonomy.
fn classify(err: DockerError) -> RuntimeError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Operation(format!("{status_code}: {message}")),
        other => RuntimeError::Unreachable(other.to_string()),
    }
}

fn container_config(spec: &ContainerSpec) -> Config<String> {
    let mut exposed = HashMap::new();
    let mut bindings = HashMap::new();
    for port in &spec.ports {
        let key = format!("{}/tcp", port.container_port);
        exposed.insert(key.clone(), HashMap::new());
        bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: Some(port.host_ip.clone()),
                host_port: Some(port.host_port.to_string()),
            }]),
        );
    }

    Config {
        image: Some(spec.image.clone()),
        cmd: (!spec.command.is_empty()).then(|| spec.command.clone()),
        env: Some(spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
        labels: Some(spec.labels.clone().into_iter().collect()),
        exposed_ports: Some(exposed),
        host_config: Some(HostConfig {
            binds: Some(spec.binds.clone()),
            port_bindings: Some(bindings),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Append `chunk` to `buf` and drain every complete line out of it.
pub(crate) fn split_lines(buf: &mut String, chunk: &str) -> Vec<String> {
    buf.push_str(chunk);
    let mut lines = Vec::new();
    while let Some(pos) = buf.find('\n') {
        let line: String = buf.drain(..=pos).collect();
        let line = line.trim_end_matches(['\n', '\r']);
        if !line.is_empty() {
            lines.push(line.to_string());
        }
    }
    lines
}

/// CPU usage in percent of one core times online cores, as `docker stats` reports it.
pub(crate) fn cpu_percent(total: u64, pre_total: u64, system: u64, pre_system: u64, cpus: u64) -> f64 {
    let cpu_delta = total.saturating_sub(pre_total) as f64;
    let system_delta = system.saturating_sub(pre_system) as f64;
    if cpu_delta <= 0.0 || system_delta <= 0.0 {
        return 0.0;
    }
    cpu_delta / system_delta * cpus.max(1) as f64 * 100.0
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await.map(|_| ()).map_err(classify)
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        self.remove_stale(&spec.name).await?;
        self.ensure_image(&spec.image).await?;

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                container_config(spec),
            )
            .await
            .map_err(classify)?;
        for warning in &created.warnings {
            warn!(container = %spec.name, warning, "create warning");
        }

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            let err = classify(e);
            if let Err(cleanup) = self.remove(&created.id).await {
                warn!(container = %spec.name, error = %cleanup, "cleanup after failed start");
            }
            return Err(err);
        }

        info!(container = %spec.name, id = %created.id, image = %spec.image, "container started");
        Ok(ContainerHandle {
            id: created.id,
            name: spec.name.clone(),
        })
    }

    async fn logs(&self, id: &str) -> Result<LogStream, RuntimeError> {
        let raw = self.docker.logs(
            id,
            Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                tail: LOG_TAIL.to_string(),
                ..Default::default()
            }),
        );
        let lines = raw
            .scan(String::new(), |buf, item| {
                let out = match item {
                    Ok(output) => {
                        let bytes = output.into_bytes();
                        split_lines(buf, &String::from_utf8_lossy(&bytes))
                            .into_iter()
                            .map(Ok)
                            .collect::<Vec<_>>()
                    }
                    Err(e) => vec![Err(classify(e))],
                };
                future::ready(Some(out))
            })
            .flat_map(stream::iter);
        Ok(Box::pin(lines))
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        self.docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await
            .map_err(classify)
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .kill_container(id, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
            .map_err(classify)
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(classify)
    }

    async fn inspect(&self, id: &str) -> Result<ContainerStatus, RuntimeError> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(classify)?;
        let state = info.state.unwrap_or_default();
        Ok(ContainerStatus {
            running: state.running.unwrap_or(false),
            exit_code: state.exit_code,
            error: state.error.filter(|e| !e.is_empty()),
        })
    }

    async fn stats(&self, id: &str) -> Result<ContainerStats, RuntimeError> {
        let mut samples = self.docker.stats(
            id,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );
        let stats = match samples.next().await {
            Some(sample) => sample.map_err(classify)?,
            None => return Err(RuntimeError::Operation(format!("no stats for {id}"))),
        };

        let cpu = &stats.cpu_stats;
        let pre = &stats.precpu_stats;
        let cpus = cpu
            .online_cpus
            .or_else(|| cpu.cpu_usage.percpu_usage.as_ref().map(|v| v.len() as u64))
            .unwrap_or(1);
        let (rx, tx) = stats
            .networks
            .as_ref()
            .map(|nets| {
                nets.values()
                    .fold((0u64, 0u64), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes))
            })
            .unwrap_or((0, 0));

        Ok(ContainerStats {
            cpu_percent: cpu_percent(
                cpu.cpu_usage.total_usage,
                pre.cpu_usage.total_usage,
                cpu.system_cpu_usage.unwrap_or(0),
                pre.system_cpu_usage.unwrap_or(0),
                cpus,
            ),
            memory_used_bytes: stats.memory_stats.usage.unwrap_or(0),
            memory_limit_bytes: stats.memory_stats.limit.unwrap_or(0),
            network_rx_bytes: rx,
            network_tx_bytes: tx,
        })
    }

    async fn exec(&self, id: &str, argv: &[String]) -> Result<ExecOutput, RuntimeError> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(argv.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(classify)?;

        let mut output = String::new();
        if let StartExecResults::Attached { output: mut out, .. } =
            self.docker.start_exec(&exec.id, None).await.map_err(classify)?
        {
            while let Some(chunk) = out.next().await {
                let chunk = chunk.map_err(classify)?;
                output.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
            }
        }

        let inspected = self.docker.inspect_exec(&exec.id).await.map_err(classify)?;
        Ok(ExecOutput {
            exit_code: inspected.exit_code,
            output,
        })
    }
}
