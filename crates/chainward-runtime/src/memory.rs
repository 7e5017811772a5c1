//! An in-process container runtime for tests and dry runs.
//!
//! Containers are plain records; logs are pushed in with [`InMemoryRuntime::emit_log`]
//! and fanned out to followers over a broadcast channel.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::error::RuntimeError;
use crate::runtime::{
    ContainerHandle, ContainerRuntime, ContainerSpec, ContainerStats, ContainerStatus, ExecOutput,
    LogStream,
};

const LOG_CHANNEL: usize = 1024;

struct Container {
    name: String,
    spec: ContainerSpec,
    running: bool,
    exit_code: Option<i64>,
    error: Option<String>,
    history: Vec<String>,
    tx: Option<broadcast::Sender<String>>,
}

impl Container {
    fn halt(&mut self, exit_code: i64) {
        self.running = false;
        self.exit_code = Some(exit_code);
        // Dropping the sender ends every follower's stream.
        self.tx = None;
    }
}

#[derive(Default)]
struct State {
    containers: HashMap<String, Container>,
    seq: u64,
    unreachable: bool,
    failures: VecDeque<bool>,
    run_delay: Option<Duration>,
    stop_hangs: bool,
    stats: ContainerStats,
    exec_result: ExecOutput,
    exec_calls: Vec<(String, Vec<String>)>,
}

/// A [`ContainerRuntime`] that keeps everything in memory.
#[derive(Clone, Default)]
pub struct InMemoryRuntime {
    state: Arc<Mutex<State>>,
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make `ping` and `run_container` fail as if the daemon were gone.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Fail the next `n` runs; transient failures look like a dropped connection.
    pub fn fail_next_runs(&self, n: usize, transient: bool) {
        let mut state = self.lock();
        for _ in 0..n {
            state.failures.push_back(transient);
        }
    }

    /// Delay every `run_container` call.
    pub fn set_run_delay(&self, delay: Duration) {
        self.lock().run_delay = Some(delay);
    }

    /// Make `stop` never return, forcing callers onto their kill path.
    pub fn set_stop_hangs(&self, hangs: bool) {
        self.lock().stop_hangs = hangs;
    }

    pub fn set_stats(&self, stats: ContainerStats) {
        self.lock().stats = stats;
    }

    pub fn set_exec_result(&self, result: ExecOutput) {
        self.lock().exec_result = result;
    }

    /// Append a log line to a running container (by id or name).
    pub fn emit_log(&self, container: &str, line: impl Into<String>) -> bool {
        let mut state = self.lock();
        let Some(id) = find(&state, container) else {
            return false;
        };
        let line = line.into();
        let Some(c) = state.containers.get_mut(&id) else {
            return false;
        };
        c.history.push(line.clone());
        if let Some(tx) = &c.tx {
            let _ = tx.send(line);
        }
        true
    }

    /// Simulate the container process exiting on its own.
    pub fn crash(&self, container: &str, exit_code: i64) -> bool {
        let mut state = self.lock();
        let Some(id) = find(&state, container) else {
            return false;
        };
        match state.containers.get_mut(&id) {
            Some(c) => {
                c.halt(exit_code);
                true
            }
            None => false,
        }
    }

    /// Names of containers currently running.
    pub fn running_containers(&self) -> Vec<String> {
        let state = self.lock();
        let mut names: Vec<String> = state
            .containers
            .values()
            .filter(|c| c.running)
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn container_by_name(&self, name: &str) -> Option<ContainerHandle> {
        let state = self.lock();
        state
            .containers
            .iter()
            .find(|(_, c)| c.name == name)
            .map(|(id, c)| ContainerHandle {
                id: id.clone(),
                name: c.name.clone(),
            })
    }

    /// The spec a container was started from.
    pub fn spec_of(&self, container: &str) -> Option<ContainerSpec> {
        let state = self.lock();
        let id = find(&state, container)?;
        state.containers.get(&id).map(|c| c.spec.clone())
    }

    pub fn exec_calls(&self) -> Vec<(String, Vec<String>)> {
        self.lock().exec_calls.clone()
    }
}

fn lookup<'a>(state: &'a State, key: &str) -> Result<&'a Container, RuntimeError> {
    find(state, key)
        .and_then(|id| state.containers.get(&id))
        .ok_or_else(|| RuntimeError::NotFound(key.to_string()))
}

fn find(state: &State, key: &str) -> Option<String> {
    if state.containers.contains_key(key) {
        return Some(key.to_string());
    }
    state
        .containers
        .iter()
        .find(|(_, c)| c.name == key)
        .map(|(id, _)| id.clone())
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    fn name(&self) -> &str {
        "memory"
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        if self.lock().unreachable {
            return Err(RuntimeError::Unreachable("in-memory runtime offline".to_string()));
        }
        Ok(())
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        let delay = self.lock().run_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.unreachable {
            return Err(RuntimeError::Unreachable("in-memory runtime offline".to_string()));
        }
        if let Some(transient) = state.failures.pop_front() {
            return Err(if transient {
                RuntimeError::Unreachable("connection reset".to_string())
            } else {
                RuntimeError::Operation(format!("image {} failed to start", spec.image))
            });
        }
        if state
            .containers
            .values()
            .any(|c| c.name == spec.name && c.running)
        {
            return Err(RuntimeError::Operation(format!(
                "container name {} already in use",
                spec.name
            )));
        }
        state.containers.retain(|_, c| c.name != spec.name);

        state.seq += 1;
        let id = format!("mem-{:04}", state.seq);
        let (tx, _) = broadcast::channel(LOG_CHANNEL);
        state.containers.insert(
            id.clone(),
            Container {
                name: spec.name.clone(),
                spec: spec.clone(),
                running: true,
                exit_code: None,
                error: None,
                history: Vec::new(),
                tx: Some(tx),
            },
        );
        Ok(ContainerHandle {
            id,
            name: spec.name.clone(),
        })
    }

    async fn logs(&self, id: &str) -> Result<LogStream, RuntimeError> {
        let state = self.lock();
        let c = lookup(&state, id)?;
        let backlog: Vec<Result<String, RuntimeError>> =
            c.history.iter().cloned().map(Ok).collect();
        let live = c.tx.as_ref().map(|tx| tx.subscribe());
        drop(state);

        let follow = stream::unfold(live, |rx| async move {
            let mut rx = rx?;
            loop {
                match rx.recv().await {
                    Ok(line) => return Some((Ok(line), Some(rx))),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream::iter(backlog).chain(follow)))
    }

    async fn stop(&self, id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        let (key, hangs) = {
            let state = self.lock();
            let key = find(&state, id).ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
            (key, state.stop_hangs)
        };
        if hangs {
            std::future::pending::<()>().await;
        }
        if let Some(c) = self.lock().containers.get_mut(&key) {
            c.halt(0);
        }
        Ok(())
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        let key = find(&state, id).ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        if let Some(c) = state.containers.get_mut(&key) {
            c.halt(137);
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        let key = find(&state, id).ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        state.containers.remove(&key);
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerStatus, RuntimeError> {
        let state = self.lock();
        let c = lookup(&state, id)?;
        Ok(ContainerStatus {
            running: c.running,
            exit_code: c.exit_code,
            error: c.error.clone(),
        })
    }

    async fn stats(&self, id: &str) -> Result<ContainerStats, RuntimeError> {
        let state = self.lock();
        lookup(&state, id)?;
        Ok(state.stats.clone())
    }

    async fn exec(&self, id: &str, argv: &[String]) -> Result<ExecOutput, RuntimeError> {
        let mut state = self.lock();
        if !lookup(&state, id)?.running {
            return Err(RuntimeError::Operation(format!("container {id} is not running")));
        }
        state.exec_calls.push((id.to_string(), argv.to_vec()));
        Ok(state.exec_result.clone())
    }
}
