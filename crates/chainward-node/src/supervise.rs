//! Per-run supervision: a log tail and an RPC probe loop.
//!
//! Both tasks stop on the shared `watch` signal. They report into the
//! manager tagged with the run number they were started for, so a late
//! report from a previous run is ignored.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::manager::NodeManager;
use crate::probe::ProbeTarget;

pub(crate) struct Supervisor {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Supervisor {
    /// Ask both tasks to finish on their own.
    pub(crate) fn signal(self) {
        let _ = self.shutdown.send(true);
    }

    /// Signal and abort both tasks.
    pub(crate) fn stop(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            handle.abort();
        }
    }
}

pub(crate) struct RunContext {
    pub id: String,
    pub container_id: String,
    pub run: u64,
    pub target: ProbeTarget,
    pub interval: Duration,
    pub probe_timeout: Duration,
}

pub(crate) fn spawn(manager: NodeManager, ctx: RunContext) -> Supervisor {
    let (tx, rx) = watch::channel(false);
    let logs = tokio::spawn(tail_logs(
        manager.clone(),
        ctx.id.clone(),
        ctx.container_id.clone(),
        ctx.run,
        rx.clone(),
    ));
    let probe = tokio::spawn(probe_loop(manager, ctx, rx));
    Supervisor {
        shutdown: tx,
        handles: vec![logs, probe],
    }
}

async fn tail_logs(
    manager: NodeManager,
    id: String,
    container_id: String,
    run: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut lines = match manager.runtime().logs(&container_id).await {
        Ok(lines) => lines,
        Err(e) => {
            warn!(node_id = %id, error = %e, "cannot follow container logs");
            return;
        }
    };
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            next = lines.next() => match next {
                Some(Ok(line)) => manager.ingest_log(&id, run, line).await,
                Some(Err(e)) => debug!(node_id = %id, error = %e, "log stream error"),
                None => {
                    debug!(node_id = %id, "log stream ended");
                    manager.check_exit(&id, run, &container_id).await;
                    break;
                }
            },
        }
    }
}

async fn probe_loop(manager: NodeManager, ctx: RunContext, mut shutdown: watch::Receiver<bool>) {
    debug!(node_id = %ctx.id, addr = %ctx.target.addr, kind = ?ctx.target.kind, "probe loop starting");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(ctx.interval) => {}
            _ = shutdown.changed() => break,
        }

        match tokio::time::timeout(ctx.probe_timeout, manager.probe().probe(&ctx.target)).await {
            Ok(Ok(report)) => manager.apply_probe(&ctx.id, ctx.run, report).await,
            Ok(Err(e)) => {
                debug!(node_id = %ctx.id, error = %e, "probe failed");
                if manager.check_exit(&ctx.id, ctx.run, &ctx.container_id).await {
                    break;
                }
            }
            Err(_) => {
                debug!(node_id = %ctx.id, timeout = ?ctx.probe_timeout, "probe timed out");
                if manager.check_exit(&ctx.id, ctx.run, &ctx.container_id).await {
                    break;
                }
            }
        }
    }
    debug!(node_id = %ctx.id, "probe loop stopped");
}
