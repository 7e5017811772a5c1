//! Combining log and RPC sync signals.
//!
//! Log lines give an early estimate before RPC is reachable. The first
//! successful probe makes RPC authoritative for the rest of the run; from
//! then on log-derived numbers are ignored.

use chainward_state::{NodeState, SyncSource};

use crate::logparse::LogSignals;
use crate::probe::ProbeReport;

#[derive(Debug, Clone)]
pub struct SyncTracker {
    tolerance: u64,
    rpc_authoritative: bool,
}

impl SyncTracker {
    pub fn new(tolerance_blocks: u64) -> Self {
        Self {
            tolerance: tolerance_blocks,
            rpc_authoritative: false,
        }
    }

    pub fn rpc_authoritative(&self) -> bool {
        self.rpc_authoritative
    }

    /// Apply log-derived signals. Returns whether the line showed this
    /// node's own progress; a peer's announced height alone does not count.
    pub fn apply_log(&mut self, signals: &LogSignals, state: &mut NodeState) -> bool {
        if self.rpc_authoritative || signals.is_empty() {
            return false;
        }
        let progressed = signals.stage.is_some()
            || signals.block_height.is_some()
            || signals.progress_percent.is_some();
        if let Some(stage) = signals.stage {
            state.sync_stage = Some(stage);
        }
        if let Some(h) = signals.block_height {
            state.block_height = Some(h);
        }
        if let Some(p) = signals.progress_percent {
            state.sync_progress = p;
        }
        if let Some(best) = signals.peer_best_height {
            state.peer_best_height = Some(state.peer_best_height.map_or(best, |b| b.max(best)));
        }
        state.sync_source = Some(SyncSource::Log);
        progressed
    }

    /// Apply a successful probe and report whether the node is in sync.
    pub fn apply_probe(&mut self, report: &ProbeReport, state: &mut NodeState) -> bool {
        self.rpc_authoritative = true;
        let synced = self.is_synced(report);

        state.sync_source = Some(SyncSource::Rpc);
        state.sync_stage = None;
        state.block_height = report.height.or(state.block_height);
        state.peer_best_height = report.peer_best;
        if report.peers.is_some() {
            state.peers = report.peers;
        }
        state.sync_progress = if synced {
            100.0
        } else {
            report
                .progress
                .or_else(|| match (report.height, report.peer_best) {
                    (Some(h), Some(p)) if p > 0 => Some(h as f64 / p as f64 * 100.0),
                    _ => None,
                })
                .map(|p| p.clamp(0.0, 100.0))
                .unwrap_or(state.sync_progress)
        };
        synced
    }

    /// An explicit verdict wins; otherwise the height must be within
    /// tolerance of the best height peers know about.
    pub fn is_synced(&self, report: &ProbeReport) -> bool {
        if let Some(explicit) = report.synced {
            return explicit;
        }
        match (report.height, report.peer_best) {
            (Some(h), Some(best)) if best > 0 => best.saturating_sub(h) <= self.tolerance,
            _ => false,
        }
    }
}
