//! Best-effort sync signals from node log output.
//!
//! Recognised lines (Bitcoin Core and geth style):
//!
//! ```text
//! Pre-synchronizing blockheaders, height: 2000 (~0.22%)
//! Synchronizing blockheaders, height: 812345 (~95.10%)
//! UpdateTip: new best=00…1f height=700123 version=0x20000000 … progress=0.812345 cache=…
//! receive version message: /Satoshi:27.0.0/: version 70016, blocks=840000, us=…, peer=3
//! Imported new chain segment number=19,000,123 hash=… age=3d2h
//! Syncing: chain download in progress synced=45.12% chain=…
//! ```

use chainward_state::SyncStage;
use regex::Regex;

/// Signals extracted from one log line. Every field is optional; an
/// unrelated line yields the default (empty) value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogSignals {
    pub stage: Option<SyncStage>,
    pub stage_height: Option<u64>,
    pub stage_progress_percent: Option<f64>,
    pub block_height: Option<u64>,
    /// Block-sync progress, 0.0–100.0.
    pub progress_percent: Option<f64>,
    pub peer_best_height: Option<u64>,
}

impl LogSignals {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct LogParser {
    presync: Regex,
    headers: Regex,
    update_tip: Regex,
    tip_progress: Regex,
    peer_version: Regex,
    geth_import: Regex,
    geth_synced: Regex,
}

impl LogParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            presync: Regex::new(r"Pre-synchronizing blockheaders, height: (\d+) \(~([\d.]+)%\)")?,
            headers: Regex::new(r"\bSynchronizing blockheaders, height: (\d+) \(~([\d.]+)%\)")?,
            update_tip: Regex::new(r"UpdateTip: .*?\bheight=(\d+)")?,
            tip_progress: Regex::new(r"\bprogress=([\d.]+)")?,
            peer_version: Regex::new(r"version message: .*?\bblocks=(\d+)")?,
            geth_import: Regex::new(r"Imported new chain segment.*?\bnumber=([\d,]+)")?,
            geth_synced: Regex::new(r"\bsynced=([\d.]+)%")?,
        })
    }

    pub fn parse(&self, line: &str) -> LogSignals {
        let mut out = LogSignals::default();

        if let Some(c) = self.presync.captures(line) {
            out.stage = Some(SyncStage::HeadersPresync);
            out.stage_height = c.get(1).and_then(|m| m.as_str().parse().ok());
            out.stage_progress_percent = c.get(2).and_then(|m| m.as_str().parse().ok());
            return out;
        }
        if let Some(c) = self.headers.captures(line) {
            out.stage = Some(SyncStage::Headers);
            out.stage_height = c.get(1).and_then(|m| m.as_str().parse().ok());
            out.stage_progress_percent = c.get(2).and_then(|m| m.as_str().parse().ok());
            return out;
        }
        if let Some(c) = self.update_tip.captures(line) {
            out.stage = Some(SyncStage::Blocks);
            out.block_height = c.get(1).and_then(|m| m.as_str().parse().ok());
            out.progress_percent = self
                .tip_progress
                .captures(line)
                .and_then(|p| p.get(1))
                .and_then(|m| m.as_str().parse::<f64>().ok())
                .map(|f| (f * 100.0).clamp(0.0, 100.0));
            return out;
        }
        if let Some(c) = self.peer_version.captures(line) {
            out.peer_best_height = c.get(1).and_then(|m| m.as_str().parse().ok());
            return out;
        }
        if let Some(c) = self.geth_import.captures(line) {
            out.stage = Some(SyncStage::Blocks);
            out.block_height = c.get(1).and_then(|m| m.as_str().replace(',', "").parse().ok());
        }
        if let Some(c) = self.geth_synced.captures(line) {
            out.progress_percent = c
                .get(1)
                .and_then(|m| m.as_str().parse::<f64>().ok())
                .map(|p| p.clamp(0.0, 100.0));
        }
        out
    }
}
