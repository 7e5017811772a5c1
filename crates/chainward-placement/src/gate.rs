//! Pre-flight resource gate.
//!
//! A node may only be created or started when its chain declares the
//! requested mode, a template provides a runnable image for it, and the
//! host has the disk and memory the template asks for.

use std::path::PathBuf;
use std::sync::Arc;

use chainward_core::{NodeMode, TemplateCatalog};
use serde::Serialize;
use tracing::debug;

use crate::host::HostProbe;

/// Why a node cannot run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateFailure {
    UnknownChain,
    ModeUnsupported,
    NoImage,
    Disk { available_gb: f64, required_gb: f64 },
    Memory { total_gb: f64, required_gb: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateVerdict {
    pub can_run: bool,
    pub reason: Option<String>,
    pub warning: Option<String>,
    pub failure: Option<GateFailure>,
}

impl GateVerdict {
    fn pass(warning: Option<String>) -> Self {
        Self {
            can_run: true,
            reason: None,
            warning,
            failure: None,
        }
    }

    fn fail(failure: GateFailure, reason: String) -> Self {
        Self {
            can_run: false,
            reason: Some(reason),
            warning: None,
            failure: Some(failure),
        }
    }
}

#[derive(Clone)]
pub struct ResourceGate {
    catalog: Arc<dyn TemplateCatalog>,
    host: Arc<dyn HostProbe>,
    data_root: PathBuf,
}

impl ResourceGate {
    pub fn new(catalog: Arc<dyn TemplateCatalog>, host: Arc<dyn HostProbe>, data_root: PathBuf) -> Self {
        Self {
            catalog,
            host,
            data_root,
        }
    }

    /// Modes of `blockchain` that are declared supported and have a runnable image.
    pub fn supported_modes(&self, blockchain: &str) -> Vec<NodeMode> {
        let Some(chain) = self.catalog.chain(blockchain) else {
            return Vec::new();
        };
        chain
            .modes
            .iter()
            .copied()
            .filter(|mode| {
                self.catalog
                    .template(blockchain, *mode)
                    .is_some_and(|t| t.is_runnable())
            })
            .collect()
    }

    pub fn can_run(&self, blockchain: &str, mode: NodeMode) -> GateVerdict {
        let verdict = self.evaluate(blockchain, mode);
        debug!(blockchain, %mode, can_run = verdict.can_run, reason = ?verdict.reason, "resource gate");
        verdict
    }

    fn evaluate(&self, blockchain: &str, mode: NodeMode) -> GateVerdict {
        let Some(chain) = self.catalog.chain(blockchain) else {
            return GateVerdict::fail(
                GateFailure::UnknownChain,
                format!("unknown blockchain '{blockchain}'"),
            );
        };
        if !chain.modes.contains(&mode) {
            return GateVerdict::fail(
                GateFailure::ModeUnsupported,
                format!("{} does not support {mode} mode", chain.name),
            );
        }
        let Some(template) = self
            .catalog
            .template(blockchain, mode)
            .filter(|t| t.is_runnable())
        else {
            return GateVerdict::fail(
                GateFailure::NoImage,
                format!("no runnable image for {} in {mode} mode", chain.name),
            );
        };

        let req = template.requirements;
        let host = self.host.sample(&self.data_root);

        if host.disk_available_gb < req.disk_gb {
            return GateVerdict::fail(
                GateFailure::Disk {
                    available_gb: host.disk_available_gb,
                    required_gb: req.disk_gb,
                },
                format!(
                    "insufficient disk: {:.1} GB available, {:.1} GB required",
                    host.disk_available_gb, req.disk_gb
                ),
            );
        }
        // Total rather than available memory: available fluctuates too much
        // to refuse on.
        if host.memory_total_gb < req.memory_gb {
            return GateVerdict::fail(
                GateFailure::Memory {
                    total_gb: host.memory_total_gb,
                    required_gb: req.memory_gb,
                },
                format!(
                    "insufficient memory: {:.1} GB total, {:.1} GB required",
                    host.memory_total_gb, req.memory_gb
                ),
            );
        }

        let warning = (host.memory_available_gb < req.memory_gb * 0.5).then(|| {
            format!(
                "low available memory: {:.1} GB free, {:.1} GB recommended",
                host.memory_available_gb, req.memory_gb
            )
        });
        GateVerdict::pass(warning)
    }
}
