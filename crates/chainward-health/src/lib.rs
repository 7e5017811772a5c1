//! chainward-health: periodic health monitoring and disk remediation.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor (every health.interval)
//!   ├── system_readings() ── CPU_HIGH / MEMORY_CRITICAL / DISK_FULL
//!   ├── NodeWatch per node
//!   │   ├── is_down()    ── NODE_DOWN after down_grace in stopped/error
//!   │   └── is_stalled() ── SYNC_DELAYED after stall_window of flat progress
//!   └── NodeManager::refresh_metrics() for active nodes
//!
//! PruningScheduler (every pruning.interval)
//!   └── disk over threshold ── DISK_FULL(node) ── prune routine ── resolve
//! ```
//!
//! Both loops log and swallow per-check failures; a bad tick never stops
//! the next one.

pub mod checker;
pub mod monitor;
pub mod pruning;

pub use checker::{Edge, NodeWatch, Signal, SystemReading, system_readings};
pub use monitor::HealthMonitor;
pub use pruning::{PruneError, PruneReport, PruningScheduler, run_routine};
