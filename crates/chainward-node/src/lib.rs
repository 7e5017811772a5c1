//! chainward-node: the node lifecycle.
//!
//! A node is a blockchain client running in a container. This crate owns
//! its state machine:
//!
//! ```text
//!            start                 log/probe            synced
//! stopped ─────────▶ starting ─────────────▶ syncing ─────────▶ ready
//!    ▲                  │                      ▲                 │
//!    │ stop             │ exit / failure       └──── behind ─────┘
//!    └── stopping ◀─────┴──────────▶ error
//! ```
//!
//! Sync progress comes from two sources: regex-parsed container logs
//! early on, then RPC probes, which take over once the first one succeeds.

pub mod error;
pub mod events;
pub mod logparse;
pub mod manager;
pub mod mounts;
pub mod naming;
pub mod probe;
pub mod retry;
mod supervise;
pub mod sync;

pub use error::{NodeError, NodeResult};
pub use events::{EventBus, NodeEvent};
pub use logparse::{LogParser, LogSignals};
pub use manager::{CreateRequest, ManagerDeps, ManagerSettings, NodeManager};
pub use probe::{ProbeError, ProbeReport, ProbeTarget, RpcProbe, ScriptedProbe, SyncProbe};
pub use retry::Backoff;
pub use sync::SyncTracker;
