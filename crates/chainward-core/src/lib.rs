//! chainward-core: shared types for the chainward node supervisor.
//!
//! Holds the pieces every other crate agrees on: node modes and port
//! sets, the read-only template catalog, the `chainward.toml` config
//! model, and small helpers for durations, ids and timestamps.

pub mod catalog;
pub mod clock;
pub mod config;
pub mod duration;
pub mod id;
pub mod types;

pub use catalog::{
    ChainSpec, DATA_DIR_PLACEHOLDER, HealthCheck, ProbeKind, PruneRoutine, Requirements,
    StaticCatalog, Template, TemplateCatalog,
};
pub use config::ChainwardConfig;
pub use duration::parse_duration;
pub use types::*;
