//! chainward-alerts: the alert pipeline.
//!
//! Alerts are keyed by `(type, node)`. While one is unresolved, raising the
//! same key again returns the existing alert and notifies nobody. New
//! alerts at or above the configured severity fan out to every registered
//! handler, each on its own task; resolutions always fan out.
//!
//! ```text
//! trigger ──▶ dedup (store + transient index) ──▶ persist ──▶ severity gate ──▶ handlers
//! resolve ──▶ mark resolved ─────────────────────────────────────────────────▶ handlers
//! ```

pub mod error;
pub mod handler;
pub mod manager;

pub use error::AlertError;
pub use handler::{AlertEvent, AlertHandler, log_handler};
pub use manager::{AlertFilter, AlertInput, AlertManager};
