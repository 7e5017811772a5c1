//! chainward-state: persisted node records and alert history.
//!
//! Backed by [redb](https://docs.rs/redb). Values are JSON documents keyed
//! by id, in two tables: `nodes` and `alerts`. Alerts are never deleted;
//! resolving one rewrites it in place.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (an `Arc<Database>`) and
//! is handed explicitly to every subsystem that needs it.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
