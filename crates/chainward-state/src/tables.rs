//! redb table definitions.
//!
//! Both tables use `&str` keys (the record id) and `&[u8]` JSON values.

use redb::TableDefinition;

/// Shape shared by every table in the store.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Node records keyed by node id.
pub const NODES: JsonTable = TableDefinition::new("nodes");

/// Alerts keyed by alert id.
pub const ALERTS: JsonTable = TableDefinition::new("alerts");
