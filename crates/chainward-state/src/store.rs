//! StateStore: redb-backed persistence for node records and alerts.
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(ALERTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put<T: Serialize>(
        &self,
        table: JsonTable,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Encode))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(
        &self,
        table: JsonTable,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Decode))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(
        &self,
        table: JsonTable,
        mut keep: impl FnMut(&T) -> bool,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let item: T = serde_json::from_slice(value.value()).map_err(map_err!(Decode))?;
            if keep(&item) {
                results.push(item);
            }
        }
        Ok(results)
    }

    fn remove(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update a node record.
    pub fn put_node(&self, node: &NodeRecord) -> StateResult<()> {
        self.put(NODES, &node.id, node)?;
        debug!(node_id = %node.id, status = %node.status, "node record stored");
        Ok(())
    }

    /// Get a node record by id.
    pub fn get_node(&self, node_id: &str) -> StateResult<Option<NodeRecord>> {
        self.get(NODES, node_id)
    }

    /// List all node records.
    pub fn list_nodes(&self) -> StateResult<Vec<NodeRecord>> {
        self.scan(NODES, |_: &NodeRecord| true)
    }

    /// Delete a node record. Returns true if it existed.
    pub fn delete_node(&self, node_id: &str) -> StateResult<bool> {
        let existed = self.remove(NODES, node_id)?;
        debug!(%node_id, existed, "node record deleted");
        Ok(existed)
    }

    // ── Alerts ─────────────────────────────────────────────────────

    /// Insert or update an alert.
    pub fn put_alert(&self, alert: &Alert) -> StateResult<()> {
        self.put(ALERTS, &alert.id, alert)?;
        debug!(alert_id = %alert.id, alert_type = %alert.alert_type, resolved = alert.resolved, "alert stored");
        Ok(())
    }

    /// Get an alert by id.
    pub fn get_alert(&self, alert_id: &str) -> StateResult<Option<Alert>> {
        self.get(ALERTS, alert_id)
    }

    /// List all alerts, oldest first.
    pub fn list_alerts(&self) -> StateResult<Vec<Alert>> {
        let mut alerts = self.scan(ALERTS, |_: &Alert| true)?;
        alerts.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(alerts)
    }

    /// List unresolved alerts.
    pub fn list_unresolved_alerts(&self) -> StateResult<Vec<Alert>> {
        self.scan(ALERTS, |a: &Alert| !a.resolved)
    }

    /// Find the unresolved alert for a (type, node) key, if any.
    pub fn find_unresolved_alert(
        &self,
        alert_type: AlertType,
        node_id: Option<&str>,
    ) -> StateResult<Option<Alert>> {
        let mut matches =
            self.scan(ALERTS, |a: &Alert| !a.resolved && a.matches(alert_type, node_id))?;
        // Oldest wins if a concurrent trigger ever produced two.
        matches.sort_by_key(|a| a.timestamp);
        Ok(matches.into_iter().next())
    }
}
