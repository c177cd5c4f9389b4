//! redb-backed persistence for nodes and per-node event logs.
//!
//! Layout: a flat `nodes` table (key `node:<id>`, value JSON node) and one
//! table per node named `events:<node_id>` (key `event:<rfc3339>:<event_id>`,
//! value JSON event). The time-prefixed event keys make window queries a
//! seek plus a forward scan.
//!
//! Every operation comes in a standalone form that owns its transaction and
//! a `*_tx` form that runs inside a caller-supplied one. Write transactions
//! commit atomically; dropping one without committing aborts it.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use redb::{Database, ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};
use tracing::debug;

use crate::error::{Error, Result};
use crate::node::{Node, NodeTimePeriodSummary};
use crate::node_event::NodeEvent;

const NODES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

fn events_table_name(node_id: &str) -> String {
    format!("events:{node_id}")
}

/// Durable, transactional store for nodes and their event logs.
pub struct Store {
    db: Database,
}

impl Store {
    /// Opens (creating if necessary) the database at `path`, mode 0600.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| Error::Storage(format!("setting database permissions: {e}")))?;
        }

        let store = Self { db };
        store.initialize_tables()?;
        Ok(store)
    }

    fn initialize_tables(&self) -> Result<()> {
        let txn = self.db.begin_write()?;
        txn.open_table(NODES_TABLE)?;
        txn.commit()?;
        Ok(())
    }

    /// Begins a read-write transaction for use with the `*_tx` methods.
    pub fn begin_write(&self) -> Result<WriteTransaction> {
        Ok(self.db.begin_write()?)
    }

    /// Begins a read-only transaction for use with the `*_tx` methods.
    pub fn begin_read(&self) -> Result<ReadTransaction> {
        Ok(self.db.begin_read()?)
    }

    /// Persists a node. Used for both creates and updates.
    pub fn create_node(&self, node: &Node) -> Result<()> {
        let txn = self.begin_write()?;
        self.create_node_tx(&txn, node)?;
        txn.commit()?;
        Ok(())
    }

    /// Persists a node inside `txn`. Used for both creates and updates.
    pub fn create_node_tx(&self, txn: &WriteTransaction, node: &Node) -> Result<()> {
        node.validate()?;

        let buf = serde_json::to_vec(node)?;
        let mut table = txn.open_table(NODES_TABLE)?;
        table.insert(node.key().as_str(), buf.as_slice())?;
        Ok(())
    }

    /// Fetches a node by id. `None` is returned if the node isn't found;
    /// an empty id is rejected.
    pub fn get_node(&self, node_id: &str) -> Result<Option<Node>> {
        if node_id.is_empty() {
            return Err(Error::validation("invalid node id provided"));
        }

        let txn = self.begin_read()?;
        let table = txn.open_table(NODES_TABLE)?;
        match table.get(Node::key_for(node_id).as_str())? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Fetches a node by id inside a write transaction, so callers can
    /// read-modify-write without a torn view.
    pub fn get_node_tx(&self, txn: &WriteTransaction, node_id: &str) -> Result<Option<Node>> {
        if node_id.is_empty() {
            return Err(Error::validation("invalid node id provided"));
        }

        let table = txn.open_table(NODES_TABLE)?;
        let result = match table.get(Node::key_for(node_id).as_str())? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        };
        result
    }

    /// Deletes a node.
    pub fn delete_node(&self, node: &Node) -> Result<()> {
        let txn = self.begin_write()?;
        self.delete_node_tx(&txn, node)?;
        txn.commit()?;
        Ok(())
    }

    /// Deletes a node inside `txn`.
    pub fn delete_node_tx(&self, txn: &WriteTransaction, node: &Node) -> Result<()> {
        node.validate()?;

        let mut table = txn.open_table(NODES_TABLE)?;
        table.remove(node.key().as_str())?;
        Ok(())
    }

    /// Appends a node event.
    pub fn create_node_event(&self, event: &NodeEvent) -> Result<()> {
        let txn = self.begin_write()?;
        self.create_node_event_tx(&txn, event)?;
        txn.commit()?;
        Ok(())
    }

    /// Appends a node event inside `txn`. The per-node event table is
    /// created lazily on the first event.
    pub fn create_node_event_tx(&self, txn: &WriteTransaction, event: &NodeEvent) -> Result<()> {
        event.validate()?;

        let buf = serde_json::to_vec(event)?;
        let table_name = events_table_name(&event.node_id);
        let mut table = txn.open_table(TableDefinition::<&str, &[u8]>::new(&table_name))?;
        table.insert(event.key().as_str(), buf.as_slice())?;
        Ok(())
    }

    /// Walks all events for a node in key (time) order. A node with no
    /// event table yields zero calls, not an error.
    pub fn walk_node_events<F>(&self, node_id: &str, handler: F) -> Result<()>
    where
        F: FnMut(&NodeEvent) -> Result<()>,
    {
        let txn = self.begin_read()?;
        self.walk_node_events_tx(&txn, node_id, handler)
    }

    /// Walks all events for a node inside `txn`.
    pub fn walk_node_events_tx<F>(
        &self,
        txn: &ReadTransaction,
        node_id: &str,
        mut handler: F,
    ) -> Result<()>
    where
        F: FnMut(&NodeEvent) -> Result<()>,
    {
        let table_name = events_table_name(node_id);
        let table = match txn.open_table(TableDefinition::<&str, &[u8]>::new(&table_name)) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for entry in table.range::<&str>(..)? {
            let (_, value) = entry?;
            let event: NodeEvent = serde_json::from_slice(value.value())?;
            handler(&event)?;
        }
        Ok(())
    }

    /// Returns all events for a node in time order.
    pub fn get_node_events(&self, node_id: &str) -> Result<Vec<NodeEvent>> {
        let mut events = Vec::new();
        self.walk_node_events(node_id, |event| {
            events.push(event.clone());
            Ok(())
        })?;
        Ok(events)
    }

    /// Returns a per-node summary of events observed between `start` and
    /// `end`, for every node with at least one event in the window.
    pub fn get_node_time_period_summaries(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<NodeTimePeriodSummary>> {
        let txn = self.begin_read()?;
        self.get_node_time_period_summaries_tx(&txn, start, end)
    }

    /// Returns per-node summaries for the window inside `txn`.
    pub fn get_node_time_period_summaries_tx(
        &self,
        txn: &ReadTransaction,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<NodeTimePeriodSummary>> {
        let mut summaries = Vec::new();

        let nodes = txn.open_table(NODES_TABLE)?;
        for entry in nodes.range::<&str>(..)? {
            let (_, value) = entry?;
            let node: Node = serde_json::from_slice(value.value())?;
            let events = self.node_events_in_window(txn, &node.id, start, end)?;

            debug!(node = %node, events = events.len(), "collected window summary");

            if !events.is_empty() {
                summaries.push(NodeTimePeriodSummary {
                    node,
                    events,
                    period_start: start,
                    period_end: end,
                });
            }
        }

        Ok(summaries)
    }

    fn node_events_in_window(
        &self,
        txn: &ReadTransaction,
        node_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<NodeEvent>> {
        let table_name = events_table_name(node_id);
        let table = match txn.open_table(TableDefinition::<&str, &[u8]>::new(&table_name)) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let start_key = NodeEvent::key_for(start, "");
        // The extra second compensates for the second-resolution key
        // encoding so events timestamped exactly at `end` are included.
        let end_key = NodeEvent::key_for(end + Duration::seconds(1), "");

        let mut events = Vec::new();
        for entry in table.range(start_key.as_str()..)? {
            let (key, value) = entry?;
            if key.value() > end_key.as_str() {
                break;
            }
            events.push(serde_json::from_slice(value.value())?);
        }
        Ok(events)
    }
}
