//! Node metadata and windowed event summaries.

use std::fmt;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node as KubeNode;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::node_event::NodeEvent;

/// States of the node repair state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepairStatus {
    #[default]
    Healthy,
    InProgress,
    Failed,
}

impl fmt::Display for RepairStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RepairStatus::Healthy => "healthy",
            RepairStatus::InProgress => "in-progress",
            RepairStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Metadata about a Kubernetes node, keyed by its stable system UUID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub repaired_at: Option<DateTime<Utc>>,
    /// Snapshot of the upstream node object, kept opaque so the on-disk
    /// format does not couple to upstream schema changes.
    #[serde(default)]
    pub source: serde_json::Value,
    #[serde(default)]
    pub repair_status: RepairStatus,
    #[serde(default)]
    pub repair_configuration_name: String,
    #[serde(default)]
    pub repair_configuration_version: String,
    #[serde(default)]
    pub repair_stage: usize,
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.id)
    }
}

impl Node {
    /// Builds a `Node` from the upstream Kubernetes object.
    ///
    /// The system UUID is used as the identifier; the machine-id is not
    /// unique between instances that share an image.
    pub fn from_kube_node(node: &KubeNode) -> Result<Self> {
        let id = node
            .status
            .as_ref()
            .and_then(|s| s.node_info.as_ref())
            .map(|info| info.system_uuid.clone())
            .unwrap_or_default();
        let name = node.metadata.name.clone().unwrap_or_default();
        let created_at = node
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .unwrap_or(DateTime::UNIX_EPOCH);

        Ok(Self {
            id,
            name,
            created_at,
            repaired_at: None,
            source: serde_json::to_value(node)?,
            repair_status: RepairStatus::Healthy,
            repair_configuration_name: String::new(),
            repair_configuration_version: String::new(),
            repair_stage: 0,
        })
    }

    /// The store key for a node id.
    pub fn key_for(node_id: &str) -> String {
        format!("node:{node_id}")
    }

    /// The store key for this node.
    pub fn key(&self) -> String {
        Node::key_for(&self.id)
    }

    /// Ensures the node is persistable.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::validation("Node is missing an id"));
        }
        if self.created_at == DateTime::UNIX_EPOCH {
            return Err(Error::validation("Node is missing a creation timestamp"));
        }
        Ok(())
    }
}

/// All events observed for a node within a time period. Transient; never
/// persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTimePeriodSummary {
    pub node: Node,
    pub events: Vec<NodeEvent>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

impl NodeTimePeriodSummary {
    /// Drops events that occurred at or before the node's last repair, so
    /// a recently repaired node is not re-flagged for anomalies that
    /// preceded the repair. In-memory only; stored events are untouched.
    pub fn remove_older_repaired_events(&mut self) {
        if let Some(repaired_at) = self.node.repaired_at {
            self.events.retain(|event| event.created_at > repaired_at);
        }
    }
}
