//! Node events observed from the cluster's event stream.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::Event as KubeEvent;
use k8s_openapi::Resource;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::node::Node;

/// A single node-scoped event, identified by the upstream event's UID.
/// Events are append-only; the store never mutates one in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEvent {
    pub id: String,
    pub node_id: String,
    pub created_at: DateTime<Utc>,
    pub involved_object: String,
    pub kind: String,
    pub reason: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub source_component: String,
    /// Snapshot of the upstream event object, kept opaque.
    #[serde(default)]
    pub source: serde_json::Value,
}

impl fmt::Display for NodeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeEvent({})", self.id)
    }
}

impl NodeEvent {
    /// Builds a `NodeEvent` from the upstream Kubernetes event, using the
    /// event's UID as the id and its last-observed timestamp as
    /// `created_at`.
    pub fn from_kube_event(node: &Node, event: &KubeEvent) -> Result<Self> {
        Ok(Self {
            id: event.metadata.uid.clone().unwrap_or_default(),
            node_id: node.id.clone(),
            created_at: event
                .last_timestamp
                .as_ref()
                .map(|t| t.0)
                .unwrap_or(DateTime::UNIX_EPOCH),
            involved_object: event.involved_object.kind.clone().unwrap_or_default(),
            kind: KubeEvent::KIND.to_string(),
            reason: event.reason.clone().unwrap_or_default(),
            type_: event.type_.clone().unwrap_or_default(),
            source_component: event
                .source
                .as_ref()
                .and_then(|s| s.component.clone())
                .unwrap_or_default(),
            source: serde_json::to_value(event)?,
        })
    }

    /// The store key for an event timestamp and id. The RFC 3339 prefix
    /// makes keys sort by time, so range seeks are a prefix scan.
    pub fn key_for(created_at: DateTime<Utc>, event_id: &str) -> String {
        format!(
            "event:{}:{event_id}",
            created_at
                .with_timezone(&Utc)
                .to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }

    /// The store key for this event.
    pub fn key(&self) -> String {
        NodeEvent::key_for(self.created_at, &self.id)
    }

    /// Ensures the event is persistable.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::validation("NodeEvent is missing an id"));
        }
        if self.node_id.is_empty() {
            return Err(Error::validation("NodeEvent is missing a node id"));
        }
        if self.created_at == DateTime::UNIX_EPOCH {
            return Err(Error::validation(
                "NodeEvent is missing a creation timestamp",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use chrono::TimeZone;

    #[test]
    fn test_event_key_is_time_prefixed() {
        let created_at = Utc.with_ymd_and_hms(2018, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            NodeEvent::key_for(created_at, "u1"),
            "event:2018-01-02T03:04:05Z:u1"
        );
    }

    #[test]
    fn test_event_keys_sort_by_time() {
        let early = Utc.with_ymd_and_hms(2018, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2018, 6, 1, 0, 0, 0).unwrap();
        assert!(NodeEvent::key_for(early, "zzz") < NodeEvent::key_for(late, "aaa"));
    }

    #[test]
    fn test_from_kube_event() {
        let node = testutil::fake_node("sys-uuid-a");
        let kube_event = testutil::fake_kube_node_event("u1", "node-a");
        let event = NodeEvent::from_kube_event(&node, &kube_event).unwrap();

        assert_eq!(event.id, "u1");
        assert_eq!(event.node_id, "sys-uuid-a");
        assert_eq!(event.involved_object, "Node");
        assert_eq!(event.kind, "Event");
        assert_eq!(event.reason, "NodeReady");
        assert_eq!(event.source_component, "kubelet");
        event.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        let now = Utc::now();

        let mut event = testutil::fake_event_at("u1", "sys-uuid-a", now);
        event.id = String::new();
        assert!(matches!(event.validate(), Err(Error::Validation(_))));

        let mut event = testutil::fake_event_at("u1", "sys-uuid-a", now);
        event.node_id = String::new();
        assert!(matches!(event.validate(), Err(Error::Validation(_))));

        let mut event = testutil::fake_event_at("u1", "sys-uuid-a", now);
        event.created_at = DateTime::UNIX_EPOCH;
        assert!(matches!(event.validate(), Err(Error::Validation(_))));
    }
}
