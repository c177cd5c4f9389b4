//! Shared fixtures for unit tests.

use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::api::core::v1::{
    Event as KubeEvent, EventSource, Node as KubeNode, NodeStatus, NodeSystemInfo,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use crate::node::Node;
use crate::node_event::NodeEvent;
use crate::store::Store;

pub fn temp_store() -> (Store, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("naro-test.db")).unwrap();
    (store, dir)
}

pub fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2018, 4, 1, 12, 0, 0).unwrap()
}

pub fn fake_kube_node(name: &str, system_uuid: &str) -> KubeNode {
    let mut node = KubeNode::default();
    node.metadata.name = Some(name.to_string());
    node.metadata.creation_timestamp = Some(Time(fixed_time()));
    node.status = Some(NodeStatus {
        node_info: Some(NodeSystemInfo {
            system_uuid: system_uuid.to_string(),
            ..NodeSystemInfo::default()
        }),
        ..NodeStatus::default()
    });
    node
}

pub fn fake_kube_node_event(uid: &str, node_name: &str) -> KubeEvent {
    let mut event = KubeEvent::default();
    event.metadata.uid = Some(uid.to_string());
    event.involved_object.kind = Some("Node".to_string());
    event.involved_object.name = Some(node_name.to_string());
    event.last_timestamp = Some(Time(fixed_time()));
    event.reason = Some("NodeReady".to_string());
    event.type_ = Some("Normal".to_string());
    event.source = Some(EventSource {
        component: Some("kubelet".to_string()),
        ..EventSource::default()
    });
    event
}

pub fn fake_node(id: &str) -> Node {
    Node::from_kube_node(&fake_kube_node("node-a", id)).unwrap()
}

pub fn fake_event_at(id: &str, node_id: &str, created_at: DateTime<Utc>) -> NodeEvent {
    NodeEvent {
        id: id.to_string(),
        node_id: node_id.to_string(),
        created_at,
        involved_object: "Node".to_string(),
        kind: "Event".to_string(),
        reason: String::new(),
        type_: "Normal".to_string(),
        source_component: String::new(),
        source: serde_json::Value::Null,
    }
}

/// An event shaped like the cluster emits it, for extractor tests.
pub fn reason_event(
    id: &str,
    node_id: &str,
    created_at: DateTime<Utc>,
    reason: &str,
    source_component: &str,
) -> NodeEvent {
    let mut event = fake_event_at(id, node_id, created_at);
    event.reason = reason.to_string();
    event.source_component = source_component.to_string();
    event
}
