//! The no-schedule repair taint.

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Node as KubeNode, Taint};
use kube::api::PostParams;
use kube::{Api, Client};

use crate::error::{Error, Result};
use crate::node::Node;
use crate::repair::NodeTainter;

/// Taint key marking a node as under repair. Its presence keeps new pods
/// from being scheduled onto the node.
pub const REPAIR_TAINT: &str = "RepairingWithNodeAutoRepairOperator";

/// Adds and removes the repair taint through the cluster API, always
/// operating on a freshly fetched copy of the node.
pub struct RepairTainter {
    client: Client,
}

impl RepairTainter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn fresh_node(&self, name: &str) -> Result<KubeNode> {
        let nodes: Api<KubeNode> = Api::all(self.client.clone());
        nodes
            .get(name)
            .await
            .map_err(|e| Error::ClusterApi(format!("failed to get node {name}: {e}")))
    }

    async fn replace_node(&self, name: &str, node: &KubeNode) -> Result<()> {
        let nodes: Api<KubeNode> = Api::all(self.client.clone());
        nodes.replace(name, &PostParams::default(), node).await?;
        Ok(())
    }
}

#[async_trait]
impl NodeTainter for RepairTainter {
    async fn taint(&self, node: &Node) -> Result<()> {
        let mut fresh = self.fresh_node(&node.name).await?;
        if !add_repair_taint(&mut fresh) {
            return Ok(());
        }
        self.replace_node(&node.name, &fresh).await
    }

    async fn remove_taint(&self, node: &Node) -> Result<()> {
        let mut fresh = self.fresh_node(&node.name).await?;
        if !remove_repair_taints(&mut fresh) {
            return Ok(());
        }
        self.replace_node(&node.name, &fresh).await
    }
}

/// Adds the repair taint, returning whether the node changed. Idempotent:
/// an already-tainted node is left alone.
fn add_repair_taint(node: &mut KubeNode) -> bool {
    let spec = node.spec.get_or_insert_with(Default::default);
    let taints = spec.taints.get_or_insert_with(Vec::new);
    if taints.iter().any(|t| t.key == REPAIR_TAINT) {
        return false;
    }
    taints.push(Taint {
        key: REPAIR_TAINT.to_string(),
        value: Some(Utc::now().timestamp().to_string()),
        effect: "NoSchedule".to_string(),
        time_added: None,
    });
    true
}

/// Strips every repair taint, returning whether the node changed.
fn remove_repair_taints(node: &mut KubeNode) -> bool {
    let Some(taints) = node.spec.as_mut().and_then(|s| s.taints.as_mut()) else {
        return false;
    };
    let before = taints.len();
    taints.retain(|t| t.key != REPAIR_TAINT);
    taints.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taint_keys(node: &KubeNode) -> Vec<String> {
        node.spec
            .as_ref()
            .and_then(|s| s.taints.as_ref())
            .map(|taints| taints.iter().map(|t| t.key.clone()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_add_repair_taint() {
        let mut node = KubeNode::default();
        assert!(add_repair_taint(&mut node));
        assert_eq!(taint_keys(&node), vec![REPAIR_TAINT]);

        let taint = &node.spec.as_ref().unwrap().taints.as_ref().unwrap()[0];
        assert_eq!(taint.effect, "NoSchedule");
        let value = taint.value.as_deref().unwrap();
        assert!(value.parse::<i64>().is_ok());
    }

    #[test]
    fn test_add_repair_taint_is_idempotent() {
        let mut node = KubeNode::default();
        assert!(add_repair_taint(&mut node));
        assert!(!add_repair_taint(&mut node));
        assert_eq!(taint_keys(&node), vec![REPAIR_TAINT]);
    }

    #[test]
    fn test_remove_repair_taints_keeps_other_taints() {
        let mut node = KubeNode::default();
        add_repair_taint(&mut node);
        node.spec
            .as_mut()
            .unwrap()
            .taints
            .as_mut()
            .unwrap()
            .push(Taint {
                key: "dedicated".to_string(),
                value: Some("batch".to_string()),
                effect: "NoSchedule".to_string(),
                time_added: None,
            });

        assert!(remove_repair_taints(&mut node));
        assert_eq!(taint_keys(&node), vec!["dedicated"]);
    }

    #[test]
    fn test_remove_repair_taints_without_taints() {
        let mut node = KubeNode::default();
        assert!(!remove_repair_taints(&mut node));
    }
}
