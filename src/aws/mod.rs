//! EC2-backed repair strategies.

use async_trait::async_trait;
use aws_sdk_ec2::Client;
use tracing::info;

use crate::error::{Error, Result};
use crate::node::Node;
use crate::repair::RepairStrategy;

/// Repairs a node by rebooting its EC2 instance.
pub struct InstanceRebooter {
    ec2: Client,
}

impl InstanceRebooter {
    pub fn new(ec2: Client) -> Self {
        Self { ec2 }
    }
}

#[async_trait]
impl RepairStrategy for InstanceRebooter {
    async fn repair(&self, node: &Node) -> Result<()> {
        let instance_id = ec2_instance_id(node)?;

        info!(%instance_id, node = %node, "rebooting EC2 instance");

        self.ec2
            .reboot_instances()
            .instance_ids(&instance_id)
            .send()
            .await
            .map_err(|e| Error::CloudApi(format!("rebooting EC2 instance {instance_id}: {e}")))?;

        info!(%instance_id, "successfully requested EC2 instance reboot");

        Ok(())
    }
}

/// The instance id from the stored node snapshot: the legacy
/// `spec.externalID` when present, otherwise the tail of
/// `spec.providerID` (`aws:///us-west-2a/i-0123456789`).
fn ec2_instance_id(node: &Node) -> Result<String> {
    let spec = &node.source["spec"];

    if let Some(id) = spec["externalID"].as_str() {
        if !id.is_empty() {
            return Ok(id.to_string());
        }
    }
    if let Some(provider_id) = spec["providerID"].as_str() {
        if let Some(id) = provider_id.rsplit('/').next() {
            if !id.is_empty() {
                return Ok(id.to_string());
            }
        }
    }

    Err(Error::CloudApi(format!(
        "{node} has no EC2 instance id in its snapshot"
    )))
}
