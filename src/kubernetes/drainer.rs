//! Bounded eviction of all workloads from a node.
//!
//! The eviction schedule follows the cluster-autoscaler's scale-down
//! behavior: fan out one eviction task per pod with a per-pod retry loop,
//! bound the whole fan-out, then poll until every pod is actually gone.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, EvictParams, ListParams};
use kube::{Api, Client};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::kubernetes::error::DrainError;
use crate::node::Node;
use crate::repair::NodeDrainer;

/// Extra wait to catch pods that ignore SIGTERM and are killed with
/// SIGKILL after the graceful termination window.
pub const POD_EVICTION_HEADROOM: Duration = Duration::from_secs(30);

/// Maximum time to keep retrying one pod's eviction before giving up.
pub const MAX_POD_EVICTION_TIME: Duration = Duration::from_secs(2 * 60);

/// Delay between failed eviction attempts for one pod.
pub const EVICTION_RETRY_TIME: Duration = Duration::from_secs(10);

/// Maximum graceful termination grace period, in seconds.
pub const MAX_GRACEFUL_TERMINATION_SEC: i64 = 60 * 30;

const DEFAULT_TERMINATION_GRACE_PERIOD_SEC: i64 = 30;
const GONE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Drains a node by evicting every pod bound to it.
pub struct EvictionDrainer {
    client: Client,
}

impl EvictionDrainer {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn pods_on_node(&self, node: &Node) -> std::result::Result<Vec<Pod>, DrainError> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={}", node.name));
        let list = pods
            .list(&params)
            .await
            .map_err(|e| DrainError::api_call(format!("error listing pods for {node}: {e}")))?;
        Ok(list.items)
    }

    async fn drain_pods(&self, node: &Node, pods: Vec<Pod>) -> std::result::Result<(), DrainError> {
        let retry_until = Instant::now() + MAX_POD_EVICTION_TIME;

        let mut evictions = JoinSet::new();
        for pod in pods.clone() {
            let client = self.client.clone();
            evictions.spawn(async move { evict_pod(client, pod, retry_until).await });
        }

        let collect_confirmations = async {
            let mut errors = Vec::new();
            while let Some(joined) = evictions.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => errors.push(e),
                    Err(e) => {
                        errors.push(DrainError::internal(format!("eviction task failed: {e}")));
                    }
                }
            }
            errors
        };
        let errors = tokio::time::timeout(
            MAX_POD_EVICTION_TIME + Duration::from_secs(5),
            collect_confirmations,
        )
        .await
        .map_err(|_| {
            DrainError::api_call(format!(
                "failed to drain {node}: timeout when waiting for creating evictions"
            ))
        })?;

        if !errors.is_empty() {
            let details: Vec<String> = errors.iter().map(ToString::to_string).collect();
            return Err(DrainError::api_call(format!(
                "failed to drain {node}, due to following errors: {details:?}"
            )));
        }

        // Evictions were accepted; wait for the pods to really disappear.
        let poll_until = Instant::now()
            + Duration::from_secs(MAX_GRACEFUL_TERMINATION_SEC as u64)
            + POD_EVICTION_HEADROOM;
        while Instant::now() < poll_until {
            if self.all_pods_gone(&pods).await {
                info!(node = %node, "all pods removed");
                return Ok(());
            }
            tokio::time::sleep(GONE_POLL_INTERVAL).await;
        }

        Err(DrainError::transient(format!(
            "failed to drain {node}: pods remaining after timeout"
        )))
    }

    /// A pod is gone iff fetching it returns not-found; any other state or
    /// error counts as still present.
    async fn all_pods_gone(&self, pods: &[Pod]) -> bool {
        for pod in pods {
            let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
            let name = pod.metadata.name.as_deref().unwrap_or_default();
            let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
            match api.get(name).await {
                Ok(_) => {
                    warn!(pod = %name, namespace = %namespace, "pod not deleted yet");
                    return false;
                }
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => {
                    error!(
                        pod = %name,
                        namespace = %namespace,
                        error = %e,
                        "failed to check pod"
                    );
                    return false;
                }
            }
        }
        true
    }
}

#[async_trait]
impl NodeDrainer for EvictionDrainer {
    async fn drain(&self, node: &Node) -> Result<()> {
        let pods = self.pods_on_node(node).await?;
        self.drain_pods(node, pods).await?;
        Ok(())
    }
}

/// The grace period to send with an eviction: the pod's own when it is
/// shorter than the cap, the cap otherwise.
fn eviction_grace_period(pod: &Pod) -> i64 {
    match pod
        .spec
        .as_ref()
        .and_then(|s| s.termination_grace_period_seconds)
    {
        Some(grace) if grace < MAX_GRACEFUL_TERMINATION_SEC => grace,
        Some(_) => MAX_GRACEFUL_TERMINATION_SEC,
        None => DEFAULT_TERMINATION_GRACE_PERIOD_SEC,
    }
}

/// Evicts one pod, retrying until success, not-found, or `retry_until`.
async fn evict_pod(
    client: Client,
    pod: Pod,
    retry_until: Instant,
) -> std::result::Result<(), DrainError> {
    let namespace = pod
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());
    let name = pod.metadata.name.clone().unwrap_or_default();

    let api: Api<Pod> = Api::namespaced(client, &namespace);
    let params = EvictParams {
        delete_options: Some(DeleteParams {
            grace_period_seconds: Some(eviction_grace_period(&pod) as u32),
            ..DeleteParams::default()
        }),
        ..EvictParams::default()
    };

    let mut last_error = None;
    let mut first = true;
    while first || Instant::now() < retry_until {
        if !first {
            tokio::time::sleep(EVICTION_RETRY_TIME).await;
        }
        first = false;

        match api.evict(&name, &params).await {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
            Err(e) => last_error = Some(e),
        }
    }

    error!(pod = %name, namespace = %namespace, error = ?last_error, "failed to evict pod");
    Err(DrainError::api_call(format!(
        "failed to evict pod {namespace}/{name} within allowed timeout (last error: {last_error:?})"
    )))
}
