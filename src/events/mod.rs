//! Cluster event ingestion: a watcher-backed emitter distributes node
//! events to handlers, and the ingestion controller persists each one
//! alongside its node in a single transaction.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Event as KubeEvent, Node as KubeNode};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::node::Node;
use crate::node_event::NodeEvent;
use crate::store::Store;

const NODE_EVENT_KIND: &str = "Node";

/// Ingests one upstream node event.
#[async_trait]
pub trait KubeNodeEventHandler: Send + Sync {
    async fn handle_kube_node_event(&self, event: &KubeEvent) -> Result<()>;
}

/// Fetches the current upstream node object by name.
#[async_trait]
pub trait NodeFetcher: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<KubeNode>;
}

/// `NodeFetcher` backed by the cluster API.
pub struct ClusterNodeFetcher {
    client: Client,
}

impl ClusterNodeFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeFetcher for ClusterNodeFetcher {
    async fn get_node(&self, name: &str) -> Result<KubeNode> {
        let nodes: Api<KubeNode> = Api::all(self.client.clone());
        Ok(nodes.get(name).await?)
    }
}

/// Persists each incoming node event, creating the node record on first
/// sight.
pub struct NodeEventController {
    fetcher: Arc<dyn NodeFetcher>,
    store: Arc<Store>,
}

impl NodeEventController {
    pub fn new(fetcher: Arc<dyn NodeFetcher>, store: Arc<Store>) -> Self {
        Self { fetcher, store }
    }
}

#[async_trait]
impl KubeNodeEventHandler for NodeEventController {
    async fn handle_kube_node_event(&self, event: &KubeEvent) -> Result<()> {
        let node_name = event.involved_object.name.clone().unwrap_or_default();
        // TODO: cache this lookup; one node fetch per event is expensive.
        let kube_node = self.fetcher.get_node(&node_name).await?;
        let derived = Node::from_kube_node(&kube_node)?;

        let txn = self.store.begin_write()?;

        // Keep the stored node when one exists: its repair state must not
        // be clobbered by a stale upstream snapshot.
        let node = match self.store.get_node_tx(&txn, &derived.id)? {
            Some(existing) => existing,
            None => {
                self.store.create_node_tx(&txn, &derived)?;
                derived
            }
        };

        let node_event = NodeEvent::from_kube_event(&node, event)?;
        self.store.create_node_event_tx(&txn, &node_event)?;
        txn.commit()?;

        info!(event = %node_event, node = %node, "processed node event");

        Ok(())
    }
}

/// Watches the cluster's event stream and distributes node-scoped events
/// to the registered handlers in order. Handler errors are logged and
/// dropped; the event will resurface on the next resync.
pub struct NodeEventEmitter {
    client: Client,
    handlers: Vec<Arc<dyn KubeNodeEventHandler>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NodeEventEmitter {
    pub fn new(client: Client, handlers: Vec<Arc<dyn KubeNodeEventHandler>>) -> Self {
        Self {
            client,
            handlers,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Spawns the watch loop.
    pub fn start(self: &Arc<Self>) {
        let emitter = Arc::clone(self);
        let handle = tokio::spawn(async move {
            info!("NodeEventEmitter: started");
            emitter.run().await;
            info!("NodeEventEmitter: stopped");
        });
        *self.task.lock().unwrap() = Some(handle);
    }

    /// Raises cancellation and waits for the watch loop to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "NodeEventEmitter: watch task failed");
            }
        }
    }

    async fn run(&self) {
        let events: Api<KubeEvent> = Api::all(self.client.clone());
        let mut stream =
            Box::pin(watcher(events, watcher::Config::default()).applied_objects());

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                item = stream.next() => match item {
                    Some(Ok(event)) => self.dispatch(&event).await,
                    Some(Err(e)) => warn!(error = %e, "NodeEventEmitter: watch error"),
                    None => return,
                }
            }
        }
    }

    async fn dispatch(&self, event: &KubeEvent) {
        if !is_node_event(event) {
            debug!("NodeEventEmitter: received non-node event");
            return;
        }

        for handler in &self.handlers {
            if let Err(e) = handler.handle_kube_node_event(event).await {
                error!(error = %e, "NodeEventEmitter: error handling node event");
            }
        }
    }
}

/// Only events scoped to a node are accepted; everything else is dropped
/// silently.
fn is_node_event(event: &KubeEvent) -> bool {
    event.involved_object.kind.as_deref() == Some(NODE_EVENT_KIND)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::node::RepairStatus;
    use crate::testutil;
    use chrono::Duration;

    struct FakeFetcher {
        node: KubeNode,
    }

    #[async_trait]
    impl NodeFetcher for FakeFetcher {
        async fn get_node(&self, name: &str) -> Result<KubeNode> {
            if self.node.metadata.name.as_deref() == Some(name) {
                Ok(self.node.clone())
            } else {
                Err(Error::ClusterApi(format!("node {name} not found")))
            }
        }
    }

    fn controller_for(node: KubeNode, store: Arc<Store>) -> NodeEventController {
        NodeEventController::new(Arc::new(FakeFetcher { node }), store)
    }

    #[tokio::test]
    async fn test_ingest_then_query() {
        let (store, _dir) = testutil::temp_store();
        let store = Arc::new(store);

        let kube_node = testutil::fake_kube_node("n", "sysA");
        let controller = controller_for(kube_node, Arc::clone(&store));

        let event = testutil::fake_kube_node_event("u1", "n");
        controller.handle_kube_node_event(&event).await.unwrap();

        let t0 = testutil::fixed_time();
        let summaries = store
            .get_node_time_period_summaries(t0 - Duration::minutes(1), t0 + Duration::minutes(1))
            .unwrap();

        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].node.id, "sysA");
        assert_eq!(summaries[0].events.len(), 1);
        assert_eq!(summaries[0].events[0].id, "u1");
    }

    #[tokio::test]
    async fn test_existing_node_repair_state_is_preserved() {
        let (store, _dir) = testutil::temp_store();
        let store = Arc::new(store);

        let mut node = testutil::fake_node("sysA");
        node.repair_status = RepairStatus::Failed;
        node.repair_stage = 2;
        node.repair_configuration_name = "default".to_string();
        store.create_node(&node).unwrap();

        let kube_node = testutil::fake_kube_node("node-a", "sysA");
        let controller = controller_for(kube_node, Arc::clone(&store));
        let event = testutil::fake_kube_node_event("u2", "node-a");
        controller.handle_kube_node_event(&event).await.unwrap();

        let stored = store.get_node("sysA").unwrap().unwrap();
        assert_eq!(stored.repair_status, RepairStatus::Failed);
        assert_eq!(stored.repair_stage, 2);

        let mut event_ids = Vec::new();
        store
            .walk_node_events("sysA", |event| {
                event_ids.push(event.id.clone());
                Ok(())
            })
            .unwrap();
        assert_eq!(event_ids, vec!["u2"]);
    }

    #[tokio::test]
    async fn test_fetch_failure_surfaces_to_the_emitter() {
        let (store, _dir) = testutil::temp_store();
        let store = Arc::new(store);

        let kube_node = testutil::fake_kube_node("other", "sysA");
        let controller = controller_for(kube_node, Arc::clone(&store));

        let event = testutil::fake_kube_node_event("u1", "n");
        let err = controller.handle_kube_node_event(&event).await.unwrap_err();
        assert!(matches!(err, Error::ClusterApi(_)));

        // Nothing was persisted.
        assert!(store.get_node("sysA").unwrap().is_none());
    }

    #[test]
    fn test_only_node_events_are_accepted() {
        let node_event = testutil::fake_kube_node_event("u1", "n");
        assert!(is_node_event(&node_event));

        let mut pod_event = testutil::fake_kube_node_event("u2", "p");
        pod_event.involved_object.kind = Some("Pod".to_string());
        assert!(!is_node_event(&pod_event));

        let mut kindless = testutil::fake_kube_node_event("u3", "x");
        kindless.involved_object.kind = None;
        assert!(!is_node_event(&kindless));
    }
}
