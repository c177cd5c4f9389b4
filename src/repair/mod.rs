//! Node repair workflow: strategy selection, per-node serialization, and
//! the taint → drain → repair → untaint state machine.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::detector::AnomalyHandler;
use crate::error::{Error, Result};
use crate::node::{Node, NodeTimePeriodSummary, RepairStatus};
use crate::store::Store;

/// Deadline for draining a node's workloads (R3).
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Deadline for one repair strategy invocation (R4).
pub const STRATEGY_TIMEOUT: Duration = Duration::from_secs(60);

/// Adds and removes the no-schedule repair taint on a node.
#[async_trait]
pub trait NodeTainter: Send + Sync {
    async fn taint(&self, node: &Node) -> Result<()>;
    async fn remove_taint(&self, node: &Node) -> Result<()>;
}

/// Evicts all workloads from a node and waits for them to terminate.
#[async_trait]
pub trait NodeDrainer: Send + Sync {
    async fn drain(&self, node: &Node) -> Result<()>;
}

/// A single repair action, e.g. rebooting the underlying instance.
#[async_trait]
pub trait RepairStrategy: Send + Sync {
    async fn repair(&self, node: &Node) -> Result<()>;
}

/// The ordered list of repair strategies to apply to a node. Bump the
/// version whenever the list changes; nodes mid-escalation under an older
/// version restart from the first strategy.
pub struct RepairConfiguration {
    pub name: String,
    pub version: String,
    pub ordered_strategies: Vec<Arc<dyn RepairStrategy>>,
}

impl fmt::Display for RepairConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

/// Repairs a node using a selected strategy, tracking progress through the
/// node's persisted repair status.
pub struct NodeRepairer {
    clock: Arc<dyn Clock>,
    store: Arc<Store>,
    drainer: Arc<dyn NodeDrainer>,
    tainter: Arc<dyn NodeTainter>,
}

impl NodeRepairer {
    pub fn new(
        clock: Arc<dyn Clock>,
        store: Arc<Store>,
        drainer: Arc<dyn NodeDrainer>,
        tainter: Arc<dyn NodeTainter>,
    ) -> Self {
        Self {
            clock,
            store,
            drainer,
            tainter,
        }
    }

    /// Runs the repair state machine on a node.
    ///
    /// Only `healthy` nodes enter; the node is `in-progress` for the
    /// duration and ends `healthy` on success or `failed` on any step
    /// failure. The taint is deliberately left in place on the failure
    /// path so the node keeps repelling workloads until an operator
    /// intervenes.
    pub async fn repair_node(
        &self,
        node: &mut Node,
        strategy: &Arc<dyn RepairStrategy>,
    ) -> Result<()> {
        // R1: mark the node as being repaired.
        if node.repair_status != RepairStatus::Healthy {
            return Err(Error::state_violation(format!(
                "can't repair {node} since it's in state: {}",
                node.repair_status
            )));
        }
        let txn = self.store.begin_write()?;
        node.repair_status = RepairStatus::InProgress;
        self.store.create_node_tx(&txn, node)?;
        txn.commit()?;

        // R2: repel new workloads.
        if let Err(e) = self.tainter.taint(node).await {
            return Err(self.mark_failed(node, e));
        }

        // R3: drain existing workloads.
        match tokio::time::timeout(DRAIN_TIMEOUT, self.drainer.drain(node)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(self.mark_failed(node, e)),
            Err(_) => {
                return Err(self.mark_failed(node, Error::timeout("drain", DRAIN_TIMEOUT)));
            }
        }

        // R4: apply the selected strategy.
        match tokio::time::timeout(STRATEGY_TIMEOUT, strategy.repair(node)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(self.mark_failed(node, e)),
            Err(_) => {
                return Err(self.mark_failed(
                    node,
                    Error::timeout("repair strategy", STRATEGY_TIMEOUT),
                ));
            }
        }

        // R5: accept workloads again.
        if let Err(e) = self.tainter.remove_taint(node).await {
            return Err(self.mark_failed(node, e));
        }

        // TODO: wait for the node to report Ready before marking it
        // healthy.

        // R6: record the successful repair. On a persist failure the node
        // stays in-progress and the error surfaces to the caller.
        node.repaired_at = Some(self.clock.now());
        node.repair_status = RepairStatus::Healthy;
        self.store.create_node(node)?;

        Ok(())
    }

    /// Best-effort transition to `failed`; a persist failure is combined
    /// with the root error.
    fn mark_failed(&self, node: &mut Node, root: Error) -> Error {
        node.repair_status = RepairStatus::Failed;
        match self.store.create_node(node) {
            Ok(()) => root,
            Err(persist) => Error::combined(root, persist),
        }
    }
}

/// Selects the appropriate repair strategy for an anomalous node and
/// applies it, serializing all repairs per node.
pub struct RepairController {
    clock: Arc<dyn Clock>,
    config: RepairConfiguration,
    store: Arc<Store>,
    repairer: NodeRepairer,
    /// Maximum time between stages of one escalating repair attempt.
    max_repair_continuation: chrono::Duration,
    /// Lazily populated; one entry per node id ever seen. Never pruned —
    /// entries are a few dozen bytes and fleets stay well below the size
    /// where a sharded table would pay off.
    node_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RepairController {
    pub fn new(
        clock: Arc<dyn Clock>,
        config: RepairConfiguration,
        store: Arc<Store>,
        repairer: NodeRepairer,
    ) -> Self {
        Self {
            clock,
            config,
            store,
            repairer,
            max_repair_continuation: chrono::Duration::hours(24),
            node_locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for_node(&self, node_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.node_locks.lock().unwrap();
        Arc::clone(
            locks
                .entry(node_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Picks the next strategy index for the node.
    ///
    /// A node on a stale or unset configuration is reset to stage 0 of the
    /// current one (persisted immediately). A node already on the current
    /// configuration escalates to the next stage while inside the
    /// continuation window of its last repair, and restarts from 0 outside
    /// it.
    fn select_repair_strategy(&self, node: &mut Node) -> Result<usize> {
        let mut strategy_idx = 0;

        if node.repair_configuration_name.is_empty()
            || node.repair_configuration_name != self.config.name
            || node.repair_configuration_version != self.config.version
        {
            node.repair_configuration_name = self.config.name.clone();
            node.repair_configuration_version = self.config.version.clone();
            node.repair_stage = 0;

            let txn = self.store.begin_write()?;
            self.store.create_node_tx(&txn, node)?;
            txn.commit()?;
        } else if let Some(repaired_at) = node.repaired_at {
            if self.clock.now() < repaired_at + self.max_repair_continuation {
                strategy_idx = node.repair_stage + 1;
            }
        }

        if strategy_idx >= self.config.ordered_strategies.len() {
            return Err(Error::ConfigDrift(format!(
                "no repair strategies left to apply to {node}"
            )));
        }

        Ok(strategy_idx)
    }

    async fn repair(&self, node: &mut Node) -> Result<()> {
        let strategy_idx = self.select_repair_strategy(node)?;

        // Record the selected stage before acting on it.
        node.repair_stage = strategy_idx;
        let txn = self.store.begin_write()?;
        self.store.create_node_tx(&txn, node)?;
        txn.commit()?;

        info!(
            node = %node,
            config = %self.config,
            strategy = strategy_idx,
            "repairing node"
        );

        self.repairer
            .repair_node(node, &self.config.ordered_strategies[strategy_idx])
            .await?;

        info!(node = %node, "finished repairing node");

        Ok(())
    }
}

#[async_trait]
impl AnomalyHandler for RepairController {
    /// Handles a node anomaly: selects a repair strategy and applies it.
    /// Anomalies for the same node serialize; different nodes proceed in
    /// parallel.
    async fn handle_anomaly(&self, summary: &NodeTimePeriodSummary, metadata: &str) -> Result<()> {
        let lock = self.lock_for_node(&summary.node.id);
        let _guard = lock.lock().await;

        warn!(node = %summary.node, metadata, "handling anomaly");

        // Work from the persisted node, not the summary's snapshot: an
        // earlier repair may have advanced its state while this anomaly
        // waited on the lock.
        let mut node = match self.store.get_node(&summary.node.id)? {
            Some(node) => node,
            None => summary.node.clone(),
        };
        self.repair(&mut node).await
    }
}
