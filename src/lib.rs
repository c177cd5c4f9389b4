//! naro detects unhealthy nodes in a Kubernetes cluster and drives each
//! one through an ordered repair workflow: cordon, drain, repair action,
//! uncordon. Per-node history is persisted so repeated failures escalate
//! to stronger repair actions and recently repaired nodes are not
//! re-repaired for events that preceded their last repair.

#![allow(clippy::missing_errors_doc)]

pub mod aws;
pub mod clock;
pub mod detector;
pub mod error;
pub mod events;
pub mod kubernetes;
pub mod node;
pub mod node_event;
pub mod repair;
pub mod store;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{Error, Result};
pub use node::{Node, NodeTimePeriodSummary, RepairStatus};
pub use node_event::NodeEvent;
pub use store::Store;
