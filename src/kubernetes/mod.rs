//! Kubernetes-facing collaborators: the repair tainter and the node
//! drainer, plus the drain failure classification.

mod drainer;
mod error;
mod tainter;

pub use drainer::{
    EvictionDrainer, EVICTION_RETRY_TIME, MAX_GRACEFUL_TERMINATION_SEC, MAX_POD_EVICTION_TIME,
    POD_EVICTION_HEADROOM,
};
pub use error::{DrainError, DrainErrorKind};
pub use tainter::{RepairTainter, REPAIR_TAINT};
