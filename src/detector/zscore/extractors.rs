//! Feature extractors for the z-score detector.

use std::fmt;

use tracing::debug;

use crate::detector::zscore::FeatureExtractor;
use crate::error::Result;
use crate::node::NodeTimePeriodSummary;

/// Counts periods of Docker daemon instability on a node.
///
/// A `NodeNotReady` from the controller manager followed by a
/// `ContainerGCFailed` from the kubelet marks one instability period; a
/// `NodeReady` in between means the node recovered and the sequence resets.
/// Found experimentally to line up with Docker daemon issues.
#[derive(Debug, Default)]
pub struct DockerDaemonInstability;

impl DockerDaemonInstability {
    pub fn new() -> Self {
        Self
    }
}

impl fmt::Display for DockerDaemonInstability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DockerDaemonInstability")
    }
}

impl FeatureExtractor for DockerDaemonInstability {
    fn extract(&self, summary: &NodeTimePeriodSummary) -> Result<f64> {
        debug!(
            events = summary.events.len(),
            "extracting docker daemon instability feature"
        );

        let mut instability_periods = 0u64;
        let mut unstable = false;

        for event in &summary.events {
            if event.reason == "NodeNotReady" && event.source_component == "controllermanager" {
                unstable = true;
                continue;
            }
            if unstable {
                if event.reason == "ContainerGCFailed" && event.source_component == "kubelet" {
                    instability_periods += 1;
                    unstable = false;
                    continue;
                }
                if event.reason == "NodeReady" && event.source_component == "kubelet" {
                    unstable = false;
                }
            }
        }

        Ok(instability_periods as f64)
    }
}

/// Counts how many times a node alternates between Ready and NotReady.
///
/// A node that keeps flapping is unhealthy even when every individual
/// outage resolves on its own.
#[derive(Debug, Default)]
pub struct FlappingNode;

impl FlappingNode {
    pub fn new() -> Self {
        Self
    }
}

impl fmt::Display for FlappingNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FlappingNode")
    }
}

impl FeatureExtractor for FlappingNode {
    fn extract(&self, summary: &NodeTimePeriodSummary) -> Result<f64> {
        let mut transitions = 0u64;
        let mut ready: Option<bool> = None;

        for event in &summary.events {
            let observed = if event.reason == "NodeReady" && event.source_component == "kubelet" {
                Some(true)
            } else if event.reason == "NodeNotReady"
                && event.source_component == "controllermanager"
            {
                Some(false)
            } else {
                None
            };

            if let Some(observed) = observed {
                if ready.is_some_and(|previous| previous != observed) {
                    transitions += 1;
                }
                ready = Some(observed);
            }
        }

        Ok(transitions as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_event::NodeEvent;
    use crate::testutil;
    use chrono::Duration;

    fn summary_from_reasons(reasons: &[(&str, &str)]) -> NodeTimePeriodSummary {
        let start = testutil::fixed_time();
        let events: Vec<NodeEvent> = reasons
            .iter()
            .enumerate()
            .map(|(i, (reason, component))| {
                testutil::reason_event(
                    &format!("e{i}"),
                    "sys-uuid-a",
                    start + Duration::minutes(i as i64),
                    reason,
                    component,
                )
            })
            .collect();
        NodeTimePeriodSummary {
            node: testutil::fake_node("sys-uuid-a"),
            events,
            period_start: start,
            period_end: start + Duration::hours(1),
        }
    }

    #[test]
    fn test_counts_not_ready_followed_by_gc_failure() {
        let summary = summary_from_reasons(&[
            ("NodeNotReady", "controllermanager"),
            ("ContainerGCFailed", "kubelet"),
            ("NodeNotReady", "controllermanager"),
            ("ContainerGCFailed", "kubelet"),
        ]);
        let feature = DockerDaemonInstability::new().extract(&summary).unwrap();
        assert_eq!(feature, 2.0);
    }

    #[test]
    fn test_node_ready_resets_the_sequence() {
        let summary = summary_from_reasons(&[
            ("NodeNotReady", "controllermanager"),
            ("NodeReady", "kubelet"),
            ("ContainerGCFailed", "kubelet"),
        ]);
        let feature = DockerDaemonInstability::new().extract(&summary).unwrap();
        assert_eq!(feature, 0.0);
    }

    #[test]
    fn test_unrelated_events_do_not_break_the_sequence() {
        let summary = summary_from_reasons(&[
            ("NodeNotReady", "controllermanager"),
            ("ImagePullBackOff", "kubelet"),
            ("ContainerGCFailed", "kubelet"),
        ]);
        let feature = DockerDaemonInstability::new().extract(&summary).unwrap();
        assert_eq!(feature, 1.0);
    }

    #[test]
    fn test_component_must_match() {
        // The same reasons from the wrong components never pair up.
        let summary = summary_from_reasons(&[
            ("NodeNotReady", "kubelet"),
            ("ContainerGCFailed", "controllermanager"),
        ]);
        let feature = DockerDaemonInstability::new().extract(&summary).unwrap();
        assert_eq!(feature, 0.0);
    }

    #[test]
    fn test_gc_failure_without_not_ready_does_not_count() {
        let summary = summary_from_reasons(&[("ContainerGCFailed", "kubelet")]);
        let feature = DockerDaemonInstability::new().extract(&summary).unwrap();
        assert_eq!(feature, 0.0);
    }

    #[test]
    fn test_empty_summary_extracts_zero() {
        let summary = summary_from_reasons(&[]);
        let feature = DockerDaemonInstability::new().extract(&summary).unwrap();
        assert_eq!(feature, 0.0);
    }

    #[test]
    fn test_flapping_counts_each_alternation() {
        let summary = summary_from_reasons(&[
            ("NodeReady", "kubelet"),
            ("NodeNotReady", "controllermanager"),
            ("NodeReady", "kubelet"),
            ("NodeNotReady", "controllermanager"),
        ]);
        let feature = FlappingNode::new().extract(&summary).unwrap();
        assert_eq!(feature, 3.0);
    }

    #[test]
    fn test_flapping_ignores_repeats_and_noise() {
        let summary = summary_from_reasons(&[
            ("NodeReady", "kubelet"),
            ("NodeReady", "kubelet"),
            ("ImagePullBackOff", "kubelet"),
            ("NodeNotReady", "controllermanager"),
        ]);
        let feature = FlappingNode::new().extract(&summary).unwrap();
        assert_eq!(feature, 1.0);
    }

    #[test]
    fn test_flapping_single_state_is_zero() {
        let summary = summary_from_reasons(&[("NodeNotReady", "controllermanager")]);
        let feature = FlappingNode::new().extract(&summary).unwrap();
        assert_eq!(feature, 0.0);
    }
}
