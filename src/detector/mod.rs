//! Periodic anomaly detection over windowed node summaries.
//!
//! Each tick builds a fresh detector set from the registered factories,
//! trains it on a trailing window of summaries, scores a (usually shorter)
//! detection window, and dispatches anomalies to the registered handlers.
//! Detectors are deliberately stateless across ticks: training data ages
//! out without any detector-side bookkeeping, and factories can be swapped
//! at will.

pub mod zscore;

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::Result;
use crate::node::NodeTimePeriodSummary;
use crate::store::Store;

/// A detector that can be trained on historical summaries and then score
/// new ones.
pub trait AnomalyDetector: Send + Sync + fmt::Display {
    /// Trains on the full set of summaries; a constructed but untrained
    /// detector is never scored.
    fn train(&mut self, summaries: &[NodeTimePeriodSummary]) -> Result<()>;

    /// Scores one summary, returning the verdict and a metadata string for
    /// handlers and logs.
    fn is_anomalous(&self, summary: &NodeTimePeriodSummary) -> Result<(bool, String)>;
}

/// Builds a fresh detector for one detection cycle.
pub type AnomalyDetectorFactory =
    Box<dyn Fn() -> Result<Box<dyn AnomalyDetector>> + Send + Sync>;

/// Receives summaries that a trained detector flagged as anomalous.
#[async_trait]
pub trait AnomalyHandler: Send + Sync {
    async fn handle_anomaly(&self, summary: &NodeTimePeriodSummary, metadata: &str) -> Result<()>;
}

/// Drives the periodic train/score pipeline.
pub struct DetectorController {
    training_window: chrono::Duration,
    detection_window: chrono::Duration,
    tick_interval: Duration,
    factories: Vec<AnomalyDetectorFactory>,
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    handlers: Vec<Arc<dyn AnomalyHandler>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DetectorController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        training_window: chrono::Duration,
        detection_window: chrono::Duration,
        tick_interval: Duration,
        factories: Vec<AnomalyDetectorFactory>,
        store: Arc<Store>,
        clock: Arc<dyn Clock>,
        handlers: Vec<Arc<dyn AnomalyHandler>>,
    ) -> Self {
        Self {
            training_window,
            detection_window,
            tick_interval,
            factories,
            store,
            clock,
            handlers,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Spawns the scheduler loop.
    pub fn start(self: &Arc<Self>) {
        let controller = Arc::clone(self);
        let handle = tokio::spawn(async move {
            info!("DetectorController: started");
            controller.run().await;
            info!("DetectorController: stopped");
        });
        *self.task.lock().unwrap() = Some(handle);
    }

    /// Raises cancellation and waits for the loop to exit. Observing a
    /// second call is safe.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "DetectorController: loop task failed");
            }
        }
    }

    async fn run(&self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = self.clock.sleep(self.tick_interval) => {}
            }

            if let Err(e) = self.run_detection_cycle().await {
                error!(error = %e, "DetectorController: detection cycle failed");
            }
        }
    }

    /// One train/score pass. Every detector is trained before any scoring
    /// begins; detectors score in factory order and nodes in store
    /// iteration order; handlers run in registration order.
    async fn run_detection_cycle(&self) -> Result<()> {
        let now = self.clock.now();

        let training_summaries = self
            .store
            .get_node_time_period_summaries(now - self.training_window, now)?;

        // A factory or training failure aborts the whole cycle: a
        // partially constructed detector set could silently skip an
        // anomaly the missing detector would have caught.
        let mut detectors = Vec::with_capacity(self.factories.len());
        for factory in &self.factories {
            let mut detector = factory()?;
            detector.train(&training_summaries)?;
            detectors.push(detector);
        }

        let mut summaries = self
            .store
            .get_node_time_period_summaries(now - self.detection_window, now)?;
        for summary in &mut summaries {
            summary.remove_older_repaired_events();
        }

        debug!(
            detectors = detectors.len(),
            summaries = summaries.len(),
            "DetectorController: scoring"
        );

        for detector in &detectors {
            for summary in &summaries {
                match detector.is_anomalous(summary) {
                    Ok((true, metadata)) => {
                        warn!(node = %summary.node, %detector, %metadata, "anomaly detected");
                        for handler in &self.handlers {
                            if let Err(e) = handler.handle_anomaly(summary, &metadata).await {
                                error!(
                                    error = %e,
                                    node = %summary.node,
                                    "DetectorController: anomaly handler failed"
                                );
                            }
                        }
                    }
                    Ok((false, _)) => {}
                    Err(e) => {
                        error!(
                            error = %e,
                            node = %summary.node,
                            %detector,
                            "DetectorController: error scoring summary"
                        );
                    }
                }
            }
        }

        Ok(())
    }
}
