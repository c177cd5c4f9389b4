//! Z-score outlier detection over windowed node summaries.
//!
//! Background: <http://colingorrie.github.io/outlier-detection.html>

pub mod extractors;

use std::fmt;

use tracing::debug;

use crate::detector::AnomalyDetector;
use crate::error::{Error, Result};
use crate::node::NodeTimePeriodSummary;

/// Z-score values for well-known percentiles.
pub const Z_SCORE_95: f64 = 1.6449;
pub const Z_SCORE_99: f64 = 2.3263;

/// Extracts a single scalar feature from a node's windowed summary.
pub trait FeatureExtractor: Send + Sync + fmt::Display {
    fn extract(&self, summary: &NodeTimePeriodSummary) -> Result<f64>;
}

/// A trainable z-score detector over a pluggable scalar feature.
pub struct Detector {
    mean: f64,
    stddev: f64,
    z_threshold: f64,
    extractor: Box<dyn FeatureExtractor>,
}

impl fmt::Display for Detector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Detector: mean({}), stddev({}), z-threshold({}), extractor({})",
            self.mean, self.stddev, self.z_threshold, self.extractor
        )
    }
}

impl Detector {
    pub fn new(z_threshold: f64, extractor: Box<dyn FeatureExtractor>) -> Self {
        Self {
            mean: 0.0,
            stddev: 0.0,
            z_threshold,
            extractor,
        }
    }
}

impl AnomalyDetector for Detector {
    /// Computes the mean and sample standard deviation of the extracted
    /// features over the training set.
    fn train(&mut self, summaries: &[NodeTimePeriodSummary]) -> Result<()> {
        let mut features = Vec::with_capacity(summaries.len());
        for summary in summaries {
            features.push(self.extractor.extract(summary)?);
        }

        debug!(extractor = %self.extractor, ?features, "training detector");

        if features.is_empty() {
            return Err(Error::validation(
                "cannot train a detector on zero summaries",
            ));
        }

        let mean = features.iter().sum::<f64>() / features.len() as f64;
        let stddev = if features.len() > 1 {
            let variance = features
                .iter()
                .map(|f| (f - mean).powi(2))
                .sum::<f64>()
                / (features.len() - 1) as f64;
            variance.sqrt()
        } else {
            0.0
        };

        self.mean = mean;
        self.stddev = stddev;

        Ok(())
    }

    /// The division is deliberately unguarded: with zero training spread,
    /// IEEE arithmetic makes an above-mean feature score `+inf` (fires)
    /// and an at-mean feature `NaN` (never fires). Neither crashes.
    fn is_anomalous(&self, summary: &NodeTimePeriodSummary) -> Result<(bool, String)> {
        let feature = self.extractor.extract(summary)?;

        let z_score = (feature - self.mean) / self.stddev;
        Ok((z_score >= self.z_threshold, format!("z-score: {z_score}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use chrono::Duration;

    /// Counts events; lets tests shape features via event-list length.
    struct EventCount;

    impl fmt::Display for EventCount {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("EventCount")
        }
    }

    impl FeatureExtractor for EventCount {
        fn extract(&self, summary: &NodeTimePeriodSummary) -> Result<f64> {
            Ok(summary.events.len() as f64)
        }
    }

    fn summary_with_events(count: usize) -> NodeTimePeriodSummary {
        let start = testutil::fixed_time();
        let events = (0..count)
            .map(|i| {
                testutil::fake_event_at(
                    &format!("e{i}"),
                    "sys-uuid-a",
                    start + Duration::minutes(i as i64),
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

    /// 99 two-event summaries and a single four-event one give the
    /// training set enough spread for four events to score as an outlier.
    fn trained_detector() -> Detector {
        let mut training: Vec<_> = (0..99).map(|_| summary_with_events(2)).collect();
        training.push(summary_with_events(4));

        let mut detector = Detector::new(Z_SCORE_99, Box::new(EventCount));
        detector.train(&training).unwrap();
        detector
    }

    #[test]
    fn test_detects_outlier_summary() {
        let detector = trained_detector();
        let (anomalous, metadata) = detector.is_anomalous(&summary_with_events(4)).unwrap();
        assert!(anomalous);
        assert!(metadata.starts_with("z-score: "));
    }

    #[test]
    fn test_typical_summary_is_not_anomalous() {
        let detector = trained_detector();
        let (anomalous, _) = detector.is_anomalous(&summary_with_events(2)).unwrap();
        assert!(!anomalous);
    }

    #[test]
    fn test_zero_stddev_does_not_crash() {
        // 100 identical training summaries have no spread at all.
        let training: Vec<_> = (0..100).map(|_| summary_with_events(2)).collect();
        let mut detector = Detector::new(Z_SCORE_99, Box::new(EventCount));
        detector.train(&training).unwrap();

        // An above-mean outlier scores +inf and still fires.
        let (anomalous, _) = detector.is_anomalous(&summary_with_events(4)).unwrap();
        assert!(anomalous);

        // An at-mean summary scores NaN, which never fires.
        let (anomalous, _) = detector.is_anomalous(&summary_with_events(2)).unwrap();
        assert!(!anomalous);
    }

    #[test]
    fn test_training_on_empty_set_fails() {
        let mut detector = Detector::new(Z_SCORE_95, Box::new(EventCount));
        assert!(detector.train(&[]).is_err());
    }
}
