use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::outcome::{RequestOutcome, Stage};

/// Failure causes kept verbatim in the report; the rest are only counted.
pub const MAX_FAILURE_SAMPLES: usize = 100;

/// Tolerance, in seconds, for rounding noise in server breakdowns.
pub const ADDITIVITY_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Position in completion order
    pub sequence: u64,
    pub cause: String,
}

/// Everything the collector accumulated once draining finished.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectedResults {
    pub attempted: u64,
    pub completed: u64,
    pub failure_count: u64,
    pub failures: Vec<FailureRecord>,
    pub non_additive_count: u64,
    pub raw_samples: BTreeMap<Stage, Vec<f64>>,
}

/// Single consumer of request outcomes, in completion order.
pub struct ResultCollector {
    expected: u64,
    results: CollectedResults,
    progress: bool,
}

impl ResultCollector {
    pub fn new(expected: u64) -> Self {
        Self {
            expected,
            results: CollectedResults::default(),
            progress: false,
        }
    }

    /// Print a `.` per failure, breaking the line every 20 failures.
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn record(&mut self, outcome: RequestOutcome) {
        self.results.attempted += 1;
        match outcome {
            RequestOutcome::Success { timing } => {
                self.results.completed += 1;
                if !timing.is_additive(ADDITIVITY_TOLERANCE) {
                    self.results.non_additive_count += 1;
                }
                for (stage, value) in timing.stages() {
                    self.results.raw_samples.entry(stage).or_default().push(value);
                }
            }
            RequestOutcome::Failure { cause } => self.record_failure(cause),
        }
    }

    fn record_failure(&mut self, cause: String) {
        self.results.failure_count += 1;
        debug!(failures = self.results.failure_count, %cause, "request failed");
        if self.results.failures.len() < MAX_FAILURE_SAMPLES {
            self.results.failures.push(FailureRecord {
                sequence: self.results.attempted,
                cause,
            });
        }
        if self.progress {
            print!(".");
            if self.results.failure_count % 20 == 0 {
                println!();
            }
            let _ = std::io::stdout().flush();
        }
    }

    /// Receive until `expected` outcomes arrived or every sender is gone.
    ///
    /// Outcomes that never arrive are tallied as failures so every
    /// attempted request stays accounted for.
    pub async fn drain(mut self, mut rx: mpsc::Receiver<RequestOutcome>) -> CollectedResults {
        while self.results.attempted < self.expected {
            match rx.recv().await {
                Some(outcome) => self.record(outcome),
                None => break,
            }
        }

        let missing = self.expected.saturating_sub(self.results.attempted);
        if missing > 0 {
            warn!(missing, "workers exited without reporting an outcome");
            for _ in 0..missing {
                self.record(RequestOutcome::Failure {
                    cause: "worker exited without reporting".to_string(),
                });
            }
        }
        self.finish()
    }

    pub fn finish(self) -> CollectedResults {
        if self.progress && self.results.failure_count % 20 != 0 {
            println!();
        }
        self.results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ServerTimes;
    use crate::outcome::TimingBreakdown;
    use crate::stats::AggregatedMetric;
    use std::time::Duration;

    fn success(latency_ms: u64) -> RequestOutcome {
        RequestOutcome::Success {
            timing: TimingBreakdown::client_only(Duration::from_millis(latency_ms)),
        }
    }

    fn failure(cause: &str) -> RequestOutcome {
        RequestOutcome::Failure {
            cause: cause.to_string(),
        }
    }

    #[test]
    fn test_record_success_and_failure() {
        let mut collector = ResultCollector::new(3);
        collector.record(success(10));
        collector.record(failure("connection reset"));
        collector.record(success(30));
        let results = collector.finish();

        assert_eq!(results.attempted, 3);
        assert_eq!(results.completed, 2);
        assert_eq!(results.failure_count, 1);
        assert_eq!(results.failures[0].sequence, 2);
        assert_eq!(results.failures[0].cause, "connection reset");
        assert_eq!(results.raw_samples[&Stage::Latency].len(), 2);
    }

    #[test]
    fn test_failure_samples_are_capped() {
        let mut collector = ResultCollector::new(0);
        for i in 0..(MAX_FAILURE_SAMPLES + 25) {
            collector.record(failure(&format!("error {i}")));
        }
        let results = collector.finish();
        assert_eq!(results.failure_count, (MAX_FAILURE_SAMPLES + 25) as u64);
        assert_eq!(results.failures.len(), MAX_FAILURE_SAMPLES);
    }

    #[test]
    fn test_non_additive_breakdown_counted() {
        let mut collector = ResultCollector::new(1);
        collector.record(RequestOutcome::Success {
            timing: TimingBreakdown::with_server(
                Duration::from_millis(100),
                ServerTimes {
                    preprocessing_time: 0.01,
                    batching_time: 0.02,
                    inference_time: 0.05,
                    postprocessing_time: 0.01,
                    server_end2end_time: 0.05,
                },
            ),
        });
        let results = collector.finish();
        assert_eq!(results.non_additive_count, 1);
        assert_eq!(results.raw_samples.len(), 7);
    }

    #[test]
    fn test_completion_order_does_not_change_aggregates() {
        let outcomes: Vec<RequestOutcome> = [12, 7, 30, 18, 5, 22, 9]
            .into_iter()
            .map(success)
            .chain([failure("timeout"), failure("503")])
            .collect();

        let mut forward = ResultCollector::new(outcomes.len() as u64);
        let mut backward = ResultCollector::new(outcomes.len() as u64);
        for outcome in outcomes.iter().cloned() {
            forward.record(outcome);
        }
        for outcome in outcomes.iter().rev().cloned() {
            backward.record(outcome);
        }
        let forward = forward.finish();
        let backward = backward.finish();

        assert_eq!(forward.completed, backward.completed);
        assert_eq!(forward.failure_count, backward.failure_count);
        let a = AggregatedMetric::from_samples(&forward.raw_samples[&Stage::Latency]);
        let b = AggregatedMetric::from_samples(&backward.raw_samples[&Stage::Latency]);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_drain_stops_at_expected_count() {
        let (tx, rx) = mpsc::channel(16);
        for latency in [1, 2, 3] {
            tx.send(success(latency)).await.unwrap();
        }
        // sender still open: drain must return on the count alone
        let results = ResultCollector::new(3).drain(rx).await;
        assert_eq!(results.completed, 3);
        drop(tx);
    }

    #[tokio::test]
    async fn test_drain_accounts_for_missing_outcomes() {
        let (tx, rx) = mpsc::channel(16);
        tx.send(success(1)).await.unwrap();
        drop(tx);

        let results = ResultCollector::new(4).drain(rx).await;
        assert_eq!(results.attempted, 4);
        assert_eq!(results.completed, 1);
        assert_eq!(results.failure_count, 3);
    }
}
