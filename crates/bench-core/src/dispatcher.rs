use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep_until, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::codec::EncodedRequest;
use crate::context::InFlightGauge;
use crate::outcome::{RequestOutcome, TimingBreakdown};
use crate::schedule::ArrivalSchedule;
use crate::sender::{InferenceSender, Route};

/// Send one request and time it from just before the call to just after
/// the response is decoded.
async fn execute(
    sender: &dyn InferenceSender,
    request: &EncodedRequest,
    route: Route,
    with_server_times: bool,
) -> RequestOutcome {
    let start = Instant::now();
    match sender.send(request, route).await {
        Ok(response) => {
            let latency = start.elapsed();
            let timing = if with_server_times {
                TimingBreakdown::with_server(latency, response.times)
            } else {
                TimingBreakdown::client_only(latency)
            };
            RequestOutcome::Success { timing }
        }
        Err(e) => RequestOutcome::Failure {
            cause: e.to_string(),
        },
    }
}

/// Result of a warm-up phase; the outcomes themselves are discarded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmupSummary {
    pub attempted: u64,
    pub failed: u64,
    pub first_failure: Option<String>,
}

impl WarmupSummary {
    fn record(&mut self, outcome: RequestOutcome) {
        self.attempted += 1;
        if let RequestOutcome::Failure { cause } = outcome {
            self.failed += 1;
            if self.first_failure.is_none() {
                self.first_failure = Some(cause);
            }
        }
    }
}

/// A submitted request whose outcome will arrive on the outcome channel.
pub struct PendingRequest {
    pub index: usize,
    /// Scheduled offset from run start, in seconds
    pub offset: f64,
    pub submitted_at: Instant,
    pub handle: JoinHandle<()>,
}

impl PendingRequest {
    /// How late the submission was relative to its scheduled instant.
    pub fn pacing_lag(&self, run_start: Instant) -> Duration {
        let due = run_start + Duration::from_secs_f64(self.offset);
        self.submitted_at.saturating_duration_since(due)
    }
}

/// Paced dispatcher: submissions follow the schedule regardless of how
/// many earlier requests are still in flight.
pub struct OpenLoopDispatcher {
    sender: Arc<dyn InferenceSender>,
    request: Arc<EncodedRequest>,
    pool: Arc<Semaphore>,
}

impl OpenLoopDispatcher {
    pub fn new(
        sender: Arc<dyn InferenceSender>,
        request: Arc<EncodedRequest>,
        concurrency: usize,
    ) -> Self {
        Self {
            sender,
            request,
            pool: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Send `count` throwaway requests `interval` apart and wait for all.
    pub async fn warm_up(&self, count: u64, interval: Duration) -> WarmupSummary {
        let mut tasks = JoinSet::new();
        let mut ticker = tokio::time::interval(interval.max(Duration::from_micros(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

        for _ in 0..count {
            ticker.tick().await;
            let sender = Arc::clone(&self.sender);
            let request = Arc::clone(&self.request);
            let pool = Arc::clone(&self.pool);
            tasks.spawn(async move {
                let _permit = pool.acquire_owned().await;
                execute(sender.as_ref(), &request, Route::Warmup, true).await
            });
        }

        let mut summary = WarmupSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => summary.record(outcome),
                Err(e) => summary.record(RequestOutcome::Failure {
                    cause: format!("warm-up task failed: {e}"),
                }),
            }
        }
        info!(
            attempted = summary.attempted,
            failed = summary.failed,
            "open-loop warm-up finished"
        );
        summary
    }

    /// Submit one request per scheduled offset, in schedule order.
    ///
    /// Returns once the last request has been submitted; completions are
    /// delivered to `outcomes` in whatever order they finish.
    pub async fn dispatch(
        &self,
        schedule: &ArrivalSchedule,
        run_start: Instant,
        gauge: Arc<InFlightGauge>,
        outcomes: mpsc::Sender<RequestOutcome>,
    ) -> Vec<PendingRequest> {
        let mut pending = Vec::with_capacity(schedule.len());

        for (index, &offset) in schedule.offsets().iter().enumerate() {
            sleep_until(run_start + Duration::from_secs_f64(offset)).await;

            let submitted_at = Instant::now();
            let in_flight = gauge.enter();
            debug!(index, offset, in_flight, "submitting request");

            let sender = Arc::clone(&self.sender);
            let request = Arc::clone(&self.request);
            let pool = Arc::clone(&self.pool);
            let gauge = Arc::clone(&gauge);
            let outcomes = outcomes.clone();
            let handle = tokio::spawn(async move {
                let outcome = match pool.acquire_owned().await {
                    Ok(_permit) => execute(sender.as_ref(), &request, Route::Measured, true).await,
                    Err(e) => RequestOutcome::Failure {
                        cause: format!("worker pool closed: {e}"),
                    },
                };
                gauge.exit();
                if outcomes.send(outcome).await.is_err() {
                    warn!(index, "outcome dropped: collector is gone");
                }
            });

            pending.push(PendingRequest {
                index,
                offset,
                submitted_at,
                handle,
            });
        }

        pending
    }
}

/// Blocking dispatcher: each worker issues its next call as soon as the
/// previous one completes.
pub struct ClosedLoopDispatcher {
    sender: Arc<dyn InferenceSender>,
    request: Arc<EncodedRequest>,
    num_threads: usize,
    num_batches: u64,
}

impl ClosedLoopDispatcher {
    pub fn new(
        sender: Arc<dyn InferenceSender>,
        request: Arc<EncodedRequest>,
        num_threads: usize,
        num_batches: u64,
    ) -> Self {
        Self {
            sender,
            request,
            num_threads: num_threads.max(1),
            num_batches,
        }
    }

    /// Total calls the measured phase will make.
    pub fn total_requests(&self) -> u64 {
        self.num_threads as u64 * self.num_batches
    }

    /// Run `iterations` back-to-back throwaway calls on a single worker.
    pub async fn warm_up(&self, iterations: u64) -> WarmupSummary {
        let mut summary = WarmupSummary::default();
        for _ in 0..iterations {
            summary.record(execute(self.sender.as_ref(), &self.request, Route::Warmup, false).await);
        }
        info!(
            attempted = summary.attempted,
            failed = summary.failed,
            "closed-loop warm-up finished"
        );
        summary
    }

    /// Start `num_threads` independent workers, each making `num_batches`
    /// sequential calls.
    pub fn dispatch(&self, outcomes: mpsc::Sender<RequestOutcome>) -> Vec<JoinHandle<()>> {
        (0..self.num_threads)
            .map(|worker| {
                let sender = Arc::clone(&self.sender);
                let request = Arc::clone(&self.request);
                let outcomes = outcomes.clone();
                let num_batches = self.num_batches;
                tokio::spawn(async move {
                    for batch in 0..num_batches {
                        let outcome =
                            execute(sender.as_ref(), &request, Route::Measured, false).await;
                        if outcomes.send(outcome).await.is_err() {
                            warn!(worker, batch, "outcome dropped: collector is gone");
                            return;
                        }
                    }
                    debug!(worker, "closed-loop worker finished");
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode, DataType, InferResponse, TensorPayload};
    use crate::collector::ResultCollector;
    use crate::error::BenchError;
    use crate::outcome::Stage;
    use crate::sender::{MockSender, SendFuture};
    use crate::stats::AggregatedMetric;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    fn request() -> Arc<EncodedRequest> {
        let payload = TensorPayload::from_raw(vec![4], DataType::Uint8, vec![1, 2, 3, 4]).unwrap();
        Arc::new(encode(&payload).unwrap())
    }

    /// Fails every `every`-th call; successful calls take `delay`.
    struct FlakySender {
        calls: AtomicU64,
        every: u64,
        delay: Duration,
        started: Mutex<Vec<Instant>>,
    }

    impl FlakySender {
        fn new(every: u64, delay: Duration) -> Self {
            Self {
                calls: AtomicU64::new(0),
                every,
                delay,
                started: Mutex::new(Vec::new()),
            }
        }
    }

    impl InferenceSender for FlakySender {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn send<'a>(&'a self, _request: &'a EncodedRequest, _route: Route) -> SendFuture<'a> {
            Box::pin(async move {
                self.started.lock().unwrap().push(Instant::now());
                let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(self.delay).await;
                if self.every > 0 && call % self.every == 0 {
                    return Err(BenchError::transport(format!("call {call} refused")));
                }
                Ok(InferResponse {
                    response: serde_json::Value::Null,
                    times: MockSender::server_times(self.delay),
                })
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_loop_submits_on_schedule() {
        let sender = Arc::new(FlakySender::new(0, Duration::from_millis(5)));
        let dispatcher = OpenLoopDispatcher::new(sender.clone(), request(), 10);
        let schedule = ArrivalSchedule::from_offsets(vec![0.0, 0.25, 0.5, 1.5]).unwrap();
        let gauge = Arc::new(InFlightGauge::new(100));
        let (tx, rx) = mpsc::channel(16);

        let start = Instant::now();
        let pending = dispatcher.dispatch(&schedule, start, gauge, tx).await;
        let results = ResultCollector::new(4).drain(rx).await;

        assert_eq!(results.completed, 4);
        let started = sender.started.lock().unwrap().clone();
        let offsets: Vec<Duration> = started.iter().map(|t| *t - start).collect();
        assert_eq!(
            offsets,
            vec![
                Duration::from_millis(0),
                Duration::from_millis(250),
                Duration::from_millis(500),
                Duration::from_millis(1500),
            ]
        );
        assert!(pending.iter().all(|p| p.pacing_lag(start).is_zero()));
        assert_eq!(pending.iter().map(|p| p.index).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_workers_do_not_delay_submission() {
        // One worker, each call takes a second: requests queue instead of
        // stretching the submission schedule.
        let sender = Arc::new(FlakySender::new(0, Duration::from_secs(1)));
        let dispatcher = OpenLoopDispatcher::new(sender.clone(), request(), 1);
        let schedule = ArrivalSchedule::from_offsets(vec![0.0, 0.1, 0.2, 0.3]).unwrap();
        let gauge = Arc::new(InFlightGauge::new(2));
        let (tx, rx) = mpsc::channel(16);

        let start = Instant::now();
        let pending = dispatcher.dispatch(&schedule, start, gauge.clone(), tx).await;
        assert_eq!(start.elapsed(), Duration::from_millis(300));
        assert!(pending.iter().all(|p| p.pacing_lag(start).is_zero()));

        let results = ResultCollector::new(4).drain(rx).await;
        assert_eq!(results.completed, 4);
        assert_eq!(start.elapsed(), Duration::from_secs(4));

        let stats = gauge.stats();
        assert_eq!(stats.peak_in_flight, 4);
        assert_eq!(stats.submissions_over_high_water, 2);
        assert_eq!(gauge.current(), 0);

        let latency = &results.raw_samples[&Stage::Latency];
        assert!(latency.iter().all(|&l| (l - 1.0).abs() < 1e-9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_isolated() {
        let sender = Arc::new(FlakySender::new(3, Duration::from_millis(20)));
        let dispatcher = OpenLoopDispatcher::new(sender, request(), 10);
        let offsets: Vec<f64> = (0..30).map(|i| i as f64 * 0.01).collect();
        let schedule = ArrivalSchedule::from_offsets(offsets).unwrap();
        let (tx, rx) = mpsc::channel(64);

        let collector = tokio::spawn(ResultCollector::new(30).drain(rx));
        let pending = dispatcher
            .dispatch(&schedule, Instant::now(), Arc::new(InFlightGauge::new(100)), tx)
            .await;
        for p in pending {
            p.handle.await.unwrap();
        }
        let results = collector.await.unwrap();

        assert_eq!(results.attempted, 30);
        assert_eq!(results.failure_count, 10);
        assert_eq!(results.completed, 20);
        assert_eq!(results.raw_samples[&Stage::Latency].len(), 20);
        let latency = AggregatedMetric::from_samples(&results.raw_samples[&Stage::Latency]).unwrap();
        assert_eq!(latency.count, 20);
        assert!(results.failures.iter().all(|f| f.cause.contains("refused")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_loop_warm_up_counts_failures() {
        let sender = Arc::new(FlakySender::new(4, Duration::from_millis(5)));
        let dispatcher = OpenLoopDispatcher::new(sender.clone(), request(), 10);

        let summary = dispatcher.warm_up(8, Duration::from_millis(10)).await;
        assert_eq!(summary.attempted, 8);
        assert_eq!(summary.failed, 2);
        assert!(summary.first_failure.unwrap().contains("refused"));
        assert_eq!(sender.started.lock().unwrap().len(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_loop_workers_run_back_to_back() {
        let sender = Arc::new(FlakySender::new(0, Duration::from_millis(50)));
        let dispatcher = ClosedLoopDispatcher::new(sender.clone(), request(), 3, 4);
        assert_eq!(dispatcher.total_requests(), 12);
        let (tx, rx) = mpsc::channel(4);

        let start = Instant::now();
        let handles = dispatcher.dispatch(tx);
        let results = ResultCollector::new(12).drain(rx).await;
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(results.completed, 12);
        assert_eq!(start.elapsed(), Duration::from_millis(200));
        assert_eq!(results.raw_samples.len(), 1);
        let latency = AggregatedMetric::from_samples(&results.raw_samples[&Stage::Latency]).unwrap();
        assert!((latency.mean - 0.05).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_loop_warm_up_is_sequential() {
        let sender = Arc::new(FlakySender::new(0, Duration::from_millis(10)));
        let dispatcher = ClosedLoopDispatcher::new(sender, request(), 2, 1);

        let start = Instant::now();
        let summary = dispatcher.warm_up(5).await;
        assert_eq!(summary.attempted, 5);
        assert_eq!(summary.failed, 0);
        assert_eq!(start.elapsed(), Duration::from_millis(50));
    }
}
