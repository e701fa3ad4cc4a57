use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{info, warn};

use crate::codec::EncodedRequest;
use crate::collector::{CollectedResults, ResultCollector};
use crate::config::Config;
use crate::context::{BenchmarkContext, RunPhase};
use crate::dispatcher::{ClosedLoopDispatcher, OpenLoopDispatcher, WarmupSummary};
use crate::error::{BenchError, Result};
use crate::report::{
    BenchmarkReport, ClosedLoopReport, ModeReport, OpenLoopReport, ResultAggregator, WarmupStats,
};
use crate::schedule::ArrivalSchedule;
use crate::sender::InferenceSender;
use crate::telemetry::{MetricsSource, PollerHandle, TelemetryPoller, TelemetryRecord};

const OUTCOME_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Paced submissions following a Poisson arrival schedule
    OpenLoop,
    /// Fixed-iteration workers issuing back-to-back calls
    ClosedLoop,
}

/// What the measured phase of either mode hands to aggregation.
struct Measured {
    mode: ModeReport,
    warmup: WarmupStats,
    collected: CollectedResults,
    telemetry: Option<TelemetryRecord>,
}

/// One bounded measurement session against a single endpoint.
pub struct Runner {
    config: Config,
    sender: Arc<dyn InferenceSender>,
    source: Option<Arc<dyn MetricsSource>>,
    request: Arc<EncodedRequest>,
    progress: bool,
}

impl Runner {
    pub fn new(config: Config, sender: Arc<dyn InferenceSender>, request: EncodedRequest) -> Self {
        Self {
            config,
            sender,
            source: None,
            request: Arc::new(request),
            progress: false,
        }
    }

    pub fn with_telemetry(mut self, source: Arc<dyn MetricsSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Run the session to completion.
    ///
    /// Only setup faults (bad parameters, a failed warm-up) end in an
    /// error; request failures during the measured phase are tallied in
    /// the returned report.
    pub async fn run(&self, mode: LoadMode) -> Result<BenchmarkReport> {
        let mut ctx = BenchmarkContext::new(self.config.clone());
        match self.execute(&mut ctx, mode).await {
            Ok(report) => Ok(report),
            Err(e) => {
                ctx.fail();
                warn!(error = %e, phase = ?ctx.phase(), "benchmark run failed");
                Err(e)
            }
        }
    }

    async fn execute(&self, ctx: &mut BenchmarkContext, mode: LoadMode) -> Result<BenchmarkReport> {
        let config = ctx.config().clone();
        config.validate()?;
        info!(
            sender = self.sender.name(),
            ?mode,
            model = config.primary_model(),
            batch_size = config.run.batch_size,
            payload_bytes = self.request.len(),
            "starting benchmark"
        );

        self.resolve_devices(&config).await?;

        let measured = match mode {
            LoadMode::OpenLoop => self.open_loop(ctx, &config).await?,
            LoadMode::ClosedLoop => self.closed_loop(ctx, &config).await?,
        };

        ctx.advance(RunPhase::Aggregating)?;
        let mut report = ResultAggregator::new(self.sender.name()).assemble(
            ctx,
            measured.collected,
            measured.telemetry,
            measured.mode,
            measured.warmup,
        );
        ctx.advance(RunPhase::Done)?;
        report.phases = ctx.phases().to_vec();
        info!(
            completed = report.completed,
            failed = report.failure_count,
            throughput = report.throughput,
            "benchmark finished"
        );
        Ok(report)
    }

    async fn open_loop(&self, ctx: &mut BenchmarkContext, config: &Config) -> Result<Measured> {
        let schedule = ArrivalSchedule::for_run(&config.run)?;
        if schedule.is_empty() {
            return Err(BenchError::invalid(format!(
                "rate {} over {}s yields no full batch of {}",
                config.run.rate, config.run.duration_secs, config.run.batch_size
            )));
        }
        info!(
            scheduled = schedule.len(),
            span_secs = schedule.span_secs(),
            "arrival schedule generated"
        );

        let dispatcher = OpenLoopDispatcher::new(
            Arc::clone(&self.sender),
            Arc::clone(&self.request),
            config.target.concurrency,
        );

        ctx.advance(RunPhase::Warmup)?;
        let warmup_count = config.run.batch_size as u64 * config.warmup.requests_per_batch as u64;
        let summary = dispatcher
            .warm_up(warmup_count, Duration::from_millis(config.warmup.interval_ms))
            .await;
        check_warmup(&summary, config.warmup.max_failures)?;

        ctx.advance(RunPhase::Running)?;
        let run_start = ctx.mark_started();
        let poller = self.start_poller(config, run_start);
        let gauge = ctx.in_flight();

        let expected = schedule.len() as u64;
        let (tx, rx) = mpsc::channel(OUTCOME_CHANNEL_CAPACITY);
        let collector = tokio::spawn(
            ResultCollector::new(expected)
                .with_progress(self.progress)
                .drain(rx),
        );

        let pending = dispatcher
            .dispatch(&schedule, run_start, Arc::clone(&gauge), tx)
            .await;
        ctx.advance(RunPhase::Draining)?;

        let max_pacing_lag = pending
            .iter()
            .map(|p| p.pacing_lag(run_start))
            .max()
            .unwrap_or_default();
        join_workers(pending.into_iter().map(|p| p.handle)).await;
        let collected = collector
            .await
            .map_err(|e| BenchError::Setup(format!("result collector panicked: {e}")))?;
        ctx.mark_finished();
        let telemetry = stop_poller(poller).await;

        let mode = ModeReport::OpenLoop(OpenLoopReport {
            rate: config.run.rate,
            duration_secs: config.run.duration_secs,
            seed: config.run.seed,
            scheduled: expected,
            arrival_offsets: schedule.into_offsets(),
            concurrency: config.target.concurrency,
            backpressure: gauge.stats(),
            max_pacing_lag_secs: max_pacing_lag.as_secs_f64(),
        });
        Ok(Measured {
            mode,
            warmup: WarmupStats::from(&summary),
            collected,
            telemetry,
        })
    }

    async fn closed_loop(&self, ctx: &mut BenchmarkContext, config: &Config) -> Result<Measured> {
        let dispatcher = ClosedLoopDispatcher::new(
            Arc::clone(&self.sender),
            Arc::clone(&self.request),
            config.closed_loop.num_threads,
            config.closed_loop.num_batches,
        );

        ctx.advance(RunPhase::Warmup)?;
        let summary = dispatcher.warm_up(config.warmup.iterations as u64).await;
        check_warmup(&summary, config.warmup.max_failures)?;

        ctx.advance(RunPhase::Running)?;
        let run_start = ctx.mark_started();
        let poller = self.start_poller(config, run_start);

        let expected = dispatcher.total_requests();
        let (tx, rx) = mpsc::channel(OUTCOME_CHANNEL_CAPACITY);
        let collector = tokio::spawn(
            ResultCollector::new(expected)
                .with_progress(self.progress)
                .drain(rx),
        );

        let workers = dispatcher.dispatch(tx);
        ctx.advance(RunPhase::Draining)?;
        join_workers(workers).await;
        let collected = collector
            .await
            .map_err(|e| BenchError::Setup(format!("result collector panicked: {e}")))?;
        ctx.mark_finished();
        let telemetry = stop_poller(poller).await;

        let mode = ModeReport::ClosedLoop(ClosedLoopReport {
            num_threads: config.closed_loop.num_threads,
            num_batches: config.closed_loop.num_batches,
            sample_throughput: 0.0,
        });
        Ok(Measured {
            mode,
            warmup: WarmupStats::from(&summary),
            collected,
            telemetry,
        })
    }

    /// Poll the telemetry source once before warm-up. Every tracked device
    /// must be reported, otherwise the run cannot attribute its telemetry.
    async fn resolve_devices(&self, config: &Config) -> Result<()> {
        let Some(source) = &self.source else {
            return Ok(());
        };
        let snapshots = source.poll().await.map_err(|e| {
            BenchError::Setup(format!("telemetry source {} unreachable: {e}", source.name()))
        })?;
        let missing: Vec<&str> = config
            .telemetry
            .devices
            .iter()
            .filter(|device| !snapshots.iter().any(|s| &s.device == *device))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            let reported: Vec<&str> = snapshots.iter().map(|s| s.device.as_str()).collect();
            return Err(BenchError::Setup(format!(
                "tracked devices {missing:?} not reported by {} (reported: {reported:?})",
                source.name()
            )));
        }
        info!(
            source = source.name(),
            devices = snapshots.len(),
            "telemetry devices resolved"
        );
        Ok(())
    }

    fn start_poller(&self, config: &Config, run_start: Instant) -> Option<PollerHandle> {
        self.source.as_ref().map(|source| {
            info!(
                source = source.name(),
                interval_ms = config.telemetry.interval_ms,
                "starting telemetry poller"
            );
            TelemetryPoller::new(Arc::clone(source), &config.telemetry).spawn(run_start)
        })
    }
}

fn check_warmup(summary: &WarmupSummary, max_failures: u64) -> Result<()> {
    if summary.failed > max_failures {
        return Err(BenchError::Setup(format!(
            "warm-up failed: {} of {} requests failed (first: {})",
            summary.failed,
            summary.attempted,
            summary.first_failure.as_deref().unwrap_or("unknown")
        )));
    }
    if summary.failed > 0 {
        warn!(failed = summary.failed, "warm-up had tolerated failures");
    }
    Ok(())
}

async fn join_workers(handles: impl IntoIterator<Item = JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "worker task failed");
        }
    }
}

async fn stop_poller(poller: Option<PollerHandle>) -> Option<TelemetryRecord> {
    match poller?.stop().await {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(error = %e, "telemetry lost");
            None
        }
    }
}
