use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::info;

use crate::config::Config;
use crate::error::{BenchError, Result};

/// Lifecycle of a benchmark run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunPhase {
    Init,
    Warmup,
    Running,
    Draining,
    Aggregating,
    Done,
    Failed,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Done | RunPhase::Failed)
    }

    fn can_advance_to(self, next: RunPhase) -> bool {
        use RunPhase::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Init, Warmup) | (Warmup, Running) | (Running, Draining) => true,
            (Draining, Aggregating) | (Aggregating, Done) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseMark {
    pub phase: RunPhase,
    /// Seconds since the context was created
    pub at_secs: f64,
}

/// Counts submitted-but-unfinished requests.
///
/// Crossing the high-water mark is recorded, never enforced.
#[derive(Debug)]
pub struct InFlightGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
    over_high_water: AtomicU64,
    high_water: usize,
}

impl InFlightGauge {
    pub fn new(high_water: usize) -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            over_high_water: AtomicU64::new(0),
            high_water,
        }
    }

    /// Register a submission; returns the in-flight count including it.
    pub fn enter(&self) -> usize {
        let now = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        if now > self.high_water {
            self.over_high_water.fetch_add(1, Ordering::Relaxed);
        }
        now
    }

    pub fn exit(&self) {
        self.current.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> BackpressureStats {
        BackpressureStats {
            high_water: self.high_water,
            peak_in_flight: self.peak.load(Ordering::Acquire),
            submissions_over_high_water: self.over_high_water.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackpressureStats {
    pub high_water: usize,
    pub peak_in_flight: usize,
    pub submissions_over_high_water: u64,
}

/// All mutable state of one run, passed explicitly to every component.
pub struct BenchmarkContext {
    config: Config,
    phase: RunPhase,
    phases: Vec<PhaseMark>,
    created: Instant,
    run_start: Option<Instant>,
    run_finish: Option<Instant>,
    in_flight: Arc<InFlightGauge>,
}

impl BenchmarkContext {
    pub fn new(config: Config) -> Self {
        let in_flight = Arc::new(InFlightGauge::new(config.target.in_flight_high_water));
        Self {
            config,
            phase: RunPhase::Init,
            phases: vec![PhaseMark {
                phase: RunPhase::Init,
                at_secs: 0.0,
            }],
            created: Instant::now(),
            run_start: None,
            run_finish: None,
            in_flight,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn phases(&self) -> &[PhaseMark] {
        &self.phases
    }

    pub fn advance(&mut self, next: RunPhase) -> Result<()> {
        if !self.phase.can_advance_to(next) {
            return Err(BenchError::Setup(format!(
                "illegal phase transition {:?} -> {:?}",
                self.phase, next
            )));
        }
        info!(from = ?self.phase, to = ?next, "run phase");
        self.phase = next;
        self.phases.push(PhaseMark {
            phase: next,
            at_secs: self.created.elapsed().as_secs_f64(),
        });
        Ok(())
    }

    /// Move to `Failed` unless the run already terminated.
    pub fn fail(&mut self) {
        if !self.phase.is_terminal() {
            let _ = self.advance(RunPhase::Failed);
        }
    }

    /// Fix the shared start instant T0 and return it.
    pub fn mark_started(&mut self) -> Instant {
        let now = Instant::now();
        self.run_start = Some(now);
        now
    }

    pub fn mark_finished(&mut self) -> Instant {
        let now = Instant::now();
        self.run_finish = Some(now);
        now
    }

    pub fn run_start(&self) -> Option<Instant> {
        self.run_start
    }

    /// Wall time between T0 and the finish instant.
    pub fn elapsed(&self) -> Option<Duration> {
        match (self.run_start, self.run_finish) {
            (Some(start), Some(finish)) => Some(finish.saturating_duration_since(start)),
            _ => None,
        }
    }

    pub fn in_flight(&self) -> Arc<InFlightGauge> {
        Arc::clone(&self.in_flight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut ctx = BenchmarkContext::new(Config::default());
        for phase in [
            RunPhase::Warmup,
            RunPhase::Running,
            RunPhase::Draining,
            RunPhase::Aggregating,
            RunPhase::Done,
        ] {
            ctx.advance(phase).unwrap();
        }
        assert_eq!(ctx.phase(), RunPhase::Done);
        assert_eq!(ctx.phases().len(), 6);

        // terminal phases do not move
        ctx.fail();
        assert_eq!(ctx.phase(), RunPhase::Done);
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut ctx = BenchmarkContext::new(Config::default());
        assert!(ctx.advance(RunPhase::Running).is_err());
        assert_eq!(ctx.phase(), RunPhase::Init);

        ctx.advance(RunPhase::Warmup).unwrap();
        ctx.fail();
        assert_eq!(ctx.phase(), RunPhase::Failed);
        assert!(ctx.advance(RunPhase::Running).is_err());
    }

    #[test]
    fn test_in_flight_gauge_tracks_peak_and_high_water() {
        let gauge = InFlightGauge::new(2);
        assert_eq!(gauge.enter(), 1);
        assert_eq!(gauge.enter(), 2);
        assert_eq!(gauge.enter(), 3);
        gauge.exit();
        gauge.exit();
        assert_eq!(gauge.enter(), 2);
        assert_eq!(gauge.current(), 2);

        let stats = gauge.stats();
        assert_eq!(stats.peak_in_flight, 3);
        assert_eq!(stats.submissions_over_high_water, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_between_start_and_finish() {
        let mut ctx = BenchmarkContext::new(Config::default());
        assert_eq!(ctx.elapsed(), None);
        ctx.mark_started();
        tokio::time::sleep(Duration::from_secs(10)).await;
        ctx.mark_finished();
        assert_eq!(ctx.elapsed(), Some(Duration::from_secs(10)));
    }
}
