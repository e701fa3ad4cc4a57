use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::time::Duration;

use crate::collector::{CollectedResults, FailureRecord};
use crate::config::Config;
use crate::context::{BackpressureStats, BenchmarkContext, PhaseMark};
use crate::dispatcher::WarmupSummary;
use crate::error::{BenchError, Result};
use crate::outcome::Stage;
use crate::stats::AggregatedMetric;
use crate::telemetry::{topology, DeviceTopology, TelemetryRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenLoopReport {
    pub rate: f64,
    pub duration_secs: f64,
    pub seed: u64,
    /// Submissions in the (batch-truncated) schedule
    pub scheduled: u64,
    pub arrival_offsets: Vec<f64>,
    pub concurrency: usize,
    pub backpressure: BackpressureStats,
    /// Worst delay between a scheduled instant and its actual submission
    pub max_pacing_lag_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedLoopReport {
    pub num_threads: usize,
    pub num_batches: u64,
    /// Samples (requests x batch size) per second
    pub sample_throughput: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModeReport {
    OpenLoop(OpenLoopReport),
    ClosedLoop(ClosedLoopReport),
}

impl ModeReport {
    /// Worker count used in the report file name.
    pub fn threads(&self) -> usize {
        match self {
            ModeReport::OpenLoop(open) => open.concurrency,
            ModeReport::ClosedLoop(closed) => closed.num_threads,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmupStats {
    pub attempted: u64,
    pub failed: u64,
}

impl From<&WarmupSummary> for WarmupStats {
    fn from(summary: &WarmupSummary) -> Self {
        Self {
            attempted: summary.attempted,
            failed: summary.failed,
        }
    }
}

/// Terminal artifact of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub test_time: String,
    pub mode: ModeReport,
    pub sender: String,
    pub models: Vec<String>,
    pub task: String,
    pub batch_size: u32,
    pub client_preprocessing: bool,
    pub warmup: WarmupStats,
    pub attempted: u64,
    pub completed: u64,
    pub failure_count: u64,
    pub failures: Vec<FailureRecord>,
    /// Successes whose server stages overran the end-to-end time
    pub non_additive_count: u64,
    pub elapsed_secs: f64,
    /// Completed requests per second of wall time
    pub throughput: f64,
    pub raw_samples: BTreeMap<Stage, Vec<f64>>,
    /// Only stages with at least one sample appear here
    pub metrics: BTreeMap<Stage, AggregatedMetric>,
    pub telemetry: Option<TelemetryRecord>,
    pub device_model: Option<String>,
    pub topology: Vec<DeviceTopology>,
    pub phases: Vec<PhaseMark>,
    pub config: Config,
}

impl BenchmarkReport {
    /// `<device_model>_<model>_bs<batch>_j<threads>[_<suffix>].json`
    pub fn file_name(&self) -> String {
        let device = path_safe(self.device_model.as_deref().unwrap_or("unknown-device"));
        let model = path_safe(self.models.first().map(String::as_str).unwrap_or("unknown"));
        let mut name = format!(
            "{}_{}_bs{}_j{}",
            device,
            model,
            self.batch_size,
            self.mode.threads()
        );
        if let Some(suffix) = self.config.report.suffix.as_deref().filter(|s| !s.is_empty()) {
            name.push('_');
            name.push_str(&path_safe(suffix));
        }
        name.push_str(".json");
        name
    }

    /// Write the report as pretty JSON under the configured directory.
    pub fn write(&self) -> Result<PathBuf> {
        self.write_to(&self.config.report.dir)
    }

    pub fn write_to(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let dir = dir.as_ref();
        let path = dir.join(self.file_name());
        let write_err = |source: std::io::Error| BenchError::ReportWrite {
            path: path.clone(),
            source,
        };

        std::fs::create_dir_all(dir).map_err(write_err)?;
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| write_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        std::fs::write(&path, json).map_err(write_err)?;
        Ok(path)
    }

    pub fn metric(&self, stage: Stage) -> Option<&AggregatedMetric> {
        self.metrics.get(&stage)
    }
}

pub fn throughput(completed: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        completed as f64 / secs
    } else {
        0.0
    }
}

/// Summaries for every stage that has samples.
pub fn aggregate(raw: &BTreeMap<Stage, Vec<f64>>) -> BTreeMap<Stage, AggregatedMetric> {
    raw.iter()
        .filter_map(|(stage, samples)| {
            AggregatedMetric::from_samples(samples).map(|metric| (*stage, metric))
        })
        .collect()
}

/// Reduces collected samples and merges them with telemetry into a report.
pub struct ResultAggregator {
    sender: String,
    test_time: String,
}

impl ResultAggregator {
    pub fn new(sender: &str) -> Self {
        Self {
            sender: sender.to_string(),
            test_time: chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string(),
        }
    }

    pub fn assemble(
        &self,
        ctx: &BenchmarkContext,
        collected: CollectedResults,
        telemetry: Option<TelemetryRecord>,
        mut mode: ModeReport,
        warmup: WarmupStats,
    ) -> BenchmarkReport {
        let config = ctx.config().clone();
        let elapsed = ctx.elapsed().unwrap_or_default();
        let throughput = throughput(collected.completed, elapsed);
        if let ModeReport::ClosedLoop(closed) = &mut mode {
            closed.sample_throughput = throughput * config.run.batch_size as f64;
        }

        let device_model = config.report.device_model.clone().or_else(|| {
            telemetry
                .as_ref()
                .and_then(|t| t.device_model().map(str::to_string))
        });
        let topology = telemetry.as_ref().map(topology).unwrap_or_default();

        // transitions recorded so far; the runner refreshes this after Done
        let phases = ctx.phases().to_vec();

        BenchmarkReport {
            test_time: self.test_time.clone(),
            mode,
            sender: self.sender.clone(),
            models: config.run.models.clone(),
            task: config.run.task.clone(),
            batch_size: config.run.batch_size,
            client_preprocessing: config.run.client_preprocessing,
            warmup,
            attempted: collected.attempted,
            completed: collected.completed,
            failure_count: collected.failure_count,
            failures: collected.failures,
            non_additive_count: collected.non_additive_count,
            elapsed_secs: elapsed.as_secs_f64(),
            throughput,
            metrics: aggregate(&collected.raw_samples),
            raw_samples: collected.raw_samples,
            telemetry,
            device_model,
            topology,
            phases,
            config,
        }
    }
}

/// Keep a name component inside a single path segment.
fn path_safe(component: &str) -> String {
    component.replace(['/', '\\', ' '], "-")
}
