use anyhow::{Context, Result};
use bench_core::{
    encode, ArrivalSchedule, BenchmarkReport, Config, HttpSender, InferenceSender, LoadMode,
    MetricsSource, MockSender, ModeReport, PrometheusSource, Runner, TelemetrySourceKind,
    TensorPayload,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Image-sized tensor sent when no payload file is given.
const SYNTHETIC_SHAPE: [i64; 3] = [224, 224, 3];

#[derive(Parser, Debug)]
#[command(name = "bench-client")]
#[command(about = "Inference serving benchmark - paced or closed-loop load with timing breakdowns")]
struct Args {
    /// Path to configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Load mode: open-loop or closed-loop
    #[arg(long, default_value = "open-loop")]
    mode: String,

    /// Request transport: http or mock
    #[arg(long, default_value = "http")]
    sender: String,

    /// Batch size
    #[arg(short = 'b', long = "bs")]
    batch_size: Option<u32>,

    /// Model name (repeatable)
    #[arg(short = 'm', long = "model")]
    models: Vec<String>,

    /// Base URL of the serving endpoint
    #[arg(long)]
    url: Option<String>,

    /// Service (task) name
    #[arg(short = 'n', long = "name")]
    task: Option<String>,

    /// Mean arrival rate in requests per second
    #[arg(short = 'r', long)]
    rate: Option<f64>,

    /// Run duration in seconds
    #[arg(short = 't', long = "time")]
    duration_secs: Option<f64>,

    /// File with the raw tensor bytes to send
    #[arg(long)]
    data: Option<PathBuf>,

    /// Tag the run as using client-side preprocessing
    #[arg(short = 'P', long)]
    preprocessing: bool,

    /// Workers: pool size in open loop, worker count in closed loop
    #[arg(long)]
    threads: Option<usize>,

    /// Sequential calls per closed-loop worker
    #[arg(long)]
    num_batches: Option<u64>,

    /// Prometheus (DCGM exporter) endpoint to poll during the run
    #[arg(long)]
    telemetry_url: Option<String>,

    /// Suffix appended to the report file name
    #[arg(long)]
    report_suffix: Option<String>,

    /// Simulated latency of the mock sender
    #[arg(long, default_value = "5")]
    mock_delay_ms: u64,

    /// Run without writing the report
    #[arg(long)]
    dry_run: bool,

    /// Print the arrival schedule summary and exit
    #[arg(long)]
    schedule_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mode = match args.mode.as_str() {
        "open-loop" => LoadMode::OpenLoop,
        "closed-loop" => LoadMode::ClosedLoop,
        other => anyhow::bail!("Invalid mode: {}, must be 'open-loop' or 'closed-loop'", other),
    };

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => Config::default(),
    };
    apply_overrides(&mut config, &args, mode);
    config.validate().context("Invalid configuration")?;

    if args.schedule_only {
        let schedule = ArrivalSchedule::for_run(&config.run)?;
        print_schedule(&config, &schedule);
        return Ok(());
    }

    let sender: Arc<dyn InferenceSender> = match args.sender.as_str() {
        "mock" => Arc::new(MockSender::new(Duration::from_millis(args.mock_delay_ms))),
        "http" => Arc::new(
            HttpSender::new(&config.target.url, &config.run.task, config.target.timeout_ms)
                .context("Failed to create HTTP sender")?,
        ),
        _ => anyhow::bail!("Invalid sender: {}, must be 'mock' or 'http'", args.sender),
    };
    info!("Using sender: {}", sender.name());

    let payload = load_payload(&config)?;
    let request = encode(&payload).context("Failed to encode payload")?;
    info!(
        "Payload: shape={:?} datatype={} encoded={} bytes",
        payload.shape(),
        payload.datatype().wire_name(),
        request.len()
    );

    let mut runner = Runner::new(config.clone(), sender, request).with_progress(true);
    if config.telemetry.source == TelemetrySourceKind::Prometheus {
        let url = config
            .telemetry
            .url
            .clone()
            .context("telemetry.url required for the prometheus source")?;
        let source: Arc<dyn MetricsSource> = Arc::new(
            PrometheusSource::new(url, Duration::from_millis(config.telemetry.interval_ms))
                .context("Failed to create telemetry source")?,
        );
        runner = runner.with_telemetry(source);
    }

    let report = runner.run(mode).await.context("Benchmark run failed")?;
    print_summary(&report);

    if args.dry_run {
        info!("Dry run: report not written");
        return Ok(());
    }
    let path = report.write().context("Failed to write report")?;
    info!("Report written to {}", path.display());

    Ok(())
}

fn apply_overrides(config: &mut Config, args: &Args, mode: LoadMode) {
    if let Some(batch_size) = args.batch_size {
        config.run.batch_size = batch_size;
    }
    if !args.models.is_empty() {
        config.run.models = args.models.clone();
    }
    if let Some(url) = &args.url {
        config.target.url = url.clone();
    }
    if let Some(task) = &args.task {
        config.run.task = task.clone();
    }
    if let Some(rate) = args.rate {
        config.run.rate = rate;
    }
    if let Some(duration_secs) = args.duration_secs {
        config.run.duration_secs = duration_secs;
    }
    if let Some(data) = &args.data {
        config.run.data_path = Some(data.clone());
    }
    if args.preprocessing {
        config.run.client_preprocessing = true;
    }
    if let Some(threads) = args.threads {
        match mode {
            LoadMode::OpenLoop => config.target.concurrency = threads,
            LoadMode::ClosedLoop => config.closed_loop.num_threads = threads,
        }
    }
    if let Some(num_batches) = args.num_batches {
        config.closed_loop.num_batches = num_batches;
    }
    if let Some(url) = &args.telemetry_url {
        config.telemetry.source = TelemetrySourceKind::Prometheus;
        config.telemetry.url = Some(url.clone());
    }
    if let Some(suffix) = &args.report_suffix {
        config.report.suffix = Some(suffix.clone());
    }
}

fn load_payload(config: &Config) -> Result<TensorPayload> {
    let run = &config.run;
    if let Some(path) = &run.data_path {
        return TensorPayload::from_file(path, run.shape.clone(), run.datatype)
            .with_context(|| format!("Failed to load payload from {:?}", path));
    }

    warn!("No payload file given, sending a zero-filled tensor");
    let shape = run.shape.clone().unwrap_or_else(|| SYNTHETIC_SHAPE.to_vec());
    let len = run
        .datatype
        .tensor_len(&shape)?
        .context("A payload file is required for TYPE_BYTES tensors")?;
    Ok(TensorPayload::from_raw(shape, run.datatype, vec![0; len])?)
}

fn print_schedule(config: &Config, schedule: &ArrivalSchedule) {
    println!("\n=== Arrival Schedule ===");
    println!(
        "Rate: {} req/s  Duration: {}s  Seed: {}  Batch size: {}",
        config.run.rate, config.run.duration_secs, config.run.seed, config.run.batch_size
    );
    println!("Requests: {}", schedule.len());
    println!("Span: {:.3}s", schedule.span_secs());
    if schedule.len() > 1 {
        println!(
            "Mean gap: {:.4}s",
            schedule.span_secs() / (schedule.len() - 1) as f64
        );
    }
    let head: Vec<String> = schedule
        .offsets()
        .iter()
        .take(10)
        .map(|o| format!("{o:.4}"))
        .collect();
    println!("First offsets: [{}]", head.join(", "));
    println!();
}

fn print_summary(report: &BenchmarkReport) {
    println!("\n=== Benchmark Summary ({}) ===", report.test_time);
    println!(
        "Models: {}  Task: {}  Batch size: {}  Client preprocessing: {}",
        report.models.join(","),
        report.task,
        report.batch_size,
        report.client_preprocessing
    );
    match &report.mode {
        ModeReport::OpenLoop(open) => {
            println!(
                "Open loop: rate={} duration={}s scheduled={} concurrency={}",
                open.rate, open.duration_secs, open.scheduled, open.concurrency
            );
            println!(
                "Peak in flight: {} (over high water: {})  Max pacing lag: {:.1}ms",
                open.backpressure.peak_in_flight,
                open.backpressure.submissions_over_high_water,
                open.max_pacing_lag_secs * 1000.0
            );
        }
        ModeReport::ClosedLoop(closed) => {
            println!(
                "Closed loop: threads={} batches={} samples/s={:.2}",
                closed.num_threads, closed.num_batches, closed.sample_throughput
            );
        }
    }
    println!("Warm-up: {} sent, {} failed", report.warmup.attempted, report.warmup.failed);
    println!("Attempted: {}", report.attempted);
    println!("Completed: {}", report.completed);
    println!("Failed: {}", report.failure_count);
    if report.non_additive_count > 0 {
        println!("Non-additive breakdowns: {}", report.non_additive_count);
    }
    println!("Elapsed: {:.3}s", report.elapsed_secs);
    println!("Throughput: {:.2} req/s", report.throughput);

    if report.metrics.is_empty() {
        println!("No successful requests: timing metrics unavailable");
    } else {
        println!(
            "{:<22} {:>10} {:>10} {:>10} {:>10} {:>10}",
            "stage (ms)", "mean", "std", "p50", "p95", "p99"
        );
        for (stage, metric) in &report.metrics {
            println!(
                "{:<22} {:>10.3} {:>10.3} {:>10.3} {:>10.3} {:>10.3}",
                stage.name(),
                metric.mean * 1000.0,
                metric.std * 1000.0,
                metric.p50 * 1000.0,
                metric.p95 * 1000.0,
                metric.p99 * 1000.0
            );
        }
    }

    if let Some(telemetry) = &report.telemetry {
        for (device, series) in &telemetry.devices {
            let status = if series.degraded { " [degraded]" } else { "" };
            println!("Device {}{}:", device, status);
            for (metric, summary) in &series.summary {
                println!("  {:<32} mean={:.2} max={:.2}", metric, summary.mean, summary.max);
            }
        }
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_core::DataType;

    #[test]
    fn test_cli_overrides_config() {
        let args = Args::parse_from([
            "bench-client",
            "--mode",
            "closed-loop",
            "-b",
            "8",
            "-m",
            "resnet50",
            "-m",
            "vgg16",
            "-r",
            "12.5",
            "-t",
            "60",
            "-P",
            "--threads",
            "4",
            "--telemetry-url",
            "http://localhost:9400/metrics",
        ]);
        let mut config = Config::default();
        apply_overrides(&mut config, &args, LoadMode::ClosedLoop);

        assert_eq!(config.run.batch_size, 8);
        assert_eq!(config.run.models, vec!["resnet50", "vgg16"]);
        assert_eq!(config.run.rate, 12.5);
        assert_eq!(config.run.duration_secs, 60.0);
        assert!(config.run.client_preprocessing);
        assert_eq!(config.closed_loop.num_threads, 4);
        assert_eq!(config.target.concurrency, 10);
        assert_eq!(config.telemetry.source, TelemetrySourceKind::Prometheus);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_synthetic_payload() {
        let mut config = Config::default();
        config.run.shape = Some(vec![2, 4]);
        config.run.datatype = DataType::Fp32;
        let payload = load_payload(&config).unwrap();
        assert_eq!(payload.raw().len(), 32);

        config.run.datatype = DataType::Bytes;
        assert!(load_payload(&config).is_err());
    }

    #[test]
    fn test_synthetic_payload_rejects_overflowing_shape() {
        let mut config = Config::default();
        config.run.shape = Some(vec![i64::MAX, 4]);
        config.run.datatype = DataType::Fp32;
        let err = load_payload(&config).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<bench_core::BenchError>(),
            Some(bench_core::BenchError::InvalidParameter(_))
        ));

        config.run.shape = Some(vec![-2, 3]);
        assert!(load_payload(&config).is_err());
    }
}
