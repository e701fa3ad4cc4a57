use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::codec::DataType;
use crate::error::{BenchError, Result};
use crate::schedule::check_expected_arrivals;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub run: RunConfig,
    pub target: TargetConfig,
    pub warmup: WarmupConfig,
    pub closed_loop: ClosedLoopConfig,
    pub telemetry: TelemetryConfig,
    pub report: ReportConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        Ok(config)
    }

    /// Reject configurations that cannot produce a meaningful run.
    pub fn validate(&self) -> Result<()> {
        let run = &self.run;
        if !run.rate.is_finite() || run.rate <= 0.0 {
            return Err(BenchError::invalid(format!(
                "rate must be positive, got {}",
                run.rate
            )));
        }
        if !run.duration_secs.is_finite() || run.duration_secs <= 0.0 {
            return Err(BenchError::invalid(format!(
                "duration must be positive, got {}",
                run.duration_secs
            )));
        }
        check_expected_arrivals(run.rate, run.duration_secs)?;
        if run.batch_size == 0 {
            return Err(BenchError::invalid("batch_size must be greater than zero"));
        }
        if run.models.is_empty() {
            return Err(BenchError::invalid("at least one model name is required"));
        }
        if self.target.concurrency == 0 {
            return Err(BenchError::invalid("concurrency must be greater than zero"));
        }
        validate_http_url(&self.target.url)?;
        if self.closed_loop.num_threads == 0 {
            return Err(BenchError::invalid("num_threads must be greater than zero"));
        }
        if self.closed_loop.num_batches == 0 {
            return Err(BenchError::invalid("num_batches must be greater than zero"));
        }
        if self.telemetry.interval_ms == 0 {
            return Err(BenchError::invalid(
                "telemetry interval_ms must be greater than zero",
            ));
        }
        if self.telemetry.source == TelemetrySourceKind::Prometheus {
            let url = self.telemetry.url.as_deref().ok_or_else(|| {
                BenchError::invalid("telemetry.url is required for the prometheus source")
            })?;
            validate_http_url(url)?;
        }
        Ok(())
    }

    /// Model name used for report naming; the first configured model.
    pub fn primary_model(&self) -> &str {
        self.run.models.first().map(String::as_str).unwrap_or("unknown")
    }
}

fn validate_http_url(raw: &str) -> Result<url::Url> {
    let url = url::Url::parse(raw)
        .map_err(|e| BenchError::invalid(format!("invalid URL {raw}: {e}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(BenchError::invalid(format!(
            "URL must be http:// or https:// (got {raw})"
        )));
    }
    if url.host_str().is_none() {
        return Err(BenchError::invalid(format!("URL must include a host (got {raw})")));
    }
    Ok(url)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Frontend batch size; the schedule is cut to a multiple of it
    pub batch_size: u32,
    /// Names of the models under test
    pub models: Vec<String>,
    /// Service (task) name, appended to the predict route
    pub task: String,
    /// Mean arrival rate in requests per second
    pub rate: f64,
    /// Nominal run duration in seconds
    pub duration_secs: f64,
    /// Seed for the arrival process
    pub seed: u64,
    /// Whether the payload was preprocessed on the client side
    pub client_preprocessing: bool,
    /// File holding the raw tensor bytes to send
    pub data_path: Option<PathBuf>,
    /// Tensor shape; defaults to a flat `[len]` tensor
    pub shape: Option<Vec<i64>>,
    pub datatype: DataType,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            models: Vec::new(),
            task: "image_classification".to_string(),
            rate: 5.0,
            duration_secs: 30.0,
            seed: 666,
            client_preprocessing: false,
            data_path: None,
            shape: None,
            datatype: DataType::Uint8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Base URL of the serving endpoint
    pub url: String,
    /// Per-request timeout in milliseconds
    pub timeout_ms: u64,
    /// Size of the open-loop worker pool
    pub concurrency: usize,
    /// In-flight count above which a submission is flagged as backpressured
    pub in_flight_high_water: usize,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:50075".to_string(),
            timeout_ms: 30_000,
            concurrency: 10,
            in_flight_high_water: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmupConfig {
    /// Open loop sends `batch_size * requests_per_batch` warm-up requests
    pub requests_per_batch: u32,
    /// Spacing between open-loop warm-up submissions
    pub interval_ms: u64,
    /// Sequential warm-up calls in closed loop
    pub iterations: u32,
    /// Warm-up failures tolerated before the run is declared failed
    pub max_failures: u64,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            requests_per_batch: 100,
            interval_ms: 10,
            iterations: 100,
            max_failures: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClosedLoopConfig {
    pub num_threads: usize,
    /// Sequential calls made by each worker
    pub num_batches: u64,
}

impl Default for ClosedLoopConfig {
    fn default() -> Self {
        Self {
            num_threads: 1,
            num_batches: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetrySourceKind {
    #[default]
    None,
    Prometheus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub source: TelemetrySourceKind,
    /// Metrics endpoint, e.g. a DCGM exporter at `http://host:9400/metrics`
    pub url: Option<String>,
    pub interval_ms: u64,
    /// Devices to track; empty tracks everything the source reports
    pub devices: Vec<String>,
    /// Consecutive missed polls after which a device is marked degraded
    pub max_consecutive_misses: u32,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            source: TelemetrySourceKind::None,
            url: None,
            interval_ms: 1000,
            devices: Vec::new(),
            max_consecutive_misses: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub dir: PathBuf,
    /// Appended to the report file name
    pub suffix: Option<String>,
    /// Overrides the device model name discovered through telemetry
    pub device_model: Option<String>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("results"),
            suffix: None,
            device_model: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.run.models = vec!["resnet18".to_string()];
        config
    }

    #[test]
    fn test_config_serde() {
        let config_str = r#"
[run]
batch_size = 4
models = ["resnet50", "resnet18"]
rate = 20.0
duration_secs = 60.0
seed = 42
client_preprocessing = true
shape = [3, 224, 224]
datatype = "TYPE_FP32"

[target]
url = "http://10.0.0.2:50075"
concurrency = 16

[closed_loop]
num_threads = 2
num_batches = 500

[telemetry]
source = "prometheus"
url = "http://10.0.0.2:9400/metrics"
devices = ["gpu0-gi1"]

[report]
dir = "out"
suffix = "mig"
        "#;

        let config = Config::from_toml(config_str).unwrap();
        assert_eq!(config.run.batch_size, 4);
        assert_eq!(config.primary_model(), "resnet50");
        assert_eq!(config.run.seed, 42);
        assert!(config.run.client_preprocessing);
        assert_eq!(config.run.shape, Some(vec![3, 224, 224]));
        assert_eq!(config.run.datatype, DataType::Fp32);
        assert_eq!(config.target.concurrency, 16);
        assert_eq!(config.target.timeout_ms, 30_000);
        assert_eq!(config.closed_loop.num_batches, 500);
        assert_eq!(config.telemetry.source, TelemetrySourceKind::Prometheus);
        assert_eq!(config.telemetry.max_consecutive_misses, 3);
        assert_eq!(config.report.suffix.as_deref(), Some("mig"));
        config.validate().unwrap();
    }

    #[test]
    fn test_example_config_loads() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/example.toml");
        let config = Config::from_file(path).unwrap();
        assert_eq!(config.run.batch_size, 4);
        assert_eq!(config.run.datatype, DataType::Uint8);
        assert_eq!(config.telemetry.source, TelemetrySourceKind::None);
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.run.rate, 5.0);
        assert_eq!(config.run.duration_secs, 30.0);
        assert_eq!(config.run.seed, 666);
        assert_eq!(config.target.concurrency, 10);
        assert_eq!(config.warmup.requests_per_batch, 100);
        assert_eq!(config.telemetry.interval_ms, 1000);
    }

    #[test]
    fn test_validate_rejects_bad_parameters() {
        let mut config = valid_config();
        config.validate().unwrap();

        config.run.rate = 0.0;
        assert!(matches!(
            config.validate(),
            Err(BenchError::InvalidParameter(_))
        ));

        let mut config = valid_config();
        config.run.duration_secs = -1.0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.run.rate = 1e19;
        config.run.duration_secs = 1.0;
        assert!(matches!(
            config.validate(),
            Err(BenchError::InvalidParameter(_))
        ));

        let mut config = valid_config();
        config.run.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.run.models.clear();
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.target.url = "ftp://localhost".to_string();
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.telemetry.source = TelemetrySourceKind::Prometheus;
        assert!(config.validate().is_err());
        config.telemetry.url = Some("http://localhost:9400/metrics".to_string());
        config.validate().unwrap();
    }
}
