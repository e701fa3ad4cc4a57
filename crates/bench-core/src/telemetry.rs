use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::TelemetryConfig;
use crate::error::{BenchError, Result};
use crate::stats::AggregatedMetric;

/// Labels describing the device itself rather than a single reading.
const STATIC_LABELS: [&str; 6] = ["gpu", "UUID", "modelName", "Hostname", "GPU_I_PROFILE", "GPU_I_ID"];

/// Current readings of one device.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeviceSnapshot {
    pub device: String,
    pub labels: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, f64>,
}

pub type PollFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<DeviceSnapshot>>> + Send + 'a>>;

/// External resource-metrics source.
pub trait MetricsSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn poll<'a>(&'a self) -> PollFuture<'a>;
}

/// Scrapes a Prometheus text endpoint such as the DCGM exporter.
pub struct PrometheusSource {
    client: reqwest::Client,
    url: String,
}

impl PrometheusSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BenchError::Setup(format!("failed to build telemetry client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl MetricsSource for PrometheusSource {
    fn name(&self) -> &'static str {
        "prometheus"
    }

    fn poll<'a>(&'a self) -> PollFuture<'a> {
        Box::pin(async move {
            let response = self
                .client
                .get(&self.url)
                .send()
                .await
                .map_err(|e| BenchError::TelemetryGap(e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(BenchError::TelemetryGap(format!(
                    "metrics endpoint returned {status}"
                )));
            }
            let text = response
                .text()
                .await
                .map_err(|e| BenchError::TelemetryGap(e.to_string()))?;
            Ok(parse_exposition(&text))
        })
    }
}

/// Group a Prometheus text exposition into per-device snapshots.
///
/// Samples without a `gpu` label are not device-scoped and are skipped.
pub fn parse_exposition(text: &str) -> Vec<DeviceSnapshot> {
    let mut devices: BTreeMap<String, DeviceSnapshot> = BTreeMap::new();
    for line in text.lines() {
        let Some((name, labels, value)) = parse_sample_line(line) else {
            continue;
        };
        let Some(device) = device_identity(&labels) else {
            continue;
        };
        let snapshot = devices.entry(device.clone()).or_insert_with(|| DeviceSnapshot {
            device,
            ..DeviceSnapshot::default()
        });
        for key in STATIC_LABELS {
            if let Some(v) = labels.get(key) {
                snapshot.labels.entry(key.to_string()).or_insert_with(|| v.clone());
            }
        }
        snapshot.metrics.insert(name.to_string(), value);
    }
    devices.into_values().collect()
}

/// `gpu<N>` for a whole GPU, `gpu<N>-gi<M>` for a MIG GPU instance.
pub fn device_identity(labels: &BTreeMap<String, String>) -> Option<String> {
    let gpu = labels.get("gpu")?;
    match labels.get("GPU_I_ID").filter(|id| !id.is_empty()) {
        Some(instance) => Some(format!("gpu{gpu}-gi{instance}")),
        None => Some(format!("gpu{gpu}")),
    }
}

fn parse_sample_line(line: &str) -> Option<(&str, BTreeMap<String, String>, f64)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let name_end = line.find(|c: char| c == '{' || c.is_whitespace())?;
    let name = &line[..name_end];
    let mut rest = &line[name_end..];
    let mut labels = BTreeMap::new();
    if let Some(body) = rest.strip_prefix('{') {
        let (parsed, consumed) = parse_labels(body)?;
        labels = parsed;
        rest = &body[consumed..];
    }
    let value = rest.split_whitespace().next()?.parse::<f64>().ok()?;
    Some((name, labels, value))
}

/// Parse `k="v",...}`; returns the labels and the bytes consumed including
/// the closing brace.
fn parse_labels(input: &str) -> Option<(BTreeMap<String, String>, usize)> {
    let bytes = input.as_bytes();
    let mut labels = BTreeMap::new();
    let mut i = 0;
    loop {
        while i < bytes.len() && (bytes[i] == b',' || bytes[i].is_ascii_whitespace()) {
            i += 1;
        }
        if *bytes.get(i)? == b'}' {
            return Some((labels, i + 1));
        }

        let key_start = i;
        while bytes.get(i)? != &b'=' {
            i += 1;
        }
        let key = input[key_start..i].trim().to_string();
        i += 1;
        if bytes.get(i)? != &b'"' {
            return None;
        }
        i += 1;

        let mut value = String::new();
        loop {
            let c = input[i..].chars().next()?;
            i += c.len_utf8();
            match c {
                '"' => break,
                '\\' => {
                    let escaped = input[i..].chars().next()?;
                    i += escaped.len_utf8();
                    value.push(if escaped == 'n' { '\n' } else { escaped });
                }
                other => value.push(other),
            }
        }
        labels.insert(key, value);
    }
}

/// Scripted source for tests; repeats its final entry once exhausted.
pub struct MockSource {
    script: Mutex<VecDeque<std::result::Result<Vec<DeviceSnapshot>, String>>>,
    polls: AtomicUsize,
}

impl MockSource {
    pub fn new(script: Vec<std::result::Result<Vec<DeviceSnapshot>, String>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            polls: AtomicUsize::new(0),
        }
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::Relaxed)
    }

    fn next_entry(&self) -> std::result::Result<Vec<DeviceSnapshot>, String> {
        let mut script = match self.script.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match script.len() {
            0 => Err("mock script is empty".to_string()),
            1 => script[0].clone(),
            _ => script.pop_front().unwrap_or_else(|| Err("mock script is empty".to_string())),
        }
    }
}

impl MetricsSource for MockSource {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn poll<'a>(&'a self) -> PollFuture<'a> {
        Box::pin(async move {
            self.polls.fetch_add(1, Ordering::Relaxed);
            self.next_entry().map_err(BenchError::TelemetryGap)
        })
    }
}

/// One reading of a device metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub device: String,
    pub metric: String,
    pub value: f64,
    /// Seconds since run start
    pub elapsed: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimePoint {
    pub elapsed: f64,
    pub value: f64,
}

/// Completed telemetry of one device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceTelemetry {
    pub labels: BTreeMap<String, String>,
    pub degraded: bool,
    pub missed_polls: u64,
    pub series: BTreeMap<String, Vec<TimePoint>>,
    pub summary: BTreeMap<String, AggregatedMetric>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub source: String,
    pub polls: u64,
    pub failed_polls: u64,
    pub devices: BTreeMap<String, DeviceTelemetry>,
}

impl TelemetryRecord {
    /// Model name reported by the first device that carries one.
    pub fn device_model(&self) -> Option<&str> {
        self.devices
            .values()
            .find_map(|d| d.labels.get("modelName").map(String::as_str))
    }
}

#[derive(Debug, Default)]
struct DeviceSeries {
    labels: BTreeMap<String, String>,
    samples: Vec<TelemetrySample>,
    consecutive_misses: u32,
    missed_polls: u64,
    degraded: bool,
}

impl DeviceSeries {
    fn into_telemetry(self) -> DeviceTelemetry {
        let mut series: BTreeMap<String, Vec<TimePoint>> = BTreeMap::new();
        for sample in self.samples {
            series.entry(sample.metric).or_default().push(TimePoint {
                elapsed: sample.elapsed,
                value: sample.value,
            });
        }
        let summary = series
            .iter()
            .filter_map(|(metric, points)| {
                let values: Vec<f64> = points.iter().map(|p| p.value).collect();
                AggregatedMetric::from_samples(&values).map(|m| (metric.clone(), m))
            })
            .collect();
        DeviceTelemetry {
            labels: self.labels,
            degraded: self.degraded,
            missed_polls: self.missed_polls,
            series,
            summary,
        }
    }
}

/// State owned by the polling task until it is joined.
struct PollState {
    source: String,
    polls: u64,
    failed_polls: u64,
    devices: BTreeMap<String, DeviceSeries>,
}

/// Samples a metrics source at a fixed cadence until told to stop.
pub struct TelemetryPoller {
    source: Arc<dyn MetricsSource>,
    interval: Duration,
    tracked: Vec<String>,
    max_consecutive_misses: u32,
}

impl TelemetryPoller {
    pub fn new(source: Arc<dyn MetricsSource>, config: &TelemetryConfig) -> Self {
        Self {
            source,
            interval: Duration::from_millis(config.interval_ms.max(1)),
            tracked: config.devices.clone(),
            max_consecutive_misses: config.max_consecutive_misses.max(1),
        }
    }

    /// Start polling; sample times are measured from `run_start`.
    pub fn spawn(self, run_start: Instant) -> PollerHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let join = tokio::spawn(self.run(run_start, stop_rx));
        PollerHandle { stop_tx, join }
    }

    async fn run(self, run_start: Instant, mut stop_rx: oneshot::Receiver<()>) -> TelemetryRecord {
        let mut state = PollState {
            source: self.source.name().to_string(),
            polls: 0,
            failed_polls: 0,
            devices: self
                .tracked
                .iter()
                .map(|d| (d.clone(), DeviceSeries::default()))
                .collect(),
        };

        let mut ticker = tokio::time::interval_at(run_start + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = &mut stop_rx => break,
                _ = ticker.tick() => self.poll_once(&mut state, run_start).await,
            }
        }

        info!(
            polls = state.polls,
            failed = state.failed_polls,
            devices = state.devices.len(),
            "telemetry poller stopped"
        );
        TelemetryRecord {
            source: state.source,
            polls: state.polls,
            failed_polls: state.failed_polls,
            devices: state
                .devices
                .into_iter()
                .map(|(device, series)| (device, series.into_telemetry()))
                .collect(),
        }
    }

    async fn poll_once(&self, state: &mut PollState, run_start: Instant) {
        state.polls += 1;
        let polled = self.source.poll().await;
        let elapsed = Instant::now().saturating_duration_since(run_start).as_secs_f64();

        let mut seen = BTreeSet::new();
        match polled {
            Ok(snapshots) => {
                for snapshot in snapshots {
                    if !self.tracked.is_empty() && !self.tracked.contains(&snapshot.device) {
                        continue;
                    }
                    seen.insert(snapshot.device.clone());
                    let series = state.devices.entry(snapshot.device.clone()).or_default();
                    series.consecutive_misses = 0;
                    for (key, value) in snapshot.labels {
                        series.labels.entry(key).or_insert(value);
                    }
                    for (metric, value) in snapshot.metrics {
                        series.samples.push(TelemetrySample {
                            device: snapshot.device.clone(),
                            metric,
                            value,
                            elapsed,
                        });
                    }
                }
            }
            Err(e) => {
                state.failed_polls += 1;
                warn!(source = self.source.name(), error = %e, "telemetry poll skipped");
            }
        }

        for (device, series) in state.devices.iter_mut() {
            if seen.contains(device) {
                continue;
            }
            series.consecutive_misses += 1;
            series.missed_polls += 1;
            debug!(%device, misses = series.consecutive_misses, "device missing from poll");
            if !series.degraded && series.consecutive_misses >= self.max_consecutive_misses {
                series.degraded = true;
                warn!(%device, "telemetry degraded after consecutive missed polls");
            }
        }
    }
}

/// Handle to a running poller.
pub struct PollerHandle {
    stop_tx: oneshot::Sender<()>,
    join: JoinHandle<TelemetryRecord>,
}

impl PollerHandle {
    /// Signal the poller and wait for it to exit before handing back its
    /// accumulated series.
    pub async fn stop(self) -> Result<TelemetryRecord> {
        let _ = self.stop_tx.send(());
        self.join
            .await
            .map_err(|e| BenchError::TelemetryGap(format!("telemetry poller panicked: {e}")))
    }
}

/// Placement of one device, as derived from its telemetry labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTopology {
    pub device: String,
    pub gpu: Option<String>,
    pub uuid: Option<String>,
    pub model_name: Option<String>,
    pub mig_enabled: bool,
    pub mig_profile: Option<String>,
    /// Profiles of every GPU instance seen on the same physical GPU
    pub sibling_profiles: Vec<String>,
}

pub fn topology(record: &TelemetryRecord) -> Vec<DeviceTopology> {
    record
        .devices
        .iter()
        .map(|(device, telemetry)| {
            let gpu = telemetry.labels.get("gpu").cloned();
            let mig_profile = telemetry.labels.get("GPU_I_PROFILE").cloned();
            let mig_enabled = telemetry.labels.get("GPU_I_ID").is_some();
            let sibling_profiles = if mig_enabled {
                record
                    .devices
                    .values()
                    .filter(|other| other.labels.get("gpu") == gpu.as_ref())
                    .filter_map(|other| other.labels.get("GPU_I_PROFILE").cloned())
                    .collect()
            } else {
                Vec::new()
            };
            DeviceTopology {
                device: device.clone(),
                gpu,
                uuid: telemetry.labels.get("UUID").cloned(),
                model_name: telemetry.labels.get("modelName").cloned(),
                mig_enabled,
                mig_profile,
                sibling_profiles,
            }
        })
        .collect()
}
