use serde::{Deserialize, Serialize};
use tracing::warn;

/// Summary of one raw sample list.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregatedMetric {
    /// Finite samples summarized; NaN and infinities are left out
    pub count: usize,
    /// Non-finite samples left out of the summary
    #[serde(default)]
    pub excluded: usize,
    pub mean: f64,
    /// Population standard deviation
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl AggregatedMetric {
    /// Summarize `samples`; `None` when there is nothing finite to summarize.
    ///
    /// Input order does not matter: the samples are sorted before any
    /// percentile is taken. Non-finite samples are counted in `excluded`
    /// and logged.
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        let mut sorted: Vec<f64> = samples.iter().copied().filter(|v| v.is_finite()).collect();
        let excluded = samples.len() - sorted.len();
        if excluded > 0 {
            warn!(
                excluded,
                total = samples.len(),
                "non-finite samples excluded from summary"
            );
        }
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_by(f64::total_cmp);

        let n = sorted.len() as f64;
        let mean = sorted.iter().sum::<f64>() / n;
        let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

        Some(Self {
            count: sorted.len(),
            excluded,
            mean,
            std: variance.sqrt(),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            p50: percentile(&sorted, 50.0),
            p95: percentile(&sorted, 95.0),
            p99: percentile(&sorted, 99.0),
        })
    }
}

/// Percentile of an ascending, non-empty slice with linear interpolation
/// between the closest ranks (rank = p/100 * (n - 1)).
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        len => {
            let rank = (p.clamp(0.0, 100.0) / 100.0) * (len - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let fraction = rank - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
        }
    }
}
