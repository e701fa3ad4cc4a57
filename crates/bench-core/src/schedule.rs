use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Exp};
use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::error::{BenchError, Result};

/// Upper bound on the expected arrival count `rate * duration_secs`.
pub const MAX_EXPECTED_ARRIVALS: f64 = 1e7;

/// Pre-allocation is capped so the expected count only sizes the first chunk.
const PREALLOC_LIMIT: usize = 1 << 20;

/// Arrival offsets in seconds from run start, non-decreasing.
///
/// Fully determined by `(rate, duration, seed)`: gaps are drawn from an
/// exponential distribution driven by ChaCha20 seeded with `seed`, so the
/// same inputs reproduce the schedule bit-for-bit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrivalSchedule {
    offsets: Vec<f64>,
}

impl ArrivalSchedule {
    /// Draw a Poisson arrival process at `rate` req/s until the cumulative
    /// offset passes `duration_secs`.
    pub fn generate(rate: f64, duration_secs: f64, seed: u64) -> Result<Self> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(BenchError::invalid(format!(
                "arrival rate must be positive, got {rate}"
            )));
        }
        if !duration_secs.is_finite() || duration_secs <= 0.0 {
            return Err(BenchError::invalid(format!(
                "duration must be positive, got {duration_secs}"
            )));
        }
        check_expected_arrivals(rate, duration_secs)?;

        let exp = Exp::new(rate)
            .map_err(|e| BenchError::invalid(format!("arrival rate {rate}: {e}")))?;
        let mut rng = ChaCha20Rng::seed_from_u64(seed);

        let expected = (rate * duration_secs).ceil() as usize;
        let mut offsets = Vec::with_capacity(expected.min(PREALLOC_LIMIT));
        let mut elapsed = 0.0f64;
        loop {
            elapsed += exp.sample(&mut rng);
            if elapsed > duration_secs {
                break;
            }
            offsets.push(elapsed);
        }

        Ok(Self { offsets })
    }

    /// Generate the schedule described by a run config, cut to full batches.
    pub fn for_run(run: &RunConfig) -> Result<Self> {
        if run.batch_size == 0 {
            return Err(BenchError::invalid("batch_size must be greater than zero"));
        }
        Ok(Self::generate(run.rate, run.duration_secs, run.seed)?.truncate_to_batch(run.batch_size))
    }

    /// Build a schedule from explicit offsets (replays, tests).
    pub fn from_offsets(offsets: Vec<f64>) -> Result<Self> {
        let mut previous = 0.0f64;
        for (idx, &offset) in offsets.iter().enumerate() {
            if !offset.is_finite() || offset < 0.0 {
                return Err(BenchError::invalid(format!(
                    "offset {idx} must be a non-negative number, got {offset}"
                )));
            }
            if offset < previous {
                return Err(BenchError::invalid(format!(
                    "offset {idx} ({offset}) precedes offset {} ({previous})",
                    idx - 1
                )));
            }
            previous = offset;
        }
        Ok(Self { offsets })
    }

    /// Drop the tail so the length is a multiple of `batch_size`.
    pub fn truncate_to_batch(mut self, batch_size: u32) -> Self {
        let batch = batch_size.max(1) as usize;
        let keep = self.offsets.len() / batch * batch;
        self.offsets.truncate(keep);
        self
    }

    pub fn offsets(&self) -> &[f64] {
        &self.offsets
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Offset of the final submission, 0 for an empty schedule.
    pub fn span_secs(&self) -> f64 {
        self.offsets.last().copied().unwrap_or(0.0)
    }

    pub fn into_offsets(self) -> Vec<f64> {
        self.offsets
    }
}

/// Reject `(rate, duration)` pairs whose expected arrival count exceeds
/// [`MAX_EXPECTED_ARRIVALS`].
pub fn check_expected_arrivals(rate: f64, duration_secs: f64) -> Result<()> {
    let expected = rate * duration_secs;
    if !expected.is_finite() || expected > MAX_EXPECTED_ARRIVALS {
        return Err(BenchError::invalid(format!(
            "rate {rate} over {duration_secs}s expects {expected:e} arrivals, limit is {MAX_EXPECTED_ARRIVALS:e}"
        )));
    }
    Ok(())
}
