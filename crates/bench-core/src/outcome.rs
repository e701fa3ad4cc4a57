use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::codec::ServerTimes;

/// Named processing stage of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[serde(rename = "preprocessing_time")]
    Preprocessing,
    #[serde(rename = "batching_time")]
    Batching,
    #[serde(rename = "inference_time")]
    Inference,
    #[serde(rename = "postprocessing_time")]
    Postprocessing,
    #[serde(rename = "server_end2end_time")]
    ServerEnd2End,
    Latency,
    ClientServerRtt,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Preprocessing => "preprocessing_time",
            Stage::Batching => "batching_time",
            Stage::Inference => "inference_time",
            Stage::Postprocessing => "postprocessing_time",
            Stage::ServerEnd2End => "server_end2end_time",
            Stage::Latency => "latency",
            Stage::ClientServerRtt => "client_server_rtt",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-request timing, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimingBreakdown {
    /// Client-observed send-to-receive wall time
    pub latency: f64,
    /// Breakdown reported by the server; absent for closed-loop calls
    pub server: Option<ServerTimes>,
}

impl TimingBreakdown {
    pub fn client_only(latency: Duration) -> Self {
        Self {
            latency: latency.as_secs_f64(),
            server: None,
        }
    }

    pub fn with_server(latency: Duration, server: ServerTimes) -> Self {
        Self {
            latency: latency.as_secs_f64(),
            server: Some(server),
        }
    }

    /// Network plus client overhead: latency minus server end-to-end time.
    pub fn client_server_rtt(&self) -> Option<f64> {
        self.server.map(|s| self.latency - s.server_end2end_time)
    }

    /// Every stage present in this breakdown with its duration.
    pub fn stages(&self) -> Vec<(Stage, f64)> {
        let mut stages = vec![(Stage::Latency, self.latency)];
        if let Some(server) = self.server {
            stages.extend([
                (Stage::ClientServerRtt, self.latency - server.server_end2end_time),
                (Stage::Preprocessing, server.preprocessing_time),
                (Stage::Batching, server.batching_time),
                (Stage::Inference, server.inference_time),
                (Stage::Postprocessing, server.postprocessing_time),
                (Stage::ServerEnd2End, server.server_end2end_time),
            ]);
        }
        stages
    }

    /// False only when a server breakdown is present and its stages overrun
    /// the end-to-end time by more than `tolerance`.
    pub fn is_additive(&self, tolerance: f64) -> bool {
        self.server.map_or(true, |s| s.is_additive(tolerance))
    }
}

/// Result of one dispatched request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Success { timing: TimingBreakdown },
    Failure { cause: String },
}

impl RequestOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RequestOutcome::Success { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_times() -> ServerTimes {
        ServerTimes {
            preprocessing_time: 0.002,
            batching_time: 0.008,
            inference_time: 0.025,
            postprocessing_time: 0.001,
            server_end2end_time: 0.040,
        }
    }

    #[test]
    fn test_client_only_breakdown_has_latency_stage() {
        let timing = TimingBreakdown::client_only(Duration::from_millis(12));
        let stages = timing.stages();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].0, Stage::Latency);
        assert!((stages[0].1 - 0.012).abs() < 1e-12);
        assert_eq!(timing.client_server_rtt(), None);
        assert!(timing.is_additive(0.0));
    }

    #[test]
    fn test_server_breakdown_stages() {
        let timing = TimingBreakdown::with_server(Duration::from_millis(50), server_times());
        let stages = timing.stages();
        assert_eq!(stages.len(), 7);

        let rtt = timing.client_server_rtt().unwrap();
        assert!((rtt - 0.010).abs() < 1e-9);
        assert!(stages
            .iter()
            .any(|&(stage, value)| stage == Stage::ClientServerRtt && (value - rtt).abs() < 1e-12));
        assert!(timing.is_additive(1e-6));
    }

    #[test]
    fn test_stage_names_match_wire_keys() {
        assert_eq!(Stage::ServerEnd2End.to_string(), "server_end2end_time");
        assert_eq!(
            serde_json::to_string(&Stage::ClientServerRtt).unwrap(),
            "\"client_server_rtt\""
        );
        assert_eq!(
            serde_json::to_string(&Stage::Inference).unwrap(),
            "\"inference_time\""
        );
    }
}
