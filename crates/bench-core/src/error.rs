use std::path::PathBuf;

/// Failure taxonomy of a benchmark run.
///
/// `Transport` and `TelemetryGap` are recovered where they occur and only
/// show up in the report; the remaining variants end the run.
#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("failed to parse config: {0}")]
    Config(#[from] toml::de::Error),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("telemetry gap: {0}")]
    TelemetryGap(String),

    #[error("setup failed: {0}")]
    Setup(String),

    #[error("failed to write report to {path}: {source}")]
    ReportWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BenchError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        BenchError::InvalidParameter(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        BenchError::Transport(msg.into())
    }

    /// True for faults that are tallied per request instead of aborting.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BenchError::Transport(_) | BenchError::TelemetryGap(_))
    }
}

pub type Result<T> = std::result::Result<T, BenchError>;
