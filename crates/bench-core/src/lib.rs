pub mod codec;
pub mod collector;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod outcome;
pub mod report;
pub mod runner;
pub mod schedule;
pub mod sender;
pub mod stats;
pub mod telemetry;

pub use codec::*;
pub use collector::*;
pub use config::*;
pub use context::*;
pub use dispatcher::*;
pub use error::{BenchError, Result};
pub use outcome::*;
pub use report::*;
pub use runner::*;
pub use schedule::*;
pub use sender::*;
pub use stats::*;
pub use telemetry::*;
