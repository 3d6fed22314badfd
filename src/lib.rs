use clap::ValueEnum;
use serde::{Deserialize, Serialize};

pub mod agent;
pub mod benches;
pub mod coordinator;
pub mod error;
pub mod fleet;
pub mod harness;
pub mod logging;
pub mod report;
pub mod results;
pub mod schema;
pub mod session;
pub mod wire;

pub use error::BenchError;

/// Acceptance criterion applied to the clustered samples.
#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvergenceMode {
    /// Every remaining peak must hold enough samples.
    #[default]
    Exact,
    /// One well-populated peak is enough.
    Rough,
}

impl ConvergenceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConvergenceMode::Exact => "exact",
            ConvergenceMode::Rough => "rough",
        }
    }
}
