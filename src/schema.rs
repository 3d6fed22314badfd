use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub schema_version: u32,
    pub bench_version: String,
    pub mode: String,
    pub forced_runs: Option<u32>,
    pub seed: u64,
    pub environment: String,
    pub timestamp_utc: String,
    pub agents: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeakRecord {
    /// Raw round durations, `[start_ns, end_ns)`.
    pub start_ns: u64,
    pub end_ns: u64,
    pub count: usize,

    /// Per-run cost at the peak's midpoint.
    pub midpoint_ns: u64,
    pub share_percent: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkRecord {
    pub name: String,
    pub agents: Vec<usize>,
    pub rounds: u64,

    pub final_runs: u32,
    pub overhead_ns: u64,
    pub samples: usize,

    pub median_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,

    pub peaks: Vec<PeakRecord>,
    pub summary: String,
    pub distribution: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedRecord {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run: RunMeta,
    pub benchmarks: Vec<BenchmarkRecord>,
    pub skipped: Vec<SkippedRecord>,
}
