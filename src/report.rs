//! Turning converged stores into text lines, CSV rows and JSON records.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::coordinator::{BenchmarkRun, Outcome};
use crate::results::Converged;
use crate::schema::{BenchmarkRecord, PeakRecord, RunMeta, RunReport, SkippedRecord};

/// Fill a benchmark's report format with a per-run cost.
pub fn format_result(format: &str, value: u64) -> String {
    if format.contains("{}") {
        format.replacen("{}", &value.to_string(), 1)
    } else {
        format!("{format} {value}")
    }
}

/// Human-readable result: the report line, then spread and peaks.
pub fn text(outcome: &Outcome) -> Option<String> {
    let result = outcome.result()?;
    Some(format!(
        "{}\n    {} [{}]",
        format_result(outcome.descriptor.format, result.median()),
        result.quick_summary(),
        result.dist_summary()
    ))
}

/// Append `<name>,<v1>,<v2>,...` to the CSV accumulation file.
pub fn append_csv(path: &Path, name: &str, result: &Converged<'_>) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{name},{}", result.csv())
}

/// Writes each benchmark's text line and CSV row as soon as it finishes,
/// and keeps the runs for the JSON report.
pub struct Reporter<W> {
    csv: Option<PathBuf>,
    text: Option<W>,
    runs: Vec<BenchmarkRun>,
}

impl<W: Write> Reporter<W> {
    pub fn new(csv: Option<PathBuf>, text: Option<W>) -> Self {
        Self {
            csv,
            text,
            runs: Vec::new(),
        }
    }

    pub fn emit(&mut self, run: BenchmarkRun) -> io::Result<()> {
        match &run {
            BenchmarkRun::Completed(outcome) => {
                if let (Some(path), Some(result)) = (&self.csv, outcome.result()) {
                    append_csv(path, outcome.name(), &result)
                        .map_err(|e| io::Error::new(e.kind(), format!("appending to {}: {e}", path.display())))?;
                }
                if let (Some(out), Some(line)) = (self.text.as_mut(), text(outcome)) {
                    writeln!(out, "{line}")?;
                    out.flush()?;
                }
            }
            BenchmarkRun::Skipped { name, reason } => {
                if let Some(out) = self.text.as_mut() {
                    writeln!(out, "{name}: skipped ({reason})")?;
                }
            }
        }
        self.runs.push(run);
        Ok(())
    }

    pub fn runs(&self) -> &[BenchmarkRun] {
        &self.runs
    }
}

pub fn benchmark_record(outcome: &Outcome) -> Option<BenchmarkRecord> {
    let result = outcome.result()?;
    let peaks = result
        .peaks()
        .iter()
        .map(|p| PeakRecord {
            start_ns: p.start,
            end_ns: p.end,
            count: p.count,
            midpoint_ns: result.midpoint(p),
            share_percent: result.share(p),
        })
        .collect();
    Some(BenchmarkRecord {
        name: outcome.name().to_string(),
        agents: outcome.agents.clone(),
        rounds: outcome.rounds,
        final_runs: result.final_runs(),
        overhead_ns: result.overhead(),
        samples: result.sample_count(),
        median_ns: result.median(),
        min_ns: result.min(),
        max_ns: result.max(),
        peaks,
        summary: result.quick_summary(),
        distribution: result.dist_summary(),
    })
}

pub fn run_report(run: RunMeta, runs: &[BenchmarkRun]) -> RunReport {
    let mut benchmarks = Vec::new();
    let mut skipped = Vec::new();
    for entry in runs {
        match entry {
            BenchmarkRun::Completed(outcome) => benchmarks.extend(benchmark_record(outcome)),
            BenchmarkRun::Skipped { name, reason } => skipped.push(SkippedRecord {
                name: name.clone(),
                reason: reason.clone(),
            }),
        }
    }
    RunReport {
        run,
        benchmarks,
        skipped,
    }
}
