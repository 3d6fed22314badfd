//! Sample accumulation and convergence detection.
//!
//! A [`SampleStore`] collects the wall-clock duration of every measurement
//! round at the current repetition count. After each sample the coordinator
//! asks [`SampleStore::is_converged`], which either requests more samples at
//! the same count, requests a larger count (discarding what it has), or
//! freezes the clustered peaks as the result.
//!
//! # Clustering
//!
//! ```text
//! 1. split [min, max] into ceil((max+1-min)*100/min) buckets (~1% of min wide)
//! 2. drop empty buckets
//! 3. merge touching bucket pairs whose combined extent stays within 1% of min
//! 4. drop buckets holding <= 1% of all samples
//! 5. narrow each bucket to [lowest member, highest member + 1)
//! ```

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, trace};

use crate::ConvergenceMode;

/// Samples needed at one repetition count, and in one peak, before it counts.
pub const MINIMUM_SAMPLES: usize = 10;

/// The work must take at least this multiple of the protocol overhead.
pub const OVERHEAD_FACTOR: u64 = 100;

/// A clustered range `[start, end)` of raw sample values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Peak {
    pub start: u64,
    pub end: u64,
    pub count: usize,
}

/// Outcome of one convergence check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub converged: bool,
    /// Repetition count the next round must use.
    pub next_runs: u32,
    /// Repetition count the result was frozen at (0 until converged).
    pub final_runs: u32,
}

#[derive(Debug, Clone)]
pub struct SampleStore {
    mode: ConvergenceMode,
    forced_runs: Option<u32>,
    runs: u32,
    samples: Vec<u64>,
    overhead: u64,
    minimum: u64,
    maximum: u64,
    peaks: Option<Vec<Peak>>,
    final_runs: u32,
}

impl SampleStore {
    /// A store that starts with the zero-run overhead probe.
    pub fn new(mode: ConvergenceMode) -> Self {
        Self {
            mode,
            forced_runs: None,
            runs: 0,
            samples: Vec::new(),
            overhead: u64::MAX,
            minimum: u64::MAX,
            maximum: 0,
            peaks: None,
            final_runs: 0,
        }
    }

    /// Probe the overhead, then sample at exactly `runs` until the peaks settle.
    pub fn with_forced_runs(mode: ConvergenceMode, runs: u32) -> Self {
        Self {
            forced_runs: Some(runs.max(1)),
            ..Self::new(mode)
        }
    }

    /// Skip the probe: the overhead is already known and sampling starts at `runs`.
    pub fn seeded(mode: ConvergenceMode, overhead: u64, runs: u32) -> Self {
        Self {
            runs: runs.max(1),
            overhead,
            ..Self::new(mode)
        }
    }

    pub fn mode(&self) -> ConvergenceMode {
        self.mode
    }

    /// Repetition count the current samples belong to.
    pub fn runs(&self) -> u32 {
        self.runs
    }

    /// Fastest zero-run round seen so far.
    pub fn overhead(&self) -> u64 {
        self.overhead
    }

    pub fn samples(&self) -> &[u64] {
        &self.samples
    }

    pub fn minimum(&self) -> u64 {
        self.minimum
    }

    pub fn maximum(&self) -> u64 {
        self.maximum
    }

    pub fn peaks(&self) -> Option<&[Peak]> {
        self.peaks.as_deref()
    }

    pub fn final_runs(&self) -> u32 {
        self.final_runs
    }

    pub fn record(&mut self, duration: u64) {
        if self.peaks.is_some() {
            trace!(duration, "ignoring sample recorded after convergence");
            return;
        }
        self.samples.push(duration);
        self.minimum = self.minimum.min(duration);
        self.maximum = self.maximum.max(duration);
        if self.runs == 0 {
            self.overhead = self.overhead.min(duration);
        }
    }

    pub fn is_converged(&mut self) -> Verdict {
        if self.peaks.is_some() {
            return self.verdict(true);
        }
        if self.samples.len() < MINIMUM_SAMPLES {
            return self.verdict(false);
        }

        if self.runs == 0 {
            let next = self.forced_runs.unwrap_or(1);
            debug!(overhead = self.overhead, next_runs = next, "overhead probe complete");
            self.rescale(next);
            return self.verdict(false);
        }

        if self.forced_runs.is_none() {
            let mean = mean(&self.samples);
            let floor = self.overhead.saturating_mul(OVERHEAD_FACTOR);
            if mean < floor {
                let per_run = mean.saturating_sub(self.overhead) / u64::from(self.runs);
                let next = scale_runs(self.runs, per_run, floor);
                debug!(mean, overhead = self.overhead, per_run, next_runs = next, "signal below overhead floor");
                self.rescale(next);
                return self.verdict(false);
            }
        }

        let peaks = find_peaks(&self.samples, self.minimum, self.maximum);
        let sufficient = peaks.iter().filter(|p| p.count >= MINIMUM_SAMPLES).count();
        let accepted = match self.mode {
            ConvergenceMode::Rough => sufficient > 0,
            ConvergenceMode::Exact => !peaks.is_empty() && sufficient == peaks.len(),
        };
        trace!(
            samples = self.samples.len(),
            peaks = peaks.len(),
            sufficient,
            "checked peaks"
        );
        if !accepted {
            return self.verdict(false);
        }

        self.peaks = Some(peaks);
        self.final_runs = self.runs;
        self.verdict(true)
    }

    /// Summary view, available once the store has converged.
    pub fn converged(&self) -> Option<Converged<'_>> {
        self.peaks.as_deref().map(|peaks| Converged { store: self, peaks })
    }

    fn verdict(&self, converged: bool) -> Verdict {
        Verdict {
            converged,
            next_runs: self.runs,
            final_runs: self.final_runs,
        }
    }

    // Samples at different repetition counts are not comparable.
    fn rescale(&mut self, runs: u32) {
        self.runs = runs;
        self.samples.clear();
        self.minimum = u64::MAX;
        self.maximum = 0;
    }
}

fn mean(samples: &[u64]) -> u64 {
    let total: u128 = samples.iter().map(|&s| u128::from(s)).sum();
    (total / samples.len().max(1) as u128) as u64
}

/// Smallest power-of-two multiple of `runs` (at least double) whose
/// estimated cost reaches `target`, capped to what fits the wire width.
fn scale_runs(runs: u32, per_run: u64, target: u64) -> u32 {
    let mut next = runs.max(1);
    loop {
        if next > u32::MAX / 2 {
            return next;
        }
        next *= 2;
        if per_run == 0 || u128::from(next) * u128::from(per_run) >= u128::from(target) {
            return next;
        }
    }
}

/// Min and max of the samples inside `[start, end)`; an `end` of `u64::MAX`
/// stands for 2^64 and includes `u64::MAX` itself.
fn extent(samples: &[u64], start: u64, end: u64) -> Option<(u64, u64)> {
    samples
        .iter()
        .filter(|&&s| s >= start && (s < end || end == u64::MAX))
        .fold(None, |acc, &s| match acc {
            None => Some((s, s)),
            Some((lo, hi)) => Some((lo.min(s), hi.max(s))),
        })
}

/// Cluster `samples` (whose extremes are `minimum` and `maximum`) into peaks.
pub fn find_peaks(samples: &[u64], minimum: u64, maximum: u64) -> Vec<Peak> {
    if samples.is_empty() {
        return Vec::new();
    }

    let lo = u128::from(minimum);
    let width = u128::from(minimum.max(1));
    let span = u128::from(maximum) + 1 - lo;
    let buckets = (span * 100 + width - 1) / width;
    let bound = |i: u128| lo + span * i / buckets;
    let edge = |i: u128| u64::try_from(bound(i)).unwrap_or(u64::MAX);

    let mut counts: BTreeMap<u128, usize> = BTreeMap::new();
    for &s in samples {
        let v = u128::from(s);
        let mut idx = ((v - lo) * buckets / span).min(buckets - 1);
        while idx > 0 && bound(idx) > v {
            idx -= 1;
        }
        while idx + 1 < buckets && bound(idx + 1) <= v {
            idx += 1;
        }
        *counts.entry(idx).or_default() += 1;
    }

    let mut peaks: Vec<Peak> = counts
        .into_iter()
        .map(|(idx, count)| Peak {
            start: edge(idx),
            end: edge(idx + 1),
            count,
        })
        .collect();

    let mut i = 0;
    while i + 1 < peaks.len() {
        if peaks[i + 1].start != peaks[i].end {
            i += 1;
            continue;
        }
        let chained = i + 2 < peaks.len() && peaks[i + 1].end == peaks[i + 2].start;
        if !chained {
            if let Some((lmin, lmax)) = extent(samples, peaks[i].start, peaks[i + 1].end) {
                if u128::from(lmax - lmin) * 100 <= lo {
                    peaks[i] = Peak {
                        start: lmin,
                        end: lmax.saturating_add(1),
                        count: peaks[i].count + peaks[i + 1].count,
                    };
                    peaks.remove(i + 1);
                    continue;
                }
            }
        }
        i += 1;
    }

    let total = samples.len();
    peaks.retain(|p| p.count * 100 > total);

    for p in &mut peaks {
        if let Some((lmin, lmax)) = extent(samples, p.start, p.end) {
            p.start = lmin;
            p.end = lmax.saturating_add(1);
        }
    }

    peaks
}

/// Read-only view over a converged store.
#[derive(Debug, Clone, Copy)]
pub struct Converged<'a> {
    store: &'a SampleStore,
    peaks: &'a [Peak],
}

impl<'a> Converged<'a> {
    pub fn peaks(&self) -> &'a [Peak] {
        self.peaks
    }

    pub fn final_runs(&self) -> u32 {
        self.store.final_runs
    }

    pub fn overhead(&self) -> u64 {
        self.store.overhead
    }

    pub fn sample_count(&self) -> usize {
        self.store.samples.len()
    }

    /// Per-run cost of a raw round duration.
    pub fn normalize(&self, raw: u64) -> u64 {
        raw.saturating_sub(self.store.overhead) / u64::from(self.store.final_runs.max(1))
    }

    pub fn median(&self) -> u64 {
        let mut sorted = self.store.samples.clone();
        sorted.sort_unstable();
        self.normalize(sorted[sorted.len() / 2])
    }

    pub fn min(&self) -> u64 {
        self.normalize(self.store.minimum)
    }

    pub fn max(&self) -> u64 {
        self.normalize(self.store.maximum)
    }

    /// Normalized midpoint of a peak.
    pub fn midpoint(&self, peak: &Peak) -> u64 {
        let mid = (u128::from(peak.start) + u128::from(peak.end)) / 2;
        self.normalize(mid as u64)
    }

    /// Rounded percentage of all samples that fall in `peak`.
    pub fn share(&self, peak: &Peak) -> usize {
        let total = self.store.samples.len();
        (peak.count * 100 + total / 2) / total
    }

    /// `"<midpoint>:<share>%"` per peak, e.g. `"100:50%, 105:50%"`.
    pub fn dist_summary(&self) -> String {
        self.peaks
            .iter()
            .map(|p| format!("{}:{}%", self.midpoint(p), self.share(p)))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `"<median> (<min> - <max>)"`, all per run.
    pub fn quick_summary(&self) -> String {
        format!("{} ({} - {})", self.median(), self.min(), self.max())
    }

    /// Every sample, normalized, in recording order.
    pub fn csv(&self) -> String {
        self.store
            .samples
            .iter()
            .map(|&s| self.normalize(s).to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}
