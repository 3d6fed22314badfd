use std::hint::black_box;
use std::time::Duration;

use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::results::SampleStore;
use crate::ConvergenceMode;

/// Limit on sending a setup frame and receiving its ack.
pub const SETUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Limit on one armed round, from arm to the last completion ack.
pub const ROUND_TIMEOUT: Duration = Duration::from_secs(20);

/// Limit on connecting to and pinging the whole fleet.
pub const BRINGUP_TIMEOUT: Duration = Duration::from_secs(15);

/// Pause between connection attempts during bring-up.
pub const CONNECT_RETRY: Duration = Duration::from_millis(50);

/// Port agents listen on for the control connection.
pub const CONTROL_PORT: u16 = 6099;

/// Port the active side of a pair listens on unless configured otherwise.
pub const PEER_PORT: u16 = 6100;

#[derive(Clone, Debug)]
pub struct BenchConfig {
    pub mode: ConvergenceMode,
    /// Sample at exactly this repetition count instead of scaling.
    pub forced_runs: Option<u32>,
    pub seed: u64,
    pub setup_timeout: Duration,
    pub round_timeout: Duration,
    pub bringup_timeout: Duration,
    /// Describes the machines under test; benchmarks may refuse to run on some.
    pub environment: String,
    /// Log every completed round at info level.
    pub progress: bool,
    /// Program and leading arguments run before and after every round.
    pub profile_cmd: Vec<String>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            mode: ConvergenceMode::Exact,
            forced_runs: None,
            seed: 0,
            setup_timeout: SETUP_TIMEOUT,
            round_timeout: ROUND_TIMEOUT,
            bringup_timeout: BRINGUP_TIMEOUT,
            environment: String::new(),
            progress: false,
            profile_cmd: Vec::new(),
        }
    }
}

impl BenchConfig {
    /// Deterministic source for picking participants.
    pub fn rng(&self) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.seed)
    }

    /// Fresh store for one benchmark run.
    pub fn sample_store(&self) -> SampleStore {
        match self.forced_runs {
            Some(runs) => SampleStore::with_forced_runs(self.mode, runs),
            None => SampleStore::new(self.mode),
        }
    }
}

/// Run `f` `runs` times without letting the optimizer elide it.
pub fn repeat<T>(runs: u32, mut f: impl FnMut() -> T) {
    for _ in 0..runs {
        black_box(f());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_rng_is_deterministic() {
        let cfg = BenchConfig {
            seed: 7,
            ..Default::default()
        };
        let mut first = cfg.rng();
        let mut second = cfg.rng();
        let a: Vec<u32> = (0..8).map(|_| first.gen_range(0..100)).collect();
        let b: Vec<u32> = (0..8).map(|_| second.gen_range(0..100)).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_sample_store_honours_forced_runs() {
        let cfg = BenchConfig::default();
        assert_eq!(cfg.sample_store().runs(), 0);

        let forced = BenchConfig {
            forced_runs: Some(64),
            mode: ConvergenceMode::Rough,
            ..Default::default()
        };
        let mut store = forced.sample_store();
        assert_eq!(store.mode(), ConvergenceMode::Rough);
        for _ in 0..crate::results::MINIMUM_SAMPLES {
            store.record(10);
        }
        assert_eq!(store.is_converged().next_runs, 64);
    }

    #[test]
    fn test_repeat_counts_calls() {
        let mut calls = 0u32;
        repeat(5, || calls += 1);
        assert_eq!(calls, 5);
        repeat(0, || calls += 1);
        assert_eq!(calls, 5);
    }
}
