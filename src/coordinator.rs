//! Drives agents through measurement rounds until the samples converge.
//!
//! ```text
//! Idle -> Probing (runs = 0) -> Scaling (runs doubling) -> Sampling (runs fixed) -> Done
//! ```
//!
//! A round is: setup every participant, start the clock, arm every
//! participant, wait for every expected completion ack, stop the clock.
//! Any transport, timeout or protocol failure ends the whole run.

use std::io;
use std::process::Stdio;

use futures::future::try_join_all;
use rand::seq::index;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::benches::{Arity, BenchmarkDescriptor, Registry, Workload};
use crate::error::BenchError;
use crate::fleet::Fleet;
use crate::harness::BenchConfig;
use crate::results::{Converged, SampleStore};
use crate::wire::{BenchOptions, PairOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Zero-run rounds measuring protocol overhead.
    Probing,
    /// The repetition count just changed.
    Scaling,
    /// Collecting samples at a fixed repetition count.
    Sampling,
    Done,
}

/// One agent's part in a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Participant {
    pub agent: usize,
    pub options: BenchOptions,
    /// Whether the coordinator waits for this agent's completion ack.
    pub acks: bool,
}

/// Who takes part in every round of one benchmark.
#[derive(Debug, Clone)]
pub struct RoundPlan {
    pub descriptor: BenchmarkDescriptor,
    /// Setup and arm order; the active side of a pair comes first.
    pub participants: Vec<Participant>,
}

impl RoundPlan {
    pub fn agents(&self) -> Vec<usize> {
        self.participants.iter().map(|p| p.agent).collect()
    }
}

/// A converged benchmark.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub descriptor: BenchmarkDescriptor,
    pub agents: Vec<usize>,
    pub rounds: u64,
    pub store: SampleStore,
}

impl Outcome {
    pub fn name(&self) -> &'static str {
        self.descriptor.name
    }

    pub fn result(&self) -> Option<Converged<'_>> {
        self.store.converged()
    }
}

#[derive(Debug, Clone)]
pub enum BenchmarkRun {
    Completed(Outcome),
    Skipped { name: String, reason: String },
}

pub struct Coordinator<'f, S = TcpStream> {
    fleet: &'f mut Fleet<S>,
    config: BenchConfig,
    rng: ChaCha8Rng,
    phase: Phase,
}

impl<'f, S: AsyncRead + AsyncWrite + Unpin> Coordinator<'f, S> {
    pub fn new(fleet: &'f mut Fleet<S>, config: BenchConfig) -> Self {
        let rng = config.rng();
        Self {
            fleet,
            config,
            rng,
            phase: Phase::Idle,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    /// Pick the agents for a benchmark.
    pub fn plan(&mut self, descriptor: &BenchmarkDescriptor) -> Result<RoundPlan, BenchError> {
        if matches!(descriptor.workload, Workload::Probe) {
            return Err(BenchError::Config(format!("'{}' is not a benchmark", descriptor.name)));
        }
        let arity = descriptor.arity();
        let available = self.fleet.len();
        if available < arity.participants() {
            return Err(BenchError::Config(format!(
                "'{}' needs {} agents, fleet has {available}",
                descriptor.name,
                arity.participants()
            )));
        }

        let participants = match arity {
            Arity::Single | Arity::Receiving => vec![Participant {
                agent: self.rng.gen_range(0..available),
                options: BenchOptions::None,
                acks: true,
            }],
            Arity::Paired | Arity::PairedSingleAck => {
                let picked = index::sample(&mut self.rng, available, 2);
                let (active, passive) = (picked.index(0), picked.index(1));
                let (active_addr, passive_addr) = match (self.peer_of(active), self.peer_of(passive)) {
                    (Some(a), Some(p)) => (a, p),
                    _ => {
                        return Err(BenchError::Config(format!(
                            "'{}' needs IPv4 peer addresses for agents {active} and {passive}",
                            descriptor.name
                        )))
                    }
                };
                let port = active_addr.port();
                vec![
                    Participant {
                        agent: active,
                        options: BenchOptions::Pair(PairOptions {
                            own_address: *active_addr.ip(),
                            peer_address: *passive_addr.ip(),
                            active: true,
                            port,
                        }),
                        acks: true,
                    },
                    Participant {
                        agent: passive,
                        options: BenchOptions::Pair(PairOptions {
                            own_address: *passive_addr.ip(),
                            peer_address: *active_addr.ip(),
                            active: false,
                            port,
                        }),
                        acks: arity == Arity::Paired,
                    },
                ]
            }
        };
        Ok(RoundPlan {
            descriptor: descriptor.clone(),
            participants,
        })
    }

    fn peer_of(&self, agent: usize) -> Option<std::net::SocketAddrV4> {
        self.fleet.member(agent).and_then(|m| m.peer)
    }

    /// Run one timed round; returns the elapsed wall-clock nanoseconds.
    pub async fn run_round(&mut self, plan: &RoundPlan, runs: u32) -> Result<u64, BenchError> {
        let name = plan.descriptor.name;
        let round_timeout = self.config.round_timeout;
        let payload = plan.descriptor.payload_len(runs);
        self.profile("start", name, runs).await;
        let mut members = self.fleet.members_mut(&plan.agents())?;

        for (member, participant) in members.iter_mut().zip(&plan.participants) {
            member.session.send_setup(name, participant.options, runs).await?;
        }

        let start = Instant::now();
        for member in members.iter_mut() {
            member.session.send_arm().await?;
        }
        let deadline = start + round_timeout;
        let waits = members
            .into_iter()
            .zip(&plan.participants)
            .filter(|(_, participant)| participant.acks)
            .map(|(member, _)| async move {
                if let Some(len) = payload {
                    let left = deadline.saturating_duration_since(Instant::now());
                    member.session.send_payload(len, left).await?;
                }
                let left = deadline.saturating_duration_since(Instant::now());
                member.session.await_completion(left).await
            });
        try_join_all(waits).await?;

        let elapsed = u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.profile("stop", name, runs).await;
        Ok(elapsed)
    }

    /// Run the profiling hook as `CMD... <phase> <benchmark> <runs>`.
    ///
    /// Called outside the timed window. A failing hook is logged and ignored.
    async fn profile(&self, phase: &str, name: &str, runs: u32) {
        let Some((program, args)) = self.config.profile_cmd.split_first() else {
            return;
        };
        let status = Command::new(program)
            .args(args)
            .arg(phase)
            .arg(name)
            .arg(runs.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status()
            .await;
        match status {
            Ok(status) if status.success() => {}
            Ok(status) => warn!(benchmark = name, phase, %status, "profiling hook failed"),
            Err(e) => warn!(benchmark = name, phase, program = %program, error = %e, "profiling hook did not start"),
        }
    }

    /// Measure one benchmark until its samples converge.
    pub async fn run_benchmark(&mut self, descriptor: &BenchmarkDescriptor) -> Result<Outcome, BenchError> {
        let plan = self.plan(descriptor)?;
        let mut store = self.config.sample_store();
        let mut rounds = 0u64;
        self.phase = if store.runs() == 0 { Phase::Probing } else { Phase::Sampling };
        info!(benchmark = descriptor.name, agents = ?plan.agents(), "Running benchmark");

        loop {
            let runs = store.runs();
            let elapsed = self.run_round(&plan, runs).await?;
            rounds += 1;
            store.record(elapsed);
            let verdict = store.is_converged();
            if self.config.progress {
                info!(benchmark = descriptor.name, runs, elapsed, samples = store.samples().len(), "round");
            } else {
                debug!(benchmark = descriptor.name, runs, elapsed, "round");
            }
            if verdict.converged {
                self.phase = Phase::Done;
                break;
            }
            self.phase = match verdict.next_runs {
                0 => Phase::Probing,
                next if next != runs => Phase::Scaling,
                _ => Phase::Sampling,
            };
        }

        info!(
            benchmark = descriptor.name,
            rounds,
            final_runs = store.final_runs(),
            overhead = store.overhead(),
            "converged"
        );
        Ok(Outcome {
            descriptor: descriptor.clone(),
            agents: plan.agents(),
            rounds,
            store,
        })
    }

    /// Run the named benchmarks, or every scheduled one when `filter` is empty.
    ///
    /// Every finished or skipped benchmark is passed to `emit` before the next
    /// one starts, so results survive a later fatal error. Unknown names,
    /// unsuitable environments and unsatisfiable pairings are skipped; any
    /// other failure, including one from `emit`, aborts the run.
    pub async fn run_all<F>(&mut self, registry: &Registry, filter: &[String], mut emit: F) -> Result<(), BenchError>
    where
        F: FnMut(BenchmarkRun) -> io::Result<()>,
    {
        let selected: Vec<Result<&BenchmarkDescriptor, String>> = if filter.is_empty() {
            registry.scheduled().map(Ok).collect()
        } else {
            filter
                .iter()
                .map(|name| registry.get(name).ok_or_else(|| name.clone()))
                .collect()
        };

        for entry in selected {
            let descriptor = match entry {
                Ok(descriptor) => descriptor,
                Err(name) => {
                    warn!(benchmark = %name, "unknown benchmark; skipping");
                    emit(BenchmarkRun::Skipped {
                        name,
                        reason: "unknown benchmark".to_string(),
                    })?;
                    continue;
                }
            };
            if let Some(reason) = descriptor.skip_reason(&self.config.environment) {
                warn!(benchmark = descriptor.name, %reason, "skipping");
                emit(BenchmarkRun::Skipped {
                    name: descriptor.name.to_string(),
                    reason,
                })?;
                continue;
            }
            match self.run_benchmark(descriptor).await {
                Ok(outcome) => emit(BenchmarkRun::Completed(outcome))?,
                Err(e) if !e.is_fatal() => {
                    warn!(benchmark = descriptor.name, error = %e, "skipping");
                    self.phase = Phase::Idle;
                    emit(BenchmarkRun::Skipped {
                        name: descriptor.name.to_string(),
                        reason: e.to_string(),
                    })?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
