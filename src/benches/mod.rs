//! Benchmark registry.
//!
//! Each submodule owns a family of benchmarks and registers them into a
//! [`Registry`] at startup. The coordinator only needs a descriptor's name,
//! arity and report format; the agent also runs its [`Workload`].

use std::collections::BTreeMap;
use std::io;

use futures::future::BoxFuture;
use tokio::net::TcpStream;
use tracing::warn;

use crate::wire::OptionsLayout;


/// Name of the liveness probe every agent answers.
pub const PING: &str = "ping";

/// How many agents a benchmark occupies and who reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// One agent, timed on its own.
    Single,
    /// Two agents talking to each other; both acknowledge.
    Paired,
    /// Two agents talking to each other; only the active side acknowledges.
    PairedSingleAck,
    /// One agent receiving a byte stream from the coordinator.
    Receiving,
}

impl Arity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arity::Single => "single",
            Arity::Paired => "paired",
            Arity::PairedSingleAck => "paired-single-ack",
            Arity::Receiving => "receiving",
        }
    }

    pub fn options_layout(&self) -> OptionsLayout {
        match self {
            Arity::Single | Arity::Receiving => OptionsLayout::Empty,
            Arity::Paired | Arity::PairedSingleAck => OptionsLayout::Pair,
        }
    }

    pub fn participants(&self) -> usize {
        match self {
            Arity::Single | Arity::Receiving => 1,
            Arity::Paired | Arity::PairedSingleAck => 2,
        }
    }
}

/// Timed work that runs on a single agent.
pub trait LocalWork: Send {
    fn run(&mut self, runs: u32) -> io::Result<()>;

    /// Cleanup after the completion ack, outside the timed window.
    fn after_ack(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Prepares a [`LocalWork`] before the agent acknowledges setup.
pub type LocalFactory = fn() -> io::Result<Box<dyn LocalWork>>;

/// One phase of a paired benchmark over the peer connection.
///
/// Arguments are the peer stream, whether this side holds the active role,
/// and the repetition count.
pub type PeerFn = for<'a> fn(&'a mut TcpStream, bool, u32) -> BoxFuture<'a, io::Result<()>>;

#[derive(Clone, Copy)]
pub struct PeerWork {
    pub run: PeerFn,
    /// Runs after the completion ack, outside the timed window.
    pub after_ack: Option<PeerFn>,
    /// Only the active side acknowledges completion.
    pub one_stop: bool,
}

/// What the agent does once armed.
#[derive(Clone, Copy)]
pub enum Workload {
    /// Acknowledge setup and nothing else.
    Probe,
    Local(LocalFactory),
    Peer(PeerWork),
    /// Read `warmup + runs * chunk` bytes sent by the coordinator.
    Drain { warmup: u64, chunk: u64 },
}

impl std::fmt::Debug for Workload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Workload::Probe => f.write_str("Probe"),
            Workload::Local(_) => f.write_str("Local"),
            Workload::Peer(peer) => f.debug_struct("Peer").field("one_stop", &peer.one_stop).finish(),
            Workload::Drain { warmup, chunk } => f
                .debug_struct("Drain")
                .field("warmup", warmup)
                .field("chunk", chunk)
                .finish(),
        }
    }
}

/// Returns why a benchmark cannot run in the given environment.
pub type SkipCheck = fn(&str) -> Option<String>;

#[derive(Clone)]
pub struct BenchmarkDescriptor {
    pub name: &'static str,
    /// Report line; `{}` is replaced by the per-run cost.
    pub format: &'static str,
    pub workload: Workload,
    pub should_not_run: Option<SkipCheck>,
}

impl std::fmt::Debug for BenchmarkDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BenchmarkDescriptor")
            .field("name", &self.name)
            .field("workload", &self.workload)
            .field("skippable", &self.should_not_run.is_some())
            .finish()
    }
}

impl BenchmarkDescriptor {
    pub fn arity(&self) -> Arity {
        match &self.workload {
            Workload::Probe | Workload::Local(_) => Arity::Single,
            Workload::Peer(peer) if peer.one_stop => Arity::PairedSingleAck,
            Workload::Peer(_) => Arity::Paired,
            Workload::Drain { .. } => Arity::Receiving,
        }
    }

    pub fn skip_reason(&self, environment: &str) -> Option<String> {
        self.should_not_run.and_then(|check| check(environment))
    }

    /// Bytes the coordinator streams to a receiving agent in one round.
    pub fn payload_len(&self, runs: u32) -> Option<u64> {
        match self.workload {
            Workload::Drain { warmup, chunk } => Some(warmup.saturating_add(chunk.saturating_mul(u64::from(runs)))),
            _ => None,
        }
    }

    fn is_probe(&self) -> bool {
        matches!(self.workload, Workload::Probe)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: BTreeMap<&'static str, BenchmarkDescriptor>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every benchmark this crate ships.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(BenchmarkDescriptor {
            name: PING,
            format: "",
            workload: Workload::Probe,
            should_not_run: None,
        });
        micro::register(&mut registry);
        inter::register(&mut registry);
        host::register(&mut registry);
        registry
    }

    pub fn register(&mut self, descriptor: BenchmarkDescriptor) {
        if let Some(old) = self.entries.insert(descriptor.name, descriptor) {
            warn!(benchmark = old.name, "benchmark registered twice; keeping the later one");
        }
    }

    pub fn get(&self, name: &str) -> Option<&BenchmarkDescriptor> {
        self.entries.get(name)
    }

    /// Benchmarks a coordinator may schedule, in name order.
    pub fn scheduled(&self) -> impl Iterator<Item = &BenchmarkDescriptor> {
        self.entries.values().filter(|d| !d.is_probe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_arities() {
        let registry = Registry::builtin();
        assert_eq!(registry.get("syscall").unwrap().arity(), Arity::Single);
        assert_eq!(registry.get("pingpong").unwrap().arity(), Arity::Paired);
        assert_eq!(registry.get("sink-bandwidth").unwrap().arity(), Arity::PairedSingleAck);
        assert_eq!(registry.get("tcp-bandwidth").unwrap().arity(), Arity::Receiving);
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn test_probe_is_not_scheduled() {
        let registry = Registry::builtin();
        assert!(registry.get(PING).is_some());
        assert!(registry.scheduled().all(|d| d.name != PING));
        assert!(registry.scheduled().count() >= 10);
    }

    #[test]
    fn test_payload_only_for_receivers() {
        let registry = Registry::builtin();
        let tcp = registry.get("tcp-bandwidth").unwrap();
        assert_eq!(tcp.payload_len(2), Some(3 * host::TCP_CHUNK));
        assert_eq!(registry.get("syscall").unwrap().payload_len(2), None);
    }

    #[test]
    fn test_skip_reason_depends_on_environment() {
        let registry = Registry::builtin();
        let read = registry.get("read-latency").unwrap();
        assert!(read.skip_reason("kvm").is_none());
        assert!(read.skip_reason("diskless").is_some());
        let bandwidth = registry.get("read-bandwidth").unwrap();
        assert_eq!(bandwidth.skip_reason("diskless"), read.skip_reason("diskless"));
    }
}
