//! Error taxonomy for a measurement run.
//!
//! Transport, timeout and protocol failures are fatal: a partially failed
//! measurement is meaningless, so nothing above the session layer retries
//! them. Configuration problems only skip the offending benchmark.

use std::io;
use std::time::Duration;

/// Errors raised while coordinating benchmark agents.
#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    #[error("agent {agent}: {op} failed: {source}")]
    Transport {
        agent: usize,
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("agent {agent}: {op} timed out after {after:?}")]
    Timeout {
        agent: usize,
        op: &'static str,
        after: Duration,
    },

    #[error("agent {agent}: protocol violation: {detail}")]
    Protocol { agent: usize, detail: String },

    #[error("configuration error: {0}")]
    Config(String),

    /// Reporting a finished benchmark failed.
    #[error("reporting failed: {0}")]
    Io(#[from] io::Error),
}

impl BenchError {
    /// Whether this error must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Config(_))
    }

    /// The agent the failure is attributed to, if any.
    pub fn agent(&self) -> Option<usize> {
        match self {
            Self::Transport { agent, .. }
            | Self::Timeout { agent, .. }
            | Self::Protocol { agent, .. } => Some(*agent),
            _ => None,
        }
    }
}
