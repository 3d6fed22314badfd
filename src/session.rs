//! One control connection to a remote benchmark agent.
//!
//! Every call is bounded by a timeout and every failure is returned as a
//! fatal [`BenchError`]; a session never reconnects.

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use crate::error::BenchError;
use crate::harness::SETUP_TIMEOUT;
use crate::wire::{self, BenchOptions, Setup, ACK_OK};

const PAYLOAD_CHUNK: usize = 64 * 1024;

#[derive(Debug)]
pub struct AgentSession<S = TcpStream> {
    index: usize,
    stream: S,
    setup_timeout: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin> AgentSession<S> {
    pub fn new(index: usize, stream: S) -> Self {
        Self {
            index,
            stream,
            setup_timeout: SETUP_TIMEOUT,
        }
    }

    pub fn with_setup_timeout(mut self, limit: Duration) -> Self {
        self.setup_timeout = limit;
        self
    }

    /// Position of this agent in the fleet.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Describe the next round and wait for the agent to be ready.
    pub async fn send_setup(&mut self, name: &str, options: BenchOptions, runs: u32) -> Result<(), BenchError> {
        let setup = Setup {
            runs,
            name: name.to_string(),
            options,
        };
        trace!(agent = self.index, benchmark = name, runs, "sending setup");
        let limit = self.setup_timeout;
        let index = self.index;
        bounded(index, "send setup", limit, wire::write_setup(&mut self.stream, &setup)).await?;
        self.expect_ack("setup ack", limit).await
    }

    /// Tell the agent to start its timed work now.
    pub async fn send_arm(&mut self) -> Result<(), BenchError> {
        let index = self.index;
        bounded(index, "send arm", self.setup_timeout, wire::write_arm(&mut self.stream)).await
    }

    /// Wait for the agent to report that its timed work finished.
    pub async fn await_completion(&mut self, limit: Duration) -> Result<(), BenchError> {
        self.expect_ack("await completion", limit).await
    }

    /// Stream `len` filler bytes to an agent that is timing how fast it receives.
    pub async fn send_payload(&mut self, len: u64, limit: Duration) -> Result<(), BenchError> {
        let index = self.index;
        let stream = &mut self.stream;
        bounded(index, "send payload", limit, async move {
            let chunk = vec![0u8; PAYLOAD_CHUNK];
            let mut left = len;
            while left > 0 {
                let n = left.min(PAYLOAD_CHUNK as u64) as usize;
                stream.write_all(&chunk[..n]).await?;
                left -= n as u64;
            }
            stream.flush().await
        })
        .await
    }

    /// Liveness check used during fleet bring-up.
    pub async fn ping(&mut self) -> Result<(), BenchError> {
        self.send_setup(crate::benches::PING, BenchOptions::None, 0).await
    }

    async fn expect_ack(&mut self, op: &'static str, limit: Duration) -> Result<(), BenchError> {
        let index = self.index;
        let status = bounded(index, op, limit, wire::read_ack(&mut self.stream)).await?;
        if status != ACK_OK {
            return Err(BenchError::Protocol {
                agent: index,
                detail: format!("{op}: agent answered {status}"),
            });
        }
        Ok(())
    }
}

async fn bounded<T>(
    agent: usize,
    op: &'static str,
    limit: Duration,
    fut: impl Future<Output = io::Result<T>>,
) -> Result<T, BenchError> {
    match tokio::time::timeout(limit, fut).await {
        Err(_) => Err(BenchError::Timeout { agent, op, after: limit }),
        Ok(Err(source)) if source.kind() == io::ErrorKind::InvalidData => Err(BenchError::Protocol {
            agent,
            detail: format!("{op}: {source}"),
        }),
        Ok(Err(source)) => Err(BenchError::Transport { agent, op, source }),
        Ok(Ok(value)) => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn test_setup_round_trip_with_ack() {
        let (near, mut far) = duplex(1024);
        let mut session = AgentSession::new(2, near);

        let agent = tokio::spawn(async move {
            let (runs, name) = wire::read_setup_header(&mut far).await.unwrap();
            wire::write_ack(&mut far, ACK_OK).await.unwrap();
            wire::read_arm(&mut far).await.unwrap();
            wire::write_ack(&mut far, ACK_OK).await.unwrap();
            (runs, name)
        });

        session.send_setup("syscall", BenchOptions::None, 8).await.unwrap();
        session.send_arm().await.unwrap();
        session.await_completion(Duration::from_secs(1)).await.unwrap();
        assert_eq!(agent.await.unwrap(), (8, "syscall".to_string()));
    }

    #[tokio::test]
    async fn test_nonzero_ack_is_protocol_error() {
        let (near, mut far) = duplex(1024);
        let mut session = AgentSession::new(0, near);
        tokio::spawn(async move {
            let _ = wire::read_setup_header(&mut far).await;
            wire::write_ack(&mut far, 1).await.unwrap();
        });
        let err = session.send_setup("nope", BenchOptions::None, 1).await.unwrap_err();
        assert!(matches!(err, BenchError::Protocol { agent: 0, .. }), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_agent_times_out() {
        let (near, _far) = duplex(1024);
        let mut session = AgentSession::new(4, near).with_setup_timeout(Duration::from_secs(5));
        let err = session.send_setup("fork", BenchOptions::None, 1).await.unwrap_err();
        assert!(matches!(err, BenchError::Timeout { agent: 4, op: "setup ack", .. }), "{err}");
    }

    #[tokio::test]
    async fn test_closed_connection_is_transport_error() {
        let (near, far) = duplex(1024);
        drop(far);
        let mut session = AgentSession::new(1, near);
        let err = session.await_completion(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, BenchError::Transport { agent: 1, .. }), "{err}");
    }

    #[tokio::test]
    async fn test_payload_is_streamed_in_full() {
        let (near, mut far) = duplex(4096);
        let mut session = AgentSession::new(0, near);
        let reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            far.read_to_end(&mut buf).await.unwrap();
            buf.len()
        });
        session.send_payload(200_000, Duration::from_secs(5)).await.unwrap();
        drop(session);
        assert_eq!(reader.await.unwrap(), 200_000);
    }
}
