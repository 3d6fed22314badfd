//! The set of agents a coordinator drives, and how it comes up.

use std::fs;
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::error::BenchError;
use crate::harness::{BenchConfig, CONNECT_RETRY, CONTROL_PORT, PEER_PORT};
use crate::session::AgentSession;

/// Where to reach one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentAddr {
    /// Control connection address.
    pub control: SocketAddr,
    /// Address the agent listens on when it holds the active side of a pair.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<SocketAddrV4>,
}

impl AgentAddr {
    /// Configured peer address, or the control host on the default peer port.
    pub fn peer_addr(&self) -> Option<SocketAddrV4> {
        match (self.peer, self.control) {
            (Some(peer), _) => Some(peer),
            (None, SocketAddr::V4(control)) => Some(SocketAddrV4::new(*control.ip(), PEER_PORT)),
            (None, SocketAddr::V6(_)) => None,
        }
    }
}

/// Parses `CONTROL[,PEER]`; a bare host uses the default control port.
impl FromStr for AgentAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (control, peer) = match s.split_once(',') {
            Some((control, peer)) => (control, Some(peer)),
            None => (s, None),
        };
        let control = match control.trim().parse::<SocketAddr>() {
            Ok(addr) => addr,
            Err(_) => control
                .trim()
                .parse::<IpAddr>()
                .map(|ip| SocketAddr::new(ip, CONTROL_PORT))
                .map_err(|e| format!("invalid control address '{control}': {e}"))?,
        };
        let peer = peer
            .map(|p| {
                p.trim()
                    .parse::<SocketAddrV4>()
                    .map_err(|e| format!("invalid peer address '{p}': {e}"))
            })
            .transpose()?;
        Ok(Self { control, peer })
    }
}

/// Fleet file contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetConfig {
    pub agents: Vec<AgentAddr>,
}

impl FleetConfig {
    pub fn load(path: &Path) -> Result<Self, BenchError> {
        let text = fs::read_to_string(path)
            .map_err(|e| BenchError::Config(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&text).map_err(|e| BenchError::Config(format!("{}: {e}", path.display())))
    }
}

#[derive(Debug)]
pub struct FleetMember<S = TcpStream> {
    pub session: AgentSession<S>,
    /// Where this agent listens as the active side of a pair.
    pub peer: Option<SocketAddrV4>,
}

/// Every connected agent, indexed by position.
#[derive(Debug)]
pub struct Fleet<S = TcpStream> {
    members: Vec<FleetMember<S>>,
}

impl<S> Default for Fleet<S> {
    fn default() -> Self {
        Self { members: Vec::new() }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Fleet<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connected agent; returns its index.
    pub fn push(&mut self, stream: S, peer: Option<SocketAddrV4>, setup_timeout: Duration) -> usize {
        let index = self.members.len();
        let session = AgentSession::new(index, stream).with_setup_timeout(setup_timeout);
        self.members.push(FleetMember { session, peer });
        index
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn member(&self, index: usize) -> Option<&FleetMember<S>> {
        self.members.get(index)
    }

    /// Mutable access to several distinct members at once, in the order asked.
    pub fn members_mut(&mut self, indices: &[usize]) -> Result<Vec<&mut FleetMember<S>>, BenchError> {
        let mut slots: Vec<Option<&mut FleetMember<S>>> = self.members.iter_mut().map(Some).collect();
        indices
            .iter()
            .map(|&i| {
                slots
                    .get_mut(i)
                    .and_then(Option::take)
                    .ok_or_else(|| BenchError::Config(format!("agent {i} is missing or selected twice")))
            })
            .collect()
    }

    /// Check every agent answers the liveness probe.
    pub async fn ping_all(&mut self) -> Result<(), BenchError> {
        for member in &mut self.members {
            member.session.ping().await?;
            debug!(agent = member.session.index(), "agent answered ping");
        }
        Ok(())
    }
}

impl Fleet<TcpStream> {
    /// Connect to every agent and make sure each one answers.
    pub async fn bring_up(addrs: &[AgentAddr], cfg: &BenchConfig) -> Result<Self, BenchError> {
        if addrs.is_empty() {
            return Err(BenchError::Config("no agents configured".to_string()));
        }
        let deadline = Instant::now() + cfg.bringup_timeout;
        let connects = addrs
            .iter()
            .enumerate()
            .map(|(agent, addr)| connect_with_retry(agent, addr.control, deadline, cfg.bringup_timeout));
        let streams = try_join_all(connects).await?;

        let mut fleet = Self::new();
        for (stream, addr) in streams.into_iter().zip(addrs) {
            fleet.push(stream, addr.peer_addr(), cfg.setup_timeout);
        }
        fleet.ping_all().await?;
        info!(agents = fleet.len(), "fleet is up");
        Ok(fleet)
    }
}

async fn connect_with_retry(
    agent: usize,
    addr: SocketAddr,
    deadline: Instant,
    limit: Duration,
) -> Result<TcpStream, BenchError> {
    let attempts = async {
        loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => return stream,
                Err(e) => {
                    trace!(agent, %addr, error = %e, "agent not reachable yet");
                    tokio::time::sleep(CONNECT_RETRY).await;
                }
            }
        }
    };
    let stream = tokio::time::timeout_at(deadline, attempts)
        .await
        .map_err(|_| BenchError::Timeout {
            agent,
            op: "connect",
            after: limit,
        })?;
    stream
        .set_nodelay(true)
        .map_err(|source| BenchError::Transport { agent, op: "connect", source })?;
    debug!(agent, %addr, "connected");
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::duplex;

    #[test]
    fn test_parse_agent_flag() {
        let bare: AgentAddr = "10.0.0.2".parse().unwrap();
        assert_eq!(bare.control, "10.0.0.2:6099".parse().unwrap());
        assert_eq!(bare.peer_addr(), Some(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), PEER_PORT)));

        let full: AgentAddr = "10.0.0.2:7000,192.168.1.5:7100".parse().unwrap();
        assert_eq!(full.control.port(), 7000);
        assert_eq!(full.peer_addr(), Some("192.168.1.5:7100".parse().unwrap()));

        assert!("not-an-address".parse::<AgentAddr>().is_err());
        assert!("10.0.0.2,[::1]:80".parse::<AgentAddr>().is_err());

        let v6: AgentAddr = "[::1]:6099".parse().unwrap();
        assert_eq!(v6.peer_addr(), None);
    }

    #[test]
    fn test_load_fleet_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.json");
        fs::write(
            &path,
            r#"{ "agents": [ { "control": "10.0.0.2:6099", "peer": "10.0.0.2:6100" }, { "control": "10.0.0.3:6099" } ] }"#,
        )
        .unwrap();
        let cfg = FleetConfig::load(&path).unwrap();
        assert_eq!(cfg.agents.len(), 2);
        assert_eq!(cfg.agents[1].peer, None);

        fs::write(&path, "{").unwrap();
        assert!(matches!(FleetConfig::load(&path), Err(BenchError::Config(_))));
    }

    #[test]
    fn test_members_mut_rejects_duplicates() {
        let mut fleet = Fleet::new();
        let mut far_ends = Vec::new();
        for _ in 0..3 {
            let (near, far) = duplex(64);
            fleet.push(near, None, Duration::from_secs(1));
            far_ends.push(far);
        }
        let picked = fleet.members_mut(&[2, 0]).unwrap();
        assert_eq!(picked[0].session.index(), 2);
        assert_eq!(picked[1].session.index(), 0);
        assert!(fleet.members_mut(&[1, 1]).is_err());
        assert!(fleet.members_mut(&[3]).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_agent_times_out() {
        // Nothing listens on a port we just released.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let cfg = BenchConfig {
            bringup_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let addr: AgentAddr = format!("127.0.0.1:{port}").parse().unwrap();
        let err = Fleet::bring_up(&[addr], &cfg).await.unwrap_err();
        assert!(matches!(err, BenchError::Timeout { agent: 0, op: "connect", .. }), "{err}");
    }
}
