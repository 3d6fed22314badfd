//! The remote side of the control protocol.
//!
//! An agent answers one coordinator at a time. For every setup frame it
//! prepares the named workload, acknowledges, waits for the arm frame, runs
//! the workload and acknowledges again. The coordinator times the gap
//! between arming and the second acknowledgement.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, info, warn};

use crate::benches::{BenchmarkDescriptor, LocalWork, PeerWork, Registry, Workload};
use crate::harness::ROUND_TIMEOUT;
use crate::wire::{self, BenchOptions, PairOptions, ACK_FAILED, ACK_OK};

/// Accept coordinator connections one after another until the listener fails.
pub async fn accept_loop(listener: TcpListener, registry: &Registry) -> io::Result<()> {
    loop {
        let (stream, from) = listener.accept().await?;
        stream.set_nodelay(true)?;
        info!(%from, "coordinator connected");
        match serve(stream, registry).await {
            Ok(()) => info!(%from, "coordinator disconnected"),
            Err(e) => warn!(%from, error = %e, "control session ended"),
        }
    }
}

/// Answer setup frames on one control connection until the coordinator hangs up.
pub async fn serve<S>(mut stream: S, registry: &Registry) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let (runs, name) = match wire::read_setup_header(&mut stream).await {
            Ok(header) => header,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        let Some(descriptor) = registry.get(&name) else {
            warn!(benchmark = %name, "unknown benchmark requested");
            wire::write_ack(&mut stream, ACK_FAILED).await?;
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unknown benchmark: {name}"),
            ));
        };
        let options = wire::read_options(&mut stream, descriptor.arity().options_layout()).await?;
        debug!(benchmark = descriptor.name, runs, "setup received");

        match descriptor.workload {
            Workload::Probe => wire::write_ack(&mut stream, ACK_OK).await?,
            Workload::Local(factory) => {
                let work = match factory() {
                    Ok(work) => work,
                    Err(e) => return refuse(&mut stream, descriptor, e).await,
                };
                run_local(&mut stream, work, runs).await?;
            }
            Workload::Peer(peer) => {
                let BenchOptions::Pair(pair) = options else {
                    let e = io::Error::new(io::ErrorKind::InvalidData, "paired benchmark without pair options");
                    return refuse(&mut stream, descriptor, e).await;
                };
                run_peer(&mut stream, descriptor, peer, pair, runs).await?;
            }
            Workload::Drain { .. } => {
                let len = descriptor.payload_len(runs).unwrap_or(0);
                wire::write_ack(&mut stream, ACK_OK).await?;
                wire::read_arm(&mut stream).await?;
                let drained = tokio::io::copy(&mut (&mut stream).take(len), &mut tokio::io::sink()).await?;
                if drained != len {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("payload ended after {drained} of {len} bytes"),
                    ));
                }
                wire::write_ack(&mut stream, ACK_OK).await?;
            }
        }
    }
}

async fn refuse<S>(stream: &mut S, descriptor: &BenchmarkDescriptor, e: io::Error) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    warn!(benchmark = descriptor.name, error = %e, "cannot prepare benchmark");
    wire::write_ack(stream, ACK_FAILED).await?;
    Err(e)
}

async fn run_local<S>(stream: &mut S, mut work: Box<dyn LocalWork>, runs: u32) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    wire::write_ack(stream, ACK_OK).await?;
    wire::read_arm(stream).await?;
    let (mut work, result) = tokio::task::spawn_blocking(move || {
        let result = work.run(runs);
        (work, result)
    })
    .await
    .map_err(io::Error::other)?;
    if let Err(e) = result {
        wire::write_ack(stream, ACK_FAILED).await?;
        return Err(e);
    }
    wire::write_ack(stream, ACK_OK).await?;
    tokio::task::spawn_blocking(move || work.after_ack())
        .await
        .map_err(io::Error::other)?
}

async fn run_peer<S>(
    stream: &mut S,
    descriptor: &BenchmarkDescriptor,
    peer: PeerWork,
    pair: PairOptions,
    runs: u32,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut link = if pair.active {
        let listener = match listen(SocketAddr::V4(pair.listen_addr())) {
            Ok(listener) => listener,
            Err(e) => return refuse(stream, descriptor, e).await,
        };
        wire::write_ack(stream, ACK_OK).await?;
        let (link, from) = tokio::time::timeout(ROUND_TIMEOUT, listener.accept())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "partner never connected"))??;
        debug!(%from, "partner connected");
        link
    } else {
        let link = match TcpStream::connect(pair.connect_addr()).await {
            Ok(link) => link,
            Err(e) => return refuse(stream, descriptor, e).await,
        };
        wire::write_ack(stream, ACK_OK).await?;
        link
    };
    link.set_nodelay(true)?;

    wire::read_arm(stream).await?;
    if let Err(e) = (peer.run)(&mut link, pair.active, runs).await {
        warn!(benchmark = descriptor.name, error = %e, "peer workload failed");
        wire::write_ack(stream, ACK_FAILED).await?;
        return Err(e);
    }
    if pair.active || !peer.one_stop {
        wire::write_ack(stream, ACK_OK).await?;
    }
    if let Some(after) = peer.after_ack {
        after(&mut link, pair.active, runs).await?;
    }
    Ok(())
}

fn listen(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(1)
}
