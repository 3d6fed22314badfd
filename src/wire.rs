//! Control-connection framing between the coordinator and an agent.
//!
//! # Frames
//!
//! ```text
//! setup (coordinator -> agent):
//!   runs: u32 (little endian)
//!   name: [u8] terminated by 0
//!   options: [u8; n]   n fixed by the benchmark's arity (0 or 16)
//!
//! arm (coordinator -> agent):
//!   [0u8; 5]
//!
//! ack (agent -> coordinator):
//!   status: u32 (little endian), 0 = success
//! ```
//!
//! Paired options are four little-endian u32 fields: own IPv4 address,
//! partner IPv4 address, active-role flag, peer port.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Arm marker telling an agent to start its timed work.
pub const ARM_FRAME: [u8; 5] = [0; 5];

/// Status value of a successful acknowledgement.
pub const ACK_OK: u32 = 0;

/// Status an agent returns when it cannot run the requested benchmark.
pub const ACK_FAILED: u32 = 1;

/// Encoded size of [`PairOptions`].
pub const PAIR_OPTIONS_LEN: usize = 16;

/// Longest benchmark name accepted on the wire.
pub const MAX_NAME_LEN: usize = 1024;

/// Options telling one side of a pair where its partner is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairOptions {
    pub own_address: Ipv4Addr,
    pub peer_address: Ipv4Addr,
    /// The active side listens; the other side connects to it.
    pub active: bool,
    /// Port the active side listens on.
    pub port: u16,
}

impl PairOptions {
    /// Address the active side binds its listener to.
    pub fn listen_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.own_address, self.port)
    }

    /// Address the passive side connects to.
    pub fn connect_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.peer_address, self.port)
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&u32::from(self.own_address).to_le_bytes());
        out.extend_from_slice(&u32::from(self.peer_address).to_le_bytes());
        out.extend_from_slice(&u32::from(self.active).to_le_bytes());
        out.extend_from_slice(&u32::from(self.port).to_le_bytes());
    }

    fn decode(buf: &[u8; PAIR_OPTIONS_LEN]) -> io::Result<Self> {
        let field = |i: usize| u32::from_le_bytes([buf[i * 4], buf[i * 4 + 1], buf[i * 4 + 2], buf[i * 4 + 3]]);
        let active = match field(2) {
            0 => false,
            1 => true,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid active flag: {other}"),
                ))
            }
        };
        let port = u16::try_from(field(3)).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, format!("invalid peer port: {}", field(3)))
        })?;
        Ok(Self {
            own_address: Ipv4Addr::from(field(0)),
            peer_address: Ipv4Addr::from(field(1)),
            active,
            port,
        })
    }
}

/// How a setup frame's option bytes are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionsLayout {
    Empty,
    Pair,
}

impl OptionsLayout {
    pub fn byte_len(&self) -> usize {
        match self {
            OptionsLayout::Empty => 0,
            OptionsLayout::Pair => PAIR_OPTIONS_LEN,
        }
    }
}

/// Per-benchmark options carried by a setup frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenchOptions {
    None,
    Pair(PairOptions),
}

impl BenchOptions {
    pub fn layout(&self) -> OptionsLayout {
        match self {
            BenchOptions::None => OptionsLayout::Empty,
            BenchOptions::Pair(_) => OptionsLayout::Pair,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Setup {
    pub runs: u32,
    pub name: String,
    pub options: BenchOptions,
}

impl Setup {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.name.len() + 1 + self.options.layout().byte_len());
        out.extend_from_slice(&self.runs.to_le_bytes());
        out.extend_from_slice(self.name.as_bytes());
        out.push(0);
        if let BenchOptions::Pair(pair) = &self.options {
            pair.encode(&mut out);
        }
        out
    }
}

/// Write a setup frame.
pub async fn write_setup<W: AsyncWrite + Unpin>(writer: &mut W, setup: &Setup) -> io::Result<()> {
    if setup.name.is_empty() || setup.name.len() > MAX_NAME_LEN || setup.name.contains('\0') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid benchmark name: {:?}", setup.name),
        ));
    }
    writer.write_all(&setup.encode()).await?;
    writer.flush().await
}

/// Read the fixed part of a setup frame: run count and benchmark name.
///
/// The caller looks the name up to learn how many option bytes follow.
pub async fn read_setup_header<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<(u32, String)> {
    let mut buf4 = [0u8; 4];
    reader.read_exact(&mut buf4).await?;
    let runs = u32::from_le_bytes(buf4);

    let mut name = Vec::new();
    loop {
        let byte = reader.read_u8().await?;
        if byte == 0 {
            break;
        }
        if name.len() == MAX_NAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "benchmark name is not terminated",
            ));
        }
        name.push(byte);
    }
    let name = String::from_utf8(name)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok((runs, name))
}

/// Read the option bytes that follow a setup header.
pub async fn read_options<R: AsyncRead + Unpin>(
    reader: &mut R,
    layout: OptionsLayout,
) -> io::Result<BenchOptions> {
    match layout {
        OptionsLayout::Empty => Ok(BenchOptions::None),
        OptionsLayout::Pair => {
            let mut buf = [0u8; PAIR_OPTIONS_LEN];
            reader.read_exact(&mut buf).await?;
            Ok(BenchOptions::Pair(PairOptions::decode(&buf)?))
        }
    }
}

pub async fn write_arm<W: AsyncWrite + Unpin>(writer: &mut W) -> io::Result<()> {
    writer.write_all(&ARM_FRAME).await?;
    writer.flush().await
}

/// Read an arm frame, rejecting anything but the zero marker.
pub async fn read_arm<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<()> {
    let mut buf = [0u8; ARM_FRAME.len()];
    reader.read_exact(&mut buf).await?;
    if buf != ARM_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("malformed arm frame: {buf:?}"),
        ));
    }
    Ok(())
}

pub async fn write_ack<W: AsyncWrite + Unpin>(writer: &mut W, status: u32) -> io::Result<()> {
    writer.write_all(&status.to_le_bytes()).await?;
    writer.flush().await
}

pub async fn read_ack<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<u32> {
    let mut buf4 = [0u8; 4];
    reader.read_exact(&mut buf4).await?;
    Ok(u32::from_le_bytes(buf4))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> PairOptions {
        PairOptions {
            own_address: Ipv4Addr::new(10, 0, 0, 2),
            peer_address: Ipv4Addr::new(10, 0, 0, 3),
            active: true,
            port: 6100,
        }
    }

    #[test]
    fn test_setup_layout() {
        let setup = Setup {
            runs: 16,
            name: "fork".to_string(),
            options: BenchOptions::None,
        };
        assert_eq!(setup.encode(), vec![16, 0, 0, 0, b'f', b'o', b'r', b'k', 0]);

        let paired = Setup {
            runs: 1,
            name: "pingpong".to_string(),
            options: BenchOptions::Pair(pair()),
        };
        let bytes = paired.encode();
        assert_eq!(bytes.len(), 4 + "pingpong".len() + 1 + OptionsLayout::Pair.byte_len());
        assert_eq!(OptionsLayout::Empty.byte_len(), 0);
        let opts = &bytes[bytes.len() - PAIR_OPTIONS_LEN..];
        assert_eq!(&opts[0..4], &u32::from(Ipv4Addr::new(10, 0, 0, 2)).to_le_bytes());
        assert_eq!(&opts[8..12], &1u32.to_le_bytes());
        assert_eq!(&opts[12..16], &6100u32.to_le_bytes());
    }

    #[tokio::test]
    async fn test_setup_read_back() {
        let setup = Setup {
            runs: 1024,
            name: "bandwidth".to_string(),
            options: BenchOptions::Pair(pair()),
        };
        let bytes = setup.encode();
        let mut reader = bytes.as_slice();
        let (runs, name) = read_setup_header(&mut reader).await.unwrap();
        assert_eq!(runs, 1024);
        assert_eq!(name, "bandwidth");
        let options = read_options(&mut reader, OptionsLayout::Pair).await.unwrap();
        assert_eq!(options, setup.options);
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_bad_frames() {
        let mut nonzero: &[u8] = &[0, 0, 1, 0, 0];
        assert!(read_arm(&mut nonzero).await.is_err());

        let mut short: &[u8] = &[0, 0];
        let err = read_ack(&mut short).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        let mut bad_flag = Vec::new();
        bad_flag.extend_from_slice(&[0u8; 8]);
        bad_flag.extend_from_slice(&7u32.to_le_bytes());
        bad_flag.extend_from_slice(&6100u32.to_le_bytes());
        let mut reader = bad_flag.as_slice();
        assert!(read_options(&mut reader, OptionsLayout::Pair).await.is_err());

        let mut sink = Vec::new();
        let empty = Setup {
            runs: 1,
            name: String::new(),
            options: BenchOptions::None,
        };
        assert!(write_setup(&mut sink, &empty).await.is_err());
    }
}
