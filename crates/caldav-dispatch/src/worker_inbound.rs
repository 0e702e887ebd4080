//! Worker-side inbound connection handling (§4.4, C4).
//!
//! The worker process owns exactly one control fd (inherited as fd 3, per
//! §6.2). On boot it reports `'0'` before reading anything; from then on it
//! loops `recv_inbound_fd`, turns each `(fd, tag)` pair into a plain TCP or
//! TLS transport, and reports `'+'`/`'-'` back to the master as the
//! transport opens and closes, mirroring how `metafd.py`'s worker process
//! drives the same protocol from the child side.

use std::net::SocketAddr;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use caldav_sched_types::DispatchError;

use crate::control_channel;
use crate::fd_transport::RecvOutcome;

/// Sentinel used when `getpeername` fails with `ENOTCONN` (the accepted
/// peer disconnected before the worker could inspect it).
pub const SENTINEL_PEER_ADDR: &str = "0.0.0.0:0";

/// A connection handed to the worker by the dispatcher, tagged with
/// whatever transport wrapping it needs.
pub enum InboundConnection {
    Plain(TcpStream),
    Tls { stream: TcpStream, acceptor: Arc<TlsAcceptor> },
}

/// How to interpret the tag byte string the dispatcher attached to an fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionTag {
    Tcp,
    Tls,
}

impl ConnectionTag {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "TCP" => Some(Self::Tcp),
            "TLS" => Some(Self::Tls),
            _ => None,
        }
    }
}

/// Status bytes the worker writes back to the master on its control socket.
pub enum WorkerReport {
    Booted,
    TookOverConnection,
    ConnectionClosed,
}

impl WorkerReport {
    pub fn byte(&self) -> u8 {
        match self {
            Self::Booted => b'0',
            Self::TookOverConnection => b'+',
            Self::ConnectionClosed => b'-',
        }
    }
}

/// Send one status byte on the worker's control socket.
pub async fn report(control: &tokio::net::UnixDatagram, report: WorkerReport) -> std::io::Result<()> {
    control.send(&[report.byte()]).await?;
    Ok(())
}

/// Block until the next `(fd, tag)` pair arrives, or `WouldBlock` if the
/// control socket isn't readable yet. Callers typically await readiness on
/// `control` first, then call this.
pub fn try_receive(control_fd: RawFd) -> Result<Option<(OwnedFd, ConnectionTag)>, DispatchError> {
    match control_channel::recv_inbound_fd(control_fd)? {
        RecvOutcome::Received { fd, tag } => {
            let tag = ConnectionTag::parse(&tag).ok_or(DispatchError::MalformedDatagram)?;
            Ok(Some((fd, tag)))
        }
        RecvOutcome::WouldBlock => Ok(None),
    }
}

/// Build the transport for one received fd, substituting the sentinel peer
/// address if `getpeername` reports `ENOTCONN` (§4.4's fast-disconnect
/// case).
pub fn build_connection(
    fd: OwnedFd,
    tag: ConnectionTag,
    tls_acceptor: Option<Arc<TlsAcceptor>>,
) -> std::io::Result<(InboundConnection, SocketAddr)> {
    use std::os::fd::IntoRawFd;
    let raw: RawFd = fd.into_raw_fd();
    let std_stream = unsafe { std::net::TcpStream::from_raw_fd(raw) };
    std_stream.set_nonblocking(true)?;

    let peer = match std_stream.peer_addr() {
        Ok(addr) => addr,
        Err(e) if e.raw_os_error() == Some(libc_enotconn()) => SENTINEL_PEER_ADDR.parse().unwrap(),
        Err(e) => return Err(e),
    };

    let stream = TcpStream::from_std(std_stream)?;
    let connection = match tag {
        ConnectionTag::Tcp => InboundConnection::Plain(stream),
        ConnectionTag::Tls => {
            let acceptor = tls_acceptor.expect("TLS tag requires a configured TlsAcceptor");
            InboundConnection::Tls { stream, acceptor }
        }
    };
    Ok((connection, peer))
}

fn libc_enotconn() -> i32 {
    // ENOTCONN is 107 on Linux; kept as a named constant rather than a
    // `libc` dependency since it's the only errno this module needs.
    107
}
