//! Worker process loop (§4.4, §6.2).
//!
//! Reads fd 3 until exit: reports `'0'` on boot, then loops receiving
//! `(fd, tag)` pairs, building a connection for each, and reporting
//! `'+'`/`'-'` as it takes over and releases them. The HTTP/WebDAV pipeline
//! itself is outside this repository's scope (§1) — this loop stops at
//! handing off the built [`caldav_dispatch::InboundConnection`].

use std::os::fd::RawFd;

use caldav_dispatch::{build_connection, report, try_receive, worker_inbound::ConnectionTag, WorkerReport};
use caldav_sched_types::ServerConfig;

const CONTROL_FD: RawFd = 3;

pub async fn run(_config: ServerConfig, worker_id: u32) -> anyhow::Result<()> {
    let control = unsafe {
        use std::os::fd::FromRawFd;
        std::os::unix::net::UnixDatagram::from_raw_fd(CONTROL_FD)
    };
    control.set_nonblocking(true)?;
    let control = tokio::net::UnixDatagram::from_std(control)?;

    report(&control, WorkerReport::Booted).await?;
    tracing::info!(worker_id, "worker booted");

    loop {
        control.readable().await?;
        match try_receive(CONTROL_FD)? {
            Some((fd, tag)) => {
                let (_connection, peer) = build_connection(fd, tag, None)?;
                report(&control, WorkerReport::TookOverConnection).await?;
                tracing::debug!(worker_id, %peer, tag = ?tag, "took over connection");
                // Handing `_connection` to the HTTP/WebDAV pipeline and
                // reporting `'-'` on its closure is outside this repository.
                if matches!(tag, ConnectionTag::Tls) {
                    tracing::warn!(worker_id, "TLS connections require a configured TlsAcceptor upstream");
                }
            }
            None => continue,
        }
    }
}
