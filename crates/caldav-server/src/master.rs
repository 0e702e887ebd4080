//! Master process loop (§4.3, §6.2).
//!
//! Spawns `workers` child processes, each inheriting one end of a
//! `socketpair(AF_UNIX, SOCK_DGRAM)` as fd 3; accepts inbound TCP
//! connections and hands each one to [`caldav_dispatch::Dispatcher`]. The
//! listening socket is gated by the dispatcher's `AcceptState` watch the
//! way `ConnectionLimiter` pauses `doStart`/`doStop` on its ports.

use std::os::fd::{AsRawFd, OwnedFd};

use tokio::net::{TcpListener, UnixDatagram};
use tokio::process::Command;

use caldav_dispatch::{AcceptState, Dispatcher};
use caldav_sched_postgres::{PgRecordStore, PgUidLock, PgWorkQueue};
use caldav_sched_types::ServerConfig;

/// The scheduling core's storage ports, backed by Postgres (§4.5, §6.2).
/// Constructed once in the master and handed to whichever in-process
/// consumer needs it; the HTTP/WebDAV request path that would call
/// `ImplicitScheduler` with these is out of this repository's scope (see
/// DESIGN.md).
pub struct SchedulingStores {
    pub records: PgRecordStore,
    pub uid_lock: PgUidLock,
    pub work_queue: PgWorkQueue,
}

async fn connect_scheduling_stores(database_url: &str) -> anyhow::Result<SchedulingStores> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(SchedulingStores {
        records: PgRecordStore::new(pool.clone()),
        uid_lock: PgUidLock::new(pool.clone()),
        work_queue: PgWorkQueue::new(pool),
    })
}

pub async fn run(config: ServerConfig, worker_count: u32) -> anyhow::Result<()> {
    let _scheduling = connect_scheduling_stores(&config.database_url).await?;
    tracing::info!("scheduling stores connected");

    let (mut dispatcher, mut accept_rx) = Dispatcher::new(config.max_requests);

    let exe = std::env::current_exe()?;
    let mut children = Vec::new();
    for worker_id in 0..worker_count {
        let (master_end, worker_fd) = socketpair_nonblocking()?;
        let child = spawn_worker(&exe, worker_id, worker_fd)?;
        dispatcher.add_worker(worker_id, master_end);
        // TODO: watch `child` for exit and call dispatcher.child_exited +
        // respawn; not wired yet, so a crashed worker currently just stops
        // receiving new connections.
        children.push(child);
        tracing::info!(worker_id, "spawned worker");
    }

    let listener = TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "master listening");

    let mut status_tick = tokio::time::interval(std::time::Duration::from_millis(50));

    loop {
        if *accept_rx.borrow() == AcceptState::Paused {
            tokio::select! {
                result = accept_rx.changed() => { result?; }
                _ = status_tick.tick() => { dispatcher.drain_all_status()?; }
            }
            continue;
        }

        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                tracing::debug!(%peer, "accepted connection");
                let std_stream = stream.into_std()?;
                std_stream.set_nonblocking(false)?;
                let owned: OwnedFd = std_stream.into();
                if let Some(worker_id) = dispatcher.send_file_descriptor(owned, "TCP".to_string()) {
                    dispatcher.drain_outbox(worker_id)?;
                }
            }
            _ = accept_rx.changed() => {}
            _ = status_tick.tick() => {
                dispatcher.drain_all_status()?;
            }
        }
    }
}

fn socketpair_nonblocking() -> std::io::Result<(UnixDatagram, OwnedFd)> {
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

    let (a, b) = socketpair(AddressFamily::Unix, SockType::Datagram, None, SockFlag::SOCK_NONBLOCK)
        .map_err(std::io::Error::from)?;
    let master_end = UnixDatagram::from_std(std::os::unix::net::UnixDatagram::from(a))?;
    Ok((master_end, b))
}

/// Spawn one worker, dup'ing `worker_fd` onto fd 3 in the child before exec
/// (§6.2).
fn spawn_worker(exe: &std::path::Path, worker_id: u32, worker_fd: OwnedFd) -> std::io::Result<tokio::process::Child> {
    use std::os::unix::process::CommandExt;

    let raw = worker_fd.as_raw_fd();
    let mut cmd = Command::new(exe);
    cmd.arg("worker").arg("--worker-id").arg(worker_id.to_string());

    // Safety: `dup2` and a bare fd close are async-signal-safe; `worker_fd`
    // stays alive in the parent until `spawn` returns.
    unsafe {
        cmd.pre_exec(move || {
            nix::unistd::dup2(raw, 3).map_err(std::io::Error::from)?;
            Ok(())
        });
    }

    cmd.spawn()
}
