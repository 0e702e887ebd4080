//! Per-worker control channel (§4.2, C2).
//!
//! Each worker slot owns a `socketpair(AF_UNIX, SOCK_DGRAM)`; the master
//! keeps one end as a [`tokio::net::UnixDatagram`], the worker inherits the
//! other as fd 3. `WorkerSlot` tracks the outbox/pending-close queues and the
//! worker's [`WorkerStatus`] the way `metafd.py`'s `_SubprocessSocket` does.

use std::collections::VecDeque;
use std::os::fd::{OwnedFd, RawFd};

use tokio::net::UnixDatagram;

use caldav_sched_types::{DispatchError, WorkerStatus};

use crate::fd_transport::{self, RecvOutcome, SendOutcome};

/// One queued `(fd, tag)` pair awaiting send.
pub struct QueuedFd {
    pub fd: OwnedFd,
    pub tag: String,
}

/// State owned by the master for one worker process.
pub struct WorkerSlot {
    pub worker_id: u32,
    pub socket: UnixDatagram,
    pub status: WorkerStatus,
    outbox: VecDeque<QueuedFd>,
    pending_close: VecDeque<OwnedFd>,
}

impl WorkerSlot {
    pub fn new(worker_id: u32, socket: UnixDatagram) -> Self {
        let mut status = WorkerStatus::default();
        status.start();
        Self {
            worker_id,
            socket,
            status,
            outbox: VecDeque::new(),
            pending_close: VecDeque::new(),
        }
    }

    pub fn enqueue_fd(&mut self, fd: OwnedFd, tag: String) {
        self.outbox.push_back(QueuedFd { fd, tag });
    }

    /// Drain the outbox via C1-send. Each successfully sent entry moves
    /// from `outbox` to `pending_close`; on `WouldBlock` it stays at the
    /// head of `outbox` for the next write-ready tick (§4.1).
    pub fn drain_outbox(&mut self) -> Result<(), DispatchError> {
        use std::os::fd::AsRawFd;

        while let Some(front) = self.outbox.front() {
            let raw: RawFd = front.fd.as_raw_fd();
            match fd_transport::send_fd(self.socket.as_raw_fd(), &front.tag, raw)? {
                SendOutcome::Sent => {
                    let sent = self.outbox.pop_front().expect("front checked above");
                    self.pending_close.push_back(sent.fd);
                }
                SendOutcome::WouldBlock => break,
            }
        }
        Ok(())
    }

    /// Drain status bytes on read-ready (§4.2's read path). Returns the
    /// count of `pendingClose` entries the caller should now close.
    pub fn drain_status(&mut self) -> Result<u32, DispatchError> {
        loop {
            match self.recv_status_datagram()? {
                RecvStatusOutcome::Byte(byte) => self.apply_status_byte(byte)?,
                RecvStatusOutcome::WouldBlock => break,
            }
        }
        Ok(self.status.take_close_count())
    }

    /// Apply one validated status byte (`'0'`/`'+'`/`'-'`); anything else is
    /// a fatal-protocol condition for this link.
    pub fn apply_status_byte(&mut self, byte: u8) -> Result<(), DispatchError> {
        if !matches!(byte, b'0' | b'+' | b'-') {
            return Err(DispatchError::MalformedStatus {
                worker_id: self.worker_id,
            });
        }
        self.status.apply_message(byte);
        Ok(())
    }

    pub fn close_n_pending(&mut self, n: u32) {
        for _ in 0..n {
            self.pending_close.pop_front();
        }
    }

    pub fn mark_stopped(&mut self) {
        self.status.stop();
        self.outbox.clear();
    }

    fn recv_status_datagram(&self) -> Result<RecvStatusOutcome, DispatchError> {
        let mut buf = [0u8; 1];
        match self.socket.try_recv(&mut buf) {
            Ok(0) => Ok(RecvStatusOutcome::WouldBlock),
            Ok(_) => Ok(RecvStatusOutcome::Byte(buf[0])),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(RecvStatusOutcome::WouldBlock),
            Err(e) => Err(DispatchError::Io(e)),
        }
    }
}

pub enum RecvStatusOutcome {
    Byte(u8),
    WouldBlock,
}

/// Receive one `(fd, tag)` datagram on the worker's inherited control
/// socket. Thin wrapper so `worker_inbound.rs` doesn't import
/// [`crate::fd_transport`] directly.
pub fn recv_inbound_fd(control_fd: RawFd) -> Result<RecvOutcome, DispatchError> {
    fd_transport::recv_fd(control_fd)
}
