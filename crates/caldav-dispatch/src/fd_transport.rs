//! FD-passing transport (§4.1, C1).
//!
//! Two non-blocking operations over an open `AF_UNIX SOCK_DGRAM` file
//! descriptor: `send_fd` transmits one inherited socket plus a short ASCII
//! tag via `SCM_RIGHTS`; `recv_fd` is the matching `recvmsg` loop on the
//! worker side. Both surface `EAGAIN`/`ENOBUFS` as [`SendOutcome::WouldBlock`]
//! rather than an error — the caller re-queues and waits for write-readiness,
//! the way the teacher's `PendingDispatchStore::claim_pending` backs off
//! instead of treating contention as failure.

use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use std::io::IoSlice;

use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};

use caldav_sched_types::DispatchError;

/// Outcome of attempting to send one fd.
#[derive(Debug)]
pub enum SendOutcome {
    Sent,
    /// Kernel send buffer is full or out of ancillary-data space; re-queue
    /// at the head of the outbox and wait for write-readiness.
    WouldBlock,
}

/// Transmit `fd` tagged with `description` (e.g. `"TCP"`/`"SSL"`) over the
/// control socket `control_fd`.
pub fn send_fd(control_fd: RawFd, description: &str, fd: RawFd) -> Result<SendOutcome, DispatchError> {
    let iov = [IoSlice::new(description.as_bytes())];
    let fds = [fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    let borrowed = unsafe { BorrowedFd::borrow_raw(control_fd) };

    match sendmsg::<()>(borrowed.as_raw_fd(), &iov, &cmsg, MsgFlags::MSG_DONTWAIT, None) {
        Ok(_) => Ok(SendOutcome::Sent),
        Err(Errno::EAGAIN) | Err(Errno::ENOBUFS) => Ok(SendOutcome::WouldBlock),
        Err(e) => Err(DispatchError::Io(std::io::Error::from(e))),
    }
}

/// One received `(fd, tag)` pair, or the worker process telling the master
/// the link has nothing more to read right now.
#[derive(Debug)]
pub enum RecvOutcome {
    Received { fd: OwnedFd, tag: String },
    WouldBlock,
}

/// `recvmsg` loop: receive one datagram plus its `SCM_RIGHTS` ancillary fd.
/// Malformed datagrams (no fd attached, or more than one) are a fatal
/// link condition, not `WouldBlock`.
pub fn recv_fd(control_fd: RawFd) -> Result<RecvOutcome, DispatchError> {
    let mut buf = [0u8; 32];
    let mut iov = [std::io::IoSliceMut::new(&mut buf)];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);

    let borrowed = unsafe { BorrowedFd::borrow_raw(control_fd) };
    let msg = match recvmsg::<()>(
        borrowed.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::MSG_DONTWAIT,
    ) {
        Ok(msg) => msg,
        Err(Errno::EAGAIN) => return Ok(RecvOutcome::WouldBlock),
        Err(e) => return Err(DispatchError::Io(std::io::Error::from(e))),
    };

    let mut received_fds: Vec<RawFd> = Vec::new();
    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            received_fds.extend(fds);
        }
    }

    if received_fds.len() != 1 {
        return Err(DispatchError::MalformedDatagram);
    }

    let tag_len = msg.bytes;
    let tag = String::from_utf8_lossy(&buf[..tag_len]).into_owned();
    let fd = received_fds[0];
    // Safety: `fd` was just handed to us via SCM_RIGHTS; we own it exclusively.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };

    Ok(RecvOutcome::Received { fd: owned, tag })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

    #[test]
    fn send_then_recv_round_trips_fd_and_tag() {
        let (a, b) = socketpair(AddressFamily::Unix, SockType::Datagram, None, SockFlag::empty()).unwrap();
        let (dummy_r, _dummy_w) =
            socketpair(AddressFamily::Unix, SockType::Datagram, None, SockFlag::empty()).unwrap();

        let outcome = send_fd(a.as_raw_fd(), "TCP", dummy_r.as_raw_fd()).unwrap();
        assert!(matches!(outcome, SendOutcome::Sent));

        match recv_fd(b.as_raw_fd()).unwrap() {
            RecvOutcome::Received { tag, .. } => assert_eq!(tag, "TCP"),
            RecvOutcome::WouldBlock => panic!("expected a message"),
        }
    }

    #[test]
    fn recv_on_empty_socket_would_block() {
        let (_a, b) = socketpair(AddressFamily::Unix, SockType::Datagram, None, SockFlag::empty()).unwrap();
        let outcome = recv_fd(b.as_raw_fd()).unwrap();
        assert!(matches!(outcome, RecvOutcome::WouldBlock));
    }
}
