//! Connection dispatcher (§4.3, C3).
//!
//! Owns every worker slot and the accept-pause flag. `sendFileDescriptor`
//! always picks the least-loaded active worker (earliest-inserted on ties)
//! the way `metafd.py`'s `ConnectionLimiter.statusesChanged` walks its
//! sorted worker list; `statusesChanged` recomputes the pause flag the same
//! way after every mutation instead of leaving callers to remember to do it.

use std::collections::BTreeMap;
use std::os::fd::{AsRawFd, OwnedFd};

use tokio::sync::watch;

use caldav_sched_types::{DispatchError, WorkerStatus};

use crate::control_channel::WorkerSlot;

/// Inbound listeners watch this to know whether to keep calling `accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptState {
    Open,
    Paused,
}

pub struct Dispatcher {
    slots: BTreeMap<u32, WorkerSlot>,
    insertion_order: Vec<u32>,
    max_requests: u32,
    accept_tx: watch::Sender<AcceptState>,
}

impl Dispatcher {
    pub fn new(max_requests: u32) -> (Self, watch::Receiver<AcceptState>) {
        let (accept_tx, accept_rx) = watch::channel(AcceptState::Paused);
        (
            Self {
                slots: BTreeMap::new(),
                insertion_order: Vec::new(),
                max_requests,
                accept_tx,
            },
            accept_rx,
        )
    }

    /// Register a newly spawned worker's control-socket end. The slot
    /// starts `starting=1` and is not selected until it reports `'0'`.
    pub fn add_worker(&mut self, worker_id: u32, socket: tokio::net::UnixDatagram) {
        self.slots.insert(worker_id, WorkerSlot::new(worker_id, socket));
        self.insertion_order.push(worker_id);
        self.statuses_changed();
    }

    /// Apply one status byte read off `worker_id`'s control socket, then
    /// recompute backpressure. Returns the number of `pendingClose` fds
    /// the caller should now close.
    pub fn apply_status(&mut self, worker_id: u32, byte: u8) -> Result<u32, DispatchError> {
        let slot = self
            .slots
            .get_mut(&worker_id)
            .ok_or(DispatchError::WorkerGone { worker_id })?;
        slot.apply_status_byte(byte)?;
        let closed = slot.status.take_close_count();
        self.statuses_changed();
        Ok(closed)
    }

    /// The worker's process exited. Absorb its unacknowledged load into
    /// `abandoned`, mark it `stopped`, and stop routing to it; the caller
    /// may spawn a replacement and call `add_worker` again under a fresh id.
    pub fn child_exited(&mut self, worker_id: u32) {
        if let Some(slot) = self.slots.get_mut(&worker_id) {
            slot.mark_stopped();
        }
        self.statuses_changed();
    }

    /// Purge a slot entirely (the replacement, if any, gets its own id).
    pub fn remove_worker(&mut self, worker_id: u32) {
        self.slots.remove(&worker_id);
        self.insertion_order.retain(|id| *id != worker_id);
        self.statuses_changed();
    }

    /// §4.3 steps 1-5: select the least-loaded active worker, queue the fd
    /// for send, and bump its `unacknowledged` count. Step 6 is applied by
    /// `statuses_changed` below.
    pub fn send_file_descriptor(&mut self, fd: OwnedFd, tag: String) -> Option<u32> {
        let chosen = self
            .insertion_order
            .iter()
            .filter(|id| self.slots.get(id).is_some_and(|s| s.status.active()))
            .min_by_key(|id| self.slots[id].status.effective())
            .copied();

        let Some(worker_id) = chosen else {
            tracing::warn!("no active worker to dispatch fd {} (tag={tag})", fd.as_raw_fd());
            self.statuses_changed();
            return None;
        };

        let slot = self.slots.get_mut(&worker_id).expect("chosen id is in slots");
        slot.enqueue_fd(fd, tag);
        slot.status.new_connection();
        self.statuses_changed();
        Some(worker_id)
    }

    /// Drain every slot's outbox (typically called on a write-ready tick
    /// for each slot's socket).
    pub fn drain_outbox(&mut self, worker_id: u32) -> Result<(), DispatchError> {
        if let Some(slot) = self.slots.get_mut(&worker_id) {
            slot.drain_outbox()?;
        }
        Ok(())
    }

    /// Read-path sweep: drain every worker's pending status bytes and close
    /// whatever `pendingClose` entries that unblocks. Called on a poll tick
    /// rather than per-socket readiness, since a dispatcher-owned
    /// `BTreeMap` of sockets has no single combined readiness future.
    pub fn drain_all_status(&mut self) -> Result<(), DispatchError> {
        for worker_id in self.insertion_order.clone() {
            if let Some(slot) = self.slots.get_mut(&worker_id) {
                let closed = slot.drain_status()?;
                slot.close_n_pending(closed);
            }
        }
        self.statuses_changed();
        Ok(())
    }

    pub fn global_load(&self) -> u32 {
        self.slots.values().map(|s| s.status.effective()).sum()
    }

    pub fn active_worker_count(&self) -> usize {
        self.slots.values().filter(|s| s.status.active()).count()
    }

    pub fn worker_ids(&self) -> impl Iterator<Item = &u32> {
        self.insertion_order.iter()
    }

    /// D2: recompute global load and flip the accept-pause flag. Invoked
    /// after every status mutation, add, or removal.
    fn statuses_changed(&mut self) {
        let load = self.global_load();
        let active = self.active_worker_count();
        let next = if active == 0 || load >= self.max_requests {
            AcceptState::Paused
        } else {
            AcceptState::Open
        };
        self.accept_tx.send_if_modified(|cur| {
            if *cur == next {
                false
            } else {
                *cur = next;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::{FromRawFd, IntoRawFd};

    fn worker_socket() -> tokio::net::UnixDatagram {
        let (a, _b) = std::os::unix::net::UnixDatagram::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        tokio::net::UnixDatagram::from_std(a).unwrap()
    }

    fn dummy_fd() -> OwnedFd {
        let (a, _b) = std::os::unix::net::UnixDatagram::pair().unwrap();
        let raw = a.into_raw_fd();
        unsafe { OwnedFd::from_raw_fd(raw) }
    }

    #[test]
    fn no_active_workers_means_paused_and_no_dispatch() {
        let (mut d, rx) = Dispatcher::new(600);
        assert_eq!(*rx.borrow(), AcceptState::Paused);
        let chosen = d.send_file_descriptor(dummy_fd(), "TCP".into());
        assert!(chosen.is_none());
    }

    #[tokio::test]
    async fn dispatch_picks_least_loaded_active_worker() {
        let (mut d, rx) = Dispatcher::new(600);
        d.add_worker(1, worker_socket());
        d.add_worker(2, worker_socket());
        d.apply_status(1, b'0').unwrap();
        d.apply_status(2, b'0').unwrap();
        assert_eq!(*rx.borrow(), AcceptState::Open);

        // worker 1 takes on a connection, so worker 2 should win the next pick.
        let first = d.send_file_descriptor(dummy_fd(), "TCP".into()).unwrap();
        let second = d.send_file_descriptor(dummy_fd(), "TCP".into()).unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn load_at_max_requests_pauses_accept() {
        let (mut d, rx) = Dispatcher::new(1);
        d.add_worker(1, worker_socket());
        d.apply_status(1, b'0').unwrap();
        assert_eq!(*rx.borrow(), AcceptState::Open);
        d.send_file_descriptor(dummy_fd(), "TCP".into());
        assert_eq!(*rx.borrow(), AcceptState::Paused);
    }

    #[tokio::test]
    async fn child_exit_absorbs_unacknowledged_and_stops_routing() {
        let (mut d, _rx) = Dispatcher::new(600);
        d.add_worker(1, worker_socket());
        d.apply_status(1, b'0').unwrap();
        d.send_file_descriptor(dummy_fd(), "TCP".into());
        d.child_exited(1);
        assert_eq!(d.active_worker_count(), 0);
        assert!(d.send_file_descriptor(dummy_fd(), "TCP".into()).is_none());
    }
}
