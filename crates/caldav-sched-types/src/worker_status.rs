//! Per-worker load accounting (spec §3.1).
//!
//! Mirrors `WorkerStatus` from the original CalendarServer's
//! `txweb2/metafd.py`: every mutation goes through `adjust` (relative, clamped
//! at zero — invariant WS1) or `reset` (absolute). `effective()` is the sort
//! key the dispatcher uses to pick the least-loaded active worker.

use serde::{Deserialize, Serialize};

/// Load and lifecycle counters for one worker slot.
///
/// All fields are non-negative (WS1); `effective() == acknowledged +
/// unacknowledged` holds at all times (WS2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub acknowledged: u32,
    pub unacknowledged: u32,
    pub total: u32,
    pub started: u32,
    pub abandoned: u32,
    pub unclosed: u32,
    pub starting: u32,
    pub stopped: u32,
}

impl Default for WorkerStatus {
    fn default() -> Self {
        Self {
            acknowledged: 0,
            unacknowledged: 0,
            total: 0,
            started: 0,
            abandoned: 0,
            unclosed: 0,
            starting: 0,
            stopped: 0,
        }
    }
}

/// Relative adjustment to apply to a subset of `WorkerStatus`'s fields.
///
/// Only the fields a given status message touches are set; the rest default
/// to zero. Passed to [`WorkerStatus::adjust`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusDelta {
    pub acknowledged: i64,
    pub unacknowledged: i64,
    pub total: i64,
    pub unclosed: i64,
}

impl WorkerStatus {
    /// The current effective load: the dispatcher's sort key.
    pub fn effective(&self) -> u32 {
        self.acknowledged + self.unacknowledged
    }

    /// Whether this worker may receive new connections.
    pub fn active(&self) -> bool {
        self.starting == 0 && self.stopped == 0
    }

    /// Apply a relative delta, clamping every touched field at zero (WS1).
    pub fn adjust(&mut self, delta: StatusDelta) -> &mut Self {
        self.acknowledged = clamp_add(self.acknowledged, delta.acknowledged);
        self.unacknowledged = clamp_add(self.unacknowledged, delta.unacknowledged);
        self.total = clamp_add(self.total, delta.total);
        self.unclosed = clamp_add(self.unclosed, delta.unclosed);
        self
    }

    /// A worker slot was just added or its process is about to (re)start:
    /// mark it `starting` so it is not selected until it reports `'0'`.
    pub fn start(&mut self) -> &mut Self {
        self.starting = 1;
        self.stopped = 0;
        self
    }

    /// The worker reported `'0'`: it is ready, with zero acknowledged load.
    ///
    /// Mirrors `metafd.py`'s `WorkerStatus.restarted`, which only bumps
    /// `started` and clears `starting` — it does **not** reset
    /// `acknowledged`/`unacknowledged`/`total` to zero (see DESIGN.md, Open
    /// Question 1). Followed verbatim here rather than guessed at.
    pub fn restarted(&mut self) -> &mut Self {
        self.started += 1;
        self.starting = 0;
        self
    }

    /// The worker process died. Absorb unacknowledged connections into
    /// `abandoned` and mark stopped/inactive.
    pub fn stop(&mut self) -> &mut Self {
        self.abandoned += self.unacknowledged;
        self.acknowledged = 0;
        self.unacknowledged = 0;
        self.starting = 0;
        self.stopped = 1;
        self
    }

    /// A connection was just dispatched to this worker but not yet
    /// acknowledged.
    pub fn new_connection(&mut self) -> &mut Self {
        self.adjust(StatusDelta {
            unacknowledged: 1,
            ..Default::default()
        })
    }

    /// Apply one status-protocol byte (§4.2, §6.1). `b'0'`/`b'+'`/`b'-'` are
    /// the only valid bytes; anything else is a fatal-protocol condition the
    /// caller (the control channel) must detect before calling this.
    pub fn apply_message(&mut self, message: u8) -> &mut Self {
        match message {
            b'0' => self.restarted(),
            b'+' => self.adjust(StatusDelta {
                acknowledged: 1,
                unacknowledged: -1,
                total: 1,
                unclosed: 1,
                ..Default::default()
            }),
            b'-' => self.adjust(StatusDelta {
                acknowledged: -1,
                ..Default::default()
            }),
            other => panic!("invalid status byte {other:#x}; caller must validate first"),
        }
    }

    /// Sockets that may now be closed in the master, resetting `unclosed`
    /// to zero.
    pub fn take_close_count(&mut self) -> u32 {
        let count = self.unclosed;
        self.unclosed = 0;
        count
    }
}

fn clamp_add(field: u32, delta: i64) -> u32 {
    (field as i64 + delta).max(0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_is_sum_of_acknowledged_and_unacknowledged() {
        let mut s = WorkerStatus::default();
        s.new_connection();
        assert_eq!(s.effective(), 1);
        s.apply_message(b'+');
        assert_eq!(s.effective(), 1);
        assert_eq!(s.acknowledged, 1);
        assert_eq!(s.unacknowledged, 0);
    }

    #[test]
    fn adjust_clamps_at_zero() {
        let mut s = WorkerStatus::default();
        s.apply_message(b'-');
        assert_eq!(s.acknowledged, 0);
    }

    #[test]
    fn active_requires_not_starting_and_not_stopped() {
        let mut s = WorkerStatus::default();
        s.start();
        assert!(!s.active());
        s.restarted();
        assert!(s.active());
        s.stop();
        assert!(!s.active());
    }

    #[test]
    fn stop_absorbs_unacknowledged_into_abandoned() {
        let mut s = WorkerStatus::default();
        s.new_connection();
        s.new_connection();
        s.stop();
        assert_eq!(s.abandoned, 2);
        assert_eq!(s.unacknowledged, 0);
        assert_eq!(s.acknowledged, 0);
    }

    #[test]
    fn restarted_does_not_reset_load_counters() {
        // Open Question 1 (DESIGN.md): restarted() leaves acknowledged/
        // unacknowledged/total untouched, matching the original source.
        let mut s = WorkerStatus::default();
        s.new_connection();
        s.apply_message(b'+');
        s.restarted();
        assert_eq!(s.acknowledged, 1);
        assert_eq!(s.started, 1);
        assert_eq!(s.starting, 0);
    }

    #[test]
    fn take_close_count_drains_and_resets_unclosed() {
        let mut s = WorkerStatus::default();
        s.apply_message(b'+');
        s.apply_message(b'+');
        assert_eq!(s.take_close_count(), 2);
        assert_eq!(s.unclosed, 0);
    }

    #[test]
    fn round_trip_serialization() {
        let mut s = WorkerStatus::default();
        s.new_connection();
        s.apply_message(b'+');
        let json = serde_json::to_string(&s).unwrap();
        let back: WorkerStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(s, back);
    }
}
