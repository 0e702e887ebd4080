//! Calendar object meta-state inspected or mutated by the scheduler (spec
//! §3.3). Distinct from the [`crate::ical::CalendarComponent`] content tree:
//! this is the storage-layer bookkeeping that rides alongside it.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `accessMode` (§3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccessMode {
    Public,
    Private,
    Confidential,
    Restricted,
}

/// Bounded history of prior content digests kept for weak-ETag compatibility
/// (§3.3's `scheduleEtags`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEtagHistory {
    capacity: usize,
    entries: VecDeque<String>,
}

impl ScheduleEtagHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, etag: String) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(etag);
    }

    pub fn contains(&self, etag: &str) -> bool {
        self.entries.iter().any(|e| e == etag)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-object meta-state the scheduler reads or writes (§3.3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarObjectMeta {
    pub resource_id: Uuid,
    pub access_mode: AccessMode,
    pub is_schedule_object: bool,
    /// Opaque 128-bit token, regenerated on any non-iTIP-originated change
    /// (invariant T1).
    pub schedule_tag: Uuid,
    pub schedule_etags: ScheduleEtagHistory,
    pub has_private_comment: bool,
    /// `"."` for managed-attachment objects; legacy dropbox key otherwise.
    pub dropbox_id: String,
}

/// Why a write is touching the object — drives the T1 `scheduleTag` rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A client PUT/POST not mediated by iTIP processing.
    Direct,
    /// The organizer's copy updated in response to an attendee REPLY.
    AttendeeItipUpdate,
    /// An attendee's copy updated in response to an organizer REQUEST/CANCEL.
    OrganizerItipUpdate,
}

impl CalendarObjectMeta {
    pub fn new(resource_id: Uuid, access_mode: AccessMode, etag_history_capacity: usize) -> Self {
        Self {
            resource_id,
            access_mode,
            is_schedule_object: false,
            schedule_tag: Uuid::new_v4(),
            schedule_etags: ScheduleEtagHistory::new(etag_history_capacity),
            has_private_comment: false,
            dropbox_id: ".".to_string(),
        }
    }

    /// Apply T1: regenerate `scheduleTag` only for direct, non-iTIP writes.
    pub fn record_change(&mut self, origin: ChangeOrigin, prior_digest: String) {
        self.schedule_etags.push(prior_digest);
        if origin == ChangeOrigin::Direct {
            self.schedule_tag = Uuid::new_v4();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_tag_changes_only_on_direct_writes() {
        let mut meta = CalendarObjectMeta::new(Uuid::new_v4(), AccessMode::Public, 4);
        let original = meta.schedule_tag;
        meta.record_change(ChangeOrigin::AttendeeItipUpdate, "etag-1".into());
        assert_eq!(meta.schedule_tag, original);
        meta.record_change(ChangeOrigin::OrganizerItipUpdate, "etag-2".into());
        assert_eq!(meta.schedule_tag, original);
        meta.record_change(ChangeOrigin::Direct, "etag-3".into());
        assert_ne!(meta.schedule_tag, original);
    }

    #[test]
    fn etag_history_is_bounded() {
        let mut history = ScheduleEtagHistory::new(2);
        history.push("a".into());
        history.push("b".into());
        history.push("c".into());
        assert_eq!(history.len(), 2);
        assert!(!history.contains("a"));
        assert!(history.contains("c"));
    }
}
