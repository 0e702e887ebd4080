//! Durable scheduling work items (spec §3.2, §6.4).
//!
//! `ScheduleWork` is the base row every concrete work kind extends, keyed by
//! iCalendar UID — the group key the UID lock (C6) and the queue's
//! coalescing behavior (Q2) both hinge on. Shaped after the teacher's
//! `task_queue.rs` (`TaskResultRow`/`PendingTask`: typed row structs with
//! `as_str`/`FromStr` status enums) and `bpmn_integration::types::PendingDispatch`
//! (retry/backoff bookkeeping columns).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Discriminates the five concrete work-kind tables (§3.2, §6.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    Organizer,
    OrganizerSend,
    Reply,
    ReplyCancel,
    Refresh,
    AutoReply,
}

impl WorkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Organizer => "organizer",
            Self::OrganizerSend => "organizer_send",
            Self::Reply => "reply",
            Self::ReplyCancel => "reply_cancel",
            Self::Refresh => "refresh",
            Self::AutoReply => "auto_reply",
        }
    }
}

impl std::str::FromStr for WorkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "organizer" => Ok(Self::Organizer),
            "organizer_send" => Ok(Self::OrganizerSend),
            "reply" => Ok(Self::Reply),
            "reply_cancel" => Ok(Self::ReplyCancel),
            "refresh" => Ok(Self::Refresh),
            "auto_reply" => Ok(Self::AutoReply),
            other => Err(format!("unknown work kind: {other}")),
        }
    }
}

/// Base row every concrete work kind joins against by `work_id` (§3.2, §6.4
/// `SCHEDULE_WORK`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleWork {
    pub job_id: Uuid,
    pub work_id: Uuid,
    pub icalendar_uid: String,
    pub work_type: WorkKind,
}

/// The job-table row underlying every `ScheduleWork` (§3.2's "every work item
/// has a job row with notBefore timestamp, priority, and weight").
///
/// Grounded on `PendingDispatch`'s retry/backoff columns (`attempts`,
/// `last_error`, `last_attempted_at`) generalized to the full job lifecycle
/// §5 describes (pause on retry exhaustion, per-home pause for migration).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRow {
    pub job_id: Uuid,
    pub not_before: DateTime<Utc>,
    pub priority: i32,
    pub weight: i32,
    pub attempts: i32,
    pub last_error: Option<String>,
    /// Set true when `attempts` exceeds the configured retry ceiling
    /// (`WorkRetryExceeded`, §7) — an operator must clear this manually.
    pub paused: bool,
}

impl JobRow {
    pub fn new(job_id: Uuid, not_before: DateTime<Utc>, priority: i32, weight: i32) -> Self {
        Self {
            job_id,
            not_before,
            priority,
            weight,
            attempts: 0,
            last_error: None,
            paused: false,
        }
    }

    /// Execution order key (§3.2, §5): `(notBefore ascending, priority
    /// descending)`.
    pub fn order_key(&self) -> (DateTime<Utc>, std::cmp::Reverse<i32>) {
        (self.not_before, std::cmp::Reverse(self.priority))
    }
}

/// Action classification shared by organizer-originated work (§3.2, §4.8.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScheduleAction {
    Create,
    Modify,
    ModifyCancelled,
    Remove,
}

/// `OrganizerWork` payload (§3.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizerWork {
    pub work_id: Uuid,
    pub action: ScheduleAction,
    pub home_id: Uuid,
    pub resource_id: Uuid,
    pub old_ical: Option<String>,
    pub new_ical: String,
    pub smart_merge: bool,
    pub attendee_count: i32,
}

/// `OrganizerSendWork` payload (§3.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizerSendWork {
    pub work_id: Uuid,
    pub action: ScheduleAction,
    pub home_id: Uuid,
    pub resource_id: Uuid,
    pub attendee_cua: String,
    pub itip_message: String,
    pub suppress_refresh: bool,
}

/// `ReplyWork` payload (§3.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyWork {
    pub work_id: Uuid,
    pub home_id: Uuid,
    pub resource_id: Uuid,
    pub attendee_cua: String,
    pub changed_recurrence_ids: Vec<String>,
}

/// `ReplyCancelWork` payload (§3.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyCancelWork {
    pub work_id: Uuid,
    pub home_id: Uuid,
    pub full_ical_text: String,
    pub attendee_cua: String,
}

/// `RefreshWork` payload (§3.2, §4.9.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshWork {
    pub work_id: Uuid,
    pub home_id: Uuid,
    pub resource_id: Uuid,
    pub attendee_count: i32,
}

/// `AutoReplyWork` payload (§3.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoReplyWork {
    pub work_id: Uuid,
    pub home_id: Uuid,
    pub resource_id: Uuid,
    pub partstat: String,
}

/// Row of the `SCHEDULE_REFRESH_ATTENDEES` duplicate-allowed table (§6.4).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PendingRefreshAttendee {
    pub resource_id: Uuid,
    pub attendee_cua: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_kind_round_trips_through_str() {
        for kind in [
            WorkKind::Organizer,
            WorkKind::OrganizerSend,
            WorkKind::Reply,
            WorkKind::ReplyCancel,
            WorkKind::Refresh,
            WorkKind::AutoReply,
        ] {
            let parsed: WorkKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn job_order_key_sorts_notbefore_then_priority_desc() {
        let now = Utc::now();
        let low_priority = JobRow::new(Uuid::new_v4(), now, 1, 0);
        let high_priority = JobRow::new(Uuid::new_v4(), now, 5, 0);
        assert!(high_priority.order_key() < low_priority.order_key());
    }
}
