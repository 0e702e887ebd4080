//! Error taxonomy for implicit scheduling and the dispatcher (spec §7).
//!
//! Shaped after `sem_os_core::error::SemOsError`: one `thiserror` enum per
//! concern, each carrying an `http_status`/`precondition_tag` mapping so the
//! web layer doesn't need a parallel `match`.

use thiserror::Error;

/// Errors the implicit scheduler can raise while validating or applying a
/// write (§7's table, rows `SingleOrganizer` through `InvalidDefaultCalendar`,
/// plus `ResourceDeleted`).
#[derive(Debug, Error)]
pub enum SchedulingError {
    #[error("two different ORGANIZERs found across components of UID {uid}")]
    SingleOrganizer { uid: String },

    #[error("organizer change not allowed for UID {uid}: {reason}")]
    OrganizerAllowed { uid: String, reason: String },

    #[error("attendee {attendee} modified a property it is not permitted to change")]
    ValidAttendeeChange { attendee: String },

    #[error("ORGANIZER value changed on an existing scheduling object")]
    ValidOrganizerChange,

    #[error("UID {uid} already exists in this calendar")]
    UidExists { uid: String },

    #[error("UID {uid} already exists elsewhere in this home ({location})")]
    UidExistsElsewhere { uid: String, location: String },

    #[error("attendee {attendee} attempted to create an organizer event")]
    AttendeeAllowed { attendee: String },

    #[error("sharee {sharee} attempted to schedule")]
    ShareeAllowed { sharee: String },

    #[error("attendee count {count} exceeds the configured cap {max}")]
    TooManyAttendees { count: u32, max: u32 },

    #[error("invalid target for a default calendar setting: {reason}")]
    InvalidDefaultCalendar { reason: String },

    /// Not a failure: implicit scheduling determined the incoming resource
    /// must be deleted (it became an orphaned copy, or was fully cancelled).
    /// The caller reports success-with-deletion, not an error page.
    #[error("resource deleted as a side effect of implicit scheduling")]
    ResourceDeleted,

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl SchedulingError {
    /// The `DAV:valid-calendar-data`-style precondition tag reported to the
    /// client (§7).
    pub fn precondition_tag(&self) -> Option<&'static str> {
        match self {
            Self::SingleOrganizer { .. } => Some("single-organizer"),
            Self::OrganizerAllowed { .. } => Some("organizer-allowed"),
            Self::ValidAttendeeChange { .. } => Some("valid-attendee-change"),
            Self::ValidOrganizerChange => Some("valid-organizer-change"),
            Self::UidExists { .. } => Some("unique-scheduling-object-resource"),
            Self::UidExistsElsewhere { .. } => Some("unique-scheduling-object-resource"),
            Self::AttendeeAllowed { .. } => Some("attendee-allowed"),
            Self::ShareeAllowed { .. } => Some("sharee-allowed"),
            Self::TooManyAttendees { .. } => Some("max-attendees-per-instance"),
            Self::InvalidDefaultCalendar { .. } => Some("valid-default-calendar"),
            Self::ResourceDeleted | Self::Store(_) => None,
        }
    }

    /// §7's HTTP mapping: every validation failure is a 403 precondition
    /// failure; `ResourceDeleted` is success-shaped; an opaque store error is
    /// a 500.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ResourceDeleted => 200,
            Self::Store(_) => 500,
            _ => 403,
        }
    }
}

/// Errors surfaced while executing a queued work item (§7, "errors inside a
/// work item").
#[derive(Debug, Error)]
pub enum WorkItemError {
    #[error(transparent)]
    Scheduling(#[from] SchedulingError),

    /// The underlying transaction aborted. If the job was marked
    /// `okToSplit` the queue worker should hand it to the split engine;
    /// otherwise it is retried with backoff.
    #[error("transaction timed out")]
    TxnTimeout,

    /// Retry budget exhausted; the job is paused until an operator clears
    /// it.
    #[error("work item exceeded its retry budget after {attempts} attempts")]
    RetryExceeded { attempts: i32 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors in the master/worker dispatcher (§7, "errors in the dispatcher").
/// Every variant is scoped to one worker link; the dispatcher never lets a
/// dispatch error take down other workers.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("sendmsg on worker {worker_id} would block")]
    WouldBlock { worker_id: u32 },

    #[error("kernel socket buffer exhausted sending to worker {worker_id}")]
    NoBufferSpace { worker_id: u32 },

    #[error("worker {worker_id} did not send '0' within the startup deadline")]
    StartupTimeout { worker_id: u32 },

    #[error("worker {worker_id} sent a malformed status datagram")]
    MalformedStatus { worker_id: u32 },

    /// Raised by the FD-passing transport itself, before a worker_id is
    /// known to attach to the error — the control channel wraps it with one.
    #[error("datagram carried zero or more than one file descriptor")]
    MalformedDatagram,

    #[error("worker {worker_id} link closed")]
    WorkerGone { worker_id: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
