//! Foundation types for calendar scheduling: no module here depends on a
//! database, a socket, or a runtime — just the data every other crate in
//! this workspace shares.

pub mod calendar_meta;
pub mod config;
pub mod error;
pub mod ical;
pub mod work;
pub mod worker_status;

pub use calendar_meta::{AccessMode, CalendarObjectMeta, ChangeOrigin, ScheduleEtagHistory};
pub use config::{ServerConfig, SplittingConfig, WorkQueuesConfig};
pub use error::{DispatchError, SchedulingError, WorkItemError};
pub use ical::{
    Attendee, CalendarComponent, CalendarUserAddress, EventStatus, Instance, ItipMessage,
    ItipMethod, PartStat, Rrule, ScheduleAgent,
};
pub use work::{
    AutoReplyWork, JobRow, OrganizerSendWork, OrganizerWork, PendingRefreshAttendee, ReplyCancelWork,
    ReplyWork, RefreshWork, ScheduleAction, ScheduleWork, WorkKind,
};
pub use worker_status::{StatusDelta, WorkerStatus};
