//! Narrow, typed view of "a component tree with typed properties" (spec
//! §1's iCalendar-parser contract, consumed not implemented here).
//!
//! The real iCalendar parser/serializer is an external collaborator; these
//! types are the minimal shape the scheduler needs to reason about a
//! recurring event's attendees, instances, and RRULE without depending on
//! any concrete parser.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Calendar User Address — organizer/attendee identity (GLOSSARY).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CalendarUserAddress(pub String);

impl std::fmt::Display for CalendarUserAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `SCHEDULE-AGENT` parameter value (§4.8.3 step 2, §4.8.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleAgent {
    Server,
    Client,
    None,
}

/// `PARTSTAT` parameter value (GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartStat {
    NeedsAction,
    Accepted,
    Declined,
    Tentative,
    Delegated,
}

/// `STATUS` property value on a VEVENT/instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    Confirmed,
    Tentative,
    Cancelled,
}

/// One ATTENDEE line on a given instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attendee {
    pub cua: CalendarUserAddress,
    pub partstat: PartStat,
    pub rsvp: bool,
    pub schedule_agent: ScheduleAgent,
    /// Whether the directory service resolves this CUA to a group principal
    /// (§4.8.3.6: group attendees are skipped at fan-out time).
    pub is_group: bool,
    pub schedule_status: Option<String>,
}

impl Attendee {
    pub fn new(cua: impl Into<String>) -> Self {
        Self {
            cua: CalendarUserAddress(cua.into()),
            partstat: PartStat::NeedsAction,
            rsvp: true,
            schedule_agent: ScheduleAgent::Server,
            is_group: false,
            schedule_status: None,
        }
    }
}

/// RRULE, reduced to the fields relevant to §4.8.3.4's "pure COUNT/UNTIL
/// extension" test (S3) and §4.8.3's recurrence-reschedule classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rrule {
    pub freq: String,
    pub count: Option<u32>,
    pub until: Option<DateTime<Utc>>,
    /// Every other RRULE field (INTERVAL, BYDAY, ...), compared verbatim.
    pub other_fields: BTreeMap<String, String>,
}

impl Rrule {
    /// True iff `other` differs from `self` only in COUNT/UNTIL — the one
    /// kind of RRULE edit that does not force a full reschedule (S3).
    pub fn is_pure_extension_of(&self, other: &Rrule) -> bool {
        self.freq == other.freq && self.other_fields == other.other_fields
    }
}

/// One occurrence of a recurring series: the master (no RECURRENCE-ID) or an
/// overridden instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub recurrence_id: Option<DateTime<Utc>>,
    pub dtstart: DateTime<Utc>,
    pub duration_secs: i64,
    pub status: Option<EventStatus>,
    pub attendees: Vec<Attendee>,
    pub summary: String,
}

impl Instance {
    pub fn is_master(&self) -> bool {
        self.recurrence_id.is_none()
    }

    pub fn attendee(&self, cua: &CalendarUserAddress) -> Option<&Attendee> {
        self.attendees.iter().find(|a| &a.cua == cua)
    }
}

/// A full calendar object: one VEVENT master plus any overridden instances,
/// sufa RRULE if recurring. This is what the scheduler inspects or mutates
/// (§3.3, §4.8).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarComponent {
    pub uid: String,
    pub organizer: Option<CalendarUserAddress>,
    pub organizer_schedule_agent: ScheduleAgent,
    /// `SCHEDULE-STATUS` on the ORGANIZER property itself (§4.8.5's `5.3`
    /// when the server drops out a missing attendee's authority); distinct
    /// from [`Attendee::schedule_status`], which rides the per-ATTENDEE line.
    pub organizer_schedule_status: Option<String>,
    pub sequence: u32,
    pub rrule: Option<Rrule>,
    pub exdates: BTreeSet<DateTime<Utc>>,
    pub master: Instance,
    pub overrides: Vec<Instance>,
}

impl CalendarComponent {
    /// True iff this component carries a hosted ORGANIZER (§3.3
    /// `isScheduleObject`, §4.8.1's existingType/newType classification).
    pub fn is_schedule_object(&self) -> bool {
        self.organizer.is_some()
    }

    /// All instances, master first.
    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        std::iter::once(&self.master).chain(self.overrides.iter())
    }

    /// Recurrence-id set of all overridden (non-master) instances (§4.8.3.5's
    /// `Iold`/`Inew`).
    pub fn override_rids(&self) -> BTreeSet<DateTime<Utc>> {
        self.overrides
            .iter()
            .filter_map(|i| i.recurrence_id)
            .collect()
    }

    /// `(attendee, recurrence_id)` pairs across every instance — §4.8.3.5's
    /// `Mold`/`Mnew`. `recurrence_id = None` denotes the master.
    pub fn attendees_by_instance(&self) -> BTreeSet<(CalendarUserAddress, Option<DateTime<Utc>>)> {
        self.instances()
            .flat_map(|inst| {
                inst.attendees
                    .iter()
                    .map(move |a| (a.cua.clone(), inst.recurrence_id))
            })
            .collect()
    }

    pub fn instance_at(&self, rid: Option<DateTime<Utc>>) -> Option<&Instance> {
        self.instances().find(|i| i.recurrence_id == rid)
    }

    pub fn instance_at_mut(&mut self, rid: Option<DateTime<Utc>>) -> Option<&mut Instance> {
        if rid.is_none() {
            return Some(&mut self.master);
        }
        self.overrides.iter_mut().find(|i| i.recurrence_id == rid)
    }
}

/// One of the iTIP METHODs (GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItipMethod {
    Request,
    Reply,
    Cancel,
    Add,
    Counter,
    DeclineCounter,
    Refresh,
    Publish,
}

/// The minimal shape of a generated iTIP message (§4.7, §6.3): the external
/// iTIP generator produces the wire bytes; the scheduler only needs to know
/// the method, the affected recurrence-ids, and who it targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItipMessage {
    pub method: ItipMethod,
    pub uid: String,
    pub sequence: u32,
    pub recurrence_ids: Vec<DateTime<Utc>>,
    pub recipient: CalendarUserAddress,
    /// Opaque rendered text; the real serializer fills this in. Kept here
    /// only so work items have a payload to persist and replay.
    pub body: String,
}
