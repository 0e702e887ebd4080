//! iTIP message generation contract (§4.7, C7).
//!
//! The scheduler decides *which* messages to send and to whom; rendering the
//! actual iCalendar text is delegated to an external collaborator behind
//! this trait, the same way `caldav_sched_types::ical` leaves parsing to one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use caldav_sched_types::{CalendarComponent, CalendarUserAddress, ItipMessage, ItipMethod};

#[async_trait]
pub trait ItipGenerator: Send + Sync {
    /// Render a REQUEST/CANCEL/REFRESH/etc. addressed to `recipient` for the
    /// given recurrence-ids of `component`.
    async fn generate(
        &self,
        component: &CalendarComponent,
        method: ItipMethod,
        recipient: &CalendarUserAddress,
        recurrence_ids: &[DateTime<Utc>],
    ) -> anyhow::Result<ItipMessage>;
}
