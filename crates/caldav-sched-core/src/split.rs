//! Event splitting (§4.8.6, C10): a recurring event that has grown too
//! large and extends too far into the past is split into a past piece
//! (new UID) and a future piece (the current UID keeps going).

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use caldav_sched_types::{CalendarComponent, SplittingConfig};

/// Result of attempting a split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitOutcome {
    Split { past_uid: String, future_uid: String },
    NotSplit,
}

#[async_trait]
pub trait SplitEngine: Send + Sync {
    async fn maybe_split(
        &self,
        component: &CalendarComponent,
        now: DateTime<Utc>,
        config: &SplittingConfig,
    ) -> anyhow::Result<SplitOutcome>;
}

/// Threshold check shared by any `SplitEngine` implementation: does this
/// component even qualify for splitting, independent of how the split
/// itself is performed?
pub fn qualifies_for_split(component: &CalendarComponent, now: DateTime<Utc>, config: &SplittingConfig) -> bool {
    if !config.enabled || component.rrule.is_none() {
        return false;
    }
    let instance_count = component.overrides.len() + 1;
    if instance_count < config.size as usize {
        return false;
    }
    let past_cutoff = now - chrono::Duration::days(config.past_days as i64);
    component.master.dtstart < past_cutoff
}

#[cfg(test)]
mod tests {
    use super::*;
    use caldav_sched_types::{Instance, ScheduleAgent};
    use std::collections::BTreeSet;

    fn old_recurring_component() -> CalendarComponent {
        CalendarComponent {
            uid: "series1".into(),
            organizer: Some(caldav_sched_types::CalendarUserAddress("mailto:user01@example.com".into())),
            organizer_schedule_agent: ScheduleAgent::Server,
            organizer_schedule_status: None,
            sequence: 0,
            rrule: Some(caldav_sched_types::Rrule {
                freq: "DAILY".into(),
                count: None,
                until: None,
                other_fields: Default::default(),
            }),
            exdates: BTreeSet::new(),
            master: Instance {
                recurrence_id: None,
                dtstart: Utc::now() - chrono::Duration::days(400),
                duration_secs: 3600,
                status: None,
                attendees: vec![],
                summary: "daily standup".into(),
            },
            overrides: Vec::new(),
        }
    }

    #[test]
    fn qualifies_when_old_enough_and_far_enough_in_the_past() {
        let config = SplittingConfig {
            enabled: true,
            size: 1,
            past_days: 14,
            delay_seconds: 5,
        };
        assert!(qualifies_for_split(&old_recurring_component(), Utc::now(), &config));
    }

    #[test]
    fn does_not_qualify_when_splitting_disabled() {
        let config = SplittingConfig {
            enabled: false,
            size: 1,
            past_days: 14,
            delay_seconds: 5,
        };
        assert!(!qualifies_for_split(&old_recurring_component(), Utc::now(), &config));
    }
}
