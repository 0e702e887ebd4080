//! Implicit iTIP scheduler (§4.8, C8) — the heart of the crate.
//!
//! Every branch that rejects a write returns a typed [`SchedulingError`]
//! variant rather than a bare `anyhow::Error`, mirroring `SemOsError`'s
//! one-variant-per-precondition shape with an `http_status()` mapping.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use caldav_sched_types::{
    Attendee, CalendarComponent, CalendarUserAddress, Instance, ItipMethod, OrganizerSendWork,
    OrganizerWork, PartStat, ReplyCancelWork, ReplyWork, ScheduleAction, ScheduleAgent,
    SchedulingError, ServerConfig,
};

use crate::itip::ItipGenerator;
use crate::store::{RecordStore, SchedResult, UidLockStore, WorkQueueStore};

/// Whether a stored copy carries a hosted ORGANIZER (§4.8.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Calendar,
    Schedule,
}

/// Whose home is making the change, relative to the ORGANIZER (§4.8.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingState {
    Organizer,
    Attendee,
    AttendeeMissing,
    /// The home writing this object is merely a sharee of the calendar it
    /// lives in — not the organizer, not an invited attendee. §4.8.2
    /// forbids implicit scheduling from ever being triggered by a sharee.
    Sharee,
    None,
}

/// Result of classifying one mutation (§4.8.1's transition matrix).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub existing_type: ObjectType,
    pub new_type: ObjectType,
    pub action: Option<ScheduleAction>,
    pub state: SchedulingState,
}

/// `testImplicitSchedulingPUT`'s return value (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulingTest {
    pub needs_implicit_action: bool,
    pub is_schedule_object: bool,
    pub classification: Classification,
}

/// Outcome of `doImplicitScheduling` (§4.8).
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulingOutcome {
    Applied(CalendarComponent),
    ResourceDeleted,
    OrphanedCancelledEvent,
    OrphanedEvent,
}

fn classify_object(component: Option<&CalendarComponent>) -> ObjectType {
    match component {
        Some(c) if c.is_schedule_object() => ObjectType::Schedule,
        _ => ObjectType::Calendar,
    }
}

fn classify_action(existing: ObjectType, new: ObjectType) -> Option<ScheduleAction> {
    use ObjectType::*;
    match (existing, new) {
        (Calendar, Calendar) => None,
        (Calendar, Schedule) => Some(ScheduleAction::Create),
        (Schedule, Calendar) => Some(ScheduleAction::Remove),
        (Schedule, Schedule) => Some(ScheduleAction::Modify),
    }
}

/// §4.8.2's sharee gate is checked first: whether `home_cuas` is a sharee
/// (not the organizer, not an invitee) of the calendar the write landed in
/// is a directory/collection-ownership fact outside this crate's model
/// (§1's non-goals), so the caller supplies it as `is_sharee`.
fn classify_state(
    organizer: Option<&CalendarUserAddress>,
    attendees: &BTreeSet<CalendarUserAddress>,
    home_cuas: &[CalendarUserAddress],
    is_sharee: bool,
) -> SchedulingState {
    if is_sharee {
        return SchedulingState::Sharee;
    }
    let Some(organizer) = organizer else {
        return SchedulingState::None;
    };
    if home_cuas.contains(organizer) {
        SchedulingState::Organizer
    } else if attendees.iter().any(|a| home_cuas.contains(a)) {
        SchedulingState::Attendee
    } else {
        SchedulingState::AttendeeMissing
    }
}

/// `(attendee, recurrenceID)` pairs across every instance of `component`,
/// excluding the organizer.
fn non_organizer_attendee_instances(
    component: &CalendarComponent,
) -> BTreeSet<(CalendarUserAddress, Option<DateTime<Utc>>)> {
    let organizer = component.organizer.clone();
    component
        .attendees_by_instance()
        .into_iter()
        .filter(|(a, _)| Some(a) != organizer.as_ref())
        .collect()
}

/// Cancel derivation (§4.8.3.5). `old`/`new` are the pre/post-change copies;
/// `added_exdates` is the set of EXDATEs present in `new` but not `old`.
pub fn derive_cancels(
    old: &CalendarComponent,
    new: &CalendarComponent,
    added_exdates: &BTreeSet<DateTime<Utc>>,
) -> BTreeSet<(CalendarUserAddress, Option<DateTime<Utc>>)> {
    let m_old = non_organizer_attendee_instances(old);
    let m_new = non_organizer_attendee_instances(new);
    let i_old = old.override_rids();
    let i_new = new.override_rids();
    let old_exdates = &old.exdates;

    let mut cancels = BTreeSet::new();

    for (attendee, rid) in m_old.difference(&m_new) {
        match rid {
            None => {
                cancels.insert((attendee.clone(), None));
            }
            Some(r) => {
                if !i_new.contains(r) && i_old.contains(r) {
                    let still_in_master = m_new.contains(&(attendee.clone(), None));
                    if !still_in_master || added_exdates.contains(r) {
                        cancels.insert((attendee.clone(), Some(*r)));
                    }
                }
            }
        }
    }

    let master_attendees_old: BTreeSet<CalendarUserAddress> = old
        .master
        .attendees
        .iter()
        .map(|a| a.cua.clone())
        .filter(|cua| Some(cua) != old.organizer.as_ref())
        .collect();

    for attendee in &master_attendees_old {
        for rid in added_exdates {
            if !(i_old.contains(rid) && !i_new.contains(rid)) {
                cancels.insert((attendee.clone(), Some(*rid)));
            }
        }
    }

    for attendee in &master_attendees_old {
        for rid in i_new.difference(&i_old) {
            if !m_new.contains(&(attendee.clone(), Some(*rid))) && !old_exdates.contains(rid) {
                cancels.insert((attendee.clone(), Some(*rid)));
            }
        }
    }

    cancels
}

/// §4.8.3.3: organizers may not set attendee PARTSTAT directly. Restore the
/// prior value (or force `NEEDS-ACTION` for a brand new attendee row) on
/// every instance of `new`, leaving the organizer's own row untouched.
pub fn coerce_attendee_partstats(old: Option<&CalendarComponent>, new: &mut CalendarComponent) {
    let organizer = new.organizer.clone();
    for inst in std::iter::once(&mut new.master).chain(new.overrides.iter_mut()) {
        let rid = inst.recurrence_id;
        for attendee in inst.attendees.iter_mut() {
            if Some(&attendee.cua) == organizer.as_ref() {
                attendee.partstat = PartStat::Accepted;
                continue;
            }
            let prior = old.and_then(|o| {
                o.instance_at(rid)
                    .and_then(|i| i.attendee(&attendee.cua))
                    .map(|a| a.partstat)
            });
            match prior {
                Some(prior_partstat) if attendee.partstat != prior_partstat => {
                    attendee.partstat = prior_partstat;
                }
                None => attendee.partstat = PartStat::NeedsAction,
                _ => {}
            }
        }
    }
}

/// §4.8.3.4: RRULE/master-DTSTART replaced wholesale, not a pure COUNT/UNTIL
/// extension.
pub fn is_recurrence_reschedule(old: &CalendarComponent, new: &CalendarComponent) -> bool {
    if old.master.dtstart != new.master.dtstart {
        return true;
    }
    match (&old.rrule, &new.rrule) {
        (Some(old_rule), Some(new_rule)) => !new_rule.is_pure_extension_of(old_rule),
        (None, None) => false,
        _ => true,
    }
}

/// Instances whose DTSTART/duration/recurrence-id changed between `old` and
/// `new` (§4.8.3's `dateChangedRids`).
pub fn date_changed_rids(old: &CalendarComponent, new: &CalendarComponent) -> Vec<Option<DateTime<Utc>>> {
    new.instances()
        .filter_map(|new_inst| {
            let rid = new_inst.recurrence_id;
            match old.instance_at(rid) {
                Some(old_inst) => {
                    if old_inst.dtstart != new_inst.dtstart
                        || old_inst.duration_secs != new_inst.duration_secs
                    {
                        Some(rid)
                    } else {
                        None
                    }
                }
                None => Some(rid),
            }
        })
        .collect()
}

/// §4.8.3 step 5: bump `SEQUENCE` on removal or any significant change not
/// already reflected by the client.
pub fn should_bump_sequence(
    old: &CalendarComponent,
    new: &CalendarComponent,
    cancels: &BTreeSet<(CalendarUserAddress, Option<DateTime<Utc>>)>,
) -> bool {
    if !cancels.is_empty() {
        return true;
    }
    let significant_change = old.master.dtstart != new.master.dtstart
        || old.master.duration_secs != new.master.duration_secs
        || old.override_rids() != new.override_rids()
        || old.attendees_by_instance() != new.attendees_by_instance();
    significant_change && new.sequence <= old.sequence
}

pub struct ImplicitScheduler<R, L, Q, I> {
    record_store: Arc<R>,
    uid_lock: Arc<L>,
    work_queue: Arc<Q>,
    itip: Arc<I>,
    config: ServerConfig,
}

impl<R, L, Q, I> ImplicitScheduler<R, L, Q, I>
where
    R: RecordStore,
    L: UidLockStore,
    Q: WorkQueueStore,
    I: ItipGenerator,
{
    pub fn new(record_store: Arc<R>, uid_lock: Arc<L>, work_queue: Arc<Q>, itip: Arc<I>, config: ServerConfig) -> Self {
        Self {
            record_store,
            uid_lock,
            work_queue,
            itip,
            config,
        }
    }

    /// `testImplicitSchedulingPUT` (§4.8). `is_sharee` carries the "home is
    /// a sharee of this calendar" fact (§4.8.2) — resolved by the caller,
    /// since directory/collection ownership is out of scope here.
    pub fn test_implicit_scheduling_put(
        &self,
        old: Option<&CalendarComponent>,
        new: &CalendarComponent,
        home_cuas: &[CalendarUserAddress],
        is_sharee: bool,
    ) -> SchedulingTest {
        let existing_type = classify_object(old);
        let new_type = classify_object(Some(new));
        let action = classify_action(existing_type, new_type);
        let attendees: BTreeSet<CalendarUserAddress> =
            new.master.attendees.iter().map(|a| a.cua.clone()).collect();
        let state = classify_state(new.organizer.as_ref(), &attendees, home_cuas, is_sharee);

        SchedulingTest {
            needs_implicit_action: state != SchedulingState::Sharee
                && (action.is_some() || state == SchedulingState::Attendee),
            is_schedule_object: new_type == ObjectType::Schedule,
            classification: Classification {
                existing_type,
                new_type,
                action,
                state,
            },
        }
    }

    /// §4.8.2's validity gate, for the subset expressible over the
    /// in-process component model (cross-resource UID collisions are
    /// checked by the caller via [`RecordStore::find_uid_elsewhere`]).
    pub fn validate(
        &self,
        old: Option<&CalendarComponent>,
        new: &CalendarComponent,
        classification: &Classification,
        home_cuas: &[CalendarUserAddress],
    ) -> SchedResult<()> {
        if classification.state == SchedulingState::Sharee {
            return Err(SchedulingError::ShareeAllowed {
                sharee: home_cuas
                    .first()
                    .map(|c| c.0.clone())
                    .unwrap_or_else(|| "unknown".to_string()),
            });
        }

        if let Some(old) = old {
            if old.organizer.is_some() && new.organizer.is_some() && old.organizer != new.organizer {
                return match classification.state {
                    SchedulingState::Attendee => Err(SchedulingError::ValidAttendeeChange {
                        attendee: "unknown".into(),
                    }),
                    _ => Err(SchedulingError::ValidOrganizerChange),
                };
            }
        }

        if classification.action == Some(ScheduleAction::Remove) && !new.master.attendees.is_empty() {
            return Err(SchedulingError::OrganizerAllowed {
                uid: new.uid.clone(),
                reason: "organizer removed while attendees remain".into(),
            });
        }

        let attendee_count = new.master.attendees.len() as u32;
        if attendee_count > self.config.max_attendees_per_instance {
            return Err(SchedulingError::TooManyAttendees {
                count: attendee_count,
                max: self.config.max_attendees_per_instance,
            });
        }

        Ok(())
    }

    /// §4.8.3: the organizer's home just wrote a create/modify. Acquires the
    /// UID lock, coerces `SCHEDULE-AGENT`/`PARTSTAT`, stores the
    /// client-visible copy, and enqueues one `OrganizerWork` row carrying
    /// before/after snapshots. The SEQUENCE bump, cancel derivation, and
    /// attendee fan-out are deliberately *not* done here — §4.8.3 step 6 and
    /// §4.9.1 require them to happen inside `OrganizerWork`'s queued
    /// [`Self::complete_organizer_work`], so that the §5 ordering guarantee
    /// ("OrganizerWork for UID X always completes before any
    /// OrganizerSendWork for UID X starts") holds even under Q2 coalescing.
    pub async fn organizer_path(
        &self,
        home_id: Uuid,
        resource_id: Uuid,
        old: Option<CalendarComponent>,
        mut new: CalendarComponent,
        action: ScheduleAction,
    ) -> SchedResult<SchedulingOutcome> {
        self.uid_lock.acquire(&new.uid).await?;

        new.organizer_schedule_agent = ScheduleAgent::Server;

        if action == ScheduleAction::Modify {
            coerce_attendee_partstats(old.as_ref(), &mut new);
        } else {
            for attendee in new.master.attendees.iter_mut() {
                if Some(&attendee.cua) != new.organizer.as_ref() {
                    attendee.partstat = PartStat::NeedsAction;
                }
            }
        }

        let old_ical = old
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| SchedulingError::Store(e.into()))?;
        let new_ical = serde_json::to_string(&new).map_err(|e| SchedulingError::Store(e.into()))?;

        let not_before = Utc::now() + self.config.work_queues.request_delay();
        let work_id = Uuid::new_v4();
        let job_id = self
            .work_queue
            .enqueue_organizer(
                &new.uid,
                not_before,
                0,
                OrganizerWork {
                    work_id,
                    action,
                    home_id,
                    resource_id,
                    old_ical,
                    new_ical,
                    smart_merge: false,
                    attendee_count: new.master.attendees.len() as i32,
                },
            )
            .await
            .map_err(|e| SchedulingError::Store(anyhow::anyhow!(e.to_string())))?;
        tracing::debug!(%job_id, uid = %new.uid, "organizer work enqueued");

        let meta = match self.record_store.load_meta(resource_id).await {
            Ok(meta) => meta,
            Err(_) => caldav_sched_types::CalendarObjectMeta::new(
                resource_id,
                caldav_sched_types::AccessMode::Public,
                4,
            ),
        };
        self.record_store
            .store_component(resource_id, &new, &meta)
            .await?;

        Ok(SchedulingOutcome::Applied(new))
    }

    /// `OrganizerWork.doWork` (§4.9.1): recomputes cancels/reschedule
    /// detection from the before/after snapshots `organizer_path` enqueued,
    /// bumps SEQUENCE, fans out, and stores the result. Runs with
    /// `queued=true` — nothing here happened synchronously at request time.
    pub async fn complete_organizer_work(&self, payload: &OrganizerWork) -> SchedResult<()> {
        let old: Option<CalendarComponent> = payload
            .old_ical
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| SchedulingError::Store(e.into()))?;
        let mut new: CalendarComponent =
            serde_json::from_str(&payload.new_ical).map_err(|e| SchedulingError::Store(e.into()))?;

        self.uid_lock.acquire(&new.uid).await?;

        let added_exdates: BTreeSet<DateTime<Utc>> = match &old {
            Some(old) => new.exdates.difference(&old.exdates).copied().collect(),
            None => BTreeSet::new(),
        };

        let mut cancels = match &old {
            Some(old) => derive_cancels(old, &new, &added_exdates),
            None => BTreeSet::new(),
        };
        // §4.8.3's `statusCancelledOnly` case: an override carrying
        // STATUS:CANCELLED cancels that one instance for every attendee who
        // would otherwise have inherited it from the master, even if the
        // override itself re-lists no attendees.
        for inst in &new.overrides {
            if inst.status == Some(caldav_sched_types::EventStatus::Cancelled) {
                let attendees_for_instance: Vec<&Attendee> = if inst.attendees.is_empty() {
                    new.master.attendees.iter().collect()
                } else {
                    inst.attendees.iter().collect()
                };
                for attendee in attendees_for_instance {
                    if Some(&attendee.cua) != new.organizer.as_ref() {
                        cancels.insert((attendee.cua.clone(), inst.recurrence_id));
                    }
                }
            }
        }

        let recurrence_reschedule = old
            .as_ref()
            .map(|old| is_recurrence_reschedule(old, &new))
            .unwrap_or(false);

        let changed_rids: Vec<DateTime<Utc>> = old
            .as_ref()
            .map(|old| date_changed_rids(old, &new).into_iter().flatten().collect())
            .unwrap_or_default();

        if let Some(old) = &old {
            if new.sequence <= old.sequence && should_bump_sequence(old, &new, &cancels) {
                new.sequence += 1;
            }
        }

        self.fan_out(
            payload.home_id,
            payload.resource_id,
            &mut new,
            &cancels,
            &changed_rids,
            recurrence_reschedule,
        )
        .await?;

        let meta = match self.record_store.load_meta(payload.resource_id).await {
            Ok(meta) => meta,
            Err(_) => caldav_sched_types::CalendarObjectMeta::new(
                payload.resource_id,
                caldav_sched_types::AccessMode::Public,
                4,
            ),
        };
        self.record_store
            .store_component(payload.resource_id, &new, &meta)
            .await?;

        Ok(())
    }

    /// §4.8.3.6: one `OrganizerSendWork` per non-organizer, non-group
    /// attendee — a CANCEL if they're in `cancels`, a REQUEST otherwise.
    /// Also tags the just-fanned-out attendees' stored `SCHEDULE-STATUS`
    /// with `1.2` optimistically, ahead of real delivery confirmation.
    async fn fan_out(
        &self,
        home_id: Uuid,
        resource_id: Uuid,
        new: &mut CalendarComponent,
        cancels: &BTreeSet<(CalendarUserAddress, Option<DateTime<Utc>>)>,
        changed_rids: &[DateTime<Utc>],
        recurrence_reschedule: bool,
    ) -> SchedResult<()> {
        let organizer = new.organizer.clone();
        let cancelled_attendees: BTreeSet<CalendarUserAddress> =
            cancels.iter().map(|(a, _)| a.clone()).collect();

        let mut seen = BTreeSet::new();
        for attendee in new.instances().flat_map(|i| i.attendees.iter()) {
            if Some(&attendee.cua) == organizer.as_ref() || attendee.is_group {
                continue;
            }
            if !seen.insert(attendee.cua.clone()) {
                continue;
            }

            let is_cancel = cancelled_attendees.contains(&attendee.cua);
            let (method, recurrence_ids): (ItipMethod, Vec<DateTime<Utc>>) = if is_cancel {
                let rids = cancels
                    .iter()
                    .filter(|(a, _)| a == &attendee.cua)
                    .filter_map(|(_, rid)| *rid)
                    .collect();
                (ItipMethod::Cancel, rids)
            } else if recurrence_reschedule {
                (ItipMethod::Request, Vec::new())
            } else {
                (ItipMethod::Request, changed_rids.to_vec())
            };

            let message = self
                .itip
                .generate(new, method, &attendee.cua, &recurrence_ids)
                .await
                .map_err(SchedulingError::Store)?;

            let not_before = Utc::now() + self.config.work_queues.request_delay();
            self.work_queue
                .enqueue_organizer_send(
                    &new.uid,
                    not_before,
                    0,
                    OrganizerSendWork {
                        work_id: Uuid::new_v4(),
                        action: if is_cancel {
                            ScheduleAction::ModifyCancelled
                        } else {
                            ScheduleAction::Modify
                        },
                        home_id,
                        resource_id,
                        attendee_cua: attendee.cua.0.clone(),
                        itip_message: message.body,
                        suppress_refresh: false,
                    },
                )
                .await
                .map_err(|e| SchedulingError::Store(anyhow::anyhow!(e.to_string())))?;
        }

        for inst in std::iter::once(&mut new.master).chain(new.overrides.iter_mut()) {
            for attendee in inst.attendees.iter_mut() {
                if Some(&attendee.cua) == organizer.as_ref() || attendee.is_group {
                    continue;
                }
                attendee.schedule_status = Some("1.2".to_string());
            }
        }

        Ok(())
    }

    /// §4.8.4: attendee home wrote a change to its own copy.
    pub async fn attendee_path(
        &self,
        home_id: Uuid,
        resource_id: Uuid,
        organizer_copy: Option<CalendarComponent>,
        attendee_cua: &CalendarUserAddress,
        new: &CalendarComponent,
        removing: bool,
    ) -> SchedResult<SchedulingOutcome> {
        if removing {
            let already_terminal = new.instances().all(|i| {
                i.status == Some(caldav_sched_types::EventStatus::Cancelled)
                    || i.attendee(attendee_cua)
                        .map(|a| a.partstat == PartStat::Declined)
                        .unwrap_or(true)
            });
            if already_terminal {
                return Ok(SchedulingOutcome::ResourceDeleted);
            }

            self.uid_lock.acquire(&new.uid).await?;
            self.work_queue
                .enqueue_reply_cancel(
                    &new.uid,
                    Utc::now(),
                    0,
                    ReplyCancelWork {
                        work_id: Uuid::new_v4(),
                        home_id,
                        full_ical_text: String::new(),
                        attendee_cua: attendee_cua.0.clone(),
                    },
                )
                .await
                .map_err(|e| SchedulingError::Store(anyhow::anyhow!(e.to_string())))?;
            return Ok(SchedulingOutcome::ResourceDeleted);
        }

        let Some(organizer_copy) = organizer_copy else {
            let all_cancelled = new
                .instances()
                .all(|i| i.status == Some(caldav_sched_types::EventStatus::Cancelled));
            return Ok(if all_cancelled {
                SchedulingOutcome::OrphanedCancelledEvent
            } else {
                SchedulingOutcome::OrphanedEvent
            });
        };

        if organizer_copy.organizer.is_some()
            && new.organizer.is_some()
            && organizer_copy.organizer != new.organizer
        {
            return Err(SchedulingError::ValidAttendeeChange {
                attendee: attendee_cua.0.clone(),
            });
        }

        let mut changed_rids = Vec::new();
        for inst in new.instances() {
            if let Some(old_attendee) = organizer_copy
                .instance_at(inst.recurrence_id)
                .and_then(|i| i.attendee(attendee_cua))
            {
                if let Some(new_attendee) = inst.attendee(attendee_cua) {
                    if old_attendee.partstat != new_attendee.partstat {
                        if let Some(rid) = inst.recurrence_id {
                            changed_rids.push(rid.to_rfc3339());
                        } else {
                            changed_rids.push("master".to_string());
                        }
                    }
                }
            }
        }

        self.uid_lock.acquire(&new.uid).await?;
        self.work_queue
            .enqueue_reply(
                &new.uid,
                Utc::now() + self.config.work_queues.reply_delay(),
                0,
                ReplyWork {
                    work_id: Uuid::new_v4(),
                    home_id,
                    resource_id,
                    attendee_cua: attendee_cua.0.clone(),
                    changed_recurrence_ids: changed_rids,
                },
            )
            .await
            .map_err(|e| SchedulingError::Store(anyhow::anyhow!(e.to_string())))?;

        Ok(SchedulingOutcome::Applied(new.clone()))
    }

    /// §4.8.5: this home was removed from the attendee list out from under
    /// it, or never had authority in the first place.
    pub fn missing_attendee_path(
        &self,
        old_had_our_cua: bool,
        our_cua: &CalendarUserAddress,
        new: &mut CalendarComponent,
    ) -> SchedResult<()> {
        if old_had_our_cua {
            let still_present = new
                .instances()
                .any(|i| i.attendee(our_cua).is_some());
            if !still_present {
                return Err(SchedulingError::ValidAttendeeChange {
                    attendee: our_cua.0.clone(),
                });
            }
        }
        new.organizer_schedule_agent = ScheduleAgent::None;
        new.organizer_schedule_status = Some("5.3".to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests_support::{InMemoryRecordStore, InMemoryUidLock, InMemoryWorkQueue};
    use caldav_sched_types::Rrule;
    use std::collections::BTreeMap;

    struct FakeItipGenerator;

    #[async_trait::async_trait]
    impl ItipGenerator for FakeItipGenerator {
        async fn generate(
            &self,
            component: &CalendarComponent,
            method: ItipMethod,
            recipient: &CalendarUserAddress,
            _recurrence_ids: &[DateTime<Utc>],
        ) -> anyhow::Result<caldav_sched_types::ItipMessage> {
            Ok(caldav_sched_types::ItipMessage {
                method,
                uid: component.uid.clone(),
                sequence: component.sequence,
                recurrence_ids: Vec::new(),
                recipient: recipient.clone(),
                body: format!("{:?} to {}", method, recipient.0),
            })
        }
    }

    fn test_scheduler() -> ImplicitScheduler<InMemoryRecordStore, InMemoryUidLock, InMemoryWorkQueue, FakeItipGenerator> {
        ImplicitScheduler::new(
            Arc::new(InMemoryRecordStore::default()),
            Arc::new(InMemoryUidLock::default()),
            Arc::new(InMemoryWorkQueue::default()),
            Arc::new(FakeItipGenerator),
            ServerConfig::default(),
        )
    }

    fn cua(s: &str) -> CalendarUserAddress {
        CalendarUserAddress(s.to_string())
    }

    fn instance(rid: Option<DateTime<Utc>>, attendees: Vec<Attendee>) -> Instance {
        Instance {
            recurrence_id: rid,
            dtstart: Utc::now(),
            duration_secs: 3600,
            status: None,
            attendees,
            summary: "meeting".into(),
        }
    }

    fn component(uid: &str, organizer: &str, attendees: Vec<&str>) -> CalendarComponent {
        CalendarComponent {
            uid: uid.to_string(),
            organizer: Some(cua(organizer)),
            organizer_schedule_agent: ScheduleAgent::Server,
            organizer_schedule_status: None,
            sequence: 0,
            rrule: None,
            exdates: BTreeSet::new(),
            master: instance(None, attendees.into_iter().map(Attendee::new).collect()),
            overrides: Vec::new(),
        }
    }

    #[test]
    fn classify_create_from_calendar_to_schedule() {
        let new = component("m1", "user01@example.com", vec!["user02@example.com"]);
        assert_eq!(classify_action(ObjectType::Calendar, classify_object(Some(&new))), Some(ScheduleAction::Create));
    }

    #[test]
    fn classify_state_detects_organizer_home() {
        let new = component("m1", "user01@example.com", vec!["user02@example.com"]);
        let attendees: BTreeSet<_> = new.master.attendees.iter().map(|a| a.cua.clone()).collect();
        let state = classify_state(new.organizer.as_ref(), &attendees, &[cua("user01@example.com")], false);
        assert_eq!(state, SchedulingState::Organizer);
    }

    #[test]
    fn classify_state_detects_attendee_missing() {
        let new = component("m1", "user01@example.com", vec!["user02@example.com"]);
        let attendees: BTreeSet<_> = new.master.attendees.iter().map(|a| a.cua.clone()).collect();
        let state = classify_state(new.organizer.as_ref(), &attendees, &[cua("user99@example.com")], false);
        assert_eq!(state, SchedulingState::AttendeeMissing);
    }

    #[test]
    fn classify_state_sharee_is_gated_before_anything_else() {
        let new = component("m1", "user01@example.com", vec!["user02@example.com"]);
        let attendees: BTreeSet<_> = new.master.attendees.iter().map(|a| a.cua.clone()).collect();
        let state = classify_state(new.organizer.as_ref(), &attendees, &[cua("user01@example.com")], true);
        assert_eq!(state, SchedulingState::Sharee);
    }

    #[test]
    fn derive_cancels_flags_attendee_removed_from_master() {
        let old = component("m1", "user01@example.com", vec!["user02@example.com", "user03@example.com"]);
        let new = component("m1", "user01@example.com", vec!["user02@example.com"]);
        let cancels = derive_cancels(&old, &new, &BTreeSet::new());
        assert!(cancels.contains(&(cua("user03@example.com"), None)));
        assert!(!cancels.contains(&(cua("user02@example.com"), None)));
    }

    #[test]
    fn coerce_attendee_partstats_restores_prior_value() {
        let mut old = component("m1", "user01@example.com", vec!["user02@example.com"]);
        old.master.attendees[0].partstat = PartStat::Accepted;
        let mut new = component("m1", "user01@example.com", vec!["user02@example.com"]);
        new.master.attendees[0].partstat = PartStat::Declined;
        coerce_attendee_partstats(Some(&old), &mut new);
        assert_eq!(new.master.attendees[0].partstat, PartStat::Accepted);
    }

    #[test]
    fn coerce_attendee_partstats_leaves_organizer_accepted() {
        let mut new = component("m1", "user01@example.com", vec!["user01@example.com"]);
        new.master.attendees[0].partstat = PartStat::NeedsAction;
        coerce_attendee_partstats(None, &mut new);
        assert_eq!(new.master.attendees[0].partstat, PartStat::Accepted);
    }

    #[test]
    fn pure_count_extension_is_not_a_recurrence_reschedule() {
        let mut old = component("m1", "user01@example.com", vec!["user02@example.com"]);
        old.rrule = Some(Rrule {
            freq: "WEEKLY".into(),
            count: Some(5),
            until: None,
            other_fields: BTreeMap::new(),
        });
        let mut new = old.clone();
        new.rrule = Some(Rrule {
            freq: "WEEKLY".into(),
            count: Some(10),
            until: None,
            other_fields: BTreeMap::new(),
        });
        assert!(!is_recurrence_reschedule(&old, &new));
    }

    #[test]
    fn changing_byday_is_a_recurrence_reschedule() {
        let mut old = component("m1", "user01@example.com", vec!["user02@example.com"]);
        let mut old_fields = BTreeMap::new();
        old_fields.insert("BYDAY".to_string(), "MO".to_string());
        old.rrule = Some(Rrule {
            freq: "WEEKLY".into(),
            count: None,
            until: None,
            other_fields: old_fields,
        });
        let mut new = old.clone();
        let mut new_fields = BTreeMap::new();
        new_fields.insert("BYDAY".to_string(), "TU".to_string());
        new.rrule = Some(Rrule {
            freq: "WEEKLY".into(),
            count: None,
            until: None,
            other_fields: new_fields,
        });
        assert!(is_recurrence_reschedule(&old, &new));
    }

    #[test]
    fn should_bump_sequence_on_cancellation() {
        let old = component("m1", "user01@example.com", vec!["user02@example.com"]);
        let new = component("m1", "user01@example.com", vec![]);
        let mut cancels = BTreeSet::new();
        cancels.insert((cua("user02@example.com"), None));
        assert!(should_bump_sequence(&old, &new, &cancels));
    }

    #[test]
    fn should_not_bump_sequence_when_client_already_did() {
        let old = component("m1", "user01@example.com", vec!["user02@example.com"]);
        let mut new = old.clone();
        new.master.summary = "renamed".into();
        new.sequence = 5;
        assert!(!should_bump_sequence(&old, &new, &BTreeSet::new()));
    }

    // E1: organizer creates a meeting with two attendees — both get a
    // REQUEST and no CANCEL is produced.
    #[tokio::test]
    async fn organizer_create_fans_out_one_request_per_attendee() {
        let scheduler = test_scheduler();
        let new = component(
            "m1",
            "mailto:user01@example.com",
            vec!["mailto:user01@example.com", "mailto:user02@example.com", "mailto:user03@example.com"],
        );
        let resource_id = Uuid::new_v4();
        let outcome = scheduler
            .organizer_path(Uuid::new_v4(), resource_id, None, new, ScheduleAction::Create)
            .await
            .unwrap();
        assert!(matches!(outcome, SchedulingOutcome::Applied(_)));

        let payload = scheduler
            .work_queue
            .organizer_payloads
            .lock()
            .unwrap()
            .values()
            .next()
            .cloned()
            .expect("organizer work enqueued");
        scheduler.complete_organizer_work(&payload).await.unwrap();

        let sends = scheduler.work_queue.organizer_send_jobs.lock().unwrap();
        assert_eq!(sends.len(), 2);
        assert!(sends.iter().all(|s| !s.itip_message.contains("Cancel")));
        drop(sends);

        let stored = scheduler.record_store.load_component(resource_id).await.unwrap();
        assert!(stored
            .master
            .attendees
            .iter()
            .filter(|a| Some(&a.cua) != stored.organizer.as_ref())
            .all(|a| a.schedule_status.as_deref() == Some("1.2")));
    }

    // E3: organizer cancels one instance — only that instance's attendees
    // receive a CANCEL.
    #[tokio::test]
    async fn organizer_cancelling_one_instance_sends_targeted_cancel() {
        let scheduler = test_scheduler();
        let old = component("m2", "mailto:user01@example.com", vec!["mailto:user02@example.com"]);
        let rid = Utc::now();
        let mut new = old.clone();
        new.overrides.push(Instance {
            recurrence_id: Some(rid),
            dtstart: rid,
            duration_secs: 3600,
            status: Some(caldav_sched_types::EventStatus::Cancelled),
            attendees: vec![],
            summary: "cancelled occurrence".into(),
        });

        let outcome = scheduler
            .organizer_path(Uuid::new_v4(), Uuid::new_v4(), Some(old), new, ScheduleAction::Modify)
            .await
            .unwrap();
        assert!(matches!(outcome, SchedulingOutcome::Applied(_)));

        let payload = scheduler
            .work_queue
            .organizer_payloads
            .lock()
            .unwrap()
            .values()
            .next()
            .cloned()
            .expect("organizer work enqueued");
        scheduler.complete_organizer_work(&payload).await.unwrap();

        let sends = scheduler.work_queue.organizer_send_jobs.lock().unwrap();
        assert_eq!(sends.len(), 1);
        assert!(sends[0].itip_message.contains("Cancel"));
    }

    // E4: attendee attempts to change the organizer — rejected.
    #[test]
    fn attendee_changing_organizer_is_rejected() {
        let scheduler = test_scheduler();
        let old = component("m3", "mailto:user01@example.com", vec!["mailto:user02@example.com"]);
        let mut new = old.clone();
        new.organizer = Some(cua("mailto:user02@example.com"));
        let classification = Classification {
            existing_type: ObjectType::Schedule,
            new_type: ObjectType::Schedule,
            action: Some(ScheduleAction::Modify),
            state: SchedulingState::Attendee,
        };
        let home_cuas = [cua("mailto:user02@example.com")];
        let result = scheduler.validate(Some(&old), &new, &classification, &home_cuas);
        assert!(matches!(result, Err(SchedulingError::ValidAttendeeChange { .. })));
    }

    // §4.8.2: a sharee of a shared calendar must never trigger scheduling.
    #[test]
    fn validate_rejects_sharee_before_other_checks() {
        let scheduler = test_scheduler();
        let old = component("m3", "mailto:user01@example.com", vec!["mailto:user02@example.com"]);
        let new = old.clone();
        let classification = Classification {
            existing_type: ObjectType::Schedule,
            new_type: ObjectType::Schedule,
            action: Some(ScheduleAction::Modify),
            state: SchedulingState::Sharee,
        };
        let home_cuas = [cua("mailto:user09@example.com")];
        let result = scheduler.validate(Some(&old), &new, &classification, &home_cuas);
        assert!(matches!(result, Err(SchedulingError::ShareeAllowed { .. })));
    }

    // E2: attendee replies ACCEPTED — a ReplyWork is enqueued carrying the
    // changed recurrence id, and the write itself is applied.
    #[tokio::test]
    async fn attendee_accept_enqueues_reply_with_changed_recurrence() {
        let scheduler = test_scheduler();
        let organizer_copy = component("m4", "mailto:user01@example.com", vec!["mailto:user02@example.com"]);
        let mut attendee_copy = organizer_copy.clone();
        attendee_copy.master.attendees[0].partstat = PartStat::Accepted;

        let outcome = scheduler
            .attendee_path(
                Uuid::new_v4(),
                Uuid::new_v4(),
                Some(organizer_copy),
                &cua("mailto:user02@example.com"),
                &attendee_copy,
                false,
            )
            .await
            .unwrap();
        assert!(matches!(outcome, SchedulingOutcome::Applied(_)));

        let replies = scheduler.work_queue.reply_jobs.lock().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].attendee_cua, "mailto:user02@example.com");
        assert_eq!(replies[0].changed_recurrence_ids, vec!["master".to_string()]);
    }

    // Q2: rapid successive OrganizerWork enqueues for the same UID coalesce
    // into the one already-pending job row.
    #[tokio::test]
    async fn rapid_organizer_enqueues_for_same_uid_coalesce() {
        let queue = InMemoryWorkQueue::default();
        let payload = || OrganizerWork {
            work_id: Uuid::new_v4(),
            action: ScheduleAction::Modify,
            home_id: Uuid::new_v4(),
            resource_id: Uuid::new_v4(),
            old_ical: None,
            new_ical: String::new(),
            smart_merge: false,
            attendee_count: 1,
        };

        let first = queue.enqueue_organizer("m5", Utc::now(), 0, payload()).await.unwrap();
        let second = queue.enqueue_organizer("m5", Utc::now(), 0, payload()).await.unwrap();
        let third = queue.enqueue_organizer("m5", Utc::now(), 0, payload()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(second, third);
        assert_eq!(queue.organizer_jobs.lock().unwrap().len(), 1);
    }
}
