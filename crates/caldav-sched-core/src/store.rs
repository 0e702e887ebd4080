//! Storage port traits. Core scheduling logic depends only on these —
//! never on `sqlx` or a connection pool directly. The `caldav-sched-postgres`
//! crate provides the concrete implementation, the way `sem_os_core::ports`
//! traits are backed by `sem_os_postgres`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use caldav_sched_types::{
    AutoReplyWork, CalendarComponent, CalendarObjectMeta, JobRow, OrganizerSendWork, OrganizerWork,
    PendingRefreshAttendee, RefreshWork, ReplyCancelWork, ReplyWork, SchedulingError, WorkItemError,
    WorkKind,
};

pub type SchedResult<T> = std::result::Result<T, SchedulingError>;
pub type WorkResult<T> = std::result::Result<T, WorkItemError>;

/// Read/write access to stored calendar objects and their meta-state
/// (§4.5, §3.3). Grounded on `sem_os_core::ports::{SnapshotStore,
/// ObjectStore}`'s "resolve by key, mutate via an explicit write call" shape.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn load_component(&self, resource_id: Uuid) -> SchedResult<CalendarComponent>;

    async fn load_meta(&self, resource_id: Uuid) -> SchedResult<CalendarObjectMeta>;

    async fn find_by_uid(&self, home_id: Uuid, uid: &str) -> SchedResult<Option<Uuid>>;

    /// Find a resource with this UID in a *different* calendar of the same
    /// home (§7 `UIDExistsElsewhere`).
    async fn find_uid_elsewhere(
        &self,
        home_id: Uuid,
        uid: &str,
        excluding_resource: Uuid,
    ) -> SchedResult<Option<(Uuid, String)>>;

    async fn store_component(
        &self,
        resource_id: Uuid,
        component: &CalendarComponent,
        meta: &CalendarObjectMeta,
    ) -> SchedResult<()>;

    async fn delete_component(&self, resource_id: Uuid) -> SchedResult<()>;

    /// Append to an attendee's scheduling inbox (§4.8 fan-out target).
    async fn deliver_to_inbox(
        &self,
        recipient_home: Uuid,
        message: &caldav_sched_types::ItipMessage,
    ) -> SchedResult<()>;
}

/// UID-scoped advisory lock (§4.6, C6). `acquire` must be called inside an
/// open transaction and is released automatically at commit/rollback —
/// there is deliberately no `release` method.
#[async_trait]
pub trait UidLockStore: Send + Sync {
    async fn acquire(&self, uid: &str) -> SchedResult<()>;
}

/// Durable scheduling work queue (§4.9, §6.4). One method pair per work
/// kind: `enqueue_*` performs the `ON CONFLICT ... DO NOTHING` idempotent
/// insert backing the Q2 coalescing invariant; `claim_*_batch` is the
/// `FOR UPDATE SKIP LOCKED` poll used by [`crate::queue_worker::ScheduleQueueWorker`].
#[async_trait]
pub trait WorkQueueStore: Send + Sync {
    async fn enqueue_organizer(
        &self,
        uid: &str,
        not_before: DateTime<Utc>,
        priority: i32,
        payload: OrganizerWork,
    ) -> WorkResult<Uuid>;

    async fn enqueue_organizer_send(
        &self,
        uid: &str,
        not_before: DateTime<Utc>,
        priority: i32,
        payload: OrganizerSendWork,
    ) -> WorkResult<Uuid>;

    async fn enqueue_reply(
        &self,
        uid: &str,
        not_before: DateTime<Utc>,
        priority: i32,
        payload: ReplyWork,
    ) -> WorkResult<Uuid>;

    async fn enqueue_reply_cancel(
        &self,
        uid: &str,
        not_before: DateTime<Utc>,
        priority: i32,
        payload: ReplyCancelWork,
    ) -> WorkResult<Uuid>;

    async fn enqueue_refresh(
        &self,
        uid: &str,
        not_before: DateTime<Utc>,
        priority: i32,
        payload: RefreshWork,
    ) -> WorkResult<Uuid>;

    async fn enqueue_auto_reply(
        &self,
        uid: &str,
        not_before: DateTime<Utc>,
        priority: i32,
        payload: AutoReplyWork,
    ) -> WorkResult<Uuid>;

    /// Add an attendee to the duplicate-allowed refresh batch (R3: a no-op
    /// if `(resource_id, attendee)` is already pending).
    async fn add_pending_refresh_attendee(
        &self,
        entry: PendingRefreshAttendee,
    ) -> WorkResult<()>;

    async fn drain_pending_refresh_attendees(
        &self,
        resource_id: Uuid,
    ) -> WorkResult<Vec<PendingRefreshAttendee>>;

    /// Claim up to `limit` ready jobs of the given kind, skipping rows
    /// locked by another claimant and rows whose `not_before` is in the
    /// future.
    async fn claim_batch(&self, kind: WorkKind, limit: i64) -> WorkResult<Vec<JobRow>>;

    async fn mark_done(&self, job_id: Uuid) -> WorkResult<()>;

    /// Record a failed attempt; pauses the job once `attempts` exceeds the
    /// retry ceiling (`WorkRetryExceeded`, §7).
    async fn record_failure(&self, job_id: Uuid, error: &str, max_attempts: i32) -> WorkResult<()>;

    /// True iff another job for this UID is currently `running` (Q1).
    async fn has_running_job_for_uid(&self, uid: &str) -> WorkResult<bool>;

    /// §4.9/Q2's `afterWork` chaining: wake the next still-pending job for
    /// this UID immediately instead of letting it wait out its own
    /// `not_before` delay.
    async fn advance_next_pending_for_uid(&self, uid: &str, not_before: DateTime<Utc>) -> WorkResult<()>;
}

/// In-memory fakes for exercising the scheduler and work items without a
/// database, the way `ob-workflow`'s `blob_store.rs` keeps a `LocalBlobStore`
/// alongside the real port trait for tests.
#[cfg(test)]
pub mod tests_support {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryWorkQueue {
        pub refresh_jobs: Mutex<Vec<RefreshWork>>,
        pub organizer_jobs: Mutex<Vec<JobRow>>,
        pub organizer_send_jobs: Mutex<Vec<OrganizerSendWork>>,
        pub reply_jobs: Mutex<Vec<ReplyWork>>,
        /// The payload behind each `organizer_jobs` row, keyed by `job_id` —
        /// lets a `WorkItemBuilder`-style caller (or a test) recover what
        /// `OrganizerWorkItem::do_work` needs to replay.
        pub organizer_payloads: Mutex<HashMap<Uuid, OrganizerWork>>,
        /// Tracks the one pending `OrganizerWork` job per UID, the same
        /// coalescing a `UNIQUE ... WHERE status = 'pending'` index enforces
        /// in Postgres (Q2).
        organizer_pending_by_uid: Mutex<HashMap<String, Uuid>>,
        pending_refresh: Mutex<HashSet<PendingRefreshAttendee>>,
        running_uids: Mutex<HashSet<String>>,
        /// Every job row enqueued so far, keyed by UID across every work
        /// kind, so `advance_next_pending_for_uid` can find the next one to
        /// wake early (§4.9/Q2's `afterWork` chaining).
        pub pending_by_uid: Mutex<HashMap<String, Vec<JobRow>>>,
    }

    impl InMemoryWorkQueue {
        fn register_pending(&self, uid: &str, job: JobRow) {
            self.pending_by_uid
                .lock()
                .unwrap()
                .entry(uid.to_string())
                .or_default()
                .push(job);
        }
    }

    #[async_trait]
    impl WorkQueueStore for InMemoryWorkQueue {
        async fn enqueue_organizer(
            &self,
            uid: &str,
            not_before: DateTime<Utc>,
            priority: i32,
            payload: OrganizerWork,
        ) -> WorkResult<Uuid> {
            let mut pending = self.organizer_pending_by_uid.lock().unwrap();
            if let Some(existing) = pending.get(uid) {
                return Ok(*existing);
            }
            let job = JobRow::new(Uuid::new_v4(), not_before, priority, 0);
            let id = job.job_id;
            pending.insert(uid.to_string(), id);
            self.organizer_payloads.lock().unwrap().insert(id, payload);
            self.register_pending(uid, job.clone());
            self.organizer_jobs.lock().unwrap().push(job);
            Ok(id)
        }

        async fn enqueue_organizer_send(
            &self,
            uid: &str,
            not_before: DateTime<Utc>,
            priority: i32,
            payload: OrganizerSendWork,
        ) -> WorkResult<Uuid> {
            let job = JobRow::new(Uuid::new_v4(), not_before, priority, 0);
            let id = job.job_id;
            self.register_pending(uid, job);
            self.organizer_send_jobs.lock().unwrap().push(payload);
            Ok(id)
        }

        async fn enqueue_reply(
            &self,
            uid: &str,
            not_before: DateTime<Utc>,
            priority: i32,
            payload: ReplyWork,
        ) -> WorkResult<Uuid> {
            let job = JobRow::new(Uuid::new_v4(), not_before, priority, 0);
            let id = job.job_id;
            self.register_pending(uid, job);
            self.reply_jobs.lock().unwrap().push(payload);
            Ok(id)
        }

        async fn enqueue_reply_cancel(
            &self,
            uid: &str,
            not_before: DateTime<Utc>,
            priority: i32,
            _payload: ReplyCancelWork,
        ) -> WorkResult<Uuid> {
            let job = JobRow::new(Uuid::new_v4(), not_before, priority, 0);
            let id = job.job_id;
            self.register_pending(uid, job);
            Ok(id)
        }

        async fn enqueue_refresh(
            &self,
            uid: &str,
            not_before: DateTime<Utc>,
            priority: i32,
            payload: RefreshWork,
        ) -> WorkResult<Uuid> {
            let job = JobRow::new(Uuid::new_v4(), not_before, priority, 0);
            let id = job.job_id;
            self.register_pending(uid, job);
            self.refresh_jobs.lock().unwrap().push(payload);
            Ok(id)
        }

        async fn enqueue_auto_reply(
            &self,
            uid: &str,
            not_before: DateTime<Utc>,
            priority: i32,
            _payload: AutoReplyWork,
        ) -> WorkResult<Uuid> {
            let job = JobRow::new(Uuid::new_v4(), not_before, priority, 0);
            let id = job.job_id;
            self.register_pending(uid, job);
            Ok(id)
        }

        async fn add_pending_refresh_attendee(&self, entry: PendingRefreshAttendee) -> WorkResult<()> {
            self.pending_refresh.lock().unwrap().insert(entry);
            Ok(())
        }

        async fn drain_pending_refresh_attendees(
            &self,
            resource_id: Uuid,
        ) -> WorkResult<Vec<PendingRefreshAttendee>> {
            let mut guard = self.pending_refresh.lock().unwrap();
            let (matching, rest): (HashSet<_>, HashSet<_>) =
                guard.drain().partition(|e| e.resource_id == resource_id);
            *guard = rest;
            Ok(matching.into_iter().collect())
        }

        async fn claim_batch(&self, _kind: WorkKind, limit: i64) -> WorkResult<Vec<JobRow>> {
            let jobs = self.organizer_jobs.lock().unwrap();
            Ok(jobs.iter().take(limit as usize).cloned().collect())
        }

        async fn mark_done(&self, job_id: Uuid) -> WorkResult<()> {
            self.organizer_jobs.lock().unwrap().retain(|j| j.job_id != job_id);
            self.organizer_pending_by_uid
                .lock()
                .unwrap()
                .retain(|_, v| *v != job_id);
            self.organizer_payloads.lock().unwrap().remove(&job_id);
            self.pending_by_uid
                .lock()
                .unwrap()
                .values_mut()
                .for_each(|jobs| jobs.retain(|j| j.job_id != job_id));
            Ok(())
        }

        async fn record_failure(&self, _job_id: Uuid, _error: &str, _max_attempts: i32) -> WorkResult<()> {
            Ok(())
        }

        async fn has_running_job_for_uid(&self, uid: &str) -> WorkResult<bool> {
            Ok(self.running_uids.lock().unwrap().contains(uid))
        }

        async fn advance_next_pending_for_uid(&self, uid: &str, not_before: DateTime<Utc>) -> WorkResult<()> {
            if let Some(jobs) = self.pending_by_uid.lock().unwrap().get_mut(uid) {
                if let Some(next) = jobs.iter_mut().min_by_key(|j| j.not_before) {
                    next.not_before = not_before;
                }
            }
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct InMemoryUidLock {
        pub acquired: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl UidLockStore for InMemoryUidLock {
        async fn acquire(&self, uid: &str) -> SchedResult<()> {
            self.acquired.lock().unwrap().push(uid.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct InMemoryRecordStore {
        pub components: Mutex<HashMap<Uuid, caldav_sched_types::CalendarComponent>>,
        pub inboxes: Mutex<Vec<(Uuid, caldav_sched_types::ItipMessage)>>,
    }

    #[async_trait]
    impl RecordStore for InMemoryRecordStore {
        async fn load_component(&self, resource_id: Uuid) -> SchedResult<caldav_sched_types::CalendarComponent> {
            self.components
                .lock()
                .unwrap()
                .get(&resource_id)
                .cloned()
                .ok_or_else(|| SchedulingError::Store(anyhow::anyhow!("no such resource")))
        }

        async fn load_meta(&self, resource_id: Uuid) -> SchedResult<CalendarObjectMeta> {
            Ok(CalendarObjectMeta::new(
                resource_id,
                caldav_sched_types::AccessMode::Public,
                4,
            ))
        }

        async fn find_by_uid(&self, _home_id: Uuid, uid: &str) -> SchedResult<Option<Uuid>> {
            Ok(self
                .components
                .lock()
                .unwrap()
                .iter()
                .find(|(_, c)| c.uid == uid)
                .map(|(id, _)| *id))
        }

        async fn find_uid_elsewhere(
            &self,
            _home_id: Uuid,
            _uid: &str,
            _excluding_resource: Uuid,
        ) -> SchedResult<Option<(Uuid, String)>> {
            Ok(None)
        }

        async fn store_component(
            &self,
            resource_id: Uuid,
            component: &caldav_sched_types::CalendarComponent,
            _meta: &CalendarObjectMeta,
        ) -> SchedResult<()> {
            self.components
                .lock()
                .unwrap()
                .insert(resource_id, component.clone());
            Ok(())
        }

        async fn delete_component(&self, resource_id: Uuid) -> SchedResult<()> {
            self.components.lock().unwrap().remove(&resource_id);
            Ok(())
        }

        async fn deliver_to_inbox(
            &self,
            recipient_home: Uuid,
            message: &caldav_sched_types::ItipMessage,
        ) -> SchedResult<()> {
            self.inboxes.lock().unwrap().push((recipient_home, message.clone()));
            Ok(())
        }
    }
}
