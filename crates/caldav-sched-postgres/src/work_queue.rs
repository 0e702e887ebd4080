//! Postgres-backed durable work queue (§4.9, §6.4, C9's storage half).
//!
//! One `schedule_jobs` table carries every work kind, discriminated by
//! `work_type`; the concrete payload rides along as `JSONB`, the same shape
//! `pending_dispatches.rs` uses for `domain_payload`. `claim_batch` is
//! `FOR UPDATE SKIP LOCKED` + an idle-to-running status flip, matching
//! `PendingDispatchStore::claim_pending`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use caldav_sched_core::store::{WorkQueueStore, WorkResult};
use caldav_sched_types::{
    AutoReplyWork, JobRow, OrganizerSendWork, OrganizerWork, PendingRefreshAttendee, RefreshWork,
    ReplyCancelWork, ReplyWork, WorkItemError, WorkKind,
};

pub struct PgWorkQueue {
    pool: PgPool,
}

impl PgWorkQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn enqueue<T: serde::Serialize + Send + Sync>(
        &self,
        uid: &str,
        kind: WorkKind,
        not_before: DateTime<Utc>,
        priority: i32,
        payload: &T,
    ) -> WorkResult<Uuid> {
        let job_id = Uuid::new_v4();
        let payload_json = serde_json::to_value(payload).map_err(|e| WorkItemError::Other(e.into()))?;

        sqlx::query(
            "INSERT INTO schedule_jobs \
             (job_id, icalendar_uid, work_type, not_before, priority, weight, \
              attempts, paused, status, payload) \
             VALUES ($1, $2, $3, $4, $5, 0, 0, false, 'pending', $6) \
             ON CONFLICT (icalendar_uid, work_type) WHERE status = 'pending' DO NOTHING",
        )
        .bind(job_id)
        .bind(uid)
        .bind(kind.as_str())
        .bind(not_before)
        .bind(priority)
        .bind(payload_json)
        .execute(&self.pool)
        .await
        .map_err(|e| WorkItemError::Other(e.into()))?;

        Ok(job_id)
    }
}

#[async_trait]
impl WorkQueueStore for PgWorkQueue {
    async fn enqueue_organizer(
        &self,
        uid: &str,
        not_before: DateTime<Utc>,
        priority: i32,
        payload: OrganizerWork,
    ) -> WorkResult<Uuid> {
        self.enqueue(uid, WorkKind::Organizer, not_before, priority, &payload).await
    }

    async fn enqueue_organizer_send(
        &self,
        uid: &str,
        not_before: DateTime<Utc>,
        priority: i32,
        payload: OrganizerSendWork,
    ) -> WorkResult<Uuid> {
        self.enqueue(uid, WorkKind::OrganizerSend, not_before, priority, &payload).await
    }

    async fn enqueue_reply(
        &self,
        uid: &str,
        not_before: DateTime<Utc>,
        priority: i32,
        payload: ReplyWork,
    ) -> WorkResult<Uuid> {
        self.enqueue(uid, WorkKind::Reply, not_before, priority, &payload).await
    }

    async fn enqueue_reply_cancel(
        &self,
        uid: &str,
        not_before: DateTime<Utc>,
        priority: i32,
        payload: ReplyCancelWork,
    ) -> WorkResult<Uuid> {
        self.enqueue(uid, WorkKind::ReplyCancel, not_before, priority, &payload).await
    }

    async fn enqueue_refresh(
        &self,
        uid: &str,
        not_before: DateTime<Utc>,
        priority: i32,
        payload: RefreshWork,
    ) -> WorkResult<Uuid> {
        self.enqueue(uid, WorkKind::Refresh, not_before, priority, &payload).await
    }

    async fn enqueue_auto_reply(
        &self,
        uid: &str,
        not_before: DateTime<Utc>,
        priority: i32,
        payload: AutoReplyWork,
    ) -> WorkResult<Uuid> {
        self.enqueue(uid, WorkKind::AutoReply, not_before, priority, &payload).await
    }

    async fn add_pending_refresh_attendee(&self, entry: PendingRefreshAttendee) -> WorkResult<()> {
        sqlx::query(
            "INSERT INTO schedule_refresh_attendees (resource_id, attendee_cua) VALUES ($1, $2) \
             ON CONFLICT (resource_id, attendee_cua) DO NOTHING",
        )
        .bind(entry.resource_id)
        .bind(&entry.attendee_cua)
        .execute(&self.pool)
        .await
        .map_err(|e| WorkItemError::Other(e.into()))?;
        Ok(())
    }

    async fn drain_pending_refresh_attendees(&self, resource_id: Uuid) -> WorkResult<Vec<PendingRefreshAttendee>> {
        let rows = sqlx::query(
            "DELETE FROM schedule_refresh_attendees WHERE resource_id = $1 \
             RETURNING resource_id, attendee_cua",
        )
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| WorkItemError::Other(e.into()))?;

        rows.into_iter()
            .map(|r| {
                Ok(PendingRefreshAttendee {
                    resource_id: r.try_get("resource_id").map_err(|e: sqlx::Error| WorkItemError::Other(e.into()))?,
                    attendee_cua: r.try_get("attendee_cua").map_err(|e: sqlx::Error| WorkItemError::Other(e.into()))?,
                })
            })
            .collect()
    }

    async fn claim_batch(&self, kind: WorkKind, limit: i64) -> WorkResult<Vec<JobRow>> {
        let rows = sqlx::query(
            "UPDATE schedule_jobs SET status = 'running' WHERE job_id IN ( \
               SELECT job_id FROM schedule_jobs \
               WHERE work_type = $1 AND status = 'pending' AND paused = false \
                 AND not_before <= now() \
               ORDER BY not_before ASC, priority DESC \
               LIMIT $2 \
               FOR UPDATE SKIP LOCKED \
             ) RETURNING job_id, not_before, priority, weight, attempts, last_error, paused",
        )
        .bind(kind.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| WorkItemError::Other(e.into()))?;

        rows.into_iter()
            .map(|r| {
                Ok(JobRow {
                    job_id: r.try_get("job_id").map_err(|e: sqlx::Error| WorkItemError::Other(e.into()))?,
                    not_before: r.try_get("not_before").map_err(|e: sqlx::Error| WorkItemError::Other(e.into()))?,
                    priority: r.try_get("priority").map_err(|e: sqlx::Error| WorkItemError::Other(e.into()))?,
                    weight: r.try_get("weight").map_err(|e: sqlx::Error| WorkItemError::Other(e.into()))?,
                    attempts: r.try_get("attempts").map_err(|e: sqlx::Error| WorkItemError::Other(e.into()))?,
                    last_error: r.try_get("last_error").map_err(|e: sqlx::Error| WorkItemError::Other(e.into()))?,
                    paused: r.try_get("paused").map_err(|e: sqlx::Error| WorkItemError::Other(e.into()))?,
                })
            })
            .collect()
    }

    async fn mark_done(&self, job_id: Uuid) -> WorkResult<()> {
        sqlx::query("UPDATE schedule_jobs SET status = 'done' WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|e| WorkItemError::Other(e.into()))?;
        Ok(())
    }

    async fn record_failure(&self, job_id: Uuid, error: &str, max_attempts: i32) -> WorkResult<()> {
        sqlx::query(
            "UPDATE schedule_jobs SET \
               attempts = attempts + 1, \
               last_error = $2, \
               paused = (attempts + 1 >= $3), \
               status = 'pending' \
             WHERE job_id = $1",
        )
        .bind(job_id)
        .bind(error)
        .bind(max_attempts)
        .execute(&self.pool)
        .await
        .map_err(|e| WorkItemError::Other(e.into()))?;
        Ok(())
    }

    async fn has_running_job_for_uid(&self, uid: &str) -> WorkResult<bool> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM schedule_jobs WHERE icalendar_uid = $1 AND status = 'running') AS running",
        )
        .bind(uid)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| WorkItemError::Other(e.into()))?;
        row.try_get("running").map_err(|e| WorkItemError::Other(e.into()))
    }

    async fn advance_next_pending_for_uid(&self, uid: &str, not_before: DateTime<Utc>) -> WorkResult<()> {
        sqlx::query(
            "UPDATE schedule_jobs SET not_before = $2 \
             WHERE job_id = ( \
               SELECT job_id FROM schedule_jobs \
               WHERE icalendar_uid = $1 AND status = 'pending' AND paused = false \
               ORDER BY not_before ASC, priority DESC \
               LIMIT 1 \
             )",
        )
        .bind(uid)
        .bind(not_before)
        .execute(&self.pool)
        .await
        .map_err(|e| WorkItemError::Other(e.into()))?;
        Ok(())
    }
}
