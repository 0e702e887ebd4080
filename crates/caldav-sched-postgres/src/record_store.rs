//! Postgres-backed calendar object store (§4.5, C5).
//!
//! The iCalendar component tree is stored as a single `JSONB` column —
//! parsing/serializing it is `sem_os_core`'s `snapshots.body_json` pattern,
//! not a relational decomposition of every property. Meta-state (§3.3)
//! lives in the same row.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use caldav_sched_core::store::{RecordStore, SchedResult};
use caldav_sched_types::{AccessMode, CalendarComponent, CalendarObjectMeta, ItipMessage, ScheduleEtagHistory, SchedulingError};

pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn store_err(e: sqlx::Error) -> SchedulingError {
    SchedulingError::Store(e.into())
}

fn access_mode_str(mode: AccessMode) -> &'static str {
    match mode {
        AccessMode::Public => "public",
        AccessMode::Private => "private",
        AccessMode::Confidential => "confidential",
        AccessMode::Restricted => "restricted",
    }
}

fn parse_access_mode(s: &str) -> AccessMode {
    match s {
        "private" => AccessMode::Private,
        "confidential" => AccessMode::Confidential,
        "restricted" => AccessMode::Restricted,
        _ => AccessMode::Public,
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn load_component(&self, resource_id: Uuid) -> SchedResult<CalendarComponent> {
        let row = sqlx::query("SELECT ical_data FROM schedule_calendar_objects WHERE resource_id = $1")
            .bind(resource_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?
            .ok_or_else(|| SchedulingError::Store(anyhow::anyhow!("no calendar object for {resource_id}")))?;

        let json: serde_json::Value = row.try_get("ical_data").map_err(store_err)?;
        serde_json::from_value(json)
            .map_err(|e| SchedulingError::Store(anyhow::Error::from(e).context("decoding ical_data")))
    }

    async fn load_meta(&self, resource_id: Uuid) -> SchedResult<CalendarObjectMeta> {
        let row = sqlx::query(
            "SELECT access_mode, is_schedule_object, schedule_tag, schedule_etags, \
             has_private_comment, dropbox_id FROM schedule_calendar_objects WHERE resource_id = $1",
        )
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?
        .ok_or_else(|| SchedulingError::Store(anyhow::anyhow!("no calendar object for {resource_id}")))?;

        let access_mode: String = row.try_get("access_mode").map_err(store_err)?;
        let is_schedule_object: bool = row.try_get("is_schedule_object").map_err(store_err)?;
        let schedule_tag: Uuid = row.try_get("schedule_tag").map_err(store_err)?;
        let etags_json: serde_json::Value = row.try_get("schedule_etags").map_err(store_err)?;
        let history: ScheduleEtagHistory = serde_json::from_value(etags_json)
            .map_err(|e| SchedulingError::Store(anyhow::Error::from(e).context("decoding schedule_etags")))?;
        let has_private_comment: bool = row.try_get("has_private_comment").map_err(store_err)?;
        let dropbox_id: String = row.try_get("dropbox_id").map_err(store_err)?;

        Ok(CalendarObjectMeta {
            resource_id,
            access_mode: parse_access_mode(&access_mode),
            is_schedule_object,
            schedule_tag,
            schedule_etags: history,
            has_private_comment,
            dropbox_id,
        })
    }

    async fn find_by_uid(&self, home_id: Uuid, uid: &str) -> SchedResult<Option<Uuid>> {
        let row = sqlx::query(
            "SELECT resource_id FROM schedule_calendar_objects WHERE home_id = $1 AND ical_uid = $2",
        )
        .bind(home_id)
        .bind(uid)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(row.map(|r| r.try_get("resource_id")).transpose().map_err(store_err)?)
    }

    async fn find_uid_elsewhere(
        &self,
        home_id: Uuid,
        uid: &str,
        excluding_resource: Uuid,
    ) -> SchedResult<Option<(Uuid, String)>> {
        let row = sqlx::query(
            "SELECT resource_id, calendar_path FROM schedule_calendar_objects \
             WHERE home_id = $1 AND ical_uid = $2 AND resource_id != $3",
        )
        .bind(home_id)
        .bind(uid)
        .bind(excluding_resource)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        match row {
            None => Ok(None),
            Some(r) => {
                let resource_id: Uuid = r.try_get("resource_id").map_err(store_err)?;
                let path: String = r.try_get("calendar_path").map_err(store_err)?;
                Ok(Some((resource_id, path)))
            }
        }
    }

    async fn store_component(
        &self,
        resource_id: Uuid,
        component: &CalendarComponent,
        meta: &CalendarObjectMeta,
    ) -> SchedResult<()> {
        let ical_json = serde_json::to_value(component)
            .map_err(|e| SchedulingError::Store(anyhow::Error::from(e).context("encoding ical_data")))?;
        let etags_json = serde_json::to_value(&meta.schedule_etags)
            .map_err(|e| SchedulingError::Store(e.into()))?;

        sqlx::query(
            "INSERT INTO schedule_calendar_objects \
             (resource_id, ical_uid, ical_data, access_mode, is_schedule_object, \
              schedule_tag, schedule_etags, has_private_comment, dropbox_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (resource_id) DO UPDATE SET \
               ical_uid = EXCLUDED.ical_uid, \
               ical_data = EXCLUDED.ical_data, \
               access_mode = EXCLUDED.access_mode, \
               is_schedule_object = EXCLUDED.is_schedule_object, \
               schedule_tag = EXCLUDED.schedule_tag, \
               schedule_etags = EXCLUDED.schedule_etags, \
               has_private_comment = EXCLUDED.has_private_comment, \
               dropbox_id = EXCLUDED.dropbox_id",
        )
        .bind(resource_id)
        .bind(&component.uid)
        .bind(ical_json)
        .bind(access_mode_str(meta.access_mode))
        .bind(meta.is_schedule_object)
        .bind(meta.schedule_tag)
        .bind(etags_json)
        .bind(meta.has_private_comment)
        .bind(&meta.dropbox_id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn delete_component(&self, resource_id: Uuid) -> SchedResult<()> {
        sqlx::query("DELETE FROM schedule_calendar_objects WHERE resource_id = $1")
            .bind(resource_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn deliver_to_inbox(&self, recipient_home: Uuid, message: &ItipMessage) -> SchedResult<()> {
        let body = serde_json::to_value(message).map_err(|e| SchedulingError::Store(e.into()))?;
        sqlx::query(
            "INSERT INTO schedule_inbox_items (home_id, method, ical_uid, delivered_at, message) \
             VALUES ($1, $2, $3, now(), $4)",
        )
        .bind(recipient_home)
        .bind(format!("{:?}", message.method))
        .bind(&message.uid)
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }
}
