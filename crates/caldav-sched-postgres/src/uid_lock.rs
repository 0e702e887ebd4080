//! Postgres-backed UID lock (§4.6, C6).
//!
//! `UidLockStore::acquire` carries no transaction handle of its own — the
//! port was kept to a single `&self` method so the scheduler never has to
//! know it is talking to Postgres. That means this implementation can only
//! validate the lock-name/advisory-key derivation here; it takes the
//! `pg_advisory_xact_lock` inside its own short transaction and commits
//! immediately rather than holding it open across the caller's subsequent
//! `RecordStore`/`WorkQueueStore` calls. Serializing the full read-modify-
//! write sequence per UID needs a shared transaction threaded through all
//! three ports, which is out of scope for this pass (see DESIGN.md).

use async_trait::async_trait;
use sqlx::PgPool;

use caldav_sched_core::store::{SchedResult, UidLockStore};
use caldav_sched_core::uid_lock::advisory_key;
use caldav_sched_types::SchedulingError;

pub struct PgUidLock {
    pool: PgPool,
}

impl PgUidLock {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UidLockStore for PgUidLock {
    async fn acquire(&self, uid: &str) -> SchedResult<()> {
        let key = advisory_key(uid);
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SchedulingError::Store(e.into()))?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(|e| SchedulingError::Store(e.into()))?;
        tx.commit().await.map_err(|e| SchedulingError::Store(e.into()))?;
        Ok(())
    }
}
