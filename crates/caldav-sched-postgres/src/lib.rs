//! Postgres implementations of the scheduling core's storage ports (§4.5).
//!
//! Kept as a separate crate so `caldav-sched-core` never gains a `sqlx`
//! dependency; only this crate and its callers know the backing store is
//! Postgres.

pub mod record_store;
pub mod uid_lock;
pub mod work_queue;

pub use record_store::PgRecordStore;
pub use uid_lock::PgUidLock;
pub use work_queue::PgWorkQueue;
