//! Implicit iTIP scheduling engine and durable work queue.
//!
//! Depends only on `caldav-sched-types` and the trait ports in [`store`] —
//! never on a concrete database or transport.

pub mod itip;
pub mod queue_worker;
pub mod scheduler;
pub mod split;
pub mod store;
pub mod uid_lock;
pub mod work_items;

pub use scheduler::{Classification, ImplicitScheduler, ObjectType, SchedulingOutcome, SchedulingState, SchedulingTest};
pub use split::{qualifies_for_split, SplitEngine, SplitOutcome};
pub use store::{RecordStore, SchedResult, UidLockStore, WorkQueueStore, WorkResult};
