//! `ScheduleQueueWorker`: drains the job table (§4.9, C9).
//!
//! A direct generalization of the teacher's `PendingDispatchWorker::run`:
//! `tokio::select!` between a poll-interval sleep and a
//! `watch::Receiver<bool>` shutdown signal, claim a batch with
//! `FOR UPDATE SKIP LOCKED`, execute each job, back off on error.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use caldav_sched_types::WorkKind;

use crate::store::WorkQueueStore;
use crate::work_items::ScheduleWorkItem;

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const BATCH_SIZE: i64 = 10;
const MAX_ATTEMPTS: i32 = 10;

/// Builds a [`ScheduleWorkItem`] for one claimed job row. The queue worker
/// is generic over this so it does not need to know about every concrete
/// work-kind struct — the binary crate wires up a builder per `WorkKind`.
#[async_trait::async_trait]
pub trait WorkItemBuilder: Send + Sync {
    async fn build(&self, job_id: uuid::Uuid) -> anyhow::Result<Box<dyn ScheduleWorkItem>>;
}

pub struct ScheduleQueueWorker<Q> {
    kind: WorkKind,
    queue: Arc<Q>,
    builder: Arc<dyn WorkItemBuilder>,
}

impl<Q: WorkQueueStore> ScheduleQueueWorker<Q> {
    pub fn new(kind: WorkKind, queue: Arc<Q>, builder: Arc<dyn WorkItemBuilder>) -> Self {
        Self { kind, queue, builder }
    }

    /// Run the worker loop until the shutdown signal fires.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!(kind = self.kind.as_str(), "schedule queue worker started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            self.process_batch().await;

            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = shutdown_rx.changed() => {
                    break;
                }
            }
        }

        tracing::info!(kind = self.kind.as_str(), "schedule queue worker stopped");
    }

    async fn process_batch(&self) {
        let jobs = match self.queue.claim_batch(self.kind, BATCH_SIZE).await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!(kind = self.kind.as_str(), error = %e, "failed to claim batch");
                return;
            }
        };

        for job in jobs {
            self.run_one(job).await;
        }
    }

    async fn run_one(&self, job: caldav_sched_types::JobRow) {
        let item = match self.builder.build(job.job_id).await {
            Ok(item) => item,
            Err(e) => {
                tracing::error!(job_id = %job.job_id, error = %e, "failed to build work item");
                return;
            }
        };

        match item.do_work().await {
            Ok(()) => {
                if let Err(e) = item.after_work().await {
                    tracing::error!(job_id = %job.job_id, error = %e, "after_work failed");
                }
                if let Err(e) = self.queue.mark_done(job.job_id).await {
                    tracing::error!(job_id = %job.job_id, error = %e, "failed to mark job done");
                }
            }
            Err(e) => {
                tracing::warn!(job_id = %job.job_id, attempts = job.attempts + 1, error = %e, "work item failed, will retry");
                if let Err(store_err) = self
                    .queue
                    .record_failure(job.job_id, &e.to_string(), MAX_ATTEMPTS)
                    .await
                {
                    tracing::error!(job_id = %job.job_id, error = %store_err, "failed to record failure");
                }
            }
        }
    }
}
