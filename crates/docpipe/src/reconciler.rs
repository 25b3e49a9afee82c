//! Job aggregate rollup.
//!
//! Counts are always recomputed from the job's file records and written
//! with a version compare-and-set, so redelivered messages and concurrent
//! workers converge on the same aggregate.

use std::sync::Arc;

use crate::broadcast::{JobEventBroadcaster, JobStatusEvent};
use crate::context::PipelineContext;
use crate::error::StoreError;
use crate::model::{FileTally, Job};
use crate::retry::{with_retries, RetryPolicy};
use crate::store::RecordStore;

/// Lost compare-and-set races tolerated before giving up on one reconcile.
const MAX_CAS_ATTEMPTS: u32 = 32;

#[derive(Clone)]
pub struct StatusReconciler {
    store: Arc<dyn RecordStore>,
    events: JobEventBroadcaster,
    retry: RetryPolicy,
}

impl StatusReconciler {
    pub fn new(ctx: &PipelineContext, retry: RetryPolicy) -> Self {
        Self {
            store: Arc::clone(ctx.store()),
            events: ctx.events().clone(),
            retry,
        }
    }

    /// Recomputes `job_id`'s counters and status from its files and
    /// persists them if they changed. Returns the job as stored afterwards.
    pub async fn reconcile(&self, job_id: &str) -> Result<Job, StoreError> {
        with_retries(&self.retry, "reconcile", || self.reconcile_once(job_id)).await
    }

    async fn reconcile_once(&self, job_id: &str) -> Result<Job, StoreError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let job = self
                .store
                .get_job(job_id)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("job {}", job_id)))?;

            let files = self.store.files_for_job(job_id).await?;
            let tally = FileTally::from_statuses(
                job.total_file_count,
                files.iter().map(|f| f.status),
            );

            let next = match job.with_tally(tally) {
                Ok(next) => next,
                Err(e) => {
                    // CREATED jobs and settled terminal jobs have nothing to roll up.
                    tracing::debug!(job_id, status = %job.status, error = %e, "Nothing to reconcile");
                    return Ok(job);
                }
            };

            if !next.aggregates_differ(&job) {
                return Ok(job);
            }

            match self.store.update_job(&next).await {
                Ok(stored) => {
                    if stored.is_terminal() {
                        tracing::info!(
                            job_id,
                            status = %stored.status,
                            completed = stored.completed_file_count,
                            failed = stored.failed_file_count,
                            total = stored.total_file_count,
                            "Job finished"
                        );
                    }
                    self.events.send(JobStatusEvent::progress(&stored));
                    return Ok(stored);
                }
                Err(StoreError::Conflict(_)) => {
                    tracing::debug!(job_id, "Concurrent job update, recomputing");
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(StoreError::Conflict(format!(
            "job {} kept changing during reconcile",
            job_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::model::{FileStatus, JobFile, JobStatus, StageJob};
    use crate::store::SqliteRecordStore;

    async fn started_job(store: &Arc<dyn RecordStore>, names: &[&str]) -> Job {
        let job = Job::new("t", StageJob::Extraction);
        store.create_job(&job).await.unwrap();
        let mut latest = job;
        for name in names {
            latest = store
                .register_file(&JobFile::new(&latest.job_id, name, name))
                .await
                .unwrap();
        }
        store.update_job(&latest.started().unwrap()).await.unwrap()
    }

    async fn settle(store: &Arc<dyn RecordStore>, job: &Job, name: &str, to: FileStatus) {
        store
            .update_file_status(&job.job_id, name, FileStatus::Pending, to)
            .await
            .unwrap();
    }

    fn setup() -> (PipelineContext, StatusReconciler) {
        let store: Arc<dyn RecordStore> =
            Arc::new(SqliteRecordStore::new(Database::open_in_memory().unwrap()));
        let ctx = PipelineContext::new(store);
        let reconciler = StatusReconciler::new(&ctx, RetryPolicy::new(0));
        (ctx, reconciler)
    }

    #[tokio::test]
    async fn test_partial_progress_is_in_progress() {
        let (ctx, reconciler) = setup();
        let job = started_job(ctx.store(), &["a.pdf", "b.pdf"]).await;
        settle(ctx.store(), &job, "a.pdf", FileStatus::Completed).await;

        let job = reconciler.reconcile(&job.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::InProgress);
        assert_eq!(job.completed_file_count, 1);
        assert_eq!(job.queued_files, 1);
    }

    #[tokio::test]
    async fn test_mixed_outcomes_complete_with_errors() {
        let (ctx, reconciler) = setup();
        let mut rx = ctx.events().subscribe();
        let job = started_job(ctx.store(), &["a.pdf", "b.pdf", "c.pdf"]).await;
        settle(ctx.store(), &job, "a.pdf", FileStatus::Completed).await;
        settle(ctx.store(), &job, "b.pdf", FileStatus::Completed).await;
        settle(ctx.store(), &job, "c.pdf", FileStatus::Failed).await;

        let job = reconciler.reconcile(&job.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::CompletedWithErrors);
        assert_eq!(job.completed_file_count, 2);
        assert_eq!(job.failed_file_count, 1);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.status, JobStatus::CompletedWithErrors);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let (ctx, reconciler) = setup();
        let job = started_job(ctx.store(), &["a.pdf"]).await;
        settle(ctx.store(), &job, "a.pdf", FileStatus::Failed).await;

        let first = reconciler.reconcile(&job.job_id).await.unwrap();
        let second = reconciler.reconcile(&job.job_id).await.unwrap();
        assert_eq!(first.status, JobStatus::Failed);
        assert_eq!(second.failed_file_count, 1);
        assert_eq!(first.version, second.version);
    }

    #[tokio::test]
    async fn test_created_job_is_left_alone() {
        let (ctx, reconciler) = setup();
        let job = Job::new("t", StageJob::Extraction);
        ctx.store().create_job(&job).await.unwrap();

        let after = reconciler.reconcile(&job.job_id).await.unwrap();
        assert_eq!(after.status, JobStatus::Created);
        assert_eq!(after.version, job.version);
    }

    #[tokio::test]
    async fn test_concurrent_reconciles_converge() {
        let (ctx, reconciler) = setup();
        let names: Vec<String> = (0..8).map(|i| format!("f{}.pdf", i)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let job = started_job(ctx.store(), &refs).await;
        for name in &refs {
            settle(ctx.store(), &job, name, FileStatus::Completed).await;
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let r = reconciler.clone();
            let id = job.job_id.clone();
            handles.push(tokio::spawn(async move { r.reconcile(&id).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stored = ctx.store().get_job(&job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.completed_file_count, 8);
    }

    #[tokio::test]
    async fn test_missing_job_is_not_found() {
        let (_ctx, reconciler) = setup();
        let err = reconciler.reconcile("ghost").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
