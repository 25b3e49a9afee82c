//! Durable job and file records.

mod sqlite;

pub use sqlite::SqliteRecordStore;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{FileStatus, Job, JobFile, Stage};

/// Key-addressed storage for jobs and their files, with conditional
/// writes and the tenant / upstream / owning-job secondary lookups.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Inserts a new job. `Duplicate` if the id is taken.
    async fn create_job(&self, job: &Job) -> Result<(), StoreError>;

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError>;

    /// Conditional write keyed on `job.version`. Returns the stored job
    /// (with its bumped version) or `Conflict` if a concurrent writer won.
    async fn update_job(&self, job: &Job) -> Result<Job, StoreError>;

    async fn jobs_for_tenant(
        &self,
        tenant_id: &str,
        stage: Option<Stage>,
    ) -> Result<Vec<Job>, StoreError>;

    async fn jobs_for_upstream(
        &self,
        stage: Stage,
        upstream_job_id: &str,
    ) -> Result<Vec<Job>, StoreError>;

    /// Inserts a PENDING file and bumps the owning job's total atomically.
    ///
    /// Fails with `NotFound` for an unknown job, `Duplicate` for a taken
    /// file name, and `Conflict` once the job has left CREATED.
    async fn register_file(&self, file: &JobFile) -> Result<Job, StoreError>;

    async fn get_file(&self, job_id: &str, file_name: &str) -> Result<Option<JobFile>, StoreError>;

    async fn files_for_job(&self, job_id: &str) -> Result<Vec<JobFile>, StoreError>;

    /// Moves a file from `from` to `to`; `Conflict` if it is no longer `from`.
    async fn update_file_status(
        &self,
        job_id: &str,
        file_name: &str,
        from: FileStatus,
        to: FileStatus,
    ) -> Result<(), StoreError>;
}
