use async_trait::async_trait;

use crate::db::file_repo::{self, Registration};
use crate::db::{job_repo, Database, DatabaseError};
use crate::error::StoreError;
use crate::model::{FileStatus, Job, JobFile, Stage};

/// [`RecordStore`](super::RecordStore) over the shared SQLite database.
///
/// Repository calls block on the connection mutex, so each one runs on
/// the blocking thread pool.
#[derive(Clone)]
pub struct SqliteRecordStore {
    db: Database,
}

impl SqliteRecordStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn is_unique_violation(err: &DatabaseError) -> bool {
    matches!(
        err,
        DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl super::RecordStore for SqliteRecordStore {
    async fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        let job = job.clone();
        self.blocking(move |db| {
            job_repo::insert(db, &job).map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::Duplicate(format!("job {}", job.job_id))
                } else {
                    e.into()
                }
            })
        })
        .await
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        let job_id = job_id.to_string();
        self.blocking(move |db| Ok(job_repo::find_by_id(db, &job_id)?))
            .await
    }

    async fn update_job(&self, job: &Job) -> Result<Job, StoreError> {
        let job = job.clone();
        self.blocking(move |db| {
            if job_repo::update_if_version(db, &job)? {
                Ok(Job {
                    version: job.version + 1,
                    ..job
                })
            } else {
                Err(StoreError::Conflict(format!(
                    "job {} at version {}",
                    job.job_id, job.version
                )))
            }
        })
        .await
    }

    async fn jobs_for_tenant(
        &self,
        tenant_id: &str,
        stage: Option<Stage>,
    ) -> Result<Vec<Job>, StoreError> {
        let tenant_id = tenant_id.to_string();
        self.blocking(move |db| Ok(job_repo::list_for_tenant(db, &tenant_id, stage)?))
            .await
    }

    async fn jobs_for_upstream(
        &self,
        stage: Stage,
        upstream_job_id: &str,
    ) -> Result<Vec<Job>, StoreError> {
        let upstream_job_id = upstream_job_id.to_string();
        self.blocking(move |db| Ok(job_repo::list_by_upstream(db, stage, &upstream_job_id)?))
            .await
    }

    async fn register_file(&self, file: &JobFile) -> Result<Job, StoreError> {
        let file = file.clone();
        self.blocking(move |db| match file_repo::register(db, &file)? {
            Registration::Registered(job) => Ok(job),
            Registration::JobMissing => Err(StoreError::NotFound(format!("job {}", file.job_id))),
            Registration::JobClosed(status) => Err(StoreError::Conflict(format!(
                "job {} is {} and no longer accepts files",
                file.job_id, status
            ))),
            Registration::DuplicateName => Err(StoreError::Duplicate(format!(
                "file {} in job {}",
                file.file_name, file.job_id
            ))),
        })
        .await
    }

    async fn get_file(&self, job_id: &str, file_name: &str) -> Result<Option<JobFile>, StoreError> {
        let (job_id, file_name) = (job_id.to_string(), file_name.to_string());
        self.blocking(move |db| Ok(file_repo::find(db, &job_id, &file_name)?))
            .await
    }

    async fn files_for_job(&self, job_id: &str) -> Result<Vec<JobFile>, StoreError> {
        let job_id = job_id.to_string();
        self.blocking(move |db| Ok(file_repo::list_for_job(db, &job_id)?))
            .await
    }

    async fn update_file_status(
        &self,
        job_id: &str,
        file_name: &str,
        from: FileStatus,
        to: FileStatus,
    ) -> Result<(), StoreError> {
        let (job_id, file_name) = (job_id.to_string(), file_name.to_string());
        self.blocking(move |db| {
            if file_repo::update_status_if(db, &job_id, &file_name, from, to)? {
                Ok(())
            } else {
                Err(StoreError::Conflict(format!(
                    "file {} in job {} is no longer {}",
                    file_name, job_id, from
                )))
            }
        })
        .await
    }
}
