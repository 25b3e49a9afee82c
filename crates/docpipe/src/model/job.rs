//! Job and file records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::stage::{Stage, StageJob};
use super::state::{Advance, FileStatus, FileTally, JobEvent, JobStatus, TransitionError};

/// One pipeline invocation for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    /// Owning application. All queries are scoped by it.
    pub tenant_id: String,
    pub spec: StageJob,
    pub status: JobStatus,
    pub total_file_count: u32,
    pub queued_files: u32,
    pub completed_file_count: u32,
    pub failed_file_count: u32,
    /// Optimistic-concurrency token, bumped on every job write.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(tenant_id: &str, spec: StageJob) -> Self {
        let now = Utc::now();
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            spec,
            status: JobStatus::Created,
            total_file_count: 0,
            queued_files: 0,
            completed_file_count: 0,
            failed_file_count: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn stage(&self) -> Stage {
        self.spec.stage()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Marks the job STARTED with every registered file queued.
    pub fn started(&self) -> Result<Job, TransitionError> {
        let status = self.status.advance(&JobEvent::Started)?;
        Ok(Job {
            status,
            queued_files: self.total_file_count,
            updated_at: Utc::now(),
            ..self.clone()
        })
    }

    /// Replaces the aggregate counters with `tally` and derives the status.
    pub fn with_tally(&self, tally: FileTally) -> Result<Job, TransitionError> {
        let status = self.status.advance(&JobEvent::Progress(tally))?;
        Ok(Job {
            status,
            queued_files: tally.outstanding(),
            completed_file_count: tally.completed,
            failed_file_count: tally.failed,
            updated_at: Utc::now(),
            ..self.clone()
        })
    }

    /// True when `other` differs in any field the reconciler owns.
    pub fn aggregates_differ(&self, other: &Job) -> bool {
        self.status != other.status
            || self.queued_files != other.queued_files
            || self.completed_file_count != other.completed_file_count
            || self.failed_file_count != other.failed_file_count
    }
}

/// One unit of work belonging to a job, keyed by `(job_id, file_name)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFile {
    pub job_id: String,
    pub file_name: String,
    /// Synthetic identifier, unique across all jobs.
    pub file_id: String,
    /// Source object location read by the stage processor.
    pub file_path: String,
    pub status: FileStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobFile {
    pub fn new(job_id: &str, file_name: &str, file_path: &str) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.to_string(),
            file_name: file_name.to_string(),
            file_id: uuid::Uuid::new_v4().simple().to_string(),
            file_path: file_path.to_string(),
            status: FileStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Reference handed to a stage processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub job_id: String,
    pub tenant_id: String,
    pub file_name: String,
    pub file_path: String,
}

/// Queue message body: one per file unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkMessage {
    pub job_id: String,
    pub tenant_id: String,
    pub file_name: String,
    pub file_path: String,
    pub spec: StageJob,
}

impl WorkMessage {
    pub fn for_file(job: &Job, file: &JobFile) -> Self {
        Self {
            job_id: job.job_id.clone(),
            tenant_id: job.tenant_id.clone(),
            file_name: file.file_name.clone(),
            file_path: file.file_path.clone(),
            spec: job.spec.clone(),
        }
    }

    pub fn file_ref(&self) -> FileRef {
        FileRef {
            job_id: self.job_id.clone(),
            tenant_id: self.tenant_id.clone(),
            file_name: self.file_name.clone(),
            file_path: self.file_path.clone(),
        }
    }

    /// Deduplication id: one live message per `(job, file)`.
    pub fn dedup_id(&self) -> String {
        format!("{}:{}", self.job_id, self.file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job_is_created_and_empty() {
        let job = Job::new("app-1", StageJob::Extraction);
        assert!(!job.job_id.is_empty());
        assert_eq!(job.status, JobStatus::Created);
        assert_eq!(job.total_file_count, 0);
        assert_eq!(job.version, 0);
        assert_eq!(job.stage(), Stage::Extraction);
    }

    #[test]
    fn test_started_queues_every_registered_file() {
        let mut job = Job::new("app-1", StageJob::Extraction);
        job.total_file_count = 3;
        let started = job.started().unwrap();
        assert_eq!(started.status, JobStatus::Started);
        assert_eq!(started.queued_files, 3);
        assert!(started.started().is_err());
    }

    #[test]
    fn test_with_tally_sets_exact_counts() {
        let mut job = Job::new("app-1", StageJob::Extraction);
        job.total_file_count = 3;
        let job = job.started().unwrap();

        let partial = job
            .with_tally(FileTally {
                total: 3,
                completed: 1,
                failed: 0,
            })
            .unwrap();
        assert_eq!(partial.status, JobStatus::InProgress);
        assert_eq!(partial.queued_files, 2);
        assert!(partial.aggregates_differ(&job));

        let done = partial
            .with_tally(FileTally {
                total: 3,
                completed: 2,
                failed: 1,
            })
            .unwrap();
        assert_eq!(done.status, JobStatus::CompletedWithErrors);
        assert_eq!(done.completed_file_count, 2);
        assert_eq!(done.failed_file_count, 1);
        assert_eq!(done.queued_files, 0);
    }

    #[test]
    fn test_file_ids_are_unique_and_hyphenless() {
        let a = JobFile::new("j", "a.pdf", "t/j/a.pdf");
        let b = JobFile::new("j", "b.pdf", "t/j/b.pdf");
        assert_ne!(a.file_id, b.file_id);
        assert!(!a.file_id.contains('-'));
        assert_eq!(a.status, FileStatus::Pending);
    }

    #[test]
    fn test_work_message_dedup_id() {
        let job = Job::new("app-1", StageJob::Extraction);
        let file = JobFile::new(&job.job_id, "a.pdf", "app-1/x/a.pdf");
        let msg = WorkMessage::for_file(&job, &file);
        assert_eq!(msg.dedup_id(), format!("{}:a.pdf", job.job_id));
        assert_eq!(msg.file_ref().file_path, "app-1/x/a.pdf");
    }
}
