//! Job status event stream.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{Job, JobStatus, Stage};

/// What happened to the job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    Created,
    FileRegistered,
    Started,
    Progress,
    Finished,
}

/// Snapshot of a job's aggregates after a transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusEvent {
    pub job_id: String,
    pub tenant_id: String,
    pub stage: Stage,
    pub kind: JobEventKind,
    pub status: JobStatus,
    pub total_file_count: u32,
    pub completed_file_count: u32,
    pub failed_file_count: u32,
    pub timestamp: DateTime<Utc>,
}

impl JobStatusEvent {
    pub fn new(job: &Job, kind: JobEventKind) -> Self {
        Self {
            job_id: job.job_id.clone(),
            tenant_id: job.tenant_id.clone(),
            stage: job.stage(),
            kind,
            status: job.status,
            total_file_count: job.total_file_count,
            completed_file_count: job.completed_file_count,
            failed_file_count: job.failed_file_count,
            timestamp: Utc::now(),
        }
    }

    /// Progress or finish, depending on whether `job` is terminal.
    pub fn progress(job: &Job) -> Self {
        let kind = if job.is_terminal() {
            JobEventKind::Finished
        } else {
            JobEventKind::Progress
        };
        Self::new(job, kind)
    }
}

/// Fans job status events out to any number of subscribers.
#[derive(Clone)]
pub struct JobEventBroadcaster {
    sender: Arc<broadcast::Sender<JobStatusEvent>>,
}

impl JobEventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: JobStatusEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobStatusEvent> {
        self.sender.subscribe()
    }

    pub fn job_changed(&self, job: &Job, kind: JobEventKind) {
        tracing::debug!(
            job_id = %job.job_id,
            status = %job.status,
            kind = ?kind,
            completed = job.completed_file_count,
            failed = job.failed_file_count,
            total = job.total_file_count,
            "Job status event"
        );
        self.send(JobStatusEvent::new(job, kind));
    }
}

impl Default for JobEventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StageJob;

    #[test]
    fn test_send_without_subscribers_is_silent() {
        let broadcaster = JobEventBroadcaster::new(4);
        broadcaster.job_changed(&Job::new("t", StageJob::Extraction), JobEventKind::Created);
    }

    #[test]
    fn test_subscriber_receives_snapshot() {
        let broadcaster = JobEventBroadcaster::default();
        let mut rx = broadcaster.subscribe();

        let mut job = Job::new("t", StageJob::Extraction);
        job.status = JobStatus::CompletedWithErrors;
        job.total_file_count = 3;
        job.completed_file_count = 2;
        job.failed_file_count = 1;
        broadcaster.send(JobStatusEvent::progress(&job));

        let received = rx.try_recv().unwrap();
        assert_eq!(received.job_id, job.job_id);
        assert_eq!(received.kind, JobEventKind::Finished);
        assert_eq!(received.status, JobStatus::CompletedWithErrors);
        assert_eq!(received.completed_file_count, 2);
        assert_eq!(received.stage, Stage::Extraction);
    }

    #[test]
    fn test_event_serializes_camel_case() {
        let job = Job::new("t", StageJob::Extraction);
        let json = serde_json::to_value(JobStatusEvent::new(&job, JobEventKind::Created)).unwrap();
        assert_eq!(json["kind"], "created");
        assert_eq!(json["status"], "CREATED");
        assert_eq!(json["totalFileCount"], 0);
    }
}
