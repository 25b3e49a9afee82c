//! Job and file state machines.
//!
//! Both entities move through their lifecycle only via [`Advance::advance`],
//! so the admission path, the consumer and the reconciler agree on which
//! transitions are legal.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rejected state transition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot apply {event} to a {from} record")]
pub struct TransitionError {
    pub from: String,
    pub event: String,
}

/// Common state-machine interface shared by job and file statuses.
pub trait Advance: Sized {
    type Event: fmt::Debug;

    fn advance(&self, event: &Self::Event) -> Result<Self, TransitionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    #[serde(alias = "QUEUED")]
    Started,
    InProgress,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "CREATED",
            JobStatus::Started => "STARTED",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Completed => "COMPLETED",
            JobStatus::CompletedWithErrors => "COMPLETED_WITH_ERRORS",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::CompletedWithErrors | JobStatus::Failed
        )
    }

    /// Terminal states whose completed files may feed a downstream job.
    pub fn has_usable_output(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::CompletedWithErrors)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(JobStatus::Created),
            "STARTED" | "QUEUED" => Ok(JobStatus::Started),
            "IN_PROGRESS" => Ok(JobStatus::InProgress),
            "COMPLETED" => Ok(JobStatus::Completed),
            "COMPLETED_WITH_ERRORS" => Ok(JobStatus::CompletedWithErrors),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStatus {
    Pending,
    Queued,
    Completed,
    Failed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "PENDING",
            FileStatus::Queued => "QUEUED",
            FileStatus::Completed => "COMPLETED",
            FileStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FileStatus::Completed | FileStatus::Failed)
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(FileStatus::Pending),
            "QUEUED" => Ok(FileStatus::Queued),
            "COMPLETED" => Ok(FileStatus::Completed),
            "FAILED" => Ok(FileStatus::Failed),
            other => Err(format!("unknown file status '{}'", other)),
        }
    }
}

/// Aggregate of file outcomes for one job, always recomputed from the
/// file records rather than accumulated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileTally {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
}

impl FileTally {
    pub fn from_statuses<I>(total: u32, statuses: I) -> Self
    where
        I: IntoIterator<Item = FileStatus>,
    {
        let mut tally = FileTally {
            total,
            ..Default::default()
        };
        for status in statuses {
            match status {
                FileStatus::Completed => tally.completed += 1,
                FileStatus::Failed => tally.failed += 1,
                FileStatus::Pending | FileStatus::Queued => {}
            }
        }
        tally
    }

    pub fn settled(&self) -> u32 {
        self.completed + self.failed
    }

    pub fn outstanding(&self) -> u32 {
        self.total.saturating_sub(self.settled())
    }

    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.settled() == self.total
    }

    /// Terminal job status implied by this tally, if every file is settled.
    pub fn terminal_status(&self) -> Option<JobStatus> {
        if !self.is_complete() {
            return None;
        }
        Some(match (self.completed, self.failed) {
            (_, 0) => JobStatus::Completed,
            (0, _) => JobStatus::Failed,
            _ => JobStatus::CompletedWithErrors,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    FileRegistered,
    Started,
    Progress(FileTally),
}

impl Advance for JobStatus {
    type Event = JobEvent;

    fn advance(&self, event: &JobEvent) -> Result<Self, TransitionError> {
        let reject = || TransitionError {
            from: self.to_string(),
            event: format!("{:?}", event),
        };

        match (self, event) {
            (JobStatus::Created, JobEvent::FileRegistered) => Ok(JobStatus::Created),
            (JobStatus::Created, JobEvent::Started) => Ok(JobStatus::Started),
            (JobStatus::Created, JobEvent::Progress(_)) => Err(reject()),
            (_, JobEvent::FileRegistered) | (_, JobEvent::Started) => Err(reject()),
            (status, JobEvent::Progress(tally)) => match tally.terminal_status() {
                Some(terminal) => Ok(terminal),
                // Settled files never revert, so a terminal job cannot fall back.
                None if status.is_terminal() => Err(reject()),
                None => Ok(JobStatus::InProgress),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEvent {
    Queued,
    Completed,
    Failed,
}

impl FileEvent {
    fn target(&self) -> FileStatus {
        match self {
            FileEvent::Queued => FileStatus::Queued,
            FileEvent::Completed => FileStatus::Completed,
            FileEvent::Failed => FileStatus::Failed,
        }
    }
}

impl Advance for FileStatus {
    type Event = FileEvent;

    fn advance(&self, event: &FileEvent) -> Result<Self, TransitionError> {
        let target = event.target();
        match self {
            FileStatus::Pending | FileStatus::Queued => Ok(target),
            // Re-applying the same terminal state is the only move out of a terminal file.
            terminal if *terminal == target => Ok(target),
            _ => Err(TransitionError {
                from: self.to_string(),
                event: format!("{:?}", event),
            }),
        }
    }
}
