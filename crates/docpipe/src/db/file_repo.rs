//! File repository: the `job_files` table.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use super::job_repo::{self, format_timestamp, parse_timestamp};
use super::{Database, DatabaseError};
use crate::model::{FileStatus, Job, JobFile, JobStatus};

#[derive(Debug, Clone)]
pub struct FileRow {
    pub job_id: String,
    pub file_name: String,
    pub file_id: String,
    pub file_path: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

impl FileRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            job_id: row.get("job_id")?,
            file_name: row.get("file_name")?,
            file_id: row.get("file_id")?,
            file_path: row.get("file_path")?,
            status: row.get("status")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    pub fn into_file(self) -> Result<JobFile, DatabaseError> {
        let status: FileStatus = self
            .status
            .parse()
            .map_err(|reason| DatabaseError::Corrupt {
                column: "status",
                reason,
            })?;
        Ok(JobFile {
            job_id: self.job_id,
            file_name: self.file_name,
            file_id: self.file_id,
            file_path: self.file_path,
            status,
            created_at: parse_timestamp("created_at", &self.created_at)?,
            updated_at: parse_timestamp("updated_at", &self.updated_at)?,
        })
    }
}

/// Result of a registration attempt.
#[derive(Debug)]
pub enum Registration {
    /// File inserted; carries the job with its incremented total.
    Registered(Job),
    JobMissing,
    /// The job has left CREATED and no longer accepts files.
    JobClosed(JobStatus),
    DuplicateName,
}

/// Inserts `file` and increments its job's `total_file_count` in one
/// transaction, provided the job is still CREATED.
pub fn register(db: &Database, file: &JobFile) -> Result<Registration, DatabaseError> {
    db.with_tx(|tx| {
        let job = match job_repo::find_in(tx, &file.job_id)? {
            Some(job) => job,
            None => return Ok(Registration::JobMissing),
        };
        if job.status != JobStatus::Created {
            return Ok(Registration::JobClosed(job.status));
        }

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO job_files (job_id, file_name, file_id, file_path, status,
             created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                file.job_id,
                file.file_name,
                file.file_id,
                file.file_path,
                file.status.as_str(),
                format_timestamp(&file.created_at),
                format_timestamp(&file.updated_at),
            ],
        )?;
        if inserted == 0 {
            return Ok(Registration::DuplicateName);
        }

        tx.execute(
            "UPDATE jobs SET total_file_count = total_file_count + 1, version = version + 1,
             updated_at = ?2
             WHERE job_id = ?1 AND status = 'CREATED'",
            params![file.job_id, format_timestamp(&Utc::now())],
        )?;

        match job_repo::find_in(tx, &file.job_id)? {
            Some(job) => Ok(Registration::Registered(job)),
            None => Ok(Registration::JobMissing),
        }
    })
}

pub fn find(db: &Database, job_id: &str, file_name: &str) -> Result<Option<JobFile>, DatabaseError> {
    db.with_conn(|conn| {
        conn.query_row(
            "SELECT * FROM job_files WHERE job_id = ?1 AND file_name = ?2",
            params![job_id, file_name],
            FileRow::from_row,
        )
        .optional()?
        .map(FileRow::into_file)
        .transpose()
    })
}

/// All files of a job in registration order.
pub fn list_for_job(db: &Database, job_id: &str) -> Result<Vec<JobFile>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM job_files WHERE job_id = ?1 ORDER BY created_at, file_name",
        )?;
        let rows = stmt
            .query_map(params![job_id], FileRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(FileRow::into_file).collect()
    })
}

/// Moves a file from `expected` to `next`. Returns false when the stored
/// status is no longer `expected`.
pub fn update_status_if(
    db: &Database,
    job_id: &str,
    file_name: &str,
    expected: FileStatus,
    next: FileStatus,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE job_files SET status = ?4, updated_at = ?5
             WHERE job_id = ?1 AND file_name = ?2 AND status = ?3",
            params![
                job_id,
                file_name,
                expected.as_str(),
                next.as_str(),
                format_timestamp(&Utc::now()),
            ],
        )?;
        Ok(changed == 1)
    })
}
