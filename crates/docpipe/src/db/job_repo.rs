//! Job repository: the `jobs` table.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Database, DatabaseError};
use crate::model::{Job, JobStatus, Stage, StageJob};

/// A raw job row.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub job_id: String,
    pub tenant_id: String,
    pub stage: String,
    pub upstream_job_id: Option<String>,
    pub spec: String,
    pub status: String,
    pub total_file_count: u32,
    pub queued_files: u32,
    pub completed_file_count: u32,
    pub failed_file_count: u32,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            job_id: row.get("job_id")?,
            tenant_id: row.get("tenant_id")?,
            stage: row.get("stage")?,
            upstream_job_id: row.get("upstream_job_id")?,
            spec: row.get("spec")?,
            status: row.get("status")?,
            total_file_count: row.get("total_file_count")?,
            queued_files: row.get("queued_files")?,
            completed_file_count: row.get("completed_file_count")?,
            failed_file_count: row.get("failed_file_count")?,
            version: row.get("version")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    pub fn from_job(job: &Job) -> Result<Self, DatabaseError> {
        let spec = serde_json::to_string(&job.spec).map_err(|e| DatabaseError::Corrupt {
            column: "spec",
            reason: e.to_string(),
        })?;
        Ok(Self {
            job_id: job.job_id.clone(),
            tenant_id: job.tenant_id.clone(),
            stage: job.stage().as_str().to_string(),
            upstream_job_id: job.spec.upstream_job_id().map(str::to_string),
            spec,
            status: job.status.as_str().to_string(),
            total_file_count: job.total_file_count,
            queued_files: job.queued_files,
            completed_file_count: job.completed_file_count,
            failed_file_count: job.failed_file_count,
            version: job.version,
            created_at: format_timestamp(&job.created_at),
            updated_at: format_timestamp(&job.updated_at),
        })
    }

    pub fn into_job(self) -> Result<Job, DatabaseError> {
        let spec: StageJob =
            serde_json::from_str(&self.spec).map_err(|e| DatabaseError::Corrupt {
                column: "spec",
                reason: e.to_string(),
            })?;
        let status: JobStatus = self
            .status
            .parse()
            .map_err(|reason| DatabaseError::Corrupt {
                column: "status",
                reason,
            })?;
        Ok(Job {
            job_id: self.job_id,
            tenant_id: self.tenant_id,
            spec,
            status,
            total_file_count: self.total_file_count,
            queued_files: self.queued_files,
            completed_file_count: self.completed_file_count,
            failed_file_count: self.failed_file_count,
            version: self.version,
            created_at: parse_timestamp("created_at", &self.created_at)?,
            updated_at: parse_timestamp("updated_at", &self.updated_at)?,
        })
    }
}

/// Fixed-width UTC form, so the TEXT column sorts in time order.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(
    column: &'static str,
    value: &str,
) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Corrupt {
            column,
            reason: e.to_string(),
        })
}

pub fn insert(db: &Database, job: &Job) -> Result<(), DatabaseError> {
    let row = JobRow::from_job(job)?;
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO jobs (job_id, tenant_id, stage, upstream_job_id, spec, status,
             total_file_count, queued_files, completed_file_count, failed_file_count,
             version, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                row.job_id,
                row.tenant_id,
                row.stage,
                row.upstream_job_id,
                row.spec,
                row.status,
                row.total_file_count,
                row.queued_files,
                row.completed_file_count,
                row.failed_file_count,
                row.version,
                row.created_at,
                row.updated_at,
            ],
        )?;
        Ok(())
    })
}

pub fn find_by_id(db: &Database, job_id: &str) -> Result<Option<Job>, DatabaseError> {
    db.with_conn(|conn| find_in(conn, job_id))
}

/// Lookup usable inside an open transaction.
pub(crate) fn find_in(conn: &Connection, job_id: &str) -> Result<Option<Job>, DatabaseError> {
    conn.query_row(
        "SELECT * FROM jobs WHERE job_id = ?1",
        params![job_id],
        JobRow::from_row,
    )
    .optional()?
    .map(JobRow::into_job)
    .transpose()
}

/// Writes the mutable fields of `job` only if the stored version still
/// equals `job.version`. On success the stored version is `job.version + 1`.
///
/// Returns false when another writer got there first.
pub fn update_if_version(db: &Database, job: &Job) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = ?3, total_file_count = ?4, queued_files = ?5,
             completed_file_count = ?6, failed_file_count = ?7, updated_at = ?8,
             version = version + 1
             WHERE job_id = ?1 AND version = ?2",
            params![
                job.job_id,
                job.version,
                job.status.as_str(),
                job.total_file_count,
                job.queued_files,
                job.completed_file_count,
                job.failed_file_count,
                format_timestamp(&job.updated_at),
            ],
        )?;
        Ok(changed == 1)
    })
}

/// Jobs owned by `tenant_id`, newest first, optionally limited to one stage.
pub fn list_for_tenant(
    db: &Database,
    tenant_id: &str,
    stage: Option<Stage>,
) -> Result<Vec<Job>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs WHERE tenant_id = ?1 AND (?2 IS NULL OR stage = ?2)
             ORDER BY created_at DESC, job_id",
        )?;
        let rows = stmt
            .query_map(
                params![tenant_id, stage.map(|s| s.as_str())],
                JobRow::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(JobRow::into_job).collect()
    })
}

/// Jobs of `stage` that consume the output of `upstream_job_id`.
pub fn list_by_upstream(
    db: &Database,
    stage: Stage,
    upstream_job_id: &str,
) -> Result<Vec<Job>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs WHERE stage = ?1 AND upstream_job_id = ?2
             ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map(params![stage.as_str(), upstream_job_id], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(JobRow::into_job).collect()
    })
}
