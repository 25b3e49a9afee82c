//! Job admission and status queries.
//!
//! Every operation is scoped to the calling tenant. Admission errors are
//! returned synchronously and leave no side effects; infrastructure
//! errors are passed through.

use std::sync::Arc;

use crate::broadcast::JobEventKind;
use crate::context::PipelineContext;
use crate::error::{AdmissionError, StoreError};
use crate::model::{
    keys, ChunkingParams, ChunkingStrategy, FileStatus, Job, JobFile, JobStatus, Stage, StageJob,
    WorkMessage,
};
use crate::queue::{DedupHints, WorkQueue};
use crate::retry::{with_retries, RetryPolicy};

/// Attempts at flipping a job to STARTED while files are still arriving.
const MAX_START_ATTEMPTS: u32 = 8;

#[derive(Clone)]
pub struct JobAdmission {
    ctx: PipelineContext,
    retry: RetryPolicy,
}

impl JobAdmission {
    pub fn new(ctx: PipelineContext, retry: RetryPolicy) -> Self {
        Self { ctx, retry }
    }

    /// Creates an empty extraction job.
    pub async fn create_job(&self, tenant_id: &str) -> Result<Job, AdmissionError> {
        self.insert_job(tenant_id, StageJob::Extraction).await
    }

    async fn insert_job(&self, tenant_id: &str, spec: StageJob) -> Result<Job, AdmissionError> {
        let job = Job::new(tenant_id, spec);
        self.ctx.store().create_job(&job).await?;
        tracing::info!(job_id = %job.job_id, tenant_id, stage = %job.stage(), "Job created");
        self.ctx.events().job_changed(&job, JobEventKind::Created);
        Ok(job)
    }

    /// Adds a PENDING file to a CREATED job. `file_path` defaults to the
    /// tenant's upload key for the file.
    pub async fn register_file(
        &self,
        tenant_id: &str,
        job_id: &str,
        file_name: &str,
        file_path: Option<&str>,
    ) -> Result<JobFile, AdmissionError> {
        keys::validate_file_name(file_name).map_err(|reason| AdmissionError::InvalidFileName {
            file_name: file_name.to_string(),
            reason,
        })?;
        self.register_unchecked(tenant_id, job_id, file_name, file_path)
            .await
    }

    /// Registration without name validation, for derived jobs whose file
    /// names come from an upstream job.
    async fn register_unchecked(
        &self,
        tenant_id: &str,
        job_id: &str,
        file_name: &str,
        file_path: Option<&str>,
    ) -> Result<JobFile, AdmissionError> {
        let job = self.authorized_job(tenant_id, job_id).await?;
        if job.status != JobStatus::Created {
            return Err(not_created(&job, "files can only be added before the job starts"));
        }

        let path = file_path
            .map(str::to_string)
            .unwrap_or_else(|| keys::source_key(tenant_id, job_id, file_name));
        let file = JobFile::new(job_id, file_name, &path);

        match self.ctx.store().register_file(&file).await {
            Ok(updated) => {
                tracing::debug!(job_id, file_name, total = updated.total_file_count, "File registered");
                self.ctx
                    .events()
                    .job_changed(&updated, JobEventKind::FileRegistered);
                Ok(file)
            }
            Err(StoreError::Duplicate(_)) => Err(AdmissionError::Duplicate {
                job_id: job_id.to_string(),
                file_name: file_name.to_string(),
            }),
            Err(StoreError::NotFound(_)) => Err(AdmissionError::JobNotFound(job_id.to_string())),
            Err(StoreError::Conflict(_)) => {
                // Started between our read and the insert.
                let job = self.authorized_job(tenant_id, job_id).await?;
                Err(not_created(&job, "files can only be added before the job starts"))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Moves a CREATED job with at least one file to STARTED and enqueues
    /// one message per file.
    pub async fn start_job(&self, tenant_id: &str, job_id: &str) -> Result<Job, AdmissionError> {
        let queue = Arc::clone(self.queue_for_job(tenant_id, job_id).await?.1);

        let mut started = None;
        for _ in 0..MAX_START_ATTEMPTS {
            let job = self.authorized_job(tenant_id, job_id).await?;
            if job.status != JobStatus::Created {
                return Err(not_created(&job, "job has already been started"));
            }
            if job.total_file_count == 0 {
                return Err(AdmissionError::InvalidState {
                    job_id: job.job_id.clone(),
                    status: job.status,
                    reason: "job has no files".to_string(),
                });
            }

            let next = job.started().map_err(|e| AdmissionError::InvalidState {
                job_id: job.job_id.clone(),
                status: job.status,
                reason: e.to_string(),
            })?;
            match self.ctx.store().update_job(&next).await {
                Ok(stored) => {
                    started = Some(stored);
                    break;
                }
                Err(StoreError::Conflict(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let job = started.ok_or_else(|| {
            AdmissionError::Store(StoreError::Conflict(format!(
                "job {} kept changing while starting",
                job_id
            )))
        })?;

        tracing::info!(job_id, files = job.total_file_count, stage = %job.stage(), "Job started");
        self.ctx.events().job_changed(&job, JobEventKind::Started);

        self.dispatch_pending(&job, queue.as_ref()).await?;
        Ok(job)
    }

    /// Re-enqueues the PENDING files of a STARTED or IN_PROGRESS job, for
    /// recovery after a start that stopped part way. Returns how many
    /// files were dispatched.
    pub async fn resume_job(&self, tenant_id: &str, job_id: &str) -> Result<usize, AdmissionError> {
        let (job, queue) = self.queue_for_job(tenant_id, job_id).await?;
        if !matches!(job.status, JobStatus::Started | JobStatus::InProgress) {
            return Err(AdmissionError::InvalidState {
                job_id: job.job_id.clone(),
                status: job.status,
                reason: "only running jobs can be resumed".to_string(),
            });
        }
        let queue = Arc::clone(queue);
        let dispatched = self.dispatch_pending(&job, queue.as_ref()).await?;
        if dispatched > 0 {
            tracing::warn!(job_id, dispatched, "Resumed job with undispatched files");
        }
        Ok(dispatched)
    }

    /// Sends one message per PENDING file, then marks it QUEUED.
    ///
    /// The send is deduplicated on `(job, file)`, so running this twice
    /// for the same file leaves one live message.
    async fn dispatch_pending(&self, job: &Job, queue: &dyn WorkQueue) -> Result<usize, AdmissionError> {
        let files = self.ctx.store().files_for_job(&job.job_id).await?;
        let mut dispatched = 0;

        for file in files.iter().filter(|f| f.status == FileStatus::Pending) {
            let message = WorkMessage::for_file(job, file);
            let body = serde_json::to_string(&message).map_err(StoreError::from)?;
            let hints = DedupHints::new(&job.job_id, message.dedup_id());

            with_retries(&self.retry, "send", || queue.send(&body, &hints)).await?;

            match self
                .ctx
                .store()
                .update_file_status(&job.job_id, &file.file_name, FileStatus::Pending, FileStatus::Queued)
                .await
            {
                Ok(()) => {}
                // A consumer already settled it.
                Err(StoreError::Conflict(_)) => {
                    tracing::debug!(job_id = %job.job_id, file_name = %file.file_name, "File advanced before it was marked queued");
                }
                Err(e) => return Err(e.into()),
            }
            dispatched += 1;
        }

        Ok(dispatched)
    }

    /// Creates and starts a chunking job over the completed files of an
    /// extraction job.
    pub async fn create_chunking_job(
        &self,
        tenant_id: &str,
        extraction_job_id: &str,
        strategy: ChunkingStrategy,
        params: ChunkingParams,
    ) -> Result<Job, AdmissionError> {
        params.validate().map_err(AdmissionError::InvalidParams)?;

        let upstream = self.authorized_job(tenant_id, extraction_job_id).await?;
        require_usable(&upstream, Stage::Extraction)?;

        let running = self
            .ctx
            .store()
            .jobs_for_upstream(Stage::Chunking, extraction_job_id)
            .await?;
        if let Some(active) = running.iter().find(|j| !j.is_terminal()) {
            return Err(AdmissionError::InvalidState {
                job_id: active.job_id.clone(),
                status: active.status,
                reason: format!(
                    "a chunking job for extraction job {} is still running",
                    extraction_job_id
                ),
            });
        }

        let inputs = self.completed_files(&upstream).await?;
        let job = self
            .insert_job(
                tenant_id,
                StageJob::Chunking {
                    extraction_job_id: extraction_job_id.to_string(),
                    strategy,
                    params,
                },
            )
            .await?;

        for file in &inputs {
            let path = keys::extraction_result_key(tenant_id, extraction_job_id, &file.file_name);
            self.register_unchecked(tenant_id, &job.job_id, &file.file_name, Some(&path))
                .await?;
        }
        self.start_job(tenant_id, &job.job_id).await
    }

    /// Creates and starts a vectorization job over the chunk outputs of a
    /// chunking job.
    pub async fn create_vectorization_job(
        &self,
        tenant_id: &str,
        chunking_job_id: &str,
        index_id: &str,
    ) -> Result<Job, AdmissionError> {
        if index_id.trim().is_empty() {
            return Err(AdmissionError::InvalidParams("index_id is required".to_string()));
        }

        let upstream = self.authorized_job(tenant_id, chunking_job_id).await?;
        require_usable(&upstream, Stage::Chunking)?;
        let extraction_job_id = upstream.spec.upstream_job_id().unwrap_or_default().to_string();

        let inputs = self.completed_files(&upstream).await?;
        let job = self
            .insert_job(
                tenant_id,
                StageJob::Vectorization {
                    chunking_job_id: chunking_job_id.to_string(),
                    index_id: index_id.to_string(),
                },
            )
            .await?;

        for file in &inputs {
            let path = keys::chunk_result_key(
                tenant_id,
                &extraction_job_id,
                &file.file_name,
                chunking_job_id,
            );
            self.register_unchecked(tenant_id, &job.job_id, &file.file_name, Some(&path))
                .await?;
        }
        self.start_job(tenant_id, &job.job_id).await
    }

    pub async fn job_status(&self, tenant_id: &str, job_id: &str) -> Result<Job, AdmissionError> {
        self.authorized_job(tenant_id, job_id).await
    }

    pub async fn job_files(&self, tenant_id: &str, job_id: &str) -> Result<Vec<JobFile>, AdmissionError> {
        self.authorized_job(tenant_id, job_id).await?;
        Ok(self.ctx.store().files_for_job(job_id).await?)
    }

    pub async fn file_status(
        &self,
        tenant_id: &str,
        job_id: &str,
        file_name: &str,
    ) -> Result<JobFile, AdmissionError> {
        self.authorized_job(tenant_id, job_id).await?;
        self.ctx
            .store()
            .get_file(job_id, file_name)
            .await?
            .ok_or_else(|| AdmissionError::FileNotFound {
                job_id: job_id.to_string(),
                file_name: file_name.to_string(),
            })
    }

    /// The tenant's jobs, newest first.
    pub async fn list_jobs(&self, tenant_id: &str, stage: Option<Stage>) -> Result<Vec<Job>, AdmissionError> {
        Ok(self.ctx.store().jobs_for_tenant(tenant_id, stage).await?)
    }

    async fn authorized_job(&self, tenant_id: &str, job_id: &str) -> Result<Job, AdmissionError> {
        let job = self
            .ctx
            .store()
            .get_job(job_id)
            .await?
            .ok_or_else(|| AdmissionError::JobNotFound(job_id.to_string()))?;
        if job.tenant_id != tenant_id {
            tracing::warn!(job_id, tenant_id, "Job requested by a different tenant");
            return Err(AdmissionError::Forbidden {
                job_id: job_id.to_string(),
                tenant_id: tenant_id.to_string(),
            });
        }
        Ok(job)
    }

    async fn queue_for_job(
        &self,
        tenant_id: &str,
        job_id: &str,
    ) -> Result<(Job, &Arc<dyn WorkQueue>), AdmissionError> {
        let job = self.authorized_job(tenant_id, job_id).await?;
        let queue = self
            .ctx
            .queue(job.stage())
            .ok_or(AdmissionError::QueueNotConfigured(job.stage()))?;
        Ok((job, queue))
    }

    async fn completed_files(&self, upstream: &Job) -> Result<Vec<JobFile>, AdmissionError> {
        let files: Vec<JobFile> = self
            .ctx
            .store()
            .files_for_job(&upstream.job_id)
            .await?
            .into_iter()
            .filter(|f| f.status == FileStatus::Completed)
            .collect();
        if files.is_empty() {
            return Err(AdmissionError::InvalidState {
                job_id: upstream.job_id.clone(),
                status: upstream.status,
                reason: "job has no completed files".to_string(),
            });
        }
        Ok(files)
    }
}

fn not_created(job: &Job, reason: &str) -> AdmissionError {
    AdmissionError::InvalidState {
        job_id: job.job_id.clone(),
        status: job.status,
        reason: reason.to_string(),
    }
}

fn require_usable(upstream: &Job, stage: Stage) -> Result<(), AdmissionError> {
    if upstream.stage() != stage {
        return Err(AdmissionError::InvalidParams(format!(
            "job {} is a {} job, expected {}",
            upstream.job_id,
            upstream.stage(),
            stage
        )));
    }
    if !upstream.status.has_usable_output() {
        return Err(AdmissionError::InvalidState {
            job_id: upstream.job_id.clone(),
            status: upstream.status,
            reason: "job must be COMPLETED or COMPLETED_WITH_ERRORS".to_string(),
        });
    }
    Ok(())
}
