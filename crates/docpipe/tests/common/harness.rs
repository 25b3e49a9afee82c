//! Test harness backed by a database file in a temp directory.
//!
//! Every call to [`PipelineHarness::worker_context`] opens its own
//! connection to the same file, so two contexts behave like two worker
//! processes sharing one record store and queue.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use docpipe::model::FileRef;
use docpipe::{
    ConsumerConfig, ConsumerPool, Database, Job, JobAdmission, MessageHandler, PipelineContext,
    ProcessError, RetryPolicy, SqliteRecordStore, SqliteWorkQueue, Stage, StageJob, StageOutput,
    StageProcessor,
};

pub const TENANT: &str = "acme";

/// Fails files whose name starts with "bad" and counts calls per file.
pub struct ScriptedProcessor {
    delay: Duration,
    calls: Mutex<HashMap<String, usize>>,
    active: AtomicUsize,
    pub peak: AtomicUsize,
}

impl ScriptedProcessor {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            calls: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    pub fn calls_for(&self, file_name: &str) -> usize {
        self.calls.lock().unwrap().get(file_name).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl StageProcessor for ScriptedProcessor {
    async fn process(&self, file: &FileRef, job: &StageJob) -> Result<StageOutput, ProcessError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(file.file_name.clone())
            .or_default() += 1;
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        if file.file_name.starts_with("bad") {
            return Err(ProcessError::Failed(format!("cannot read {}", file.file_name)));
        }
        Ok(match job {
            StageJob::Extraction => StageOutput::Extracted {
                result_key: format!("{}.json", file.file_path),
            },
            StageJob::Chunking { .. } => StageOutput::Chunked {
                result_key: format!("{}.chunks", file.file_path),
                chunk_count: 4,
            },
            StageJob::Vectorization { index_id, .. } => StageOutput::Vectorized {
                index_id: index_id.clone(),
            },
        })
    }
}

pub struct PipelineHarness {
    _temp_dir: TempDir,
    pub db_path: PathBuf,
    pub ctx: PipelineContext,
    pub admission: JobAdmission,
}

impl PipelineHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("data").join("docpipe.db");
        let db = Database::open(&db_path).expect("Failed to open database");
        let ctx = context_for(db);
        Self {
            _temp_dir: temp_dir,
            db_path,
            admission: JobAdmission::new(ctx.clone(), RetryPolicy::new(2)),
            ctx,
        }
    }

    /// A context on a fresh connection, as a separate worker would build.
    pub fn worker_context(&self) -> PipelineContext {
        let db = Database::open(&self.db_path).expect("Failed to open database");
        context_for(db)
    }

    pub fn queue(&self, stage: Stage) -> SqliteWorkQueue {
        self.queue_with_visibility(stage, Duration::from_secs(60))
    }

    pub fn queue_with_visibility(&self, stage: Stage, visibility: Duration) -> SqliteWorkQueue {
        let db = Database::open(&self.db_path).expect("Failed to open database");
        SqliteWorkQueue::new(db, stage.as_str(), visibility)
    }

    pub fn pool(
        &self,
        ctx: &PipelineContext,
        stage: Stage,
        processor: Arc<ScriptedProcessor>,
        max_concurrent_tasks: usize,
    ) -> Arc<ConsumerPool> {
        let config = consumer_config(max_concurrent_tasks);
        let handler = MessageHandler::new(ctx, stage, processor, &config).expect("queue configured");
        Arc::new(ConsumerPool::new(handler, config))
    }

    pub async fn started_job(&self, names: &[&str]) -> Job {
        let job = self.admission.create_job(TENANT).await.unwrap();
        for name in names {
            self.admission
                .register_file(TENANT, &job.job_id, name, None)
                .await
                .unwrap();
        }
        self.admission.start_job(TENANT, &job.job_id).await.unwrap()
    }

    pub async fn wait_terminal(&self, job_id: &str) -> Job {
        for _ in 0..1000 {
            let job = self.admission.job_status(TENANT, job_id).await.unwrap();
            if job.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached a terminal status", job_id);
    }
}

pub fn consumer_config(max_concurrent_tasks: usize) -> ConsumerConfig {
    ConsumerConfig {
        max_concurrent_tasks,
        batch_size: 10,
        wait_time: Duration::from_millis(50),
        poll_interval: Duration::from_millis(10),
        visibility_timeout: Duration::from_secs(60),
        retry: RetryPolicy::new(5),
    }
}

fn context_for(db: Database) -> PipelineContext {
    let store = Arc::new(SqliteRecordStore::new(db.clone()));
    let mut ctx = PipelineContext::new(store);
    for stage in Stage::ALL {
        let queue = SqliteWorkQueue::new(db.clone(), stage.as_str(), Duration::from_secs(60));
        ctx = ctx.with_queue(stage, Arc::new(queue));
    }
    ctx
}
