//! Bounded-concurrency queue consumer.
//!
//! One dequeue loop per stage leases messages and hands each to a
//! [`MessageHandler`] task. A counting semaphore caps the number of
//! in-flight tasks; the loop only leases as many messages as it has free
//! permits for, so a saturated pool stops pulling work.
//!
//! A message is deleted only after the file status and the job rollup
//! are durable. Any infrastructure failure before that leaves it in the
//! queue to be redelivered once its visibility lapses.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

use crate::context::PipelineContext;
use crate::error::{ConsumerError, DocpipeError, QueueError, StoreError};
use crate::model::{Advance, FileEvent, FileStatus, JobFile, Stage, WorkMessage};
use crate::processor::StageProcessor;
use crate::queue::{ReceivedMessage, WorkQueue};
use crate::reconciler::StatusReconciler;
use crate::retry::{with_retries, RetryPolicy};
use crate::store::RecordStore;

/// Attempts at writing a file's outcome while its status keeps moving.
const MAX_SETTLE_ATTEMPTS: u32 = 4;

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub max_concurrent_tasks: usize,
    /// Messages leased per receive call, at most.
    pub batch_size: usize,
    /// Long-poll wait per receive call.
    pub wait_time: Duration,
    /// Pause after an empty receive.
    pub poll_interval: Duration,
    /// Visibility granted to a message once a worker accepts it.
    pub visibility_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            batch_size: 3,
            wait_time: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            visibility_timeout: Duration::from_secs(600),
            retry: RetryPolicy::default(),
        }
    }
}

/// How a message was disposed of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The processor ran and the file settled in this state.
    Processed(FileStatus),
    /// The file was already terminal; the processor was skipped.
    AlreadySettled(FileStatus),
    /// Undecodable or orphaned; deleted without processing.
    Discarded,
}

/// Drives one message to a terminal outcome.
#[derive(Clone)]
pub struct MessageHandler {
    stage: Stage,
    store: Arc<dyn RecordStore>,
    queue: Arc<dyn WorkQueue>,
    processor: Arc<dyn StageProcessor>,
    reconciler: StatusReconciler,
    visibility_timeout: Duration,
    retry: RetryPolicy,
}

impl MessageHandler {
    pub fn new(
        ctx: &PipelineContext,
        stage: Stage,
        processor: Arc<dyn StageProcessor>,
        config: &ConsumerConfig,
    ) -> Result<Self, ConsumerError> {
        let queue = ctx
            .queue(stage)
            .cloned()
            .ok_or(ConsumerError::QueueNotConfigured(stage))?;
        Ok(Self {
            stage,
            store: Arc::clone(ctx.store()),
            queue,
            processor,
            reconciler: StatusReconciler::new(ctx, config.retry),
            visibility_timeout: config.visibility_timeout,
            retry: config.retry,
        })
    }

    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }

    pub async fn handle(&self, message: &ReceivedMessage) -> Result<Outcome, DocpipeError> {
        let work: WorkMessage = match serde_json::from_str(&message.body) {
            Ok(work) => work,
            Err(e) => {
                tracing::error!(
                    message_id = %message.message_id,
                    error = %e,
                    "Undecodable message, discarding"
                );
                self.delete(message).await?;
                return Ok(Outcome::Discarded);
            }
        };

        if let Err(e) = self
            .queue
            .extend_visibility(&message.receipt_handle, self.visibility_timeout)
            .await
        {
            tracing::warn!(
                message_id = %message.message_id,
                job_id = %work.job_id,
                error = %e,
                "Failed to extend visibility timeout"
            );
        }

        let file = match self.load_file(&work).await? {
            Some(file) => file,
            None => {
                tracing::error!(
                    job_id = %work.job_id,
                    file_name = %work.file_name,
                    "Message refers to an unknown file, discarding"
                );
                self.delete(message).await?;
                return Ok(Outcome::Discarded);
            }
        };

        if file.status.is_terminal() {
            tracing::info!(
                job_id = %work.job_id,
                file_name = %work.file_name,
                status = %file.status,
                receive_count = message.receive_count,
                "File already settled, skipping processor"
            );
            self.reconciler.reconcile(&work.job_id).await?;
            self.delete(message).await?;
            return Ok(Outcome::AlreadySettled(file.status));
        }

        tracing::debug!(
            stage = %self.stage,
            job_id = %work.job_id,
            file_name = %work.file_name,
            receive_count = message.receive_count,
            "Processing file"
        );
        let event = match self.processor.process(&work.file_ref(), &work.spec).await {
            Ok(output) => {
                tracing::info!(job_id = %work.job_id, file_name = %work.file_name, ?output, "File processed");
                FileEvent::Completed
            }
            Err(e) => {
                tracing::warn!(job_id = %work.job_id, file_name = %work.file_name, error = %e, "File processing failed");
                FileEvent::Failed
            }
        };

        let settled = self.settle(file, event).await?;
        self.reconciler.reconcile(&work.job_id).await?;
        self.delete(message).await?;
        Ok(Outcome::Processed(settled))
    }

    async fn load_file(&self, work: &WorkMessage) -> Result<Option<JobFile>, StoreError> {
        with_retries(&self.retry, "get_file", || {
            self.store.get_file(&work.job_id, &work.file_name)
        })
        .await
    }

    /// Writes the file's terminal status. If another worker settled it
    /// first, its status stands.
    async fn settle(&self, mut file: JobFile, event: FileEvent) -> Result<FileStatus, StoreError> {
        for _ in 0..MAX_SETTLE_ATTEMPTS {
            let next = match file.status.advance(&event) {
                Ok(next) => next,
                Err(_) => return Ok(file.status),
            };
            if next == file.status {
                return Ok(next);
            }

            let from = file.status;
            let write = with_retries(&self.retry, "update_file_status", || {
                self.store
                    .update_file_status(&file.job_id, &file.file_name, from, next)
            })
            .await;
            match write {
                Ok(()) => return Ok(next),
                Err(StoreError::Conflict(_)) => {
                    file = self
                        .store
                        .get_file(&file.job_id, &file.file_name)
                        .await?
                        .ok_or_else(|| {
                            StoreError::NotFound(format!("file {} in job {}", file.file_name, file.job_id))
                        })?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::Conflict(format!(
            "file {} in job {} kept changing",
            file.file_name, file.job_id
        )))
    }

    async fn delete(&self, message: &ReceivedMessage) -> Result<(), QueueError> {
        match with_retries(&self.retry, "delete", || {
            self.queue.delete(&message.receipt_handle)
        })
        .await
        {
            Ok(()) => Ok(()),
            Err(QueueError::InvalidReceiptHandle(_)) => {
                // Lease lapsed; the redelivered copy will be skipped as settled.
                tracing::warn!(message_id = %message.message_id, "Receipt handle expired before delete");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// The dequeue loop plus its semaphore-bounded task set.
pub struct ConsumerPool {
    handler: MessageHandler,
    config: ConsumerConfig,
    semaphore: Arc<Semaphore>,
}

impl ConsumerPool {
    pub fn new(handler: MessageHandler, config: ConsumerConfig) -> Self {
        let permits = config.max_concurrent_tasks.max(1);
        Self {
            handler,
            config,
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Tasks currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.config.max_concurrent_tasks.max(1) - self.semaphore.available_permits()
    }

    /// Runs until `shutdown` turns true (or its sender is dropped), then
    /// waits for in-flight messages. Fails only when the queue stays
    /// unreachable after retries.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ConsumerError> {
        tracing::info!(
            stage = %self.handler.stage,
            max_concurrent_tasks = self.config.max_concurrent_tasks,
            batch_size = self.config.batch_size,
            "Consumer loop started"
        );

        let mut tasks = JoinSet::new();
        let result = self.dequeue_loop(&mut shutdown, &mut tasks).await;

        let pending = tasks.len();
        if pending > 0 {
            tracing::info!(pending, "Waiting for in-flight messages");
        }
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }

        tracing::info!(stage = %self.handler.stage, "Consumer loop stopped");
        result
    }

    async fn dequeue_loop(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        tasks: &mut JoinSet<()>,
    ) -> Result<(), ConsumerError> {
        loop {
            while let Some(joined) = tasks.try_join_next() {
                log_join(joined);
            }

            // Hold one permit before leasing so every leased message can start.
            let first = tokio::select! {
                permit = Arc::clone(&self.semaphore).acquire_owned() => {
                    permit.map_err(|_| ConsumerError::SemaphoreClosed)?
                }
                _ = stop_signal(shutdown) => return Ok(()),
            };
            let capacity = (self.semaphore.available_permits() + 1).min(self.config.batch_size.max(1));

            let received = tokio::select! {
                received = with_retries(&self.config.retry, "receive", || {
                    self.handler.queue.receive(capacity, self.config.wait_time)
                }) => received?,
                _ = stop_signal(shutdown) => return Ok(()),
            };

            if received.is_empty() {
                drop(first);
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = stop_signal(shutdown) => return Ok(()),
                }
                continue;
            }

            tracing::debug!(count = received.len(), "Received messages");
            let mut first = Some(first);
            for message in received {
                let permit = match first.take() {
                    Some(permit) => permit,
                    None => self.next_permit().await?,
                };
                let handler = self.handler.clone();
                tasks.spawn(run_message(handler, message, permit));
            }
        }
    }

    async fn next_permit(&self) -> Result<OwnedSemaphorePermit, ConsumerError> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(permit),
            Err(_) => Arc::clone(&self.semaphore)
                .acquire_owned()
                .await
                .map_err(|_| ConsumerError::SemaphoreClosed),
        }
    }
}

/// One spawned unit of work. The permit is released when this returns,
/// whichever way it returns.
async fn run_message(handler: MessageHandler, message: ReceivedMessage, _permit: OwnedSemaphorePermit) {
    match handler.handle(&message).await {
        Ok(outcome) => {
            tracing::debug!(message_id = %message.message_id, ?outcome, "Message done");
        }
        Err(e) => {
            tracing::error!(
                message_id = %message.message_id,
                receive_count = message.receive_count,
                error = %e,
                "Message left for redelivery"
            );
        }
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "Message task panicked");
    }
}

/// Resolves once shutdown is requested or the sender is gone.
pub(crate) async fn stop_signal(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::JobAdmission;
    use crate::db::Database;
    use crate::error::ProcessError;
    use crate::model::{FileRef, JobStatus, StageJob};
    use crate::processor::StageOutput;
    use crate::queue::{DedupHints, SqliteWorkQueue};
    use crate::store::SqliteRecordStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails files whose name starts with "bad", and records peak concurrency.
    struct TestProcessor {
        delay: Duration,
        active: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    impl TestProcessor {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl StageProcessor for TestProcessor {
        async fn process(&self, file: &FileRef, _job: &StageJob) -> Result<StageOutput, ProcessError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if file.file_name.starts_with("bad") {
                Err(ProcessError::Failed("scripted failure".into()))
            } else {
                Ok(StageOutput::Extracted {
                    result_key: file.file_path.clone(),
                })
            }
        }
    }

    struct Harness {
        ctx: PipelineContext,
        admission: JobAdmission,
        queue: SqliteWorkQueue,
    }

    fn harness() -> Harness {
        let db = Database::open_in_memory().unwrap();
        let store: Arc<dyn RecordStore> = Arc::new(SqliteRecordStore::new(db.clone()));
        let queue = SqliteWorkQueue::new(db, "extraction", Duration::from_secs(60));
        let ctx = PipelineContext::new(store).with_queue(Stage::Extraction, Arc::new(queue.clone()));
        Harness {
            admission: JobAdmission::new(ctx.clone(), RetryPolicy::new(0)),
            ctx,
            queue,
        }
    }

    fn config(max_concurrent_tasks: usize) -> ConsumerConfig {
        ConsumerConfig {
            max_concurrent_tasks,
            batch_size: 10,
            wait_time: Duration::from_millis(20),
            poll_interval: Duration::from_millis(10),
            visibility_timeout: Duration::from_secs(60),
            retry: RetryPolicy::new(0),
        }
    }

    async fn started_job(h: &Harness, names: &[&str]) -> String {
        let job = h.admission.create_job("acme").await.unwrap();
        for name in names {
            h.admission.register_file("acme", &job.job_id, name, None).await.unwrap();
        }
        h.admission.start_job("acme", &job.job_id).await.unwrap();
        job.job_id
    }

    async fn wait_terminal(h: &Harness, job_id: &str) -> crate::model::Job {
        for _ in 0..500 {
            let job = h.ctx.store().get_job(job_id).await.unwrap().unwrap();
            if job.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached a terminal status", job_id);
    }

    #[tokio::test]
    async fn test_handle_success_settles_and_deletes() {
        let h = harness();
        let job_id = started_job(&h, &["a.pdf"]).await;
        let handler = MessageHandler::new(&h.ctx, Stage::Extraction, TestProcessor::new(Duration::ZERO), &config(1)).unwrap();

        let msgs = h.queue.receive(1, Duration::ZERO).await.unwrap();
        let outcome = handler.handle(&msgs[0]).await.unwrap();
        assert_eq!(outcome, Outcome::Processed(FileStatus::Completed));
        assert_eq!(h.queue.depth().await.unwrap(), 0);

        let job = h.ctx.store().get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.completed_file_count, 1);
    }

    #[tokio::test]
    async fn test_redelivered_settled_file_is_not_reprocessed() {
        let h = harness();
        let job_id = started_job(&h, &["bad.pdf"]).await;
        let processor = TestProcessor::new(Duration::ZERO);
        let handler = MessageHandler::new(&h.ctx, Stage::Extraction, processor.clone(), &config(1)).unwrap();

        let msgs = h.queue.receive(1, Duration::ZERO).await.unwrap();
        let body = msgs[0].body.clone();
        assert_eq!(
            handler.handle(&msgs[0]).await.unwrap(),
            Outcome::Processed(FileStatus::Failed)
        );

        // Same message body delivered again.
        h.queue.send(&body, &DedupHints::default()).await.unwrap();
        let again = h.queue.receive(1, Duration::ZERO).await.unwrap();
        assert_eq!(
            handler.handle(&again[0]).await.unwrap(),
            Outcome::AlreadySettled(FileStatus::Failed)
        );
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);

        let job = h.ctx.store().get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failed_file_count, 1);
    }

    #[tokio::test]
    async fn test_poison_messages_are_discarded() {
        let h = harness();
        let handler = MessageHandler::new(&h.ctx, Stage::Extraction, TestProcessor::new(Duration::ZERO), &config(1)).unwrap();

        h.queue.send("not json", &DedupHints::default()).await.unwrap();
        let orphan = WorkMessage {
            job_id: "ghost".into(),
            tenant_id: "acme".into(),
            file_name: "a.pdf".into(),
            file_path: "acme/ghost/a.pdf".into(),
            spec: StageJob::Extraction,
        };
        h.queue
            .send(&serde_json::to_string(&orphan).unwrap(), &DedupHints::default())
            .await
            .unwrap();

        for msg in h.queue.receive(10, Duration::ZERO).await.unwrap() {
            assert_eq!(handler.handle(&msg).await.unwrap(), Outcome::Discarded);
        }
        assert_eq!(h.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pool_respects_concurrency_cap() {
        let h = harness();
        let names: Vec<String> = (0..12).map(|i| format!("f{}.pdf", i)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let job_id = started_job(&h, &refs).await;

        let processor = TestProcessor::new(Duration::from_millis(30));
        let handler = MessageHandler::new(&h.ctx, Stage::Extraction, processor.clone(), &config(3)).unwrap();
        let pool = Arc::new(ConsumerPool::new(handler, config(3)));

        let (tx, rx) = watch::channel(false);
        let runner = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.run(rx).await })
        };

        let job = wait_terminal(&h, &job_id).await;
        tx.send(true).unwrap();
        runner.await.unwrap().unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.completed_file_count, 12);
        assert!(processor.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_loop() {
        let h = harness();
        let handler = MessageHandler::new(&h.ctx, Stage::Extraction, TestProcessor::new(Duration::ZERO), &config(2)).unwrap();
        let pool = ConsumerPool::new(handler, config(2));

        let (tx, rx) = watch::channel(false);
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(true).unwrap();
        });
        tokio::time::timeout(Duration::from_secs(5), pool.run(rx))
            .await
            .expect("loop did not stop")
            .unwrap();
        stopper.await.unwrap();
    }

    #[test]
    fn test_handler_requires_a_queue() {
        let db = Database::open_in_memory().unwrap();
        let ctx = PipelineContext::new(Arc::new(SqliteRecordStore::new(db)));
        let err = MessageHandler::new(&ctx, Stage::Chunking, TestProcessor::new(Duration::ZERO), &config(1));
        assert!(matches!(err, Err(ConsumerError::QueueNotConfigured(Stage::Chunking))));
    }
}
