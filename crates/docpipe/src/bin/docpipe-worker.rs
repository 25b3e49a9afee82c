//! Stage worker: consumes one stage's queue until interrupted.

use std::process::ExitCode;
use std::sync::Arc;

use futures_util::FutureExt;

use docpipe::config::{self, Settings};
use docpipe::{
    CommandProcessor, ConfigError, ConsumerPool, Database, MessageHandler, PipelineContext,
    SqliteRecordStore, SqliteWorkQueue, Supervisor,
};

#[tokio::main]
async fn main() -> ExitCode {
    let settings = match config::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("docpipe-worker: {}", e);
            return ExitCode::FAILURE;
        }
    };
    docpipe::telemetry::init_tracing(settings.log_format);

    match run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Worker exited with error");
            ExitCode::FAILURE
        }
    }
}

async fn run(settings: Settings) -> docpipe::Result<()> {
    let line = settings.processor_command.as_deref().unwrap_or_default();
    let processor = CommandProcessor::from_command_line(line)
        .map_err(|e| ConfigError::InvalidValue {
            key: "DOCPIPE_PROCESSOR_COMMAND".to_string(),
            value: line.to_string(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| ConfigError::Validation {
            message: "DOCPIPE_PROCESSOR_COMMAND is required".to_string(),
        })?;

    let db_path = settings.database_path()?;
    let db = Database::open(&db_path)?;
    tracing::info!(
        stage = %settings.stage,
        queue = settings.queue_name(),
        database = %db_path.display(),
        "Starting worker"
    );

    let store = Arc::new(SqliteRecordStore::new(db.clone()));
    let queue = Arc::new(SqliteWorkQueue::new(
        db,
        settings.queue_name(),
        settings.visibility_timeout(),
    ));
    let ctx = PipelineContext::new(store).with_queue(settings.stage, queue);

    let consumer_config = settings.consumer_config();
    let handler = MessageHandler::new(&ctx, settings.stage, Arc::new(processor), &consumer_config)?;
    let pool = Arc::new(ConsumerPool::new(handler, consumer_config));

    let supervisor = Supervisor::new(
        format!("{}-worker", settings.stage),
        settings.supervisor_check_interval(),
    );
    let shutdown = supervisor.shutdown_handle();
    if let Err(e) = ctrlc::set_handler(move || {
        if shutdown.is_triggered() {
            // Second interrupt: stop waiting for in-flight work.
            std::process::exit(130);
        }
        tracing::info!("Shutdown requested, draining in-flight messages");
        shutdown.trigger();
    }) {
        tracing::warn!(error = %e, "Failed to install signal handler");
    }

    supervisor
        .run(move |rx| {
            let pool = Arc::clone(&pool);
            async move { pool.run(rx).await }.boxed()
        })
        .await;

    tracing::info!("Worker stopped");
    Ok(())
}
