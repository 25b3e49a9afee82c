pub mod admission;
pub mod broadcast;
pub mod config;
pub mod consumer;
pub mod context;
pub mod db;
pub mod error;
pub mod model;
pub mod processor;
pub mod queue;
pub mod reconciler;
pub mod retry;
pub mod store;
pub mod supervisor;
pub mod telemetry;

pub use admission::JobAdmission;
pub use broadcast::{JobEventBroadcaster, JobEventKind, JobStatusEvent};
pub use config::{LogFormat, Settings};
pub use consumer::{ConsumerConfig, ConsumerPool, MessageHandler, Outcome};
pub use context::PipelineContext;
pub use db::{Database, DatabaseError};
pub use error::{
    AdmissionError, ConfigError, ConsumerError, DocpipeError, ProcessError, QueueError, Result,
    StoreError,
};
pub use model::{
    ChunkingParams, ChunkingStrategy, FileStatus, Job, JobFile, JobStatus, Stage, StageJob,
};
pub use processor::{CommandProcessor, StageOutput, StageProcessor};
pub use queue::{DedupHints, ReceivedMessage, SqliteWorkQueue, WorkQueue};
pub use reconciler::StatusReconciler;
pub use retry::RetryPolicy;
pub use store::{RecordStore, SqliteRecordStore};
pub use supervisor::{ShutdownHandle, Supervisor};
