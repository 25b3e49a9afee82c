use std::path::PathBuf;
use thiserror::Error;

use crate::model::{JobStatus, Stage};

#[derive(Error, Debug)]
pub enum DocpipeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Admission error: {0}")]
    Admission(#[from] AdmissionError),

    #[error("Record store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Processing error: {0}")]
    Process(#[from] ProcessError),

    #[error("Consumer error: {0}")]
    Consumer(#[from] ConsumerError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

/// Rejections returned synchronously by job admission and status queries.
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("File '{file_name}' not found in job {job_id}")]
    FileNotFound { job_id: String, file_name: String },

    #[error("Job {job_id} does not belong to tenant {tenant_id}")]
    Forbidden { job_id: String, tenant_id: String },

    #[error("Job {job_id} is {status}: {reason}")]
    InvalidState {
        job_id: String,
        status: JobStatus,
        reason: String,
    },

    #[error("A file named '{file_name}' is already registered for job {job_id}")]
    Duplicate { job_id: String, file_name: String },

    #[error("Invalid file name '{file_name}': {reason}")]
    InvalidFileName { file_name: String, reason: String },

    #[error("Invalid stage parameters: {0}")]
    InvalidParams(String),

    #[error("No work queue configured for the {0} stage")]
    QueueNotConfigured(Stage),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Record already exists: {0}")]
    Duplicate(String),

    /// A conditional write lost against a concurrent writer. Not
    /// retryable as is; callers re-read first.
    #[error("Conditional write rejected for {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Failed to (de)serialize record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Blocking store task failed: {0}")]
    Task(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Database(e) => e.is_retryable(),
            StoreError::Task(_) => true,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Receipt handle is not valid (message deleted or redelivered): {0}")]
    InvalidReceiptHandle(String),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Blocking queue task failed: {0}")]
    Task(String),
}

impl QueueError {
    pub fn is_retryable(&self) -> bool {
        match self {
            QueueError::Database(e) => e.is_retryable(),
            QueueError::Task(_) => true,
            _ => false,
        }
    }
}

/// Failures reported by a stage processor. Every variant marks the file FAILED.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("Processor command exited with {status}: {stderr}")]
    Command { status: String, stderr: String },

    #[error("Failed to spawn processor command '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Processing failed: {0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Queue unavailable after retries: {0}")]
    Queue(#[from] QueueError),

    #[error("Concurrency limiter closed")]
    SemaphoreClosed,

    #[error("No work queue configured for the {0} stage")]
    QueueNotConfigured(Stage),
}

pub type Result<T> = std::result::Result<T, DocpipeError>;
