//! Stage processors: the per-file transformation a consumer invokes.

mod command;

pub use command::CommandProcessor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProcessError;
use crate::model::{keys, FileRef, StageJob};

/// What a successful stage produced for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageOutput {
    Extracted { result_key: String },
    Chunked { result_key: String, chunk_count: u32 },
    Vectorized { index_id: String },
}

#[async_trait]
pub trait StageProcessor: Send + Sync {
    /// Transforms one file. Any error marks the file FAILED.
    async fn process(&self, file: &FileRef, job: &StageJob) -> Result<StageOutput, ProcessError>;
}

/// Object key the stage writes its result to, if it writes one.
pub fn result_key(file: &FileRef, job: &StageJob) -> Option<String> {
    match job {
        StageJob::Extraction => Some(keys::extraction_result_key(
            &file.tenant_id,
            &file.job_id,
            &file.file_name,
        )),
        StageJob::Chunking {
            extraction_job_id, ..
        } => Some(keys::chunk_result_key(
            &file.tenant_id,
            extraction_job_id,
            &file.file_name,
            &file.job_id,
        )),
        StageJob::Vectorization { .. } => None,
    }
}

/// Rejects source documents no extractor can read.
pub fn ensure_supported(file: &FileRef) -> Result<(), ProcessError> {
    let extension = file
        .file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    if keys::ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        Ok(())
    } else {
        Err(ProcessError::UnsupportedFileType(file.file_name.clone()))
    }
}
