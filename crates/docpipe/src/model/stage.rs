//! Pipeline stages and the per-stage parameters a job carries.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One of the three structurally identical pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extraction,
    Chunking,
    Vectorization,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Extraction, Stage::Chunking, Stage::Vectorization];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extraction => "extraction",
            Stage::Chunking => "chunking",
            Stage::Vectorization => "vectorization",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "extraction" => Ok(Stage::Extraction),
            "chunking" => Ok(Stage::Chunking),
            "vectorization" => Ok(Stage::Vectorization),
            other => Err(format!("unknown stage '{}'", other)),
        }
    }
}

/// Text splitting strategy requested for a chunking job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkingStrategy {
    FixedSize,
    Recursive,
    Page,
}

pub const DEFAULT_CHUNK_SIZE: u32 = 1000;
pub const DEFAULT_CHUNK_OVERLAP: u32 = 0;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_overlap: Option<u32>,
}

impl ChunkingParams {
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE)
    }

    pub fn chunk_overlap(&self) -> u32 {
        self.chunk_overlap.unwrap_or(DEFAULT_CHUNK_OVERLAP)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size() == 0 {
            return Err("chunk_size must be greater than zero".to_string());
        }
        if self.chunk_overlap() >= self.chunk_size() {
            return Err(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap(),
                self.chunk_size()
            ));
        }
        Ok(())
    }
}

/// Stage-specific job variant. Carried on the job record and copied into
/// every queue message so processors receive their parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageJob {
    Extraction,
    Chunking {
        extraction_job_id: String,
        strategy: ChunkingStrategy,
        #[serde(default)]
        params: ChunkingParams,
    },
    Vectorization {
        chunking_job_id: String,
        index_id: String,
    },
}

impl StageJob {
    pub fn stage(&self) -> Stage {
        match self {
            StageJob::Extraction => Stage::Extraction,
            StageJob::Chunking { .. } => Stage::Chunking,
            StageJob::Vectorization { .. } => Stage::Vectorization,
        }
    }

    /// The job whose output this job consumes, if any.
    pub fn upstream_job_id(&self) -> Option<&str> {
        match self {
            StageJob::Extraction => None,
            StageJob::Chunking {
                extraction_job_id, ..
            } => Some(extraction_job_id),
            StageJob::Vectorization {
                chunking_job_id, ..
            } => Some(chunking_job_id),
        }
    }
}
