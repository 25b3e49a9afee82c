use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use super::{ensure_supported, result_key, StageOutput, StageProcessor};
use crate::error::ProcessError;
use crate::model::{FileRef, StageJob};

/// Optional JSON report a command may print on stdout.
#[derive(Debug, Default, Deserialize)]
struct CommandReport {
    #[serde(default)]
    chunk_count: Option<u32>,
}

/// Runs an external program once per file.
///
/// The file and stage are described through `DOCPIPE_*` environment
/// variables; a zero exit status is success. For chunking the program may
/// print `{"chunk_count": N}` on stdout.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    program: String,
    args: Vec<String>,
}

impl CommandProcessor {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Parses a command line. A line starting with `[` is a JSON array of
    /// strings, for arguments containing spaces; anything else is split on
    /// whitespace with no quoting. `Ok(None)` if there is no program.
    pub fn from_command_line(line: &str) -> Result<Option<Self>, serde_json::Error> {
        let line = line.trim();
        let parts: Vec<String> = if line.starts_with('[') {
            serde_json::from_str(line)?
        } else {
            line.split_whitespace().map(str::to_string).collect()
        };
        let mut parts = parts.into_iter();
        Ok(parts.next().map(|program| Self::new(program, parts)))
    }

    fn build(&self, file: &FileRef, job: &StageJob) -> Result<Command, ProcessError> {
        let params = serde_json::to_string(job)
            .map_err(|e| ProcessError::Failed(format!("cannot encode stage parameters: {}", e)))?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("DOCPIPE_STAGE", job.stage().as_str())
            .env("DOCPIPE_JOB_ID", &file.job_id)
            .env("DOCPIPE_TENANT_ID", &file.tenant_id)
            .env("DOCPIPE_FILE_NAME", &file.file_name)
            .env("DOCPIPE_FILE_PATH", &file.file_path)
            .env("DOCPIPE_STAGE_PARAMS", params)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(key) = result_key(file, job) {
            cmd.env("DOCPIPE_RESULT_KEY", key);
        }
        Ok(cmd)
    }
}

#[async_trait]
impl StageProcessor for CommandProcessor {
    async fn process(&self, file: &FileRef, job: &StageJob) -> Result<StageOutput, ProcessError> {
        if matches!(job, StageJob::Extraction) {
            ensure_supported(file)?;
        }

        let output = self
            .build(file, job)?
            .output()
            .await
            .map_err(|e| ProcessError::Spawn {
                program: self.program.clone(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(ProcessError::Command {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let report: CommandReport = if stdout.trim().is_empty() {
            CommandReport::default()
        } else {
            serde_json::from_str(stdout.trim()).unwrap_or_else(|e| {
                tracing::debug!(error = %e, "Processor stdout is not a JSON report, ignoring");
                CommandReport::default()
            })
        };

        let key = result_key(file, job).unwrap_or_default();
        Ok(match job {
            StageJob::Extraction => StageOutput::Extracted { result_key: key },
            StageJob::Chunking { .. } => StageOutput::Chunked {
                result_key: key,
                chunk_count: report.chunk_count.unwrap_or(0),
            },
            StageJob::Vectorization { index_id, .. } => StageOutput::Vectorized {
                index_id: index_id.clone(),
            },
        })
    }
}


#[cfg(test)]
mod command_line_tests {
    use super::CommandProcessor;

    #[test]
    fn test_whitespace_form() {
        assert!(CommandProcessor::from_command_line("   ").unwrap().is_none());
        let p = CommandProcessor::from_command_line("python3 -m extractor")
            .unwrap()
            .unwrap();
        assert_eq!(p.program, "python3");
        assert_eq!(p.args, vec!["-m", "extractor"]);
    }

    #[test]
    fn test_json_array_keeps_spaces_in_arguments() {
        let p = CommandProcessor::from_command_line(
            r#" ["/opt/My Tools/extract", "--title", "Annual Report 2025"] "#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(p.program, "/opt/My Tools/extract");
        assert_eq!(p.args, vec!["--title", "Annual Report 2025"]);

        assert!(CommandProcessor::from_command_line("[]").unwrap().is_none());
        assert!(CommandProcessor::from_command_line(r#"["extract", 3]"#).is_err());
        assert!(CommandProcessor::from_command_line(r#"["extract""#).is_err());
    }
}
