//! Container runtime providers for agent invocations.
//!
//! The invoke handler only consumes the [`RuntimeProvider`] trait; the
//! daemon selects a concrete adapter from `runner.runtime` in the config.

pub mod podman;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Prefix for all job ids managed by this runner.
pub const JOB_PREFIX: &str = "relay-";

/// Interface implemented by each supported container runtime.
#[async_trait]
pub trait RuntimeProvider: Send + Sync {
    /// Configuration name of the provider (e.g., "podman").
    fn name(&self) -> &'static str;

    /// Whether the runtime is available on this host.
    fn is_installed(&self) -> bool;

    /// Pull the specified container image.
    async fn pull_image(&self, cancel: &CancellationToken, image: &str) -> Result<()>;

    /// Run a job to completion with the specified options.
    async fn run_job(&self, cancel: &CancellationToken, opts: JobOptions) -> Result<()>;

    /// Terminate the job with the given id.
    async fn kill_job(&self, cancel: &CancellationToken, job_id: &str) -> Result<()>;

    /// Ids of all currently running jobs managed by this runtime.
    async fn get_running_job_ids(&self, cancel: &CancellationToken) -> Result<Vec<String>>;

    /// Ids of all jobs with log files, running or completed.
    async fn get_all_job_ids(&self) -> Result<Vec<String>>;

    /// Check that a job id is well-formed for this runtime.
    fn validate_job_id(&self, job_id: &str) -> Result<()>;

    /// Remove the log file for the specified job.
    fn delete_job_log(&self, job_id: &str) -> Result<()>;
}

/// Options for running a job.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub job_id: String,
    pub image: String,
    /// Number of CPUs to allocate.
    pub cpus: u32,
    /// Memory limit in whole gigabytes.
    pub memory_gb: u32,
    pub entrypoint: String,
    pub args: Vec<String>,
    /// Bytes fed to the job on stdin.
    pub stdin: Option<Vec<u8>>,
}

/// Build a job id from its components: `relay-<taskId>-<turnIndex>`.
pub fn job_id(task_id: &str, turn_index: u32) -> String {
    format!("{JOB_PREFIX}{task_id}-{turn_index}")
}

/// Split a job id into its task id and turn index.
pub fn parse_job_id(id: &str) -> Result<(String, u32)> {
    let trimmed = id
        .strip_prefix(JOB_PREFIX)
        .ok_or_else(|| Error::JobId(format!("missing {JOB_PREFIX:?} prefix: {id}")))?;

    let Some(separator) = trimmed.rfind('-') else {
        return Err(Error::JobId(format!("missing turn index separator: {id}")));
    };

    let turn_index = trimmed[separator + 1..]
        .parse::<u32>()
        .map_err(|_| Error::JobId(format!("turn index is not a number: {id}")))?;

    Ok((trimmed[..separator].to_string(), turn_index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_round_trips() {
        let id = job_id("2f1c9c0a-52cf-4e11-9f5e-0a51f5b7f3a1", 3);
        assert_eq!(id, "relay-2f1c9c0a-52cf-4e11-9f5e-0a51f5b7f3a1-3");
        let (task_id, turn_index) = parse_job_id(&id).unwrap();
        assert_eq!(task_id, "2f1c9c0a-52cf-4e11-9f5e-0a51f5b7f3a1");
        assert_eq!(turn_index, 3);
    }

    #[test]
    fn parse_rejects_missing_prefix() {
        assert!(parse_job_id("other-task-1").is_err());
    }

    #[test]
    fn parse_rejects_missing_separator() {
        assert!(parse_job_id("relay-taskonly").is_err());
    }

    #[test]
    fn parse_rejects_non_numeric_turn() {
        assert!(parse_job_id("relay-task-one").is_err());
    }
}
