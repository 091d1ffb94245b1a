//! Podman CLI runtime adapter.

use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use async_trait::async_trait;

use super::{JobOptions, RuntimeProvider, JOB_PREFIX};
use crate::error::{Error, Result};

/// Runs jobs through the `podman` CLI, writing per-job log files.
pub struct PodmanProvider {
    podman_path: String,
    log_dir: PathBuf,
}

impl PodmanProvider {
    pub fn new(podman_path: Option<String>, log_dir: PathBuf) -> Self {
        Self {
            podman_path: podman_path.unwrap_or_else(|| "podman".to_string()),
            log_dir,
        }
    }

    async fn run_capture(
        &self,
        cancel: &CancellationToken,
        args: &[&str],
    ) -> Result<std::process::Output> {
        let mut cmd = Command::new(&self.podman_path);
        cmd.args(args).kill_on_drop(true);
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            output = cmd.output() => Ok(output?),
        }
    }
}

#[async_trait]
impl RuntimeProvider for PodmanProvider {
    fn name(&self) -> &'static str {
        "podman"
    }

    fn is_installed(&self) -> bool {
        std::process::Command::new(&self.podman_path)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    async fn pull_image(&self, cancel: &CancellationToken, image: &str) -> Result<()> {
        let output = self.run_capture(cancel, &["pull", image]).await?;
        if !output.status.success() {
            return Err(Error::Runtime(format!(
                "failed to pull image {image}: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    async fn run_job(&self, cancel: &CancellationToken, opts: JobOptions) -> Result<()> {
        let mut args: Vec<String> = vec!["run".to_string(), "--rm".to_string()];
        if opts.cpus > 0 {
            args.push("--cpus".to_string());
            args.push(opts.cpus.to_string());
        }
        if opts.memory_gb > 0 {
            args.push("--memory".to_string());
            args.push(format!("{}g", opts.memory_gb));
        }
        if !opts.job_id.is_empty() {
            args.push("--name".to_string());
            args.push(opts.job_id.clone());
        }
        if opts.stdin.is_some() {
            args.push("-i".to_string());
        }
        if !opts.entrypoint.is_empty() {
            args.push("--entrypoint".to_string());
            args.push(opts.entrypoint.clone());
        }
        args.push(opts.image.clone());
        args.extend(opts.args.iter().cloned());

        let mut cmd = Command::new(&self.podman_path);
        cmd.args(&args).kill_on_drop(true);

        if opts.stdin.is_some() {
            cmd.stdin(Stdio::piped());
        }

        if !opts.job_id.is_empty() {
            std::fs::create_dir_all(&self.log_dir)?;
            let log_file = std::fs::File::create(self.log_dir.join(&opts.job_id))?;
            cmd.stdout(Stdio::from(log_file.try_clone()?));
            cmd.stderr(Stdio::from(log_file));
        } else {
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        }

        debug!(job_id = %opts.job_id, image = %opts.image, "starting podman job");
        let mut child = cmd.spawn()?;

        if let Some(bytes) = &opts.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(bytes).await?;
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(Error::Cancelled);
            }
            status = child.wait() => status?,
        };

        if !status.success() {
            return Err(Error::Runtime(format!(
                "job {} exited with {status}",
                opts.job_id
            )));
        }
        Ok(())
    }

    async fn kill_job(&self, cancel: &CancellationToken, job_id: &str) -> Result<()> {
        self.validate_job_id(job_id)?;
        let output = self.run_capture(cancel, &["kill", job_id]).await?;
        if !output.status.success() {
            return Err(Error::Runtime(format!(
                "failed to kill job {job_id}: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    async fn get_running_job_ids(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let output = self
            .run_capture(cancel, &["ps", "--format", "{{.Names}}"])
            .await?;
        if !output.status.success() {
            return Err(Error::Runtime(format!(
                "failed to list containers: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|name| !name.is_empty() && name.starts_with(JOB_PREFIX))
            .map(str::to_string)
            .collect())
    }

    async fn get_all_job_ids(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.log_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(JOB_PREFIX) {
                ids.push(name);
            }
        }
        Ok(ids)
    }

    fn validate_job_id(&self, job_id: &str) -> Result<()> {
        super::parse_job_id(job_id).map(|_| ())
    }

    fn delete_job_log(&self, job_id: &str) -> Result<()> {
        self.validate_job_id(job_id)?;
        match std::fs::remove_file(self.log_dir.join(job_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
