//! Local Docker runtime backend.
//!
//! Runs the built image synchronously on the host. Submission returns after
//! the container process exits, so the observed status is terminal as soon
//! as `submit` comes back.

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::backend::{
    Backend, BackendAdapter, BackendError, BackendResult, JobSpec, JobStatus, StopOutcome,
    SubmitResult,
};
use crate::build::DEFAULT_WORKDIR;
use crate::config::current_user;

/// Whether this host can run GPU containers at all.
///
/// GPU passthrough needs a Linux Docker daemon; everywhere else GPU mode
/// combined with local execution is a platform error, caught before any
/// container is launched.
pub fn gpu_supported_on_host() -> bool {
    cfg!(target_os = "linux")
}

/// Adapter that executes jobs with `docker run` on the host.
pub struct LocalRuntime {
    /// Extra arguments appended to `docker run` before the image.
    run_args: Vec<String>,
}

impl LocalRuntime {
    /// Creates the adapter, verifying that Docker is available.
    pub fn new(run_args: Vec<String>) -> BackendResult<Self> {
        std::process::Command::new("docker").arg("--version").output().map_err(|e| {
            BackendError::Terminal(format!("Docker not found on this host: {}", e))
        })?;
        Ok(Self { run_args })
    }

    /// The `docker run` argv for a spec, through the image reference; job
    /// arguments follow. The working directory and the user's home are
    /// mounted at their fixed in-container paths.
    fn run_command(&self, spec: &JobSpec, container_name: &str) -> Vec<String> {
        let mut args: Vec<String> =
            vec!["run".to_string(), "--name".to_string(), container_name.to_string()];

        if spec.mode.is_gpu() {
            args.push("--runtime".to_string());
            args.push("nvidia".to_string());
        }
        args.push("--ipc".to_string());
        args.push("host".to_string());

        if let Ok(cwd) = std::env::current_dir() {
            args.push("-v".to_string());
            args.push(format!("{}:{}", cwd.display(), DEFAULT_WORKDIR));
        }
        if let Some(home) = dirs::home_dir() {
            args.push("-v".to_string());
            args.push(format!("{}:/home/{}", home.display(), current_user()));
        }

        // Without this stderr and stdout interleave out of order inside the
        // container.
        args.push("-e".to_string());
        args.push("PYTHONUNBUFFERED=1".to_string());

        args.extend(self.run_args.iter().cloned());
        args.push(spec.image.clone());
        args.extend(spec.args.iter().cloned());
        args
    }
}

#[async_trait]
impl BackendAdapter for LocalRuntime {
    fn backend(&self) -> Backend {
        Backend::Local
    }

    fn validate(&self, spec: &JobSpec) -> BackendResult<()> {
        if spec.mode.is_gpu() && !gpu_supported_on_host() {
            return Err(BackendError::Validation {
                field: "mode".to_string(),
                message: "GPU mode is not supported by the local runtime on this host"
                    .to_string(),
            });
        }
        Ok(())
    }

    async fn submit(
        &self,
        spec: &JobSpec,
        cancel: &CancellationToken,
    ) -> BackendResult<SubmitResult> {
        let container_name = format!("caliban-{}", Uuid::new_v4().simple());
        let command = self.run_command(spec, &container_name);
        debug!(?command, "running container");

        let mut child = Command::new("docker").args(&command).spawn()?;

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = Command::new("docker")
                    .args(["rm", "-f", &container_name])
                    .output()
                    .await;
                return Err(BackendError::Cancelled);
            }
        };

        let code = status.code().unwrap_or(-1);
        info!(container = %container_name, code, "container exited");

        Ok(SubmitResult {
            backend_handle: container_name.clone(),
            details: serde_json::json!({
                "ret_code": code,
                "command": command,
            }),
        })
    }

    async fn query(&self, backend_handle: &str) -> BackendResult<JobStatus> {
        let output = Command::new("docker")
            .args(["inspect", "--format", "{{.State.Status}} {{.State.ExitCode}}", backend_handle])
            .output()
            .await?;

        if !output.status.success() {
            return Ok(JobStatus::Unknown);
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let mut parts = text.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("running"), _) => Ok(JobStatus::Running),
            (Some("exited"), Some("0")) => Ok(JobStatus::Succeeded),
            (Some("exited"), Some(_)) => Ok(JobStatus::Failed),
            (Some("created" | "paused" | "restarting"), _) => Ok(JobStatus::Submitted),
            _ => Ok(JobStatus::Unknown),
        }
    }

    async fn stop(&self, backend_handle: &str) -> BackendResult<StopOutcome> {
        let output =
            Command::new("docker").args(["rm", "-f", backend_handle]).output().await?;
        if output.status.success() {
            Ok(StopOutcome::Requested)
        } else {
            Ok(StopOutcome::NotStoppable)
        }
    }
}
