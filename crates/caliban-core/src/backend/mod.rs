//! Execution backends.
//!
//! Each backend implements the same adapter contract: client-side
//! validation, submission, status query, and stop. The dispatcher selects an
//! adapter by the [`Backend`] enum and never cares which one it holds.

mod cloud;
mod cluster;
mod labels;
mod local;
mod resources;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{Entrypoint, JobMode};
pub use crate::registry::{Backend, JobStatus};

pub use cloud::{CloudTraining, HttpTrainingApi, TrainingApi, DEFAULT_TRAINING_ENDPOINT};
pub use cluster::{BatchApi, HttpBatchApi, KubernetesCluster};
pub use labels::{args_to_labels, key_label, sanitize_labels, value_label, MAX_LABEL_LENGTH};
pub use local::{gpu_supported_on_host, LocalRuntime};
pub use resources::{
    accelerator_counts, allowed_machine_types, default_machine_type, supported_regions,
    validate_combination, AcceleratorSpec, GpuType, MachineType, Region, TpuType,
    DEFAULT_REGION,
};

/// Per-call timeout for backend network operations.
pub const BACKEND_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors raised by backend adapters.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The backend would reject this submission; caught client-side.
    #[error("Validation failed for {field}: {message}")]
    Validation { field: String, message: String },

    /// Rate limiting or a network hiccup; retried with bounded backoff.
    #[error("Transient backend error: {0}")]
    Transient(String),

    /// Terminal rejection by the backend.
    #[error("Backend rejected the request: {0}")]
    Terminal(String),

    /// The local container exited non-zero.
    #[error("Container exited with code {code}")]
    RuntimeExit { code: i32 },

    /// The call was cancelled by the user.
    #[error("Cancelled")]
    Cancelled,

    /// I/O error while talking to a local runtime.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        // Timeouts and connection failures are worth retrying; anything the
        // server actually answered is not.
        if e.is_timeout() || e.is_connect() {
            BackendError::Transient(e.to_string())
        } else {
            BackendError::Terminal(e.to_string())
        }
    }
}

/// Result type alias for backend operations.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// A normalized job submission, independent of the target backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Image reference to execute.
    pub image: String,
    /// What the container runs.
    pub entrypoint: Entrypoint,
    /// Full argv passed to the entrypoint.
    pub args: Vec<String>,
    /// Job mode the image was built for.
    pub mode: JobMode,
    /// Machine type for managed backends.
    #[serde(default)]
    pub machine_type: Option<MachineType>,
    /// Accelerator request for managed backends.
    #[serde(default)]
    pub accelerator: Option<AcceleratorSpec>,
    /// Region for the cloud training service.
    #[serde(default)]
    pub region: Option<Region>,
    /// Request preemptible capacity on the cluster backend.
    #[serde(default)]
    pub preemptible: bool,
    /// User-supplied labels, attached after auto-derived ones.
    #[serde(default)]
    pub labels: Vec<(String, String)>,
    /// Base name for backend-visible job names.
    #[serde(default)]
    pub job_name: Option<String>,
    /// 1-based position of this spec within its sweep.
    pub index: usize,
}

impl JobSpec {
    /// A minimal spec for the given image and argv.
    pub fn new(image: &str, entrypoint: Entrypoint, args: Vec<String>, mode: JobMode) -> Self {
        Self {
            image: image.to_string(),
            entrypoint,
            args,
            mode,
            machine_type: None,
            accelerator: None,
            region: None,
            preemptible: false,
            labels: Vec::new(),
            job_name: None,
            index: 1,
        }
    }

    /// The complete label set for submission: auto-derived labels from the
    /// job name and argv first, then user labels so collisions resolve in
    /// the user's favor.
    pub fn submission_labels(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = Vec::new();
        pairs.push(("gpu_enabled".to_string(), self.mode.is_gpu().to_string()));
        if let Some(name) = &self.job_name {
            pairs.push(("job_name".to_string(), name.clone()));
        }
        pairs.extend(args_to_labels(&self.args));
        pairs.extend(self.labels.iter().cloned());
        sanitize_labels(&pairs)
    }
}

/// Outcome of a successful submission.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitResult {
    /// Opaque backend-assigned identifier used for query and stop.
    pub backend_handle: String,
    /// Structured backend metadata stored on the job row.
    pub details: serde_json::Value,
}

/// Outcome of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Cancellation was requested; the state change may be asynchronous.
    Requested,
    /// The backend no longer knows the job, or it cannot be stopped.
    NotStoppable,
}

/// The common contract each execution backend implements.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Which backend this adapter drives.
    fn backend(&self) -> Backend;

    /// Client-side rejection of configurations the backend would refuse.
    fn validate(&self, spec: &JobSpec) -> BackendResult<()>;

    /// Submits the spec, returning the backend handle and metadata.
    async fn submit(
        &self,
        spec: &JobSpec,
        cancel: &CancellationToken,
    ) -> BackendResult<SubmitResult>;

    /// Maps the backend's view of the job onto the normalized status.
    async fn query(&self, backend_handle: &str) -> BackendResult<JobStatus>;

    /// Requests cancellation of a submitted job.
    async fn stop(&self, backend_handle: &str) -> BackendResult<StopOutcome>;
}
