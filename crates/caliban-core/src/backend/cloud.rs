//! Managed cloud training backend.
//!
//! Translates a [`JobSpec`] into a training-service request, validating the
//! machine/accelerator/region combination client-side so impossible
//! configurations never reach the wire. Submissions are issued one at a
//! time; rate-limit responses surface as transient errors and are retried
//! with bounded exponential backoff.

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::resources::{
    default_machine_type, validate_combination, Region, DEFAULT_REGION,
};
use crate::backend::{
    Backend, BackendAdapter, BackendError, BackendResult, JobSpec, JobStatus, StopOutcome,
    SubmitResult, BACKEND_CALL_TIMEOUT,
};

/// Public endpoint of the training service.
pub const DEFAULT_TRAINING_ENDPOINT: &str = "https://ml.googleapis.com/v1";

/// How many times a transient submission failure is retried.
const MAX_SUBMIT_RETRIES: u32 = 10;

/// Base delay of the exponential backoff between retries.
const RETRY_BASE_DELAY: std::time::Duration = std::time::Duration::from_secs(2);

/// Longest single backoff sleep.
const RETRY_MAX_DELAY: std::time::Duration = std::time::Duration::from_secs(60);

/// Client interface to the training service. The HTTP implementation talks
/// to the real endpoint; tests substitute an in-memory fake.
#[async_trait]
pub trait TrainingApi: Send + Sync {
    /// Creates a training job; returns the backend's response document.
    async fn create_job(&self, body: &serde_json::Value) -> BackendResult<serde_json::Value>;

    /// Fetches a job's current state document.
    async fn get_job(&self, job_id: &str) -> BackendResult<serde_json::Value>;

    /// Requests cancellation; false when the backend no longer accepts it.
    async fn cancel_job(&self, job_id: &str) -> BackendResult<bool>;
}

/// reqwest-backed [`TrainingApi`] implementation.
pub struct HttpTrainingApi {
    client: reqwest::Client,
    base_url: String,
    project_id: String,
    auth_token: Option<String>,
}

impl HttpTrainingApi {
    pub fn new(project_id: &str, auth_token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(BACKEND_CALL_TIMEOUT)
                .build()
                .expect("client construction cannot fail with static options"),
            base_url: DEFAULT_TRAINING_ENDPOINT.to_string(),
            project_id: project_id.to_string(),
            auth_token,
        }
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, url);
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn interpret(response: reqwest::Response) -> BackendResult<serde_json::Value> {
        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(BackendError::Transient(format!("rate limited ({})", status)));
        }
        if status.is_server_error() {
            return Err(BackendError::Transient(format!("server error ({})", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Terminal(format!("{}: {}", status, body)));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl TrainingApi for HttpTrainingApi {
    async fn create_job(&self, body: &serde_json::Value) -> BackendResult<serde_json::Value> {
        let url = format!("{}/projects/{}/jobs", self.base_url, self.project_id);
        let response = self.request(reqwest::Method::POST, url).json(body).send().await?;
        Self::interpret(response).await
    }

    async fn get_job(&self, job_id: &str) -> BackendResult<serde_json::Value> {
        let url =
            format!("{}/projects/{}/jobs/{}", self.base_url, self.project_id, job_id);
        let response = self.request(reqwest::Method::GET, url).send().await?;
        Self::interpret(response).await
    }

    async fn cancel_job(&self, job_id: &str) -> BackendResult<bool> {
        let url = format!(
            "{}/projects/{}/jobs/{}:cancel",
            self.base_url, self.project_id, job_id
        );
        let response = self.request(reqwest::Method::POST, url).send().await?;
        match Self::interpret(response).await {
            Ok(_) => Ok(true),
            Err(BackendError::Terminal(_)) => Ok(false),
            Err(other) => Err(other),
        }
    }
}

/// Adapter for the managed training service.
pub struct CloudTraining {
    api: Box<dyn TrainingApi>,
    project_id: String,
    /// Skip client-side validation entirely.
    force: bool,
}

impl CloudTraining {
    pub fn new(api: Box<dyn TrainingApi>, project_id: &str, force: bool) -> Self {
        Self { api, project_id: project_id.to_string(), force }
    }

    /// Console URL where the submitted job can be observed.
    pub fn job_url(&self, job_id: &str) -> String {
        format!(
            "https://console.cloud.google.com/mlengine/jobs/{}?projectId={}",
            job_id, self.project_id
        )
    }

    /// The backend-visible job id: `name_yyyyMMdd_HHmmss_index`.
    fn job_id(spec: &JobSpec) -> String {
        let name = spec.job_name.clone().unwrap_or_else(|| "caliban".to_string());
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        format!("{}_{}_{}", name, stamp, spec.index)
    }

    /// The full request body for a spec.
    fn request_body(&self, spec: &JobSpec, job_id: &str) -> serde_json::Value {
        let machine = spec.machine_type.unwrap_or_else(|| default_machine_type(spec.mode));
        let region: Region = spec.region.unwrap_or(DEFAULT_REGION);
        let accelerator = match &spec.accelerator {
            Some(accel) => accel.wire_config(),
            None => serde_json::json!({"count": 0, "type": "ACCELERATOR_TYPE_UNSPECIFIED"}),
        };

        let labels: serde_json::Map<String, serde_json::Value> = spec
            .submission_labels()
            .into_iter()
            .map(|(k, v)| (k, serde_json::Value::String(v)))
            .collect();

        serde_json::json!({
            "jobId": job_id,
            "trainingInput": {
                "masterConfig": {
                    "imageUri": spec.image,
                    "acceleratorConfig": accelerator,
                },
                "scaleTier": "CUSTOM",
                "masterType": machine.wire_name(),
                "region": region.wire_name(),
                "args": spec.args,
            },
            "labels": labels,
        })
    }
}

#[async_trait]
impl BackendAdapter for CloudTraining {
    fn backend(&self) -> Backend {
        Backend::Cloud
    }

    fn validate(&self, spec: &JobSpec) -> BackendResult<()> {
        if self.force {
            return Ok(());
        }
        validate_combination(
            spec.machine_type,
            spec.accelerator.as_ref(),
            Some(spec.region.unwrap_or(DEFAULT_REGION)),
        )
    }

    async fn submit(
        &self,
        spec: &JobSpec,
        cancel: &CancellationToken,
    ) -> BackendResult<SubmitResult> {
        let job_id = Self::job_id(spec);
        let body = self.request_body(spec, &job_id);
        debug!(%job_id, "submitting training job");

        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(BackendError::Cancelled);
            }

            match self.api.create_job(&body).await {
                Ok(_) => break,
                Err(BackendError::Transient(message)) if attempt < MAX_SUBMIT_RETRIES => {
                    attempt += 1;
                    let delay = RETRY_BASE_DELAY
                        .saturating_mul(1u32 << attempt.min(5))
                        .min(RETRY_MAX_DELAY);
                    warn!(
                        %job_id, attempt, delay_secs = delay.as_secs(), %message,
                        "transient submission failure; backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(BackendError::Cancelled),
                    }
                }
                Err(other) => return Err(other),
            }
        }

        let url = self.job_url(&job_id);
        info!(%job_id, %url, "training job submitted");
        Ok(SubmitResult {
            backend_handle: job_id.clone(),
            details: serde_json::json!({
                "jobId": job_id,
                "project_id": self.project_id,
                "url": url,
            }),
        })
    }

    async fn query(&self, backend_handle: &str) -> BackendResult<JobStatus> {
        let response = match self.api.get_job(backend_handle).await {
            Ok(r) => r,
            Err(BackendError::Transient(_)) => return Ok(JobStatus::Unknown),
            Err(e) => return Err(e),
        };

        let state = response.get("state").and_then(|s| s.as_str()).unwrap_or("");
        Ok(match state {
            "QUEUED" | "PREPARING" => JobStatus::Submitted,
            "RUNNING" | "CANCELLING" => JobStatus::Running,
            "SUCCEEDED" => JobStatus::Succeeded,
            "FAILED" => JobStatus::Failed,
            "CANCELLED" => JobStatus::Stopped,
            _ => JobStatus::Unknown,
        })
    }

    async fn stop(&self, backend_handle: &str) -> BackendResult<StopOutcome> {
        if self.api.cancel_job(backend_handle).await? {
            Ok(StopOutcome::Requested)
        } else {
            Ok(StopOutcome::NotStoppable)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::resources::{AcceleratorSpec, GpuType, MachineType};
    use crate::config::{Entrypoint, JobMode};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Fake training API: fails the first `fail_first` create calls with a
    /// transient error, then succeeds, recording bodies.
    struct FakeApi {
        fail_first: u32,
        calls: AtomicU32,
        state: Mutex<String>,
    }

    impl FakeApi {
        fn new(fail_first: u32) -> Self {
            Self {
                fail_first,
                calls: AtomicU32::new(0),
                state: Mutex::new("QUEUED".to_string()),
            }
        }
    }

    #[async_trait]
    impl TrainingApi for FakeApi {
        async fn create_job(&self, _body: &serde_json::Value) -> BackendResult<serde_json::Value> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(BackendError::Transient("rate limited (429)".to_string()));
            }
            Ok(serde_json::json!({"state": "QUEUED"}))
        }

        async fn get_job(&self, _job_id: &str) -> BackendResult<serde_json::Value> {
            Ok(serde_json::json!({"state": self.state.lock().unwrap().clone()}))
        }

        async fn cancel_job(&self, _job_id: &str) -> BackendResult<bool> {
            Ok(true)
        }
    }

    fn gpu_spec() -> JobSpec {
        let mut spec = JobSpec::new(
            "gcr.io/proj/img:latest",
            Entrypoint::PyModule { module: "trainer.main".to_string() },
            vec!["--lr".to_string(), "0.1".to_string()],
            JobMode::Gpu,
        );
        spec.accelerator = Some(AcceleratorSpec::Gpu { gpu: GpuType::V100, count: 8 });
        spec.machine_type = Some(MachineType::Standard_8);
        spec.region = Some(Region::UsCentral1);
        spec.job_name = Some("tuning".to_string());
        spec
    }

    #[test]
    fn test_validate_rejects_impossible_count() {
        let adapter = CloudTraining::new(Box::new(FakeApi::new(0)), "proj", false);
        let mut spec = gpu_spec();
        spec.accelerator = Some(AcceleratorSpec::Gpu { gpu: GpuType::V100, count: 3 });
        spec.machine_type = None;
        let err = adapter.validate(&spec).unwrap_err();
        match err {
            BackendError::Validation { message, .. } => {
                assert!(message.contains("[1, 2, 4, 8]"), "message: {}", message)
            }
            other => panic!("expected Validation, got {:?}", other),
        }
    }

    #[test]
    fn test_force_skips_validation() {
        let adapter = CloudTraining::new(Box::new(FakeApi::new(0)), "proj", true);
        let mut spec = gpu_spec();
        spec.accelerator = Some(AcceleratorSpec::Gpu { gpu: GpuType::V100, count: 3 });
        assert!(adapter.validate(&spec).is_ok());
    }

    #[tokio::test]
    async fn test_submit_builds_expected_body() {
        let adapter = CloudTraining::new(Box::new(FakeApi::new(0)), "proj", false);
        let spec = gpu_spec();
        let result = adapter.submit(&spec, &CancellationToken::new()).await.unwrap();

        // Handle is name_timestamp_index.
        assert!(result.backend_handle.starts_with("tuning_"));
        assert!(result.backend_handle.ends_with("_1"));
        assert!(result.details["url"].as_str().unwrap().contains(&result.backend_handle));
    }

    #[test]
    fn test_request_body_shape() {
        let adapter = CloudTraining::new(Box::new(FakeApi::new(0)), "proj", false);
        let spec = gpu_spec();
        let body = adapter.request_body(&spec, "tuning_20240101_000000_1");

        let input = &body["trainingInput"];
        assert_eq!(input["masterConfig"]["imageUri"], "gcr.io/proj/img:latest");
        assert_eq!(input["masterConfig"]["acceleratorConfig"]["type"], "NVIDIA_TESLA_V100");
        assert_eq!(input["masterConfig"]["acceleratorConfig"]["count"], 8);
        assert_eq!(input["scaleTier"], "CUSTOM");
        assert_eq!(input["masterType"], "n1-standard-8");
        assert_eq!(input["region"], "us-central1");
        assert_eq!(input["args"][0], "--lr");
        // Labels carry the sanitized argv bindings plus the job name.
        assert_eq!(body["labels"]["job_name"], "tuning");
        assert_eq!(body["labels"]["lr"], "0_1");
    }

    #[test]
    fn test_request_body_without_accelerator() {
        let adapter = CloudTraining::new(Box::new(FakeApi::new(0)), "proj", false);
        let mut spec = gpu_spec();
        spec.accelerator = None;
        spec.machine_type = None;
        spec.mode = JobMode::Cpu;
        let body = adapter.request_body(&spec, "j_1");
        let accel = &body["trainingInput"]["masterConfig"]["acceleratorConfig"];
        assert_eq!(accel["type"], "ACCELERATOR_TYPE_UNSPECIFIED");
        assert_eq!(accel["count"], 0);
        assert_eq!(body["trainingInput"]["masterType"], "n1-highcpu-32");
    }

    #[tokio::test]
    async fn test_submit_retries_transient_failures() {
        tokio::time::pause();
        let api = Box::new(FakeApi::new(2));
        let adapter = CloudTraining::new(api, "proj", false);
        let handle = tokio::spawn(async move {
            adapter.submit(&gpu_spec(), &CancellationToken::new()).await
        });
        // Paused time auto-advances through the backoff sleeps.
        let result = handle.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_submit_gives_up_after_bound() {
        tokio::time::pause();
        let api = Box::new(FakeApi::new(MAX_SUBMIT_RETRIES + 1));
        let adapter = CloudTraining::new(api, "proj", false);
        let handle = tokio::spawn(async move {
            adapter.submit(&gpu_spec(), &CancellationToken::new()).await
        });
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(BackendError::Transient(_))));
    }

    #[tokio::test]
    async fn test_submit_honors_cancellation() {
        let adapter = CloudTraining::new(Box::new(FakeApi::new(0)), "proj", false);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = adapter.submit(&gpu_spec(), &cancel).await;
        assert!(matches!(result, Err(BackendError::Cancelled)));
    }

    #[tokio::test]
    async fn test_query_maps_states() {
        let api = FakeApi::new(0);
        *api.state.lock().unwrap() = "CANCELLING".to_string();
        let adapter = CloudTraining::new(Box::new(api), "proj", false);
        assert_eq!(adapter.query("j").await.unwrap(), JobStatus::Running);

        for (state, expected) in [
            ("QUEUED", JobStatus::Submitted),
            ("PREPARING", JobStatus::Submitted),
            ("RUNNING", JobStatus::Running),
            ("SUCCEEDED", JobStatus::Succeeded),
            ("FAILED", JobStatus::Failed),
            ("CANCELLED", JobStatus::Stopped),
            ("STATE_UNSPECIFIED", JobStatus::Unknown),
        ] {
            let api = FakeApi::new(0);
            *api.state.lock().unwrap() = state.to_string();
            let adapter = CloudTraining::new(Box::new(api), "proj", false);
            assert_eq!(adapter.query("j").await.unwrap(), expected, "state {}", state);
        }
    }

    #[tokio::test]
    async fn test_stop_requests_cancellation() {
        let adapter = CloudTraining::new(Box::new(FakeApi::new(0)), "proj", false);
        assert_eq!(adapter.stop("j").await.unwrap(), StopOutcome::Requested);
    }
}
