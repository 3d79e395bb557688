//! Managed Kubernetes cluster backend.
//!
//! Translates a [`JobSpec`] into a batch job manifest and submits it to an
//! already-provisioned cluster endpoint. Job names get a short random
//! suffix to avoid collisions; manifests can also be exported to a file
//! instead of submitted.

use std::path::PathBuf;

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::resources::{validate_combination, AcceleratorSpec};
use crate::backend::{
    key_label, Backend, BackendAdapter, BackendError, BackendResult, JobSpec, JobStatus,
    StopOutcome, SubmitResult, BACKEND_CALL_TIMEOUT,
};

/// Length of the random suffix appended to generated job names.
const NAME_SUFFIX_LENGTH: usize = 5;

/// Node label keyed by the accelerator a pod requires.
const ACCELERATOR_NODE_SELECTOR: &str = "cloud.google.com/gke-accelerator";

/// Client interface to the cluster's batch API. The HTTP implementation
/// talks to the real endpoint; tests substitute an in-memory fake.
#[async_trait]
pub trait BatchApi: Send + Sync {
    /// Creates a batch job from a manifest; returns the created document.
    async fn create_job(&self, manifest: &serde_json::Value)
        -> BackendResult<serde_json::Value>;

    /// Fetches a job document, or None when the cluster no longer has it.
    async fn get_job(&self, name: &str) -> BackendResult<Option<serde_json::Value>>;

    /// Deletes a job; false when it was already gone.
    async fn delete_job(&self, name: &str) -> BackendResult<bool>;
}

/// reqwest-backed [`BatchApi`] implementation against a cluster endpoint.
pub struct HttpBatchApi {
    client: reqwest::Client,
    base_url: String,
    namespace: String,
    auth_token: Option<String>,
}

impl HttpBatchApi {
    pub fn new(endpoint: &str, namespace: &str, auth_token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(BACKEND_CALL_TIMEOUT)
                // Cluster endpoints commonly present self-signed certs; the
                // caller supplies the trust decision out of band.
                .danger_accept_invalid_certs(true)
                .build()
                .expect("client construction cannot fail with static options"),
            base_url: endpoint.trim_end_matches('/').to_string(),
            namespace: namespace.to_string(),
            auth_token,
        }
    }

    fn jobs_url(&self) -> String {
        format!("{}/apis/batch/v1/namespaces/{}/jobs", self.base_url, self.namespace)
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, url);
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

#[async_trait]
impl BatchApi for HttpBatchApi {
    async fn create_job(
        &self,
        manifest: &serde_json::Value,
    ) -> BackendResult<serde_json::Value> {
        let response = self
            .request(reqwest::Method::POST, self.jobs_url())
            .json(manifest)
            .send()
            .await?;
        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(BackendError::Transient(format!("cluster responded {}", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Terminal(format!("{}: {}", status, body)));
        }
        Ok(response.json().await?)
    }

    async fn get_job(&self, name: &str) -> BackendResult<Option<serde_json::Value>> {
        let url = format!("{}/{}", self.jobs_url(), name);
        let response = self.request(reqwest::Method::GET, url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(BackendError::Transient(format!(
                "cluster responded {}",
                response.status()
            )));
        }
        Ok(Some(response.json().await?))
    }

    async fn delete_job(&self, name: &str) -> BackendResult<bool> {
        let url = format!("{}/{}", self.jobs_url(), name);
        let response = self.request(reqwest::Method::DELETE, url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !response.status().is_success() {
            return Err(BackendError::Terminal(format!(
                "cluster responded {}",
                response.status()
            )));
        }
        Ok(true)
    }
}

/// Adapter for the managed Kubernetes cluster.
pub struct KubernetesCluster {
    api: Box<dyn BatchApi>,
    /// When set, manifests are written here instead of submitted.
    export_path: Option<PathBuf>,
}

impl KubernetesCluster {
    pub fn new(api: Box<dyn BatchApi>, export_path: Option<PathBuf>) -> Self {
        Self { api, export_path }
    }

    /// Generated job name: the sanitized base name plus a short random
    /// token, so resubmissions of the same experiment never collide.
    fn job_name(spec: &JobSpec) -> String {
        let base = spec
            .job_name
            .as_deref()
            .map(key_label)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "caliban".to_string());
        let mut rng = rand::thread_rng();
        let token: String = (0..NAME_SUFFIX_LENGTH)
            .map(|_| {
                let n = rng.gen_range(0..36u32);
                char::from_digit(n, 36).expect("digit in radix range")
            })
            .collect();
        format!("{}-{}-{}", base, spec.index, token)
    }

    /// Builds the batch job manifest for a spec.
    fn manifest(&self, spec: &JobSpec, name: &str) -> serde_json::Value {
        let labels: serde_json::Map<String, serde_json::Value> = spec
            .submission_labels()
            .into_iter()
            .map(|(k, v)| (k, serde_json::Value::String(v)))
            .collect();

        let mut container = serde_json::json!({
            "name": name,
            "image": spec.image,
            "args": spec.args,
        });
        let mut node_selector = serde_json::Map::new();
        let mut tolerations = Vec::new();

        if let Some(AcceleratorSpec::Gpu { gpu, count }) = &spec.accelerator {
            container["resources"] = serde_json::json!({
                "limits": {"nvidia.com/gpu": count}
            });
            node_selector.insert(
                ACCELERATOR_NODE_SELECTOR.to_string(),
                serde_json::Value::String(gpu.wire_name().to_lowercase().replace('_', "-")),
            );
        }

        if spec.preemptible {
            tolerations.push(serde_json::json!({
                "key": "cloud.google.com/gke-preemptible",
                "operator": "Equal",
                "value": "true",
                "effect": "NoSchedule",
            }));
        }

        let mut pod_spec = serde_json::json!({
            "containers": [container],
            "restartPolicy": "Never",
        });
        if !node_selector.is_empty() {
            pod_spec["nodeSelector"] = serde_json::Value::Object(node_selector);
        }
        if !tolerations.is_empty() {
            pod_spec["tolerations"] = serde_json::Value::Array(tolerations);
        }

        serde_json::json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": name,
                "labels": labels,
            },
            "spec": {
                "backoffLimit": 0,
                "template": {
                    "metadata": {"labels": labels},
                    "spec": pod_spec,
                },
            },
        })
    }
}

#[async_trait]
impl BackendAdapter for KubernetesCluster {
    fn backend(&self) -> Backend {
        Backend::Cluster
    }

    fn validate(&self, spec: &JobSpec) -> BackendResult<()> {
        validate_combination(spec.machine_type, spec.accelerator.as_ref(), None)
    }

    async fn submit(
        &self,
        spec: &JobSpec,
        cancel: &CancellationToken,
    ) -> BackendResult<SubmitResult> {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }

        let name = Self::job_name(spec);
        let manifest = self.manifest(spec, &name);

        if let Some(dir) = &self.export_path {
            std::fs::create_dir_all(dir)?;
            let path = dir.join(format!("{}.json", name));
            std::fs::write(&path, serde_json::to_string_pretty(&manifest).expect("manifest"))?;
            info!(path = %path.display(), "manifest exported");
            return Ok(SubmitResult {
                backend_handle: name.clone(),
                details: serde_json::json!({
                    "job_name": name,
                    "exported_to": path.display().to_string(),
                }),
            });
        }

        debug!(%name, "creating batch job");
        self.api.create_job(&manifest).await?;
        info!(%name, "batch job created");
        Ok(SubmitResult {
            backend_handle: name.clone(),
            details: serde_json::json!({"job_name": name, "manifest": manifest}),
        })
    }

    async fn query(&self, backend_handle: &str) -> BackendResult<JobStatus> {
        let job = match self.api.get_job(backend_handle).await {
            Ok(job) => job,
            Err(BackendError::Transient(_)) => return Ok(JobStatus::Unknown),
            Err(e) => return Err(e),
        };

        let job = match job {
            Some(job) => job,
            // The cluster no longer knows the job at all.
            None => return Ok(JobStatus::Unknown),
        };

        if job.pointer("/metadata/deletionTimestamp").is_some() {
            return Ok(JobStatus::Stopped);
        }

        let status = job.get("status").cloned().unwrap_or_default();
        let count = |key: &str| status.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
        let backoff_limit =
            job.pointer("/spec/backoffLimit").and_then(|v| v.as_u64()).unwrap_or(0);

        if count("succeeded") > 0 {
            Ok(JobStatus::Succeeded)
        } else if count("failed") > backoff_limit {
            Ok(JobStatus::Failed)
        } else if count("active") > 0 {
            Ok(JobStatus::Running)
        } else {
            Ok(JobStatus::Submitted)
        }
    }

    async fn stop(&self, backend_handle: &str) -> BackendResult<StopOutcome> {
        if self.api.delete_job(backend_handle).await? {
            Ok(StopOutcome::Requested)
        } else {
            Ok(StopOutcome::NotStoppable)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::resources::GpuType;
    use crate::config::{Entrypoint, JobMode};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeApi {
        jobs: Mutex<HashMap<String, serde_json::Value>>,
    }

    #[async_trait]
    impl BatchApi for FakeApi {
        async fn create_job(
            &self,
            manifest: &serde_json::Value,
        ) -> BackendResult<serde_json::Value> {
            let name = manifest["metadata"]["name"].as_str().unwrap().to_string();
            self.jobs.lock().unwrap().insert(name, manifest.clone());
            Ok(manifest.clone())
        }

        async fn get_job(&self, name: &str) -> BackendResult<Option<serde_json::Value>> {
            Ok(self.jobs.lock().unwrap().get(name).cloned())
        }

        async fn delete_job(&self, name: &str) -> BackendResult<bool> {
            Ok(self.jobs.lock().unwrap().remove(name).is_some())
        }
    }

    fn gpu_spec() -> JobSpec {
        let mut spec = JobSpec::new(
            "gcr.io/proj/img:latest",
            Entrypoint::PyModule { module: "trainer.main".to_string() },
            vec!["--lr".to_string(), "0.1".to_string()],
            JobMode::Gpu,
        );
        spec.accelerator = Some(AcceleratorSpec::Gpu { gpu: GpuType::T4, count: 2 });
        spec.job_name = Some("tuning".to_string());
        spec.preemptible = true;
        spec
    }

    #[test]
    fn test_job_name_has_random_suffix() {
        let spec = gpu_spec();
        let a = KubernetesCluster::job_name(&spec);
        let b = KubernetesCluster::job_name(&spec);
        assert!(a.starts_with("tuning-1-"));
        assert_ne!(a, b);
        assert_eq!(a.len(), "tuning-1-".len() + NAME_SUFFIX_LENGTH);
    }

    #[test]
    fn test_manifest_shape() {
        let adapter = KubernetesCluster::new(Box::<FakeApi>::default(), None);
        let manifest = adapter.manifest(&gpu_spec(), "tuning-1-ab3de");

        assert_eq!(manifest["kind"], "Job");
        assert_eq!(manifest["spec"]["backoffLimit"], 0);
        let pod = &manifest["spec"]["template"]["spec"];
        assert_eq!(pod["restartPolicy"], "Never");
        assert_eq!(pod["containers"][0]["image"], "gcr.io/proj/img:latest");
        assert_eq!(pod["containers"][0]["resources"]["limits"]["nvidia.com/gpu"], 2);
        assert_eq!(pod["nodeSelector"][ACCELERATOR_NODE_SELECTOR], "nvidia-tesla-t4");
        assert_eq!(pod["tolerations"][0]["key"], "cloud.google.com/gke-preemptible");
        // Labels land on the job and the pod template alike.
        assert_eq!(manifest["metadata"]["labels"]["job_name"], "tuning");
        assert_eq!(
            manifest["spec"]["template"]["metadata"]["labels"]["lr"],
            "0_1"
        );
    }

    #[tokio::test]
    async fn test_submit_then_query_then_stop() {
        let adapter = KubernetesCluster::new(Box::<FakeApi>::default(), None);
        let result = adapter.submit(&gpu_spec(), &CancellationToken::new()).await.unwrap();

        // No status counts yet: still submitted.
        assert_eq!(adapter.query(&result.backend_handle).await.unwrap(), JobStatus::Submitted);

        assert_eq!(adapter.stop(&result.backend_handle).await.unwrap(), StopOutcome::Requested);
        // Deleted and gone: the cluster no longer knows it.
        assert_eq!(adapter.query(&result.backend_handle).await.unwrap(), JobStatus::Unknown);
        assert_eq!(
            adapter.stop(&result.backend_handle).await.unwrap(),
            StopOutcome::NotStoppable
        );
    }

    #[tokio::test]
    async fn test_query_maps_status_counts() {
        let api = FakeApi::default();
        for (status, expected) in [
            (serde_json::json!({"active": 1}), JobStatus::Running),
            (serde_json::json!({"succeeded": 1}), JobStatus::Succeeded),
            (serde_json::json!({"failed": 1}), JobStatus::Failed),
        ] {
            api.jobs.lock().unwrap().insert(
                "j".to_string(),
                serde_json::json!({
                    "metadata": {"name": "j"},
                    "spec": {"backoffLimit": 0},
                    "status": status,
                }),
            );
            let adapter = KubernetesCluster::new(
                Box::new(FakeApi { jobs: Mutex::new(api.jobs.lock().unwrap().clone()) }),
                None,
            );
            assert_eq!(adapter.query("j").await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_deletion_timestamp_maps_to_stopped() {
        let api = FakeApi::default();
        api.jobs.lock().unwrap().insert(
            "j".to_string(),
            serde_json::json!({
                "metadata": {"name": "j", "deletionTimestamp": "2024-01-01T00:00:00Z"},
                "status": {"active": 1},
            }),
        );
        let adapter = KubernetesCluster::new(Box::new(api), None);
        assert_eq!(adapter.query("j").await.unwrap(), JobStatus::Stopped);
    }

    #[tokio::test]
    async fn test_export_writes_manifest_instead_of_submitting() {
        let dir = tempfile::tempdir().unwrap();
        let adapter =
            KubernetesCluster::new(Box::<FakeApi>::default(), Some(dir.path().to_path_buf()));
        let result = adapter.submit(&gpu_spec(), &CancellationToken::new()).await.unwrap();

        let exported = result.details["exported_to"].as_str().unwrap().to_string();
        let text = std::fs::read_to_string(&exported).unwrap();
        let manifest: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(manifest["kind"], "Job");
        // Nothing was submitted, so the cluster doesn't know the job.
        assert_eq!(adapter.query(&result.backend_handle).await.unwrap(), JobStatus::Unknown);
    }

    #[test]
    fn test_validate_uses_compatibility_tables() {
        let adapter = KubernetesCluster::new(Box::<FakeApi>::default(), None);
        let mut spec = gpu_spec();
        spec.accelerator = Some(AcceleratorSpec::Gpu { gpu: GpuType::V100, count: 3 });
        assert!(matches!(
            adapter.validate(&spec),
            Err(BackendError::Validation { .. })
        ));
    }
}
