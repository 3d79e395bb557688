//! Submit-cluster command: dispatch jobs to a managed Kubernetes cluster.

use caliban_core::backend::AcceleratorSpec;
use caliban_core::config::{ConfigError, ProjectConfig};
use caliban_core::dispatch::dispatch;
use caliban_core::registry::Backend;
use tokio_util::sync::CancellationToken;

use crate::commands::common::{
    cluster_adapter, invocation, open_store, report_exit, CliResult, ClusterArgs, JobArgs,
    CLUSTER_ENDPOINT_ENV,
};

/// Execute the submit-cluster command.
pub async fn execute(
    job: JobArgs,
    cluster: ClusterArgs,
    cancel: &CancellationToken,
) -> CliResult {
    let mut inv = invocation(&job, Backend::Cluster)?;
    let config = ProjectConfig::load(&inv.project_dir)?;

    inv.preemptible = cluster.preemptible;
    inv.accelerator = match &cluster.gpu_spec {
        Some(spec) => Some(AcceleratorSpec::parse(spec)?),
        None => None,
    };
    inv.project_id = config.project_id.clone().or_else(|| {
        std::env::var(crate::commands::common::PROJECT_ID_ENV).ok()
    });

    // Exported manifests never reach the cluster, so no endpoint is needed.
    let endpoint = cluster
        .endpoint
        .clone()
        .or_else(|| std::env::var(CLUSTER_ENDPOINT_ENV).ok());
    let endpoint = match (&endpoint, &cluster.export_dir, inv.dry_run) {
        (Some(endpoint), _, _) => endpoint.clone(),
        (None, Some(_), _) | (None, None, true) => "https://localhost".to_string(),
        (None, None, false) => {
            return Err(ConfigError::Invalid(format!(
                "no cluster endpoint found; pass --endpoint or export ${}",
                CLUSTER_ENDPOINT_ENV
            ))
            .into())
        }
    };

    let adapter = cluster_adapter(&endpoint, &cluster.namespace, cluster.export_dir.clone());
    let mut store = open_store()?;

    let report = dispatch(&mut store, &adapter, &inv, &config, cancel).await?;
    Ok(report_exit(&report))
}
