//! Submit-cloud command: dispatch jobs to the managed training service.

use caliban_core::config::{ConfigError, ProjectConfig};
use caliban_core::dispatch::dispatch;
use caliban_core::registry::Backend;
use tokio_util::sync::CancellationToken;

use crate::commands::common::{
    apply_cloud_args, cloud_adapter, invocation, open_store, report_exit, CliResult, CloudArgs,
    JobArgs,
};

/// Execute the submit-cloud command.
pub async fn execute(
    job: JobArgs,
    cloud: CloudArgs,
    cancel: &CancellationToken,
) -> CliResult {
    let mut inv = invocation(&job, Backend::Cloud)?;
    let config = ProjectConfig::load(&inv.project_dir)?;
    apply_cloud_args(&mut inv, &config, &cloud)?;

    // Dry runs never reach the wire, so a placeholder project is enough to
    // exercise validation.
    let project_id = match (&inv.project_id, inv.dry_run) {
        (Some(project_id), _) => project_id.clone(),
        (None, true) => "dry-run".to_string(),
        (None, false) => {
            return Err(ConfigError::Invalid(
                "no project id found; pass --project_id, set one in the project config, \
                 or export $PROJECT_ID"
                    .to_string(),
            )
            .into())
        }
    };

    let adapter = cloud_adapter(&project_id, cloud.force);
    let mut store = open_store()?;

    let report = dispatch(&mut store, &adapter, &inv, &config, cancel).await?;
    Ok(report_exit(&report))
}
