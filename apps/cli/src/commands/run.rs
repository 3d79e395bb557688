//! Run command: execute jobs on the local Docker runtime.

use caliban_core::backend::LocalRuntime;
use caliban_core::config::ProjectConfig;
use caliban_core::dispatch::dispatch;
use caliban_core::registry::Backend;
use tokio_util::sync::CancellationToken;

use crate::commands::common::{invocation, open_store, report_exit, CliResult, JobArgs};

/// Execute the run command.
pub async fn execute(
    job: JobArgs,
    docker_run_args: Vec<String>,
    cancel: &CancellationToken,
) -> CliResult {
    let mut inv = invocation(&job, Backend::Local)?;
    inv.docker_run_args = docker_run_args;

    let config = ProjectConfig::load(&inv.project_dir)?;
    let adapter = LocalRuntime::new(inv.docker_run_args.clone())?;
    let mut store = open_store()?;

    let report = dispatch(&mut store, &adapter, &inv, &config, cancel).await?;
    Ok(report_exit(&report))
}
