//! Resubmit command: re-run failed or stopped experiments of a group.

use std::path::Path;

use caliban_core::build::{plan, BuildParams, DockerBuilder};
use caliban_core::config::ProjectConfig;
use caliban_core::registry::{Experiment, RegistryStore};
use caliban_core::status;
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::commands::common::{
    adapter_set, open_store, project_dir, CliResult, PROJECT_ID_ENV,
};

/// Execute the resubmit command.
///
/// When a project directory is given, the image is rebuilt first (with the
/// group's recorded entrypoint, mode, and extra directories) so code changes
/// since the original submission are captured; submissions then run against
/// the fresh image.
pub async fn execute(
    xgroup: String,
    all_jobs: bool,
    dry_run: bool,
    dir: Option<String>,
    mode: Option<String>,
    cancel: &CancellationToken,
) -> CliResult {
    let mut store = open_store()?;

    let rebuilt_image = match (&dir, dry_run) {
        (Some(_), false) => Some(rebuild(&store, &xgroup, &dir, &mode).await?),
        _ => None,
    };

    let adapters = adapter_set();
    let report = status::resubmit(
        &mut store,
        &adapters,
        &xgroup,
        dry_run,
        all_jobs,
        rebuilt_image,
        cancel,
    )
    .await?;

    if report.outcomes.is_empty() {
        println!("nothing to resubmit in xgroup {}", xgroup.bold());
        return Ok(0);
    }

    if dry_run {
        println!("the following experiments would be resubmitted:");
        for outcome in &report.outcomes {
            println!(
                "  experiment {}: {}",
                outcome.experiment.id,
                outcome.experiment.command_string()
            );
        }
        println!("re-run without --dry_run to submit them");
        return Ok(0);
    }

    for outcome in &report.outcomes {
        match (&outcome.job, &outcome.error) {
            (Some(job), _) => println!(
                "{} experiment {} resubmitted as job {} ({})",
                "ok".green().bold(),
                outcome.experiment.id,
                job.id,
                job.backend_handle,
            ),
            (None, Some(error)) => println!(
                "{} experiment {} failed: {}",
                "error".red().bold(),
                outcome.experiment.id,
                error,
            ),
            (None, None) => {}
        }
    }

    Ok(if report.all_succeeded() { 0 } else { 1 })
}

/// Rebuilds the group's image so resubmissions pick up code changes.
///
/// The entrypoint, mode, and extra directories come from the group's
/// recorded rows; only the source tree is taken from the given directory.
/// The image is pushed to the project registry when a cloud project is
/// configured so remote backends can pull it.
async fn rebuild(
    store: &RegistryStore,
    xgroup: &str,
    dir: &Option<String>,
    mode_flag: &Option<String>,
) -> Result<String, caliban_core::CalibanError> {
    let project = project_dir(dir)?;
    let (entrypoint, mode, extra_dirs) = recorded_build_inputs(store, xgroup, mode_flag)?;
    let config = ProjectConfig::load(&project)?;

    let mut params = BuildParams::new(&project, mode, entrypoint);
    params.extra_dirs = extra_dirs.into_iter().filter(|d| Path::new(d).is_dir()).collect();

    let recipe = plan(&params, &config)?;
    let builder = DockerBuilder::new(false)?;
    let image = builder.build(&recipe, &params).await?;
    info!(image = %image, "rebuilt image for resubmission");

    let project_id =
        config.project_id.clone().or_else(|| std::env::var(PROJECT_ID_ENV).ok());
    match project_id {
        Some(project_id) => Ok(builder.push(&project_id, &image).await?),
        None => Ok(image),
    }
}

/// The entrypoint, mode, and extra dirs the group's experiments were
/// originally built with.
fn recorded_build_inputs(
    store: &RegistryStore,
    xgroup: &str,
    mode_flag: &Option<String>,
) -> Result<
    (caliban_core::Entrypoint, caliban_core::JobMode, Vec<String>),
    caliban_core::CalibanError,
> {
    let group = store.find_group(xgroup)?.ok_or_else(|| {
        caliban_core::registry::RegistryError::NotFound(format!("experiment group '{}'", xgroup))
    })?;
    let experiments: Vec<Experiment> = store.experiments_in_group(&group)?;
    let first = experiments.first().ok_or_else(|| {
        caliban_core::registry::RegistryError::NotFound(format!(
            "no experiments recorded in group '{}'",
            xgroup
        ))
    })?;
    let container = store.get_container(first.container_id)?;
    let mode = match mode_flag {
        Some(flag) => caliban_core::JobMode::parse(flag)?,
        None => container.mode,
    };
    Ok((first.entrypoint.clone(), mode, container.extra_dirs.clone()))
}
