//! Build command: plan and build the project image without running jobs.

use caliban_core::build::{plan, BuildParams, DockerBuilder};
use caliban_core::config::{Entrypoint, ProjectConfig};
use caliban_core::registry::Backend;

use crate::commands::common::{invocation, CliResult, JobArgs};

/// Execute the build command.
///
/// With `--dry_run` the rendered Dockerfile is printed instead of built.
pub async fn execute(job: JobArgs) -> CliResult {
    let inv = invocation(&job, Backend::Local)?;
    let config = ProjectConfig::load(&inv.project_dir)?;
    let entrypoint = Entrypoint::resolve(&inv.project_dir, &inv.module)?;

    let mut params = BuildParams::new(&inv.project_dir, inv.mode, entrypoint);
    params.extra_dirs = inv.extra_dirs.clone();
    params.setup_extras = inv.setup_extras.clone();

    let recipe = plan(&params, &config)?;

    if inv.dry_run {
        print!("{}", recipe.dockerfile());
        return Ok(0);
    }

    let builder = DockerBuilder::new(inv.no_cache)?;
    let image = builder.build(&recipe, &params).await?;
    println!("{}", image);
    Ok(0)
}
